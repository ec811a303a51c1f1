//! NovelAI v3 metadata extraction.
//!
//! NovelAI writes its fields as individual PNG chunks (or as a JSON object
//! hidden via the stealth channel): `Description` holds the positive prompt,
//! `Comment` a JSON blob with the negative prompt (`uc`) and sampler
//! settings. NAI attention syntax uses `{...}` for emphasis and bare
//! parentheses as literals, so the prompt is rewritten into webui syntax
//! before tokenization.

use serde_json::{Map, Value};

use super::prompt::{self, DEFAULT_STEPS, PromptEvaluator};
use super::Extraction;

/// Rewrite NAI attention syntax into the webui dialect: literal parentheses
/// get escaped, curly-brace emphasis becomes parenthesized emphasis.
fn convert_attention(prompt: &str) -> String {
    prompt
        .replace('(', "\\(")
        .replace(')', "\\)")
        .replace('{', "(")
        .replace('}', ")")
}

/// Settings values are strings most of the time; everything else keeps its
/// JSON rendering.
fn format_setting(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Extract tags and prompts from NAI chunk fields. Returns `None` when the
/// `Comment` blob is missing or not a JSON object.
pub fn parse(fields: &Map<String, Value>, evaluator: &dyn PromptEvaluator) -> Option<Extraction> {
    let comment: Value = serde_json::from_str(fields.get("Comment")?.as_str()?).ok()?;
    let comment = comment.as_object()?;

    let orig_positive = fields.get("Description").and_then(Value::as_str).unwrap_or("");
    let positive = convert_attention(orig_positive);
    let negative = comment.get("uc").and_then(Value::as_str).unwrap_or("");

    let mut settings = Vec::new();
    for (key, value) in comment {
        // Prompts are tokenized separately; dimensions duplicate the file.
        if matches!(key.as_str(), "prompt" | "uc" | "width" | "height") {
            continue;
        }
        settings.push(format!("{key}:{}", format_setting(value)));
    }
    if let Some(software) = fields.get("Software").and_then(Value::as_str) {
        settings.push(format!("nai_software:{software}"));
    }
    if let Some(source) = fields.get("Source").and_then(Value::as_str) {
        settings.push(format!("nai_source:{source}"));
    }

    let (mut all_tags, _) =
        prompt::schedule_tokens(evaluator, &[positive], DEFAULT_STEPS);
    all_tags.extend(settings);
    if !negative.is_empty() {
        all_tags.insert(format!("negative:{negative}"));
    }
    all_tags.retain(|t| !t.is_empty());

    Some(Extraction {
        tags: all_tags,
        positive: orig_positive.trim().to_string(),
        negative: negative.trim().to_string(),
    })
}
