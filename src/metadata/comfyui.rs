//! ComfyUI workflow-graph extraction.
//!
//! ComfyUI stores its node graph as JSON in the `prompt` chunk: a map of
//! node id to `{class_type, inputs}`. The prompt texts live in
//! `CLIPTextEncode` nodes; sampler nodes reference them through
//! `["<node id>", <slot>]` links or carry inline strings. Only the sampler's
//! positive/negative inputs matter here, the rest of the graph is ignored.

use std::collections::HashMap;

use serde_json::Value;

use super::prompt::{self, DEFAULT_STEPS, PromptEvaluator};
use super::{Extraction, extra_networks};

/// Pull prompts out of a workflow graph. Returns `None` when no sampler
/// node resolves to a positive prompt.
pub fn parse(graph: &Value, evaluator: &dyn PromptEvaluator) -> Option<Extraction> {
    let nodes = graph.as_object()?;

    let mut encoders: HashMap<&str, &str> = HashMap::new();
    for (id, node) in nodes {
        if node.get("class_type").and_then(Value::as_str) == Some("CLIPTextEncode") {
            if let Some(text) = node
                .get("inputs")
                .and_then(|i| i.get("text"))
                .and_then(Value::as_str)
            {
                encoders.insert(id.as_str(), text);
            }
        }
    }

    let mut positive = None;
    let mut negative = None;

    for node in nodes.values() {
        let class_type = node.get("class_type").and_then(Value::as_str).unwrap_or("");
        if !class_type.contains("KSampler") {
            continue;
        }
        let Some(inputs) = node.get("inputs") else {
            continue;
        };
        if inputs.get("positive").is_none() {
            continue;
        }
        if let Some(text) = inputs.get("positive").and_then(|v| resolve(v, &encoders)) {
            positive = Some(text);
        }
        if let Some(text) = inputs.get("negative").and_then(|v| resolve(v, &encoders)) {
            negative = Some(text);
        }
    }

    let positive = positive?;

    let (clean_positive, network_params) = extra_networks::extract(positive);
    let (mut tags, _) =
        prompt::schedule_tokens(evaluator, &[clean_positive], DEFAULT_STEPS);

    for (kind, arg_lists) in &network_params {
        for args in arg_lists {
            if let Some(first) = args.first() {
                tags.insert(format!("extra_networks_{kind}:{first}"));
            }
        }
    }

    let negative = negative.unwrap_or("");
    if !negative.is_empty() {
        tags.insert(format!("negative:{negative}"));
    }
    tags.retain(|t| !t.is_empty());

    Some(Extraction {
        tags,
        positive: positive.trim().to_string(),
        negative: negative.trim().to_string(),
    })
}

/// A sampler input is either a `["<node id>", <slot>]` link into an encoder
/// node or an inline prompt string.
fn resolve<'a>(input: &'a Value, encoders: &HashMap<&str, &'a str>) -> Option<&'a str> {
    match input {
        Value::Array(items) => {
            let id = items.first()?.as_str()?;
            encoders.get(id).copied()
        }
        Value::String(s) => Some(s.as_str()),
        _ => None,
    }
}
