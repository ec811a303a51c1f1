//! A1111 infotext parsing.
//!
//! Infotext is the freeform parameter blob the webui writes into the
//! `parameters` PNG chunk: positive prompt lines, an optional
//! `Negative prompt: ` line, then a `Steps: ` settings line of comma-joined
//! `Key: value` fields. Prompts may wrap across several lines and the
//! settings line may grow multi-line fields (wildcard templates), so lines
//! are classified with a small state machine rather than split positionally.

use std::sync::LazyLock;

use regex::Regex;

use super::prompt::{self, DEFAULT_STEPS, PromptEvaluator};
use super::{Extraction, extra_networks, tags};

static ADDNET_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^addnet_.+_\d+").unwrap());
static ADDNET_MODEL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(.*)\(([a-f0-9]+)\)$").unwrap());
static AND_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\bAND\b").unwrap());
// Quoted fields whose values are whole prompt templates; they would pollute
// the settings tokens and are stripped before splitting.
static ANNOYING_FIELDS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(Wildcard prompt|X Values|Y Values|Z Values): "[^"]*?"(?:, |\n?$)"#).unwrap()
});

#[derive(Clone, Copy, PartialEq)]
enum LineKind {
    Positive,
    Negative,
    Settings,
}

/// Parse an infotext blob into tags plus the positive/negative prompt texts.
pub fn parse(params: &str, evaluator: &dyn PromptEvaluator) -> Extraction {
    let (stripped, network_params) = extra_networks::extract(params);

    let lines: Vec<&str> = stripped.split('\n').collect();
    let mut settings_blob = String::new();
    let mut negatives: Option<String> = None;
    let mut positive_prompt = String::new();

    if lines.len() == 2 {
        positive_prompt = lines[0].to_string();
        negatives = Some(tags::negative_tag(lines[1]));
    } else {
        let mut state = LineKind::Positive;
        for line in &lines {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if line.starts_with("Steps: ") {
                state = LineKind::Settings;
                settings_blob.clear();
                settings_blob.push_str(line);
                settings_blob.push('\n');
                continue;
            }
            match state {
                LineKind::Negative => {
                    if let Some(neg) = negatives.as_mut() {
                        neg.push_str(", ");
                        neg.push_str(line);
                    }
                    continue;
                }
                LineKind::Settings => {
                    settings_blob.push_str(line);
                    settings_blob.push('\n');
                    continue;
                }
                LineKind::Positive => {}
            }
            if line.starts_with("Negative prompt: ") {
                state = LineKind::Negative;
                negatives = Some(tags::negative_tag(line));
                continue;
            }
            positive_prompt.push_str(line);
            positive_prompt.push('\n');
        }
    }

    // The positive prompt to report keeps its extra-network references, so it
    // is re-derived from the raw text up to the first sentinel line.
    let mut orig_prompt = String::new();
    for line in params.split('\n') {
        let trimmed = line.trim();
        if trimmed.starts_with("Negative prompt: ") || trimmed.starts_with("Steps: ") {
            break;
        }
        orig_prompt.push_str(line);
        orig_prompt.push('\n');
    }

    let settings_blob = ANNOYING_FIELDS_RE.replace_all(&settings_blob, "");
    let settings_blob = strip_template_info(&settings_blob);
    let mut settings = tags::settings_tokens(&settings_blob.to_lowercase());

    let mut addnet_models = Vec::new();
    let mut to_remove = Vec::new();
    for tag in &settings {
        if !ADDNET_RE.is_match(tag) {
            continue;
        }
        to_remove.push(tag.clone());
        if tag.starts_with("addnet_model") {
            let stripped = ADDNET_RE.replace(tag, "");
            let model = stripped.trim_matches(':');
            match ADDNET_MODEL_RE.captures(model) {
                Some(caps) => {
                    addnet_models.push(format!("addnet_model:{model}"));
                    addnet_models.push(format!("addnet_model_name:{}", &caps[1]));
                    addnet_models.push(format!("addnet_model_hash:{}", &caps[2]));
                }
                None => log::warn!("unrecognized addnet model field: {model}"),
            }
        }
    }
    settings.extend(addnet_models);

    let mut steps = DEFAULT_STEPS;
    for tag in &settings {
        if let Some(value) = tag.strip_prefix("steps:") {
            steps = value.parse().unwrap_or(DEFAULT_STEPS);
            break;
        }
    }

    let sub_prompts: Vec<String> = AND_RE.split(&positive_prompt).map(str::to_string).collect();
    if sub_prompts.len() > 1 {
        settings.push("uses_multicond:true".to_string());
    }

    let (mut all_tags, uses_editing) = prompt::schedule_tokens(evaluator, &sub_prompts, steps);
    if uses_editing {
        settings.push("uses_prompt_editing:true".to_string());
    }

    for (kind, arg_lists) in &network_params {
        for args in arg_lists {
            if let Some(first) = args.first() {
                settings.push(format!("extra_networks_{kind}:{first}"));
            }
        }
    }

    all_tags.extend(settings);
    if let Some(neg) = &negatives {
        if !neg.is_empty() {
            all_tags.insert(neg.clone());
        }
    }
    for tag in &to_remove {
        all_tags.remove(tag);
    }
    all_tags.retain(|t| !t.is_empty());

    let negatives = negatives.unwrap_or_default();
    let negative = negatives.strip_prefix("negative:").unwrap_or(&negatives);

    Extraction {
        tags: all_tags,
        positive: orig_prompt.trim().to_string(),
        negative: negative.trim().to_string(),
    }
}

/// Strip dynamic-prompts `Template:`/`Negative Template:` trailers from the
/// settings blob; their values are whole prompts.
fn strip_template_info(settings: &str) -> &str {
    let split_by = if settings.contains("\nTemplate:") && settings.contains("\nNegative Template:")
    {
        Some("Template")
    } else if settings.contains("\nNegative Template:") {
        Some("\nNegative Template:")
    } else if settings.contains("\nTemplate:") {
        Some("\nTemplate:")
    } else {
        None
    };
    match split_by {
        Some(sep) => settings.split(sep).next().unwrap_or("").trim(),
        None => settings,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::prompt::WebuiEvaluator;
    use std::collections::BTreeSet;

    fn tag_set(tags: &[&str]) -> BTreeSet<String> {
        tags.iter().map(|t| t.to_string()).collect()
    }

    fn parse_text(text: &str) -> Extraction {
        parse(text, &WebuiEvaluator)
    }

    #[test]
    fn parses_infotext_with_extra_networks() {
        let infotext = "(colorful:1.3),\n\
dreamlike fantasy landscape where everything is a shade of pink,\n\
 <lora:NAI-cutesexyrobutts:1>\n\
Negative prompt: (worst quality:1.4), (low quality:1.4) , (monochrome:1.1)\n\
Steps: 40, Sampler: DPM++ 2M Karras, CFG scale: 12, Seed: 2416682767, Size: 640x512, Model hash: 0f0eaaa61e, Model: pastelmix-better-vae-fp16, Denoising strength: 0.55, Clip skip: 2, ENSD: 31337, Hires upscale: 2, Hires steps: 20, Hires upscaler: Latent\n";

        let extraction = parse_text(infotext);
        assert_eq!(
            extraction.tags,
            tag_set(&[
                "cfg_scale:12",
                "clip_skip:2",
                "colorful",
                "denoising_strength:0.55",
                "dreamlike_fantasy_landscape_where_everything_is_a_shade_of_pink",
                "extra_networks_lora:NAI-cutesexyrobutts",
                "ensd:31337",
                "hires_steps:20",
                "hires_upscale:2",
                "hires_upscaler:latent",
                "model:pastelmix-better-vae-fp16",
                "model_hash:0f0eaaa61e",
                "negative:(worst quality:1.4), (low quality:1.4) , (monochrome:1.1)",
                "sampler:dpm++_2m_karras",
                "seed:2416682767",
                "size:640x512",
                "steps:40",
            ])
        );
        assert_eq!(
            extraction.negative,
            "(worst quality:1.4), (low quality:1.4) , (monochrome:1.1)"
        );
        assert!(extraction.positive.starts_with("(colorful:1.3),"));
        assert!(extraction.positive.contains("<lora:NAI-cutesexyrobutts:1>"));
    }

    #[test]
    fn strips_wildcard_prompt_field() {
        let infotext = "1girl\n\
Negative prompt: lowres, bad anatomy\n\
Steps: 40, Sampler: DPM++ 2M Karras, CFG scale: 9, Seed: 2976004442, Size: 576x512, Model hash: 931f9552, Model: AbyssOrangeMix2_hard, Batch size: 2, Batch pos: 0, Denoising strength: 0.6, Clip skip: 2, ENSD: 31337, Wildcard prompt: \"[:((beautiful detailed eyes)), (beautiful detailed face), :0.7][:(perfect detailed hands and fingers, detailed hands+fingers:1.1):0.45]masterpiece, best quality, highres, absurdres, world masterpiece theater, impressionism, intricate, ambient light, [sfw:nsfw:0.33], (1girl), (solo), solo focus, from above, looking up at viewer, close-up, (carry me, incoming hug, outstretched arms, reaching towards viewer:1.05)\n\
(a young girl with a naughty smile drenched in the rain on the sidewalk of a futuristic city and neon signs reflected in puddles), ((long white summer dress, detailed fabric)), (wet fabric, wet skin, shiny skin, rain, wet)[:, see-through dress:0.85], {strapless dress|sleeveless dress|off-shoulder dress}, (side slit dress:0.9), (downblouse, nipples), (perfect cute little teen ass:1.1), (medium breasts:1)[:, small nipples:0.1], (slender waist:0.9), athletic, fit, {medium|long|very long} hair, {75%blonde|chestnut hair, red|chestnut red} hair,{{ponytail|high ponytail|twintails}|{french braid|single braid|crown braid**,crown**|side_braid}|50% }, {|33%(freckles:0.85), }{75%blue|green} eyes, black_eyeliner, sideswept hair{|20%, hair ornament}, [(little girl:1.15), (child:1.2), (perfect anatomy:1.2):, little girl, child:0.25]\n\
(Daniel F. Gerhartz:1.1), (Sally Mann:0.9), (Henry Ascencio:1.1), (Emile Vernon:1.1), (Tom Bagshaw:1.1), (Krenz Cushart:1.2)\", File includes: , Hires resize: 1152x1024, Hires upscaler: Latent (nearest-exact), Discard penultimate sigma: True\n        ";

        let extraction = parse_text(infotext);
        assert_eq!(
            extraction.tags,
            tag_set(&[
                "1girl",
                "batch_pos:0",
                "batch_size:2",
                "cfg_scale:9",
                "clip_skip:2",
                "denoising_strength:0.6",
                "discard_penultimate_sigma:true",
                "ensd:31337",
                "file_includes:",
                "hires_resize:1152x1024",
                "hires_upscaler:latent_(nearest-exact)",
                "model:abyssorangemix2_hard",
                "model_hash:931f9552",
                "negative:lowres, bad anatomy",
                "sampler:dpm++_2m_karras",
                "seed:2976004442",
                "size:576x512",
                "steps:40",
            ])
        );
        assert_eq!(extraction.positive, "1girl");
        assert_eq!(extraction.negative, "lowres, bad anatomy");
    }

    #[test]
    fn composable_prompts_set_multicond() {
        let infotext = "forest AND ruins\nSteps: 20, Sampler: Euler a\n";
        let extraction = parse_text(infotext);
        assert!(extraction.tags.contains("uses_multicond:true"));
        assert!(extraction.tags.contains("forest"));
        assert!(extraction.tags.contains("ruins"));
    }

    #[test]
    fn prompt_editing_sets_flag_and_keeps_both_phases() {
        let infotext = "a [fog:clear:0.5] day\nSteps: 20, Sampler: Euler a\n";
        let extraction = parse_text(infotext);
        assert!(extraction.tags.contains("uses_prompt_editing:true"));
        assert!(extraction.tags.contains("a_fog_day"));
        assert!(extraction.tags.contains("a_clear_day"));
    }

    #[test]
    fn break_separator_is_dropped() {
        let infotext = "upper body BREAK lower body\nSteps: 20\n";
        let extraction = parse_text(infotext);
        assert!(extraction.tags.contains("upper_body"));
        assert!(extraction.tags.contains("lower_body"));
        assert!(!extraction.tags.iter().any(|t| t.contains("break")));
    }

    #[test]
    fn addnet_fields_become_model_tags() {
        let infotext = "1girl\n\
Negative prompt: lowres\n\
Steps: 20, Sampler: Euler a, AddNet Enabled: True, AddNet Module 1: LoRA, AddNet Model 1: elysiav3-000002(6d3eb064dcc1), AddNet Weight A 1: 0.75\n";
        let extraction = parse_text(infotext);
        assert!(extraction.tags.contains("addnet_model:elysiav3-000002(6d3eb064dcc1)"));
        assert!(extraction.tags.contains("addnet_model_name:elysiav3-000002"));
        assert!(extraction.tags.contains("addnet_model_hash:6d3eb064dcc1"));
        assert!(extraction.tags.contains("addnet_enabled:true"));
        // Numbered slot fields are folded away.
        assert!(!extraction.tags.iter().any(|t| t.starts_with("addnet_model_1")));
        assert!(!extraction.tags.iter().any(|t| t.starts_with("addnet_module_1")));
        assert!(!extraction.tags.iter().any(|t| t.starts_with("addnet_weight_a_1")));
    }

    #[test]
    fn template_trailer_is_stripped() {
        let infotext = "1girl\n\
Steps: 20, Sampler: Euler a\n\
Template: __characters__, masterpiece\n\
Negative Template: lowres\n";
        let extraction = parse_text(infotext);
        assert!(extraction.tags.contains("steps:20"));
        assert!(extraction.tags.contains("sampler:euler_a"));
        assert!(!extraction.tags.iter().any(|t| t.contains("template")));
        assert!(!extraction.tags.iter().any(|t| t.contains("characters")));
    }

    #[test]
    fn two_line_infotext_is_prompt_and_negative() {
        let extraction = parse_text("1girl, smile\nNegative prompt: lowres");
        assert!(extraction.tags.contains("1girl"));
        assert!(extraction.tags.contains("smile"));
        assert!(extraction.tags.contains("negative:lowres"));
        assert_eq!(extraction.negative, "lowres");
        assert_eq!(extraction.positive, "1girl, smile");
    }

    #[test]
    fn reparsing_the_same_infotext_is_stable() {
        let infotext = "(colorful:1.3), <lora:cutesexyrobutts:1>\n\
Negative prompt: lowres\n\
Steps: 40, Sampler: DPM++ 2M Karras, AddNet Model 1: elysiav3-000002(6d3eb064dcc1)\n";
        let first = parse_text(infotext);
        let second = parse_text(infotext);
        assert_eq!(first.tags, second.tags);
        assert_eq!(first.positive, second.positive);
        assert_eq!(first.negative, second.negative);
    }

    #[test]
    fn missing_negative_yields_empty_field() {
        let extraction = parse_text("1girl\nSteps: 20, Sampler: Euler a\n");
        assert_eq!(extraction.negative, "");
        assert!(!extraction.tags.iter().any(|t| t.starts_with("negative:")));
    }

    #[test]
    fn default_steps_used_when_settings_missing() {
        let extraction = parse_text("morning [fog:0.5] walk");
        assert!(extraction.tags.contains("morning_fog_walk"));
        // Before the switch step the scheduled segment resolves to nothing,
        // leaving both surrounding spaces in place.
        assert!(extraction.tags.contains("morning__walk"));
    }
}
