//! Tag normalization and final tag-set assembly.
//!
//! Tags come from three places — prompt tokens, settings fields and
//! caller-supplied defaults — and all pass through here. Case folding
//! differs per source format on purpose: the A1111 path lower-cases the
//! whole settings blob before splitting, while the NAI path lower-cases
//! prompt tokens but passes namespaced setting values through raw. Existing
//! tag stores depend on both behaviors.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;

static MULTI_SPACE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"  +").unwrap());

/// Split a settings blob into normalized `key:value` tokens.
///
/// Every `": "` collapses to `":"` so the key becomes a namespace, then each
/// comma-delimited field is trimmed and has its spaces replaced by
/// underscores. Empty fields are kept here and filtered when the final set
/// is assembled.
pub fn settings_tokens(blob: &str) -> Vec<String> {
    blob.replace(": ", ":")
        .split(',')
        .map(|field| field.trim().replace(' ', "_"))
        .collect()
}

/// Split a comma-joined prompt line into bare tokens.
///
/// Colons are replaced by semicolons first so prompt text can never
/// introduce unwanted namespaces; empty tokens are dropped.
pub fn prompt_line_tokens(line: &str) -> Vec<String> {
    line.replace(':', ";")
        .split(',')
        .map(|t| t.trim().replace(' ', "_"))
        .filter(|t| !t.is_empty())
        .collect()
}

/// Turn a `Negative prompt: ...` line into a `negative:...` tag, collapsing
/// internal runs of whitespace.
pub fn negative_tag(line: &str) -> String {
    let neg = line.replacen("Negative prompt: ", "negative:", 1);
    MULTI_SPACE_RE.replace_all(neg.trim(), " ").into_owned()
}

/// Assemble the final tag set: extractor tags plus caller defaults plus the
/// provenance tag. Guarantees no empty tags.
pub fn finalize(
    mut tags: BTreeSet<String>,
    default_tags: &[String],
    prompt_type: &str,
) -> BTreeSet<String> {
    tags.extend(default_tags.iter().cloned());
    tags.insert(format!("prompt_type:{prompt_type}"));
    tags.retain(|t| !t.is_empty());
    tags
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_fields_are_normalized() {
        let tokens = settings_tokens("steps: 40, sampler: dpm++ 2m karras, size: 640x512");
        assert_eq!(tokens, vec!["steps:40", "sampler:dpm++_2m_karras", "size:640x512"]);
    }

    #[test]
    fn value_colon_without_space_is_kept() {
        let tokens = settings_tokens("hires upscaler: latent (nearest-exact), file includes: ");
        assert_eq!(tokens, vec!["hires_upscaler:latent_(nearest-exact)", "file_includes:"]);
    }

    #[test]
    fn prompt_tokens_avoid_namespaces() {
        let tokens = prompt_line_tokens("a girl, looking up: at sky, ");
        assert_eq!(tokens, vec!["a_girl", "looking_up;_at_sky"]);
    }

    #[test]
    fn negative_line_becomes_tag() {
        assert_eq!(
            negative_tag("Negative prompt: lowres,  bad   anatomy"),
            "negative:lowres, bad anatomy"
        );
    }

    #[test]
    fn finalize_adds_provenance_and_drops_empties() {
        let tags: BTreeSet<String> = ["1girl".to_string(), String::new()].into();
        let out = finalize(tags, &["board:sdg".to_string()], "a1111");
        assert!(out.contains("1girl"));
        assert!(out.contains("board:sdg"));
        assert!(out.contains("prompt_type:a1111"));
        assert!(!out.contains(""));
    }
}
