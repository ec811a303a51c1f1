//! Extra-network reference extraction.
//!
//! Prompts may invoke auxiliary models with `<kind:name:weight>` syntax
//! (e.g. `<lora:some-model:0.8>`). These references are pulled out of the
//! prompt text before tokenization and kept as a multi-valued map so that
//! several networks of the same kind survive.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::{Captures, Regex};

static EXTRA_NETWORK_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<(\w+):([^>]+)>").unwrap());

/// kind -> one colon-split argument list per occurrence.
pub type ExtraNetworkParams = HashMap<String, Vec<Vec<String>>>;

/// Remove every `<kind:args>` reference from `prompt`, returning the
/// stripped text and the captured references.
pub fn extract(prompt: &str) -> (String, ExtraNetworkParams) {
    let mut params: ExtraNetworkParams = HashMap::new();
    let stripped = EXTRA_NETWORK_RE.replace_all(prompt, |caps: &Captures| {
        let args = caps[2].split(':').map(str::to_string).collect();
        params.entry(caps[1].to_string()).or_default().push(args);
        ""
    });
    (stripped.into_owned(), params)
}
