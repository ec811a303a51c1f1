//! Prompt-schedule evaluation and token reconstruction.
//!
//! The webui prompt dialect supports attention weighting (`(token:1.2)`,
//! `(up)`, `[down]`), step scheduling (`[from:to:when]`, `[to:when]`),
//! per-step alternation (`[a|b]`) and `BREAK` separators. `PromptEvaluator`
//! is the seam to that evaluator; `WebuiEvaluator` implements its contract
//! in-crate. `schedule_tokens` drives the evaluator across composable
//! sub-prompts and schedule steps to produce a flat, deduplicated token set.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;

use super::tags;

/// Default step count when a format exposes none.
pub const DEFAULT_STEPS: u32 = 20;

/// External prompt-attention/schedule evaluator boundary.
pub trait PromptEvaluator {
    /// Expand scheduling syntax over `steps` generation steps. Returns, per
    /// sub-prompt, the ordered `(last_step, resolved_text)` schedule.
    fn prompt_schedules(&self, sub_prompts: &[String], steps: u32) -> Vec<Vec<(u32, String)>>;

    /// Parse attention syntax into `(token, weight)` pairs. `BREAK`
    /// separators come back as a `("BREAK", -1.0)` marker.
    fn parse_attention(&self, text: &str) -> Vec<(String, f64)>;
}

/// Reconstruct the flat token set for a set of composable sub-prompts.
///
/// For every resolved schedule text: parse attention, drop `BREAK` markers,
/// rejoin with commas and normalize like settings tokens (lowercase, trim,
/// spaces to underscores). The second return value reports whether any
/// sub-prompt scheduled more than one step (prompt editing).
pub fn schedule_tokens(
    evaluator: &dyn PromptEvaluator,
    sub_prompts: &[String],
    steps: u32,
) -> (BTreeSet<String>, bool) {
    let mut tokens = BTreeSet::new();
    let mut uses_editing = false;

    for schedule in evaluator.prompt_schedules(sub_prompts, steps) {
        if schedule.len() > 1 {
            uses_editing = true;
        }
        for (_step, text) in schedule {
            let mut line = String::new();
            for (token, _weight) in evaluator.parse_attention(&text) {
                if token == "BREAK" {
                    continue;
                }
                line.push_str(&token);
                line.push(',');
            }
            tokens.extend(tags::prompt_line_tokens(&line.to_lowercase()));
        }
    }

    (tokens, uses_editing)
}

// ─── Default evaluator ───────────────────────────────────────────────────────

static ATTENTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\\\(|\\\)|\\\[|\\\]|\\\\|\\|\(|\[|:\s*([+-]?[.\d]+)\s*\)|\)|\]|[^\\()\[\]:]+|:")
        .unwrap()
});
static BREAK_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s*\bBREAK\b\s*").unwrap());

/// In-crate implementation of the webui evaluator contract.
pub struct WebuiEvaluator;

impl PromptEvaluator for WebuiEvaluator {
    fn prompt_schedules(&self, sub_prompts: &[String], steps: u32) -> Vec<Vec<(u32, String)>> {
        sub_prompts
            .iter()
            .map(|prompt| {
                let tree = parse_tree(prompt);
                let mut bounds = BTreeSet::new();
                bounds.insert(steps);
                collect_steps(&tree, steps, &mut bounds);
                bounds
                    .into_iter()
                    .map(|bound| {
                        let mut text = String::new();
                        resolve(&tree, bound, steps, &mut text);
                        (bound, text)
                    })
                    .collect()
            })
            .collect()
    }

    fn parse_attention(&self, text: &str) -> Vec<(String, f64)> {
        const ROUND_MULTIPLIER: f64 = 1.1;
        const SQUARE_MULTIPLIER: f64 = 1.0 / 1.1;

        let mut res: Vec<(String, f64)> = Vec::new();
        let mut round_brackets: Vec<usize> = Vec::new();
        let mut square_brackets: Vec<usize> = Vec::new();

        fn multiply_range(res: &mut [(String, f64)], start: usize, multiplier: f64) {
            for entry in &mut res[start..] {
                entry.1 *= multiplier;
            }
        }

        for caps in ATTENTION_RE.captures_iter(text) {
            let token = &caps[0];
            if let Some(weight) = caps.get(1) {
                match round_brackets.pop() {
                    Some(start) => {
                        multiply_range(&mut res, start, weight.as_str().parse().unwrap_or(1.0));
                    }
                    // Unmatched weight suffix stays literal.
                    None => res.push((token.to_string(), 1.0)),
                }
            } else if let Some(escaped) = token.strip_prefix('\\') {
                res.push((escaped.to_string(), 1.0));
            } else if token == "(" {
                round_brackets.push(res.len());
            } else if token == "[" {
                square_brackets.push(res.len());
            } else if token == ")" {
                match round_brackets.pop() {
                    Some(start) => multiply_range(&mut res, start, ROUND_MULTIPLIER),
                    None => res.push((token.to_string(), 1.0)),
                }
            } else if token == "]" {
                match square_brackets.pop() {
                    Some(start) => multiply_range(&mut res, start, SQUARE_MULTIPLIER),
                    None => res.push((token.to_string(), 1.0)),
                }
            } else {
                for (i, part) in BREAK_RE.split(token).enumerate() {
                    if i > 0 {
                        res.push(("BREAK".to_string(), -1.0));
                    }
                    if !part.is_empty() {
                        res.push((part.to_string(), 1.0));
                    }
                }
            }
        }

        // Unbalanced brackets still apply their multiplier.
        for start in round_brackets {
            multiply_range(&mut res, start, ROUND_MULTIPLIER);
        }
        for start in square_brackets {
            multiply_range(&mut res, start, SQUARE_MULTIPLIER);
        }

        if res.is_empty() {
            res.push((String::new(), 1.0));
        }

        // Merge runs with identical weight so escaped characters stay joined
        // to their surrounding token. BREAK markers never merge; consecutive
        // separators must stay individually droppable.
        let mut i = 0;
        while i + 1 < res.len() {
            if res[i].1 == res[i + 1].1 && res[i].0 != "BREAK" && res[i + 1].0 != "BREAK" {
                let (joined, _) = res.remove(i + 1);
                res[i].0.push_str(&joined);
            } else {
                i += 1;
            }
        }

        res
    }
}

// ─── Schedule tree ───────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
enum Node {
    Text(String),
    Scheduled {
        before: Vec<Node>,
        after: Vec<Node>,
        when: f64,
    },
    Alternate(Vec<Vec<Node>>),
}

fn parse_tree(text: &str) -> Vec<Node> {
    let chars: Vec<char> = text.chars().collect();
    let mut nodes = Vec::new();
    let mut buf = String::new();
    let mut pos = 0;
    while pos < chars.len() {
        let c = chars[pos];
        pos += 1;
        if c == '[' {
            if !buf.is_empty() {
                nodes.push(Node::Text(std::mem::take(&mut buf)));
            }
            nodes.push(parse_group(&chars, &mut pos));
        } else {
            buf.push(c);
        }
    }
    if !buf.is_empty() {
        nodes.push(Node::Text(buf));
    }
    nodes
}

/// Parse one bracketed group; the opening bracket is already consumed.
/// Groups that are not valid schedules or alternations fall back to their
/// literal text (plain `[...]` is attention syntax, handled later).
fn parse_group(chars: &[char], pos: &mut usize) -> Node {
    let open_idx = *pos - 1;
    let mut segments: Vec<Vec<Node>> = vec![Vec::new()];
    let mut separators: Vec<char> = Vec::new();
    let mut buf = String::new();
    let mut closed = false;

    while *pos < chars.len() {
        let c = chars[*pos];
        *pos += 1;
        match c {
            '[' => {
                if !buf.is_empty() {
                    push_text(&mut segments, std::mem::take(&mut buf));
                }
                let inner = parse_group(chars, pos);
                if let Some(seg) = segments.last_mut() {
                    seg.push(inner);
                }
            }
            ']' => {
                closed = true;
                break;
            }
            ':' | '|' => {
                if !buf.is_empty() {
                    push_text(&mut segments, std::mem::take(&mut buf));
                }
                separators.push(c);
                segments.push(Vec::new());
            }
            _ => buf.push(c),
        }
    }
    if !buf.is_empty() {
        push_text(&mut segments, buf);
    }

    if closed {
        if let Some(node) = build_group(&segments, &separators) {
            return node;
        }
    }
    Node::Text(chars[open_idx..*pos].iter().collect())
}

fn push_text(segments: &mut [Vec<Node>], text: String) {
    if let Some(seg) = segments.last_mut() {
        seg.push(Node::Text(text));
    }
}

fn build_group(segments: &[Vec<Node>], separators: &[char]) -> Option<Node> {
    if separators.is_empty() {
        return None;
    }
    if separators.iter().all(|&c| c == '|') {
        return Some(Node::Alternate(segments.to_vec()));
    }
    if separators.iter().all(|&c| c == ':') {
        let when = match segments.last()?.as_slice() {
            [Node::Text(t)] => t.trim().parse::<f64>().ok()?,
            _ => return None,
        };
        return match segments.len() {
            2 => Some(Node::Scheduled {
                before: Vec::new(),
                after: segments[0].clone(),
                when,
            }),
            3 => Some(Node::Scheduled {
                before: segments[0].clone(),
                after: segments[1].clone(),
                when,
            }),
            _ => None,
        };
    }
    None
}

/// A `when` below 1.0 is a fraction of the total step count.
fn when_step(when: f64, steps: u32) -> u32 {
    let absolute = if when < 1.0 { when * steps as f64 } else { when };
    (absolute as u32).min(steps)
}

fn collect_steps(nodes: &[Node], steps: u32, bounds: &mut BTreeSet<u32>) {
    for node in nodes {
        match node {
            Node::Text(_) => {}
            Node::Scheduled { before, after, when } => {
                bounds.insert(when_step(*when, steps));
                collect_steps(before, steps, bounds);
                collect_steps(after, steps, bounds);
            }
            Node::Alternate(options) => {
                bounds.extend(1..=steps);
                for option in options {
                    collect_steps(option, steps, bounds);
                }
            }
        }
    }
}

fn resolve(nodes: &[Node], step: u32, steps: u32, out: &mut String) {
    for node in nodes {
        match node {
            Node::Text(t) => out.push_str(t),
            Node::Scheduled { before, after, when } => {
                if step <= when_step(*when, steps) {
                    resolve(before, step, steps, out);
                } else {
                    resolve(after, step, steps, out);
                }
            }
            Node::Alternate(options) => {
                if !options.is_empty() {
                    let idx = step.saturating_sub(1) as usize % options.len();
                    resolve(&options[idx], step, steps, out);
                }
            }
        }
    }
}
