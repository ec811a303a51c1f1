//! Generation-metadata extraction.
//!
//! Every supported generator leaves its parameters in a PNG somewhere:
//! A1111 in a `parameters` text chunk, ComfyUI in a `prompt` chunk holding
//! the workflow graph, NovelAI in a handful of named chunks or hidden in
//! pixel LSBs after a site stripped the chunks. [`parse_image`] runs the
//! detection cascade and hands the raw payload to the matching parser,
//! ending in one canonical tag set per file.

pub mod a1111;
pub mod comfyui;
pub mod extra_networks;
pub mod nai;
pub mod png;
pub mod prompt;
pub mod stealth;
pub mod tags;

use std::collections::{BTreeSet, HashMap};
use std::path::Path;

use image::DynamicImage;
use serde_json::{Map, Value};

pub use prompt::{PromptEvaluator, WebuiEvaluator};

/// NovelAI chunk keywords, serialized together as the raw parameter record.
const NAI_FIELDS: [&str; 6] = [
    "Title",
    "Description",
    "Software",
    "Source",
    "Generation time",
    "Comment",
];

/// What a format parser produces: the canonical tag set plus the prompt
/// texts for the sidecar note.
#[derive(Debug, Clone, Default)]
pub struct Extraction {
    pub tags: BTreeSet<String>,
    pub positive: String,
    pub negative: String,
}

/// A fully parsed file, ready for import.
#[derive(Debug, Clone)]
pub struct ImportRecord {
    pub path: String,
    /// Raw parameter payload, attached verbatim as a note.
    pub raw_parameters: String,
    pub tags: BTreeSet<String>,
    pub positive: String,
    pub negative: String,
}

/// Outcome of [`parse_image`]. `Degenerate` files are remembered so they
/// are never probed again; `Skipped` files may be retried on a later run.
#[derive(Debug)]
pub enum ParseOutcome {
    Parsed(ImportRecord),
    Degenerate,
    Skipped,
}

/// Raw metadata located by the detection cascade, before parsing.
#[derive(Debug)]
enum RawMetadata {
    A1111(String),
    Comfy { raw: String, graph: Value },
    Nai { raw: String, fields: Map<String, Value> },
}

fn is_nai_chunks(chunks: &HashMap<String, String>) -> bool {
    chunks.get("Software").map(String::as_str) == Some("NovelAI")
        && chunks
            .get("Source")
            .is_some_and(|s| s.starts_with("Stable Diffusion XL"))
}

fn is_nai_fields(fields: &Map<String, Value>) -> bool {
    fields.get("Software").and_then(Value::as_str) == Some("NovelAI")
        && fields
            .get("Source")
            .and_then(Value::as_str)
            .is_some_and(|s| s.starts_with("Stable Diffusion XL"))
}

/// Locate generation metadata for an image. Chunk-borne formats win over
/// the stealth channel; a `prompt` chunk that does not hold valid JSON
/// rejects the file rather than falling through to a weaker match.
fn detect(chunks: &HashMap<String, String>, image: &DynamicImage) -> Option<RawMetadata> {
    if let Some(params) = chunks.get("parameters") {
        return Some(RawMetadata::A1111(params.clone()));
    }
    if let Some(raw) = chunks.get("prompt") {
        return serde_json::from_str(raw)
            .ok()
            .map(|graph| RawMetadata::Comfy { raw: raw.clone(), graph });
    }
    if is_nai_chunks(chunks) {
        let mut fields = Map::new();
        for key in NAI_FIELDS {
            if let Some(value) = chunks.get(key) {
                fields.insert(key.to_string(), Value::String(value.clone()));
            }
        }
        let raw = Value::Object(fields.clone()).to_string();
        return Some(RawMetadata::Nai { raw, fields });
    }

    let raw = stealth::decode(image)?;
    let value: Value = serde_json::from_str(&raw).ok()?;
    let fields = value.as_object()?;
    if is_nai_fields(fields) {
        let fields = fields.clone();
        return Some(RawMetadata::Nai { raw, fields });
    }
    None
}

/// Open one image, find its metadata and produce the canonical tag set.
pub fn parse_image(
    path: &str,
    default_tags: &[String],
    evaluator: &dyn PromptEvaluator,
) -> ParseOutcome {
    let image = match image::open(path) {
        Ok(image) => image,
        Err(err) => {
            log::warn!("failed to open {path}: {err}");
            return ParseOutcome::Skipped;
        }
    };

    if png::is_black_image(&image) {
        log::info!("skipping all-black image: {path}");
        return ParseOutcome::Degenerate;
    }

    let chunks = match png::read_text_chunks(Path::new(path)) {
        Ok(chunks) => chunks,
        Err(err) => {
            log::warn!("failed to read chunks from {path}: {err}");
            return ParseOutcome::Skipped;
        }
    };

    let Some(metadata) = detect(&chunks, &image) else {
        return ParseOutcome::Skipped;
    };

    let (raw_parameters, extraction, prompt_type) = match metadata {
        RawMetadata::A1111(params) => {
            let extraction = a1111::parse(&params, evaluator);
            (params, extraction, "a1111")
        }
        RawMetadata::Comfy { raw, graph } => match comfyui::parse(&graph, evaluator) {
            Some(extraction) => (raw, extraction, "comfyui"),
            None => return ParseOutcome::Skipped,
        },
        RawMetadata::Nai { raw, fields } => match nai::parse(&fields, evaluator) {
            Some(extraction) => (raw, extraction, "nai_v3"),
            None => return ParseOutcome::Skipped,
        },
    };

    let tags = tags::finalize(extraction.tags, default_tags, prompt_type);
    ParseOutcome::Parsed(ImportRecord {
        path: path.to_string(),
        raw_parameters,
        tags,
        positive: extraction.positive,
        negative: extraction.negative,
    })
}
