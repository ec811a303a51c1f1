//! Generation-metadata extraction and canonical-tag synthesis for hydrus.
//!
//! Reads the generation parameters embedded in AI-generated PNGs
//! (Automatic1111 infotext, ComfyUI prompt graphs, NovelAI fields, stealth
//! pnginfo), converts them into a deduplicated set of namespaced tags plus
//! separated positive/negative prompt text, and imports the files into a
//! hydrus tag store in fingerprint-grouped batches.

pub mod error;
pub mod hydrus;
pub mod import;
pub mod metadata;
pub mod retag;
