//! Retag pass over files already in the store.
//!
//! Reparses the stored `parameters` note of every file matching a search
//! query and replaces the file's tags with the result, keeping namespaced
//! tags that were added by hand (board, site and the like). Files imported
//! before notes existed get their note rebuilt from the file's own PNG
//! chunks.

use std::collections::{BTreeSet, HashMap};
use std::io::Cursor;

use serde_json::Value;

use crate::error::AppError;
use crate::hydrus::{HydrusClient, TAG_ACTION_ADD, TAG_ACTION_DELETE, TAG_STATUS_CURRENT};
use crate::metadata::{PromptEvaluator, a1111, png};

/// Metadata is fetched in batches of this many file ids.
const CHUNK_SIZE: usize = 100;

pub fn retag(
    client: &HydrusClient,
    service_name: &str,
    query: &[String],
    evaluator: &dyn PromptEvaluator,
) -> Result<(), AppError> {
    let file_ids = client.search_files(query)?;
    log::info!("retagging {} files", file_ids.len());

    let mut service_key: Option<String> = None;
    for ids in file_ids.chunks(CHUNK_SIZE) {
        let metas = client.file_metadata(ids, true)?;
        if service_key.is_none() {
            service_key = metas
                .first()
                .and_then(|meta| find_service_key(meta, service_name));
            if service_key.is_none() {
                return Err(AppError::Api(format!("unknown tag service: {service_name}")));
            }
        }
        let key = service_key.as_deref().unwrap_or_default();

        for meta in &metas {
            retag_file(client, key, meta, evaluator)?;
        }
    }
    Ok(())
}

fn retag_file(
    client: &HydrusClient,
    service_key: &str,
    meta: &Value,
    evaluator: &dyn PromptEvaluator,
) -> Result<(), AppError> {
    let Some(file_id) = meta["file_id"].as_u64() else {
        return Ok(());
    };
    let hash = meta["hash"].as_str().unwrap_or("?");

    let mut notes: HashMap<String, String> = meta["notes"]
        .as_object()
        .map(|obj| {
            obj.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
        .unwrap_or_default();

    let mut needs_update = false;
    if !notes.contains_key("parameters") {
        // Imported before notes were attached; recover the infotext from the
        // stored file itself.
        needs_update = true;
        let bytes = client.file_bytes(file_id)?;
        let chunks = png::read_text_chunks_from(Cursor::new(bytes))?;
        match chunks.get("parameters") {
            Some(params) => notes.insert("parameters".to_string(), params.clone()),
            None => {
                log::debug!("{hash}: no parameters chunk, skipping");
                return Ok(());
            }
        };
    }

    let existing: BTreeSet<String> = meta["tags"][service_key]["storage_tags"]
        [TAG_STATUS_CURRENT]
        .as_array()
        .into_iter()
        .flatten()
        .filter_map(Value::as_str)
        .map(str::to_string)
        .collect();

    let Some(params) = notes.get("parameters") else {
        return Ok(());
    };
    let new_tags = rebuild_tags(params, &existing, evaluator);

    if !needs_update && existing == new_tags {
        return Ok(());
    }

    let stale: Vec<&String> = existing.difference(&new_tags).collect();
    let fresh: Vec<&String> = new_tags.difference(&existing).collect();
    log::info!("{hash}: -{} +{} tags", stale.len(), fresh.len());
    log::debug!("{hash} removed: {stale:?}");
    log::debug!("{hash} added: {fresh:?}");

    let existing: Vec<String> = existing.into_iter().collect();
    let new_tags: Vec<String> = new_tags.into_iter().collect();
    client.add_tag_actions(file_id, service_key, TAG_ACTION_DELETE, &existing)?;
    client.add_tag_actions(file_id, service_key, TAG_ACTION_ADD, &new_tags)?;
    client.set_notes_for_file(file_id, &notes)?;
    Ok(())
}

/// Reparse the infotext, then carry over hand-added namespaced tags. The
/// `negative:` namespace is excluded since the reparse regenerates it.
fn rebuild_tags(
    params: &str,
    existing: &BTreeSet<String>,
    evaluator: &dyn PromptEvaluator,
) -> BTreeSet<String> {
    let mut tags = a1111::parse(params, evaluator).tags;
    for tag in existing {
        if tag.contains(':') && !tag.starts_with("negative:") {
            tags.insert(tag.clone());
        }
    }
    tags
}

/// The per-file metadata lists every tag service keyed by service key.
fn find_service_key(meta: &Value, service_name: &str) -> Option<String> {
    meta["tags"]
        .as_object()?
        .iter()
        .find(|(_, service)| service["name"].as_str() == Some(service_name))
        .map(|(key, _)| key.clone())
}
