//! Hydrus client API access.
//!
//! Thin blocking wrapper over the endpoints the importer needs: access-key
//! verification, file upload, tagging, notes, and file search for the retag
//! pass. Everything authenticates through the `Hydrus-Client-API-Access-Key`
//! header. The [`TagStore`] trait is the seam the import pipeline works
//! against, so batching logic stays testable without a running client.

use std::collections::HashMap;
use std::time::Duration;

use reqwest::blocking::{Client, Response};
use serde::Deserialize;
use serde_json::{Map, Value, json};

use crate::error::AppError;

pub const DEFAULT_API_URL: &str = "http://127.0.0.1:45869";

pub const PERMISSION_IMPORT_FILES: u64 = 1;
pub const PERMISSION_ADD_TAGS: u64 = 2;
pub const PERMISSION_SEARCH_FILES: u64 = 3;

pub const TAG_ACTION_ADD: u64 = 0;
pub const TAG_ACTION_DELETE: u64 = 1;

/// Storage-tag status key for tags currently applied to a file.
pub const TAG_STATUS_CURRENT: &str = "0";

/// Import status codes returned by `/add_files/add_file`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportStatus {
    Created,
    AlreadyExists,
    PreviouslyDeleted,
    Failed,
    Vetoed,
    Unknown,
}

impl ImportStatus {
    pub fn from_code(code: u64) -> Self {
        match code {
            1 => ImportStatus::Created,
            2 => ImportStatus::AlreadyExists,
            3 => ImportStatus::PreviouslyDeleted,
            4 => ImportStatus::Failed,
            7 => ImportStatus::Vetoed,
            _ => ImportStatus::Unknown,
        }
    }

    /// Whether the file ended up in the store (fresh or deduplicated).
    pub fn is_success(self) -> bool {
        matches!(self, ImportStatus::Created | ImportStatus::AlreadyExists)
    }
}

/// Per-file result of an add-and-tag round.
#[derive(Debug, Clone)]
pub struct ImportOutcome {
    pub path: String,
    pub status: ImportStatus,
    pub hash: Option<String>,
}

/// The tag-store operations the import pipeline depends on.
pub trait TagStore {
    /// Upload `paths` and apply `tags` to every file that made it in.
    fn add_and_tag(
        &self,
        paths: &[String],
        tags: &[String],
        service_key: &str,
    ) -> Result<Vec<ImportOutcome>, AppError>;

    /// Attach named notes to an imported file.
    fn attach_note(&self, hash: &str, note: &HashMap<String, String>) -> Result<(), AppError>;
}

#[derive(Deserialize)]
struct VerifyAccessResponse {
    #[serde(default)]
    basic_permissions: Vec<u64>,
}

#[derive(Deserialize)]
struct AddFileResponse {
    status: Option<u64>,
    hash: Option<String>,
    note: Option<String>,
}

pub struct HydrusClient {
    http: Client,
    api_url: String,
    access_key: String,
}

impl HydrusClient {
    pub fn new(api_url: &str, access_key: &str) -> Result<Self, AppError> {
        // Large batches can keep the client busy for a while.
        let http = Client::builder().timeout(Duration::from_secs(300)).build()?;
        Ok(Self {
            http,
            api_url: api_url.trim_end_matches('/').to_string(),
            access_key: access_key.to_string(),
        })
    }

    fn get(&self, endpoint: &str, query: &[(&str, String)]) -> Result<Value, AppError> {
        let response = self
            .http
            .get(format!("{}{endpoint}", self.api_url))
            .header("Hydrus-Client-API-Access-Key", &self.access_key)
            .query(query)
            .send()?;
        Self::into_json(response, endpoint)
    }

    fn post(&self, endpoint: &str, body: &Value) -> Result<Value, AppError> {
        let response = self
            .http
            .post(format!("{}{endpoint}", self.api_url))
            .header("Hydrus-Client-API-Access-Key", &self.access_key)
            .json(body)
            .send()?;
        Self::into_json(response, endpoint)
    }

    fn into_json(response: Response, endpoint: &str) -> Result<Value, AppError> {
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().unwrap_or_default();
            return Err(AppError::Api(format!("{endpoint}: {status}: {body}")));
        }
        Ok(response.json()?)
    }

    /// Fail fast when the access key lacks a required permission.
    pub fn verify_permissions(&self, required: &[u64]) -> Result<(), AppError> {
        let response: VerifyAccessResponse =
            serde_json::from_value(self.get("/verify_access_key", &[])?)?;
        for permission in required {
            if !response.basic_permissions.contains(permission) {
                return Err(AppError::Api(format!(
                    "access key lacks required permission {permission}"
                )));
            }
        }
        Ok(())
    }

    /// Resolve a tag service name to its key.
    pub fn service_key(&self, service_name: &str) -> Result<String, AppError> {
        let response = self.get("/get_service", &[("service_name", service_name.to_string())])?;
        response["service"]["service_key"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| AppError::Api(format!("unknown tag service: {service_name}")))
    }

    pub fn add_file(&self, path: &str) -> Result<(ImportStatus, Option<String>), AppError> {
        let response: AddFileResponse =
            serde_json::from_value(self.post("/add_files/add_file", &json!({ "path": path }))?)?;
        let status = ImportStatus::from_code(response.status.unwrap_or(4));
        if let Some(note) = response.note.filter(|n| !n.is_empty()) {
            log::debug!("{path}: {note}");
        }
        Ok((status, response.hash))
    }

    pub fn add_tags(
        &self,
        hashes: &[String],
        tags: &[String],
        service_key: &str,
    ) -> Result<(), AppError> {
        let mut services = Map::new();
        services.insert(service_key.to_string(), json!(tags));
        self.post(
            "/add_tags/add_tags",
            &json!({ "hashes": hashes, "service_keys_to_tags": services }),
        )?;
        Ok(())
    }

    /// Apply an explicit tag action (add or delete) to one file.
    pub fn add_tag_actions(
        &self,
        file_id: u64,
        service_key: &str,
        action: u64,
        tags: &[String],
    ) -> Result<(), AppError> {
        let mut actions = Map::new();
        actions.insert(action.to_string(), json!(tags));
        let mut services = Map::new();
        services.insert(service_key.to_string(), Value::Object(actions));
        self.post(
            "/add_tags/add_tags",
            &json!({ "file_ids": [file_id], "service_keys_to_actions_to_tags": services }),
        )?;
        Ok(())
    }

    pub fn set_notes_for_hash(
        &self,
        hash: &str,
        notes: &HashMap<String, String>,
    ) -> Result<(), AppError> {
        self.post("/add_notes/set_notes", &json!({ "hash": hash, "notes": notes }))?;
        Ok(())
    }

    pub fn set_notes_for_file(
        &self,
        file_id: u64,
        notes: &HashMap<String, String>,
    ) -> Result<(), AppError> {
        self.post("/add_notes/set_notes", &json!({ "file_id": file_id, "notes": notes }))?;
        Ok(())
    }

    pub fn search_files(&self, query: &[String]) -> Result<Vec<u64>, AppError> {
        let tags = serde_json::to_string(query)?;
        let response = self.get("/get_files/search_files", &[("tags", tags)])?;
        Ok(response["file_ids"]
            .as_array()
            .into_iter()
            .flatten()
            .filter_map(Value::as_u64)
            .collect())
    }

    pub fn file_metadata(
        &self,
        file_ids: &[u64],
        include_notes: bool,
    ) -> Result<Vec<Value>, AppError> {
        let ids = serde_json::to_string(file_ids)?;
        let response = self.get(
            "/get_files/file_metadata",
            &[("file_ids", ids), ("include_notes", include_notes.to_string())],
        )?;
        Ok(response["metadata"].as_array().cloned().unwrap_or_default())
    }

    pub fn file_bytes(&self, file_id: u64) -> Result<Vec<u8>, AppError> {
        let response = self
            .http
            .get(format!("{}/get_files/file", self.api_url))
            .header("Hydrus-Client-API-Access-Key", &self.access_key)
            .query(&[("file_id", file_id.to_string())])
            .send()?;
        if !response.status().is_success() {
            return Err(AppError::Api(format!("/get_files/file: {}", response.status())));
        }
        Ok(response.bytes()?.to_vec())
    }
}

impl TagStore for HydrusClient {
    fn add_and_tag(
        &self,
        paths: &[String],
        tags: &[String],
        service_key: &str,
    ) -> Result<Vec<ImportOutcome>, AppError> {
        let mut outcomes = Vec::with_capacity(paths.len());
        for path in paths {
            match self.add_file(path) {
                Ok((status, hash)) => outcomes.push(ImportOutcome {
                    path: path.clone(),
                    status,
                    hash,
                }),
                Err(err) => {
                    log::warn!("failed to add {path}: {err}");
                    outcomes.push(ImportOutcome {
                        path: path.clone(),
                        status: ImportStatus::Failed,
                        hash: None,
                    });
                }
            }
        }

        let hashes: Vec<String> = outcomes
            .iter()
            .filter(|o| o.status.is_success())
            .filter_map(|o| o.hash.clone())
            .collect();
        if !hashes.is_empty() && !tags.is_empty() {
            self.add_tags(&hashes, tags, service_key)?;
        }
        Ok(outcomes)
    }

    fn attach_note(&self, hash: &str, note: &HashMap<String, String>) -> Result<(), AppError> {
        self.set_notes_for_hash(hash, note)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_map_to_outcomes() {
        assert_eq!(ImportStatus::from_code(1), ImportStatus::Created);
        assert_eq!(ImportStatus::from_code(2), ImportStatus::AlreadyExists);
        assert_eq!(ImportStatus::from_code(3), ImportStatus::PreviouslyDeleted);
        assert_eq!(ImportStatus::from_code(4), ImportStatus::Failed);
        assert_eq!(ImportStatus::from_code(7), ImportStatus::Vetoed);
        assert_eq!(ImportStatus::from_code(99), ImportStatus::Unknown);
    }

    #[test]
    fn only_stored_files_count_as_success() {
        assert!(ImportStatus::Created.is_success());
        assert!(ImportStatus::AlreadyExists.is_success());
        assert!(!ImportStatus::PreviouslyDeleted.is_success());
        assert!(!ImportStatus::Failed.is_success());
        assert!(!ImportStatus::Vetoed.is_success());
    }

    #[test]
    fn trailing_slash_is_trimmed_from_api_url() {
        let client = HydrusClient::new("http://localhost:45869/", "key").unwrap();
        assert_eq!(client.api_url, "http://localhost:45869");
    }
}
