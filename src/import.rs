//! Batch import pipeline.
//!
//! Files are parsed one by one, grouped by their exact tag set so each group
//! costs a single tagging call, and flushed to the store in batches. A
//! plain-text cache file remembers every path that has already been imported
//! (or found degenerate) so reruns over the same directories are cheap.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use walkdir::WalkDir;

use crate::error::AppError;
use crate::hydrus::TagStore;
use crate::metadata::{self, ImportRecord, ParseOutcome, PromptEvaluator};

pub const CACHE_FILE: &str = "hydrus_import_cache.txt";

/// Flush the pending batch once this many files have been parsed.
pub const MAX_IMPORT_SIZE: usize = 100;

// ─── Processed-path cache ────────────────────────────────────────────────────

/// Persistent set of canonical paths that need no further work.
pub struct ProcessedCache {
    path: PathBuf,
    entries: HashSet<String>,
}

impl ProcessedCache {
    /// Load the cache file if it exists; a missing file is an empty cache.
    pub fn load(path: &Path) -> Self {
        let entries = match fs::read_to_string(path) {
            Ok(contents) => contents
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .collect(),
            Err(_) => HashSet::new(),
        };
        Self {
            path: path.to_path_buf(),
            entries,
        }
    }

    pub fn contains(&self, path: &str) -> bool {
        self.entries.contains(path)
    }

    pub fn insert(&mut self, path: &str) {
        self.entries.insert(path.to_string());
    }

    pub fn persist(&self) -> Result<(), AppError> {
        let mut file = fs::File::create(&self.path)?;
        for entry in &self.entries {
            writeln!(file, "{entry}")?;
        }
        Ok(())
    }
}

// ─── Tag-set batching ────────────────────────────────────────────────────────

#[derive(Debug, Default, Clone, Copy)]
pub struct ImportStats {
    pub imported: usize,
    pub duplicate: usize,
    pub failed: usize,
    pub skipped: usize,
}

/// Groups parsed files by fingerprint (their sorted tag set) so every group
/// is imported and tagged with one store call.
#[derive(Default)]
pub struct TagSetBatcher {
    groups: HashMap<Vec<String>, Vec<ImportRecord>>,
    pending: usize,
}

impl TagSetBatcher {
    pub fn push(&mut self, record: ImportRecord) {
        let fingerprint: Vec<String> = record.tags.iter().cloned().collect();
        self.groups.entry(fingerprint).or_default().push(record);
        self.pending += 1;
    }

    pub fn len(&self) -> usize {
        self.pending
    }

    pub fn is_empty(&self) -> bool {
        self.pending == 0
    }

    /// Send every pending group to the store. Files that land are remembered
    /// in the cache and get their parameter note attached; a failed group
    /// call fails its files but not the whole flush.
    pub fn flush(
        &mut self,
        store: &dyn TagStore,
        service_key: &str,
        cache: &mut ProcessedCache,
        stats: &mut ImportStats,
    ) -> Result<(), AppError> {
        for (tags, records) in self.groups.drain() {
            let paths: Vec<String> = records.iter().map(|r| r.path.clone()).collect();
            let outcomes = match store.add_and_tag(&paths, &tags, service_key) {
                Ok(outcomes) => outcomes,
                Err(err) => {
                    log::error!("batch of {} files failed: {err}", records.len());
                    stats.failed += records.len();
                    continue;
                }
            };

            for (record, outcome) in records.iter().zip(outcomes) {
                if !outcome.status.is_success() {
                    log::warn!("import failed for {}: {:?}", record.path, outcome.status);
                    stats.failed += 1;
                    continue;
                }
                match outcome.status {
                    crate::hydrus::ImportStatus::Created => stats.imported += 1,
                    _ => stats.duplicate += 1,
                }
                cache.insert(&record.path);

                if let Some(hash) = &outcome.hash {
                    let note = HashMap::from([
                        ("filename".to_string(), record.path.clone()),
                        ("parameters".to_string(), record.raw_parameters.clone()),
                        ("positive".to_string(), record.positive.clone()),
                        ("negative".to_string(), record.negative.clone()),
                    ]);
                    if let Err(err) = store.attach_note(hash, &note) {
                        log::warn!("failed to attach note to {hash}: {err}");
                    }
                }
            }
        }
        self.pending = 0;
        cache.persist()
    }
}

// ─── Import run ──────────────────────────────────────────────────────────────

/// One invocation of the import command: walks directories, parses files,
/// batches and flushes. The shutdown flag is honored between files so a
/// flush is never torn.
pub struct ImportRun<'a> {
    store: &'a dyn TagStore,
    evaluator: &'a dyn PromptEvaluator,
    service_key: String,
    cache: ProcessedCache,
    batcher: TagSetBatcher,
    shutdown: Arc<AtomicBool>,
}

impl<'a> ImportRun<'a> {
    pub fn new(
        store: &'a dyn TagStore,
        evaluator: &'a dyn PromptEvaluator,
        service_key: String,
        cache: ProcessedCache,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            store,
            evaluator,
            service_key,
            cache,
            batcher: TagSetBatcher::default(),
            shutdown,
        }
    }

    pub fn import_paths(
        &mut self,
        paths: &[String],
        default_tags: &[String],
        recursive: bool,
    ) -> Result<ImportStats, AppError> {
        let mut stats = ImportStats::default();

        'paths: for path in paths {
            if !Path::new(path).is_dir() {
                log::warn!("skipping (not a directory): {path}");
                continue;
            }
            log::info!("importing {path}");

            let mut walker = WalkDir::new(path).follow_links(true);
            if !recursive {
                walker = walker.max_depth(1);
            }

            for entry in walker.into_iter().filter_map(Result::ok) {
                if self.shutdown.load(Ordering::SeqCst) {
                    log::warn!("interrupted, flushing pending batch");
                    break 'paths;
                }
                if !entry.file_type().is_file() {
                    continue;
                }
                let is_png = entry
                    .path()
                    .extension()
                    .is_some_and(|ext| ext.eq_ignore_ascii_case("png"));
                if !is_png {
                    continue;
                }

                let realpath = match fs::canonicalize(entry.path()) {
                    Ok(p) => p.to_string_lossy().into_owned(),
                    Err(err) => {
                        log::warn!("cannot resolve {}: {err}", entry.path().display());
                        continue;
                    }
                };
                if self.cache.contains(&realpath) {
                    continue;
                }

                match metadata::parse_image(&realpath, default_tags, self.evaluator) {
                    ParseOutcome::Parsed(record) => self.batcher.push(record),
                    ParseOutcome::Degenerate => self.cache.insert(&realpath),
                    ParseOutcome::Skipped => stats.skipped += 1,
                }

                if self.batcher.len() >= MAX_IMPORT_SIZE {
                    self.batcher
                        .flush(self.store, &self.service_key, &mut self.cache, &mut stats)?;
                }
            }
        }

        self.batcher
            .flush(self.store, &self.service_key, &mut self.cache, &mut stats)?;

        log::info!(
            "done: {} imported, {} already present, {} failed, {} skipped",
            stats.imported,
            stats.duplicate,
            stats.failed,
            stats.skipped
        );
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hydrus::{ImportOutcome, ImportStatus};
    use std::cell::RefCell;
    use std::collections::BTreeSet;

    struct MockStore {
        calls: RefCell<Vec<(Vec<String>, Vec<String>)>>,
        noted_hashes: RefCell<Vec<String>>,
        fail_paths: HashSet<String>,
    }

    impl MockStore {
        fn new() -> Self {
            Self {
                calls: RefCell::new(Vec::new()),
                noted_hashes: RefCell::new(Vec::new()),
                fail_paths: HashSet::new(),
            }
        }
    }

    impl TagStore for MockStore {
        fn add_and_tag(
            &self,
            paths: &[String],
            tags: &[String],
            _service_key: &str,
        ) -> Result<Vec<ImportOutcome>, AppError> {
            self.calls
                .borrow_mut()
                .push((paths.to_vec(), tags.to_vec()));
            Ok(paths
                .iter()
                .map(|path| {
                    if self.fail_paths.contains(path) {
                        ImportOutcome {
                            path: path.clone(),
                            status: ImportStatus::Failed,
                            hash: None,
                        }
                    } else {
                        ImportOutcome {
                            path: path.clone(),
                            status: ImportStatus::Created,
                            hash: Some(format!("hash-of-{path}")),
                        }
                    }
                })
                .collect())
        }

        fn attach_note(
            &self,
            hash: &str,
            _note: &HashMap<String, String>,
        ) -> Result<(), AppError> {
            self.noted_hashes.borrow_mut().push(hash.to_string());
            Ok(())
        }
    }

    fn record(path: &str, tags: &[&str]) -> ImportRecord {
        ImportRecord {
            path: path.to_string(),
            raw_parameters: "params".to_string(),
            tags: tags.iter().map(|t| t.to_string()).collect::<BTreeSet<_>>(),
            positive: "pos".to_string(),
            negative: "neg".to_string(),
        }
    }

    fn temp_cache(dir: &tempfile::TempDir) -> ProcessedCache {
        ProcessedCache::load(&dir.path().join(CACHE_FILE))
    }

    #[test]
    fn identical_tag_sets_share_one_store_call() {
        let dir = tempfile::tempdir().unwrap();
        let store = MockStore::new();
        let mut cache = temp_cache(&dir);
        let mut stats = ImportStats::default();

        let mut batcher = TagSetBatcher::default();
        batcher.push(record("/a.png", &["1girl", "prompt_type:a1111"]));
        batcher.push(record("/b.png", &["1girl", "prompt_type:a1111"]));
        batcher.push(record("/c.png", &["landscape", "prompt_type:a1111"]));
        assert_eq!(batcher.len(), 3);

        batcher.flush(&store, "svc", &mut cache, &mut stats).unwrap();
        assert!(batcher.is_empty());
        assert_eq!(stats.imported, 3);

        let calls = store.calls.borrow();
        assert_eq!(calls.len(), 2);
        let group = calls
            .iter()
            .find(|(paths, _)| paths.len() == 2)
            .expect("grouped call");
        assert!(group.1.contains(&"1girl".to_string()));
        assert_eq!(store.noted_hashes.borrow().len(), 3);
    }

    #[test]
    fn failed_files_are_not_cached() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = MockStore::new();
        store.fail_paths.insert("/bad.png".to_string());
        let mut cache = temp_cache(&dir);
        let mut stats = ImportStats::default();

        let mut batcher = TagSetBatcher::default();
        batcher.push(record("/good.png", &["a"]));
        batcher.push(record("/bad.png", &["a"]));
        batcher.flush(&store, "svc", &mut cache, &mut stats).unwrap();

        assert_eq!(stats.imported, 1);
        assert_eq!(stats.failed, 1);
        assert!(cache.contains("/good.png"));
        assert!(!cache.contains("/bad.png"));
    }

    #[test]
    fn cache_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CACHE_FILE);

        let mut cache = ProcessedCache::load(&path);
        assert!(!cache.contains("/a.png"));
        cache.insert("/a.png");
        cache.insert("/b.png");
        cache.persist().unwrap();

        let reloaded = ProcessedCache::load(&path);
        assert!(reloaded.contains("/a.png"));
        assert!(reloaded.contains("/b.png"));
        assert!(!reloaded.contains("/c.png"));
    }
}
