use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::thread::JoinHandle;

use serde::Deserialize;
use serde::Serialize;

use crate::catalog::now_unix;
use crate::catalog::Catalog;
use crate::errors::Error;
use crate::errors::Result;
use crate::options::AnalysisOptions;
use crate::orchestrator::run_analysis;
use crate::orchestrator::RepoPaths;
use crate::orchestrator::RunHandle;
use crate::orchestrator::RunState;
use crate::orchestrator::RunStatus;
use crate::orchestrator::Stage;
use crate::query::QueryEngine;

const REPO_FILE: &str = "repo.json";
const TRASH_DIR: &str = ".trash";

/// One registered repository.
#[derive(Debug, Clone, PartialEq, Eq)]
#[derive(Serialize, Deserialize)]
pub struct RepoRecord {
    pub name: String,
    pub source: String,
    pub created_at: i64,
    /// Whether a completed catalog is available for queries.
    #[serde(default)]
    pub analyzed: bool,
}

struct RunEntry {
    handle: Arc<RunHandle>,
    thread: Option<JoinHandle<()>>,
}

/// The explicit service owning repositories, catalog handles, and active
/// runs under one `data_dir`.
///
/// There is no process-wide registry; hosts create one of these at startup
/// and drop it at teardown.
pub struct Registry {
    data_dir: PathBuf,
    runs: Mutex<HashMap<String, RunEntry>>,
}

impl Registry {
    pub fn open<P: AsRef<Path>>(data_dir: P) -> Result<Registry> {
        std::fs::create_dir_all(data_dir.as_ref())?;
        Ok(Self { data_dir: data_dir.as_ref().to_path_buf(), runs: Mutex::new(HashMap::new()) })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn repo_root(&self, name: &str) -> Result<PathBuf> {
        validate_name(name)?;
        Ok(self.data_dir.join(name))
    }

    pub fn repo_paths(&self, name: &str) -> Result<RepoPaths> {
        Ok(RepoPaths::new(self.repo_root(name)?))
    }

    pub fn create_repository(&self, name: &str, source: &str) -> Result<RepoRecord> {
        let root = self.repo_root(name)?;

        if root.exists() {
            return Err(Error::validation(format!("repository '{}' already exists", name)));
        }

        std::fs::create_dir_all(&root)?;
        let record = RepoRecord {
            name: name.to_string(),
            source: source.to_string(),
            created_at: now_unix(),
            analyzed: false,
        };
        self.save_record(&root, &record)?;
        Ok(record)
    }

    fn save_record(&self, root: &Path, record: &RepoRecord) -> Result<()> {
        let encoded = serde_json::to_string_pretty(record)
            .map_err(|e| Error::internal(e.to_string()))?;
        std::fs::write(root.join(REPO_FILE), encoded)?;
        Ok(())
    }

    /// Create the repository if missing, or point an existing one at a new
    /// source.
    pub fn upsert_repository(&self, name: &str, source: &str) -> Result<RepoRecord> {
        match self.get_repository(name) {
            Err(Error::NotFound(_)) => self.create_repository(name, source),
            Err(e) => Err(e),
            Ok(mut record) => {
                if record.source != source {
                    record.source = source.to_string();
                    self.save_record(&self.repo_root(name)?, &record)?;
                }
                Ok(record)
            }
        }
    }

    pub fn get_repository(&self, name: &str) -> Result<RepoRecord> {
        let root = self.repo_root(name)?;
        let raw = std::fs::read_to_string(root.join(REPO_FILE))
            .map_err(|_| Error::not_found(format!("no repository named '{}'", name)))?;

        let mut record: RepoRecord =
            serde_json::from_str(&raw).map_err(|e| Error::internal(e.to_string()))?;
        record.analyzed = RepoPaths::new(&root).catalog_dir().exists();
        Ok(record)
    }

    pub fn list_repositories(&self) -> Result<Vec<RepoRecord>> {
        let mut records = Vec::new();

        for entry in std::fs::read_dir(&self.data_dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();

            if !entry.path().is_dir() || name.starts_with('.') {
                continue;
            }

            if let Ok(record) = self.get_repository(&name) {
                records.push(record);
            }
        }

        records.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(records)
    }

    /// Start an analysis run on its own thread.
    ///
    /// At most one run per repository may be active; a second start request
    /// is a state error, not a queue.
    pub fn start_analysis(&self, name: &str, options: AnalysisOptions) -> Result<RunStatus> {
        options.validate()?;
        let record = self.get_repository(name)?;
        let paths = self.repo_paths(name)?;

        let mut runs = self.runs.lock().unwrap();

        if let Some(entry) = runs.get_mut(name) {
            let state = entry.handle.status().state;
            let finished = entry.thread.as_ref().map_or(true, |t| t.is_finished());

            if !finished || state == RunState::Running || state == RunState::Queued {
                return Err(Error::state("analysis already running"));
            }
        }

        let handle = Arc::new(RunHandle::new(options.clone()));
        let worker_handle = handle.clone();
        let source = record.source.clone();

        let thread = std::thread::spawn(move || {
            if let Err(e) = run_analysis(&paths, &source, &options, &worker_handle) {
                log::error!("Analysis failed: {}", e);
                worker_handle.finish_failed(&e);
            }
        });

        runs.insert(name.to_string(), RunEntry { handle: handle.clone(), thread: Some(thread) });
        Ok(handle.status())
    }

    /// Progress of the active (or most recent) run for this repository.
    ///
    /// With no run in this session, the status reflects the durable state:
    /// complete when a catalog exists, not started otherwise.
    pub fn run_status(&self, name: &str) -> Result<RunStatus> {
        let record = self.get_repository(name)?;

        if let Some(entry) = self.runs.lock().unwrap().get(name) {
            return Ok(entry.handle.status());
        }

        let (state, stage, percent, thresholds) = if record.analyzed {
            let catalog = Catalog::open(self.repo_paths(name)?.catalog_dir())?;
            (RunState::Complete, Some(Stage::Done), 100, catalog.options()?)
        } else {
            (RunState::NotStarted, None, 0, AnalysisOptions::default())
        };

        Ok(RunStatus {
            run_id: 0,
            state,
            stage,
            percent,
            commits: 0,
            files: 0,
            edges: 0,
            error: None,
            thresholds,
        })
    }

    /// Block until the active run finishes and return its final status.
    pub fn wait_for_run(&self, name: &str) -> Result<RunStatus> {
        let thread = {
            let mut runs = self.runs.lock().unwrap();
            let entry = runs
                .get_mut(name)
                .ok_or_else(|| Error::state(format!("no active run for '{}'", name)))?;
            entry.thread.take()
        };

        if let Some(thread) = thread {
            thread.join().map_err(|_| Error::internal("analysis thread panicked"))?;
        }

        self.run_status(name)
    }

    /// Open a query engine over the repository's live catalog.
    pub fn query_engine(&self, name: &str) -> Result<QueryEngine> {
        self.get_repository(name)?;
        let catalog = Catalog::open(self.repo_paths(name)?.catalog_dir())?;
        Ok(QueryEngine::new(catalog))
    }

    /// Delete a repository, aborting any active run, and move its artifacts
    /// to a timestamped tombstone directory.
    pub fn delete_repository(&self, name: &str) -> Result<PathBuf> {
        self.get_repository(name)?;
        let root = self.repo_root(name)?;

        if let Some(mut entry) = self.runs.lock().unwrap().remove(name) {
            entry.handle.cancel();
            if let Some(thread) = entry.thread.take() {
                let _ = thread.join();
            }
        }

        let trash = self.data_dir.join(TRASH_DIR);
        std::fs::create_dir_all(&trash)?;
        let tombstone = trash.join(format!("{}-{}", name, now_unix()));
        std::fs::rename(&root, &tombstone)?;

        log::info!("Repository '{}' moved to {}", name, tombstone.to_string_lossy());
        Ok(tombstone)
    }

    /// Wait for every active run; hosts call this at teardown.
    pub fn close(self) {
        let mut runs = self.runs.into_inner().unwrap();
        for (_, entry) in runs.iter_mut() {
            if let Some(thread) = entry.thread.take() {
                let _ = thread.join();
            }
        }
    }
}

fn validate_name(name: &str) -> Result<()> {
    let ok = !name.is_empty()
        && !name.starts_with('.')
        && name.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));

    if !ok {
        return Err(Error::validation(format!(
            "repository names may only contain letters, digits, '-', '_' and '.': '{}'",
            name
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repository_crud_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::open(dir.path()).unwrap();

        let record = registry.create_repository("demo", "/tmp/source").unwrap();
        assert!(!record.analyzed);

        assert_eq!(registry.get_repository("demo").unwrap().source, "/tmp/source");
        assert_eq!(registry.list_repositories().unwrap().len(), 1);

        assert!(matches!(
            registry.create_repository("demo", "/elsewhere"),
            Err(Error::Validation(_))
        ));
        assert!(matches!(registry.get_repository("ghost"), Err(Error::NotFound(_))));
    }

    #[test]
    fn deletion_moves_the_repository_into_a_tombstone() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::open(dir.path()).unwrap();
        registry.create_repository("doomed", "/tmp/source").unwrap();

        let tombstone = registry.delete_repository("doomed").unwrap();
        assert!(tombstone.exists());
        assert!(matches!(registry.get_repository("doomed"), Err(Error::NotFound(_))));

        // Tombstones do not show up as repositories.
        assert!(registry.list_repositories().unwrap().is_empty());
    }

    #[test]
    fn traversal_shaped_names_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::open(dir.path()).unwrap();

        for bad in ["", "..", "a/b", "a\\b", ".hidden"] {
            assert!(
                matches!(registry.create_repository(bad, "src"), Err(Error::Validation(_))),
                "'{}' should be rejected",
                bad
            );
        }
    }

    #[test]
    fn fresh_repositories_report_not_started_and_reject_queries() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::open(dir.path()).unwrap();
        registry.create_repository("fresh", "/tmp/source").unwrap();

        assert!(matches!(registry.query_engine("fresh"), Err(Error::State(_))));
        assert_eq!(registry.run_status("fresh").unwrap().state, RunState::NotStarted);
    }
}
