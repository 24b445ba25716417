use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Mutex;

use serde::Serialize;
use strum_macros::Display;
use strum_macros::EnumString;

use crate::bulk::BulkReader;
use crate::bulk::BulkWriter;
use crate::bulk::ChangeRow;
use crate::bulk::CommitRow;
use crate::catalog::now_unix;
use crate::catalog::CatalogWriter;
use crate::catalog::Staging;
use crate::core::CommitId;
use crate::core::FileId;
use crate::errors::Error;
use crate::errors::Result;
use crate::extract::Extractor;
use crate::graph::build_graph;
use crate::graph::Changeset;
use crate::graph::GraphAccumulator;
use crate::mirror::Mirror;
use crate::options::AnalysisOptions;
use crate::resolve::IdentityResolver;

/// Commits per build shard; the cancel flag is honored between shards.
const SHARD_SIZE: usize = 1024;

/// Catalog rows buffered before a batched write.
const WRITE_BATCH: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[derive(Display, EnumString)]
#[derive(Serialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Mirror,
    Extract,
    Resolve,
    Build,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[derive(Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    NotStarted,
    Queued,
    Running,
    Complete,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunFailure {
    pub kind: String,
    pub message: String,
}

/// Externally polled progress of one analysis run.
///
/// Percent and the counts only ever grow while the run is alive.
#[derive(Debug, Clone, Serialize)]
pub struct RunStatus {
    pub run_id: i64,
    pub state: RunState,
    pub stage: Option<Stage>,
    pub percent: u8,
    pub commits: u64,
    pub files: u64,
    pub edges: u64,
    pub error: Option<RunFailure>,
    /// The thresholds this run honors.
    pub thresholds: AnalysisOptions,
}

/// Shared handle between the run thread and its observers.
pub struct RunHandle {
    status: Mutex<RunStatus>,
    cancel: AtomicBool,
}

impl RunHandle {
    pub fn new(options: AnalysisOptions) -> Self {
        Self {
            status: Mutex::new(RunStatus {
                run_id: now_unix(),
                state: RunState::Queued,
                stage: None,
                percent: 0,
                commits: 0,
                files: 0,
                edges: 0,
                error: None,
                thresholds: options,
            }),
            cancel: AtomicBool::new(false),
        }
    }

    pub fn status(&self) -> RunStatus {
        self.status.lock().unwrap().clone()
    }

    /// Request cooperative cancellation; honored at stage and shard
    /// boundaries.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(Error::state("analysis cancelled"));
        }
        Ok(())
    }

    fn enter_stage(&self, stage: Stage, percent: u8) {
        log::info!("Entering stage: {}", stage);
        self.update(|status| {
            status.state = RunState::Running;
            status.stage = Some(stage);
            status.percent = status.percent.max(percent);
        });
    }

    fn update(&self, apply: impl FnOnce(&mut RunStatus)) {
        let mut status = self.status.lock().unwrap();
        let (percent, commits, files, edges) =
            (status.percent, status.commits, status.files, status.edges);

        apply(&mut status);

        // Progress is monotone regardless of what the stage reports.
        status.percent = status.percent.max(percent);
        status.commits = status.commits.max(commits);
        status.files = status.files.max(files);
        status.edges = status.edges.max(edges);
    }

    pub fn finish_complete(&self) {
        self.update(|status| {
            status.state = RunState::Complete;
            status.stage = Some(Stage::Done);
            status.percent = 100;
        });
    }

    pub fn finish_failed(&self, error: &Error) {
        let mut status = self.status.lock().unwrap();
        status.state = RunState::Failed;
        status.error =
            Some(RunFailure { kind: error.kind().to_string(), message: error.to_string() });
    }
}

/// On-disk layout of one repository under the data dir.
#[derive(Debug, Clone)]
pub struct RepoPaths {
    pub root: PathBuf,
}

impl RepoPaths {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self { root: root.as_ref().to_path_buf() }
    }

    pub fn mirror_dir(&self) -> PathBuf {
        self.root.join("mirror")
    }

    pub fn catalog_dir(&self) -> PathBuf {
        self.root.join("catalog")
    }
}

/// Drive one full analysis: mirror, extract, resolve, build, persist.
///
/// Artifacts accumulate in a staging directory that replaces the live
/// catalog only at the very end; a failure anywhere leaves the previous
/// catalog untouched.
pub fn run_analysis(
    paths: &RepoPaths,
    source: &str,
    options: &AnalysisOptions,
    handle: &RunHandle,
) -> Result<()> {
    options.validate()?;

    handle.enter_stage(Stage::Mirror, 0);
    let mirror = Mirror::create(source, &paths.mirror_dir())?;
    let head_paths = mirror.head_paths()?;
    handle.check_cancelled()?;

    handle.enter_stage(Stage::Extract, 5);
    let commit_ids = mirror.rev_list()?;
    let total = commit_ids.len().max(1);

    let staging = Staging::create(&paths.root)?;
    let mut bulk = BulkWriter::create(staging.path())?;
    let mut catalog = CatalogWriter::create(staging.path())?;

    let mut extractor = Extractor::new(options.clone());
    let mut resolver = IdentityResolver::new();

    let mut commit_rows = Vec::new();
    let mut file_commit_batch = Vec::new();

    for (walked, commit_id) in commit_ids.iter().enumerate() {
        if walked % 256 == 0 {
            handle.check_cancelled()?;
        }

        let raw = mirror.raw_commit(*commit_id, options.rename_similarity_threshold)?;
        let Some(parsed) = extractor.parse(raw)? else {
            continue;
        };

        let resolved = resolver.observe(parsed);
        let commit_row = CommitRow::new(&resolved.commit, resolved.counted, resolved.weight);
        bulk.append_commit(&commit_row)?;

        for change in &resolved.changes {
            bulk.append_change(&ChangeRow::from_change(change))?;
            file_commit_batch.push((
                change.file_id,
                change.commit_id,
                change.kind.token(),
                resolved.counted,
            ));
        }

        if file_commit_batch.len() >= WRITE_BATCH {
            catalog.write_file_commits(&file_commit_batch)?;
            file_commit_batch.clear();
        }

        commit_rows.push(commit_row);

        let file_count = resolver.file_count() as u64;
        handle.update(|status| {
            status.commits = (walked + 1) as u64;
            status.files = file_count;
            status.percent = (5 + 65 * (walked + 1) / total) as u8;
        });
    }

    if extractor.skipped() > 0 {
        log::warn!("Skipped {} unparseable commit(s)", extractor.skipped());
    }

    bulk.finish()?;
    catalog.write_commits(&commit_rows)?;
    handle.check_cancelled()?;

    handle.enter_stage(Stage::Resolve, 70);
    let mut resolved_files = resolver.finalize(&head_paths);
    handle.update(|status| status.files = resolved_files.identities.len() as u64);
    handle.check_cancelled()?;

    handle.enter_stage(Stage::Build, 75);
    let policies: HashMap<CommitId, (bool, f64)> =
        commit_rows.iter().map(|c| (c.id, (c.counted, c.weight))).collect();

    let mut acc = GraphAccumulator::new();
    let mut shard: Vec<Changeset> = Vec::with_capacity(SHARD_SIZE);
    let reader = BulkReader::open(staging.path());

    for group in reader.changesets()? {
        let (commit_id, rows) = group?;
        let Some((counted, weight)) = policies.get(&commit_id).copied() else {
            return Err(Error::internal(format!("change rows for unknown commit {}", commit_id)));
        };

        if !counted {
            continue;
        }

        let ids: Vec<FileId> =
            rows.iter().map(|r| r.file_id).collect::<std::collections::BTreeSet<_>>()
                .into_iter()
                .collect();
        shard.push(Changeset { ids, weight });

        if shard.len() >= SHARD_SIZE {
            handle.check_cancelled()?;
            acc.add_shard(&shard);
            shard.clear();
        }
    }

    if !shard.is_empty() {
        acc.add_shard(&shard);
        shard.clear();
    }

    let output = build_graph(&acc, &mut resolved_files.identities, options)?;
    handle.update(|status| {
        status.edges = output.edges.len() as u64;
        status.percent = 90;
    });
    handle.check_cancelled()?;

    // Remaining file_commits, then the read-side tables.
    if !file_commit_batch.is_empty() {
        catalog.write_file_commits(&file_commit_batch)?;
    }
    catalog.write_files(&resolved_files.identities)?;
    catalog.write_paths(&resolved_files.paths)?;
    catalog.write_edges(&output.edges)?;
    catalog.write_lineage(&resolved_files.lineage)?;
    catalog.write_components(&output.components)?;
    catalog.write_meta(
        options,
        &[
            ("source", source.to_string()),
            ("analyzed_at", now_unix().to_string()),
            ("commits_walked", commit_ids.len().to_string()),
            ("commits_skipped", extractor.skipped().to_string()),
        ],
    )?;
    catalog.finish()?;

    staging.commit(&paths.catalog_dir())?;
    handle.finish_complete();
    log::info!(
        "Analysis complete: {} commits, {} files, {} edges",
        commit_ids.len(),
        resolved_files.identities.len(),
        output.edges.len()
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_and_counts_are_monotone() {
        let handle = RunHandle::new(AnalysisOptions::default());
        handle.update(|status| {
            status.percent = 40;
            status.commits = 10;
        });
        handle.update(|status| {
            status.percent = 20;
            status.commits = 4;
        });

        let status = handle.status();
        assert_eq!(status.percent, 40);
        assert_eq!(status.commits, 10);
    }

    #[test]
    fn cancellation_is_observable_and_sticky() {
        let handle = RunHandle::new(AnalysisOptions::default());
        assert!(handle.check_cancelled().is_ok());

        handle.cancel();
        assert!(handle.is_cancelled());
        assert!(matches!(handle.check_cancelled(), Err(Error::State(_))));
    }

    #[test]
    fn failures_record_their_kind() {
        let handle = RunHandle::new(AnalysisOptions::default());
        handle.finish_failed(&Error::Parse("bad commit".to_string()));

        let status = handle.status();
        assert_eq!(status.state, RunState::Failed);
        assert_eq!(status.error.as_ref().unwrap().kind, "parse");
    }
}
