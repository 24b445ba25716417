use std::collections::BTreeSet;
use std::collections::HashMap;
use std::hash::Hash;
use std::hash::Hasher;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;

use git2::Repository;

use crate::core::CommitId;
use crate::errors::Error;
use crate::errors::Result;

/// Blobs larger than this skip the similarity estimate for renames.
const SIMILARITY_BLOB_CAP: usize = 4 * 1024 * 1024;

/// A bare, read-only, local image of the target repository.
///
/// All version-control I/O happens behind this type; nothing downstream ever
/// touches git directly. Uses [Arc] and [Mutex] around the repository because
/// libgit2 gives no thread-safety guarantee even for reads.
#[derive(Clone)]
pub struct Mirror {
    repo: Arc<Mutex<Repository>>,
    path: PathBuf,
}

/// The delta vocabulary the mirror reports.
///
/// Downstream parsing treats anything but the first six as unsupported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawStatus {
    Added,
    Modified,
    Deleted,
    Renamed,
    Copied,
    Typechange,
    Unsupported(String),
}

/// One file-level delta of a commit against its first parent.
#[derive(Debug, Clone)]
pub struct RawDelta {
    pub status: RawStatus,
    pub path: String,
    /// Present for renames and copies.
    pub old_path: Option<String>,
    /// Present for renames: 0-100.
    pub similarity: Option<u32>,
}

/// One commit as reported by the walk, before strict parsing.
#[derive(Debug, Clone)]
pub struct RawCommit {
    pub id: CommitId,
    pub author_name: String,
    pub author_email: String,
    pub committed_at: i64,
    pub parent_count: usize,
    pub deltas: Vec<RawDelta>,
}

impl Mirror {
    /// Materialize a bare mirror of `source` (local path or URL) at `dest`.
    pub fn create(source: &str, dest: &Path) -> Result<Mirror> {
        let local = !source.contains("://") && !source.contains('@');

        if local && !Path::new(source).exists() {
            return Err(Error::validation(format!("source not found: {}", source)));
        }

        if dest.exists() {
            std::fs::remove_dir_all(dest)?;
        }

        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let repo = git2::build::RepoBuilder::new()
            .bare(true)
            .clone(source, dest)
            .map_err(|e| {
                if local {
                    Error::validation(format!("source is not a repository: {}", e.message()))
                } else {
                    Error::Git(e)
                }
            })?;

        log::info!("Mirrored {} at {}", source, dest.to_string_lossy());
        Ok(Self { repo: Arc::new(Mutex::new(repo)), path: dest.to_path_buf() })
    }

    /// Open a previously created mirror.
    pub fn open(dest: &Path) -> Result<Mirror> {
        let repo = Repository::open_bare(dest)?;
        Ok(Self { repo: Arc::new(Mutex::new(repo)), path: dest.to_path_buf() })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The authoritative set of file paths at the repository's current
    /// snapshot, taken independently of the commit walk.
    pub fn head_paths(&self) -> Result<BTreeSet<String>> {
        let repo = self.repo.lock().unwrap();
        let head = repo.head()?.peel_to_commit()?;
        let mut paths = BTreeSet::new();

        head.tree()?.walk(git2::TreeWalkMode::PreOrder, |dir, entry| {
            if entry.kind() == Some(git2::ObjectType::Blob) {
                if let Some(name) = entry.name() {
                    paths.insert(dir.to_string() + name);
                }
            }

            git2::TreeWalkResult::Ok
        })?;

        Ok(paths)
    }

    /// Commit ids reachable from HEAD in forward chronological (topological)
    /// order.
    pub fn rev_list(&self) -> Result<Vec<CommitId>> {
        let repo = self.repo.lock().unwrap();
        let mut walk = repo.revwalk()?;
        walk.push_head()?;
        walk.set_sorting(git2::Sort::TOPOLOGICAL | git2::Sort::TIME | git2::Sort::REVERSE)?;

        let mut ids = Vec::new();
        for oid in walk {
            ids.push(CommitId::from(oid?));
        }

        Ok(ids)
    }

    /// Load one commit with its deltas against the first parent.
    ///
    /// Renames are detected at `rename_threshold` (0-100); a delta only
    /// surfaces as [RawStatus::Renamed] when it meets that bar.
    pub fn raw_commit(&self, id: CommitId, rename_threshold: u32) -> Result<RawCommit> {
        let repo = self.repo.lock().unwrap();
        let commit = repo.find_commit(id.to_oid())?;
        let author = commit.author();

        let raw = RawCommit {
            id,
            author_name: author.name().unwrap_or_default().to_string(),
            author_email: author.email().unwrap_or_default().to_string(),
            committed_at: commit.time().seconds(),
            parent_count: commit.parent_count(),
            deltas: diff_first_parent(&repo, &commit, rename_threshold)?,
        };

        Ok(raw)
    }
}

impl std::fmt::Debug for Mirror {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Mirror").field(&self.path).finish()
    }
}

fn diff_first_parent(
    repo: &Repository,
    commit: &git2::Commit,
    rename_threshold: u32,
) -> Result<Vec<RawDelta>> {
    let new_tree = commit.tree()?;
    let old_tree = match commit.parent_count() {
        0 => None,
        _ => Some(commit.parent(0)?.tree()?),
    };

    let mut opts = git2::DiffOptions::new();
    opts.ignore_filemode(true);
    opts.context_lines(0);

    let mut diff = repo.diff_tree_to_tree(old_tree.as_ref(), Some(&new_tree), Some(&mut opts))?;

    let mut find = git2::DiffFindOptions::new();
    find.renames(true);
    find.rename_threshold(rename_threshold.min(100) as u16);
    diff.find_similar(Some(&mut find))?;

    let mut deltas = Vec::new();

    for delta in diff.deltas() {
        let (path, old_path) = delta_paths(&delta);

        let status = match delta.status() {
            git2::Delta::Added => RawStatus::Added,
            git2::Delta::Modified => RawStatus::Modified,
            git2::Delta::Deleted => RawStatus::Deleted,
            git2::Delta::Renamed => RawStatus::Renamed,
            git2::Delta::Copied => RawStatus::Copied,
            git2::Delta::Typechange => RawStatus::Typechange,
            other => RawStatus::Unsupported(format!("{:?}", other)),
        };

        let similarity = match status {
            RawStatus::Renamed => Some(estimate_similarity(
                repo,
                delta.old_file().id(),
                delta.new_file().id(),
                rename_threshold,
            )),
            _ => None,
        };

        deltas.push(RawDelta { status, path, old_path, similarity });
    }

    deltas.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(deltas)
}

fn delta_paths(delta: &git2::DiffDelta) -> (String, Option<String>) {
    let old = delta.old_file().path().map(|p| p.to_string_lossy().to_string());
    let new = delta.new_file().path().map(|p| p.to_string_lossy().to_string());

    match (old, new) {
        (old, Some(new)) => {
            let old = old.filter(|o| *o != new);
            (new, old)
        }
        (Some(old), None) => (old, None),
        (None, None) => (String::new(), None),
    }
}

/// Similarity of two blobs as a 0-100 score.
///
/// git2 does not surface libgit2's internal score, so renamed deltas get a
/// Dice coefficient over hashed lines. Identical blob ids short-circuit to
/// 100. Oversized or unreadable blobs fall back to the detection threshold,
/// which the delta is known to have met.
fn estimate_similarity(
    repo: &Repository,
    old_id: git2::Oid,
    new_id: git2::Oid,
    threshold: u32,
) -> u32 {
    if old_id == new_id {
        return 100;
    }

    let old = match repo.find_blob(old_id) {
        Ok(blob) if blob.content().len() <= SIMILARITY_BLOB_CAP => blob,
        _ => return threshold,
    };
    let new = match repo.find_blob(new_id) {
        Ok(blob) if blob.content().len() <= SIMILARITY_BLOB_CAP => blob,
        _ => return threshold,
    };

    line_similarity(old.content(), new.content()).max(threshold)
}

fn line_similarity(old: &[u8], new: &[u8]) -> u32 {
    let old_lines = count_lines(old);
    let new_lines = count_lines(new);
    let total: usize = old_lines.values().sum::<usize>() + new_lines.values().sum::<usize>();

    if total == 0 {
        return 100;
    }

    let common: usize = old_lines
        .iter()
        .filter_map(|(hash, n)| new_lines.get(hash).map(|m| n.min(m)))
        .sum();

    ((200 * common) / total) as u32
}

fn count_lines(content: &[u8]) -> HashMap<u64, usize> {
    let mut counts = HashMap::new();
    let content = content.strip_suffix(b"\n").unwrap_or(content);

    for line in content.split(|b| *b == b'\n') {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        line.hash(&mut hasher);
        *counts.entry(hasher.finish()).or_insert(0) += 1;
    }

    counts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_content_scores_100() {
        assert_eq!(line_similarity(b"a\nb\nc\n", b"a\nb\nc\n"), 100);
    }

    #[test]
    fn disjoint_content_scores_0() {
        assert_eq!(line_similarity(b"a\nb\n", b"x\ny\n"), 0);
    }

    #[test]
    fn half_shared_content_scores_in_between() {
        let score = line_similarity(b"a\nb\nc\nd\n", b"a\nb\nx\ny\n");
        assert!((40..=80).contains(&score), "got {}", score);
    }
}
