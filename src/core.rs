use std::collections::BTreeSet;
use std::fmt;

use serde::Deserialize;
use serde::Serialize;

/// Identifies a commit in the mirrored repository.
///
/// Wraps a [git2::Oid] so the rest of the crate never handles raw hashes.
/// Serialized as 40 lowercase hex characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CommitId(git2::Oid);

impl CommitId {
    pub fn to_oid(self) -> git2::Oid {
        self.0
    }

    pub fn from_hex(hex: &str) -> Result<Self, git2::Error> {
        Ok(Self(git2::Oid::from_str(hex)?))
    }
}

impl From<git2::Oid> for CommitId {
    fn from(oid: git2::Oid) -> Self {
        Self(oid)
    }
}

impl fmt::Display for CommitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for CommitId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for CommitId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let hex = String::deserialize(deserializer)?;
        Self::from_hex(&hex).map_err(serde::de::Error::custom)
    }
}

/// A stable logical file across its rename history.
///
/// Dense ids are minted in walk order, so a given repository state always
/// produces the same assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[derive(Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileId(pub u32);

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How a file changed within a commit.
///
/// This is the entire vocabulary; nothing else is ever written to the `kind`
/// column of the bulk or catalog stores.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Added,
    Modified,
    Deleted,
    Renamed { old_path: String, similarity: u32 },
}

impl ChangeKind {
    pub fn token(&self) -> ChangeKindToken {
        match self {
            Self::Added => ChangeKindToken::Added,
            Self::Modified => ChangeKindToken::Modified,
            Self::Deleted => ChangeKindToken::Deleted,
            Self::Renamed { .. } => ChangeKindToken::Renamed,
        }
    }
}

/// The closed string form of [ChangeKind] used by persisted tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[derive(strum::Display, strum::EnumString, strum::VariantNames)]
#[derive(Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ChangeKindToken {
    Added,
    Modified,
    Deleted,
    Renamed,
}

/// One source commit, immutable once extracted.
#[derive(Debug, Clone, PartialEq, Eq)]
#[derive(Serialize)]
pub struct Commit {
    pub id: CommitId,
    pub author_name: String,
    pub author_email: String,
    pub committed_at: i64,
    pub parent_count: usize,
    /// Number of accepted per-file changes, before any counting policy.
    pub changeset_size: usize,
}

impl Commit {
    pub fn is_merge(&self) -> bool {
        self.parent_count > 1
    }
}

/// A per-file observation within a commit, annotated with its identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    pub commit_id: CommitId,
    pub path: String,
    pub kind: ChangeKind,
    pub file_id: FileId,
}

/// A rename the walker reported at or above the similarity threshold.
///
/// After resolution, `old_path` and `new_path` resolve to the same identity.
#[derive(Debug, Clone, PartialEq, Eq)]
#[derive(Serialize)]
pub struct RenameEvent {
    pub commit_id: CommitId,
    pub old_path: String,
    pub new_path: String,
    /// 0-100.
    pub similarity: u32,
}

/// The resolved state of one logical file after a completed walk.
#[derive(Debug, Clone, PartialEq, Eq)]
#[derive(Serialize)]
pub struct FileIdentity {
    pub id: FileId,
    pub path_current: String,
    pub path_latest_observed: String,
    pub exists_at_head: bool,
    /// Every commit that touched the identity.
    pub commits_total: u64,
    /// Commits that passed the merge and changeset-size policies.
    pub commits_filtered: u64,
    /// Surviving coupling edges; filled in by the graph builder.
    pub coupled_files: u64,
    pub first_seen_at: i64,
    pub last_seen_at: i64,
}

/// A co-change edge between two identities, canonically ordered `src < dst`.
#[derive(Debug, Clone, PartialEq)]
#[derive(Serialize)]
pub struct Edge {
    pub src: FileId,
    pub dst: FileId,
    pub pair_count: u64,
    pub pair_weight: f64,
    pub src_count: u64,
    pub dst_count: u64,
    pub jaccard: f64,
    pub jaccard_weighted: f64,
    pub p_dst_given_src: f64,
    pub p_src_given_dst: f64,
}

/// A folder-level aggregate of co-change at a fixed prefix depth.
#[derive(Debug, Clone, PartialEq)]
#[derive(Serialize)]
pub struct ComponentEdge {
    pub depth: u32,
    pub src: String,
    pub dst: String,
    pub cochanges: u64,
    pub avg_jaccard: f64,
}

/// A set of opaque commit identifiers.
///
/// Evidence queries intersect two of these; catalog rows are never
/// deserialized into anything else for set operations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitIdSet(BTreeSet<CommitId>);

impl CommitIdSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: CommitId) {
        self.0.insert(id);
    }

    pub fn contains(&self, id: &CommitId) -> bool {
        self.0.contains(id)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn intersection(&self, other: &CommitIdSet) -> Vec<CommitId> {
        self.0.intersection(&other.0).copied().collect()
    }
}

impl FromIterator<CommitId> for CommitIdSet {
    fn from_iter<I: IntoIterator<Item = CommitId>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// The folder prefix of `path` at `depth` components, or `None` for paths
/// shallower than `depth` (a file at the repository root has no depth-1
/// component).
pub fn folder_prefix(path: &str, depth: usize) -> Option<String> {
    let components: Vec<&str> = path.split('/').collect();

    if components.len() <= depth {
        return None;
    }

    Some(components[..depth].join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn folder_prefix_stops_before_the_filename() {
        assert_eq!(folder_prefix("a/b/c.rs", 1), Some("a".to_string()));
        assert_eq!(folder_prefix("a/b/c.rs", 2), Some("a/b".to_string()));
        assert_eq!(folder_prefix("a/b/c.rs", 3), None);
        assert_eq!(folder_prefix("top.rs", 1), None);
    }

    #[test]
    fn commit_id_round_trips_through_hex() {
        let id = CommitId::from_hex("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa").unwrap();
        assert_eq!(id.to_string(), "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa");
    }

    #[test]
    fn commit_id_set_intersection_is_sorted() {
        let a: CommitIdSet = ["aa", "bb", "cc"]
            .iter()
            .map(|c| CommitId::from_hex(&c.repeat(20)).unwrap())
            .collect();
        let b: CommitIdSet = ["cc", "bb"]
            .iter()
            .map(|c| CommitId::from_hex(&c.repeat(20)).unwrap())
            .collect();

        let common = a.intersection(&b);
        assert_eq!(common.len(), 2);
        assert!(common.windows(2).all(|w| w[0] < w[1]));
    }
}
