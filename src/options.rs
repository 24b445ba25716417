use serde::Deserialize;
use serde::Serialize;

use crate::errors::Error;
use crate::errors::Result;

/// How merge commits participate in co-change counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[derive(strum::Display, strum::EnumString, strum::VariantNames)]
#[derive(Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum MergePolicy {
    /// Merges count like any other commit.
    #[default]
    Include,
    /// Merges emit their commit record only; no per-file changes.
    Exclude,
    /// Merges count, but their weighted contribution is scaled by
    /// `merge_weight`.
    Downweight,
}

/// What happens to commits whose changeset exceeds `max_changeset_size`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[derive(strum::Display, strum::EnumString, strum::VariantNames)]
#[derive(Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum BulkPolicy {
    /// The commit is excluded from pair counting entirely.
    #[default]
    Drop,
    /// The commit counts normally.
    Keep,
    /// The commit counts, with weighted contributions scaled by
    /// `1 / changeset_size`.
    Downweight,
}

/// Every threshold and policy an analysis run honors.
///
/// The resolved set is persisted with the catalog and echoed by `stats`, so
/// callers can always tell which filters shaped the graph they are querying.
#[derive(Debug, Clone, PartialEq)]
#[derive(Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisOptions {
    /// Minimum similarity (0-100) for a rename to join two paths into one
    /// identity.
    pub rename_similarity_threshold: u32,
    pub merge_policy: MergePolicy,
    /// Weight of a merge-commit change under [MergePolicy::Downweight].
    pub merge_weight: f64,
    /// Changesets larger than this are subject to `bulk_policy`.
    pub max_changeset_size: usize,
    pub bulk_policy: BulkPolicy,
    /// Identities with fewer policy-passing revisions are dropped from the
    /// graph.
    pub min_revisions: u64,
    /// Pairs co-changing fewer times are dropped from the graph.
    pub min_cooccurrence: u64,
    /// Each identity keeps at most this many strongest edges.
    pub topk_edges_per_file: usize,
    /// Folder-level aggregates below this co-change count are dropped.
    pub min_component_cooccurrence: u64,
}

impl Default for AnalysisOptions {
    fn default() -> Self {
        Self {
            rename_similarity_threshold: 80,
            merge_policy: MergePolicy::default(),
            merge_weight: 0.5,
            max_changeset_size: 50,
            bulk_policy: BulkPolicy::default(),
            min_revisions: 5,
            min_cooccurrence: 5,
            topk_edges_per_file: 50,
            min_component_cooccurrence: 5,
        }
    }
}

impl AnalysisOptions {
    pub fn validate(&self) -> Result<()> {
        if self.rename_similarity_threshold > 100 {
            return Err(Error::validation(format!(
                "rename_similarity_threshold must be within 0-100, got {}",
                self.rename_similarity_threshold
            )));
        }

        if !(self.merge_weight > 0.0 && self.merge_weight <= 1.0) {
            return Err(Error::validation(format!(
                "merge_weight must be within (0, 1], got {}",
                self.merge_weight
            )));
        }

        if self.max_changeset_size == 0 {
            return Err(Error::validation("max_changeset_size must be positive"));
        }

        if self.topk_edges_per_file == 0 {
            return Err(Error::validation("topk_edges_per_file must be positive"));
        }

        Ok(())
    }
}
