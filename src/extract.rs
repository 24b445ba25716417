use crate::core::ChangeKind;
use crate::core::Commit;
use crate::errors::Error;
use crate::errors::Result;
use crate::mirror::RawCommit;
use crate::mirror::RawDelta;
use crate::mirror::RawStatus;
use crate::options::AnalysisOptions;
use crate::options::BulkPolicy;
use crate::options::MergePolicy;

/// Consecutive unparseable commits that abort the run.
const MAX_CONSECUTIVE_FAILURES: u32 = 3;

/// A change before identity assignment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedChange {
    pub path: String,
    pub kind: ChangeKind,
}

/// One commit after strict parsing and policy evaluation.
#[derive(Debug, Clone)]
pub struct ParsedCommit {
    pub commit: Commit,
    pub changes: Vec<ParsedChange>,
    /// Whether the commit participates in pair counting.
    pub counted: bool,
    /// Weight applied to the weighted counter path.
    pub weight: f64,
}

/// Turns the mirror's raw walk into strict [Commit] + [ParsedChange] streams.
///
/// Change kinds come from a fixed vocabulary; anything else is a parse error
/// that skips the commit. Paths that look like status tokens, emails, or bare
/// timestamps are rejected the same way, so no tooling artifact can ever be
/// recorded as a file.
pub struct Extractor {
    options: AnalysisOptions,
    consecutive_failures: u32,
    skipped: u64,
}

impl Extractor {
    pub fn new(options: AnalysisOptions) -> Self {
        Self { options, consecutive_failures: 0, skipped: 0 }
    }

    /// Commits skipped so far due to parse errors.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    /// Parse one raw commit.
    ///
    /// `Ok(None)` means the commit was skipped after a recoverable parse
    /// error; three consecutive failures abort with [Error::Parse].
    pub fn parse(&mut self, raw: RawCommit) -> Result<Option<ParsedCommit>> {
        match self.parse_inner(&raw) {
            Ok(parsed) => {
                self.consecutive_failures = 0;
                Ok(Some(parsed))
            }
            Err(msg) => {
                self.consecutive_failures += 1;
                self.skipped += 1;
                log::warn!("Skipping unparseable commit {}: {}", raw.id, msg);

                if self.consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
                    return Err(Error::Parse(format!(
                        "{} consecutive unparseable commits, last at {}: {}",
                        self.consecutive_failures, raw.id, msg
                    )));
                }

                Ok(None)
            }
        }
    }

    fn parse_inner(&self, raw: &RawCommit) -> std::result::Result<ParsedCommit, String> {
        let is_merge = raw.parent_count > 1;

        let mut changes = Vec::new();
        if !(is_merge && self.options.merge_policy == MergePolicy::Exclude) {
            for delta in &raw.deltas {
                changes.extend(self.parse_delta(delta)?);
            }
        }

        let mut weight = 1.0;
        if is_merge && self.options.merge_policy == MergePolicy::Downweight {
            weight *= self.options.merge_weight;
        }

        let mut counted = true;
        if changes.len() > self.options.max_changeset_size {
            match self.options.bulk_policy {
                BulkPolicy::Keep => {}
                BulkPolicy::Drop => counted = false,
                BulkPolicy::Downweight => weight /= changes.len() as f64,
            }
        }

        let commit = Commit {
            id: raw.id,
            author_name: raw.author_name.clone(),
            author_email: raw.author_email.clone(),
            committed_at: raw.committed_at,
            parent_count: raw.parent_count,
            changeset_size: changes.len(),
        };

        Ok(ParsedCommit { commit, changes, counted, weight })
    }

    fn parse_delta(&self, delta: &RawDelta) -> std::result::Result<Vec<ParsedChange>, String> {
        validate_path(&delta.path)?;

        if let Some(old_path) = &delta.old_path {
            validate_path(old_path)?;
        }

        let changes = match &delta.status {
            RawStatus::Added | RawStatus::Copied => {
                vec![ParsedChange { path: delta.path.clone(), kind: ChangeKind::Added }]
            }
            RawStatus::Modified | RawStatus::Typechange => {
                vec![ParsedChange { path: delta.path.clone(), kind: ChangeKind::Modified }]
            }
            RawStatus::Deleted => {
                vec![ParsedChange { path: delta.path.clone(), kind: ChangeKind::Deleted }]
            }
            RawStatus::Renamed => {
                let old_path = delta
                    .old_path
                    .clone()
                    .ok_or_else(|| format!("rename of '{}' without an old path", delta.path))?;
                let similarity = delta.similarity.unwrap_or(0);

                if similarity >= self.options.rename_similarity_threshold {
                    vec![ParsedChange {
                        path: delta.path.clone(),
                        kind: ChangeKind::Renamed { old_path, similarity },
                    }]
                } else {
                    // Below the threshold the two paths are independent files.
                    vec![
                        ParsedChange { path: old_path, kind: ChangeKind::Deleted },
                        ParsedChange { path: delta.path.clone(), kind: ChangeKind::Added },
                    ]
                }
            }
            RawStatus::Unsupported(status) => {
                return Err(format!("unsupported delta status '{}' for '{}'", status, delta.path));
            }
        };

        Ok(changes)
    }
}

/// Reject paths that cannot be real files.
///
/// Status tokens, email-shaped strings, and bare numeric timestamps are the
/// classes of tooling leakage that must never reach the file tables.
fn validate_path(path: &str) -> std::result::Result<(), String> {
    if path.is_empty() {
        return Err("empty path".to_string());
    }

    if path.chars().any(|c| c.is_control()) {
        return Err(format!("path contains control characters: {:?}", path));
    }

    if is_kind_token(path) {
        return Err(format!("path matches a change-kind token: '{}'", path));
    }

    if is_email_like(path) {
        return Err(format!("path looks like an email address: '{}'", path));
    }

    if is_timestamp_like(path) {
        return Err(format!("path looks like a timestamp: '{}'", path));
    }

    Ok(())
}

fn is_kind_token(path: &str) -> bool {
    matches!(path, "A" | "M" | "D" | "R" | "C" | "T")
        || matches!(
            path.to_ascii_lowercase().as_str(),
            "added" | "modified" | "deleted" | "renamed"
        )
}

fn is_email_like(path: &str) -> bool {
    if path.contains('/') {
        return false;
    }

    let Some((local, domain)) = path.split_once('@') else {
        return false;
    };

    if local.is_empty() || domain.contains('@') {
        return false;
    }

    let labels: Vec<&str> = domain.split('.').collect();
    if labels.len() < 2 || labels.iter().any(|l| l.is_empty()) {
        return false;
    }

    let tld = labels[labels.len() - 1];
    if !(2..=24).contains(&tld.len()) || !tld.chars().all(|c| c.is_ascii_alphabetic()) {
        return false;
    }

    // Domain labels with digits (logo@2x.png) are filenames, not hosts.
    labels[..labels.len() - 1].iter().all(|l| !l.chars().any(|c| c.is_ascii_digit()))
}

fn is_timestamp_like(path: &str) -> bool {
    !path.contains('/') && path.len() >= 9 && path.chars().all(|c| c.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::CommitId;

    fn raw_commit(parent_count: usize, deltas: Vec<RawDelta>) -> RawCommit {
        RawCommit {
            id: CommitId::from_hex(&"ab".repeat(20)).unwrap(),
            author_name: "Ada".to_string(),
            author_email: "ada@example.com".to_string(),
            committed_at: 1_700_000_000,
            parent_count,
            deltas,
        }
    }

    fn modified(path: &str) -> RawDelta {
        RawDelta {
            status: RawStatus::Modified,
            path: path.to_string(),
            old_path: None,
            similarity: None,
        }
    }

    #[test]
    fn status_tokens_and_artifacts_are_rejected_as_paths() {
        assert!(validate_path("M").is_err());
        assert!(validate_path("renamed").is_err());
        assert!(validate_path("alice@example.com").is_err());
        assert!(validate_path("1700000000").is_err());
        assert!(validate_path("").is_err());
        assert!(validate_path("bad\npath").is_err());

        assert!(validate_path("src/m.rs").is_ok());
        assert!(validate_path("logo@2x.png").is_ok());
        assert!(validate_path("v1/1700000000").is_ok());
        assert!(validate_path("Makefile").is_ok());
    }

    #[test]
    fn merge_exclude_keeps_the_commit_but_drops_changes() {
        let options = AnalysisOptions {
            merge_policy: MergePolicy::Exclude,
            ..Default::default()
        };
        let mut extractor = Extractor::new(options);

        let parsed = extractor
            .parse(raw_commit(2, vec![modified("a.rs"), modified("b.rs")]))
            .unwrap()
            .unwrap();

        assert!(parsed.commit.is_merge());
        assert!(parsed.changes.is_empty());
        assert_eq!(parsed.commit.changeset_size, 0);
    }

    #[test]
    fn merge_downweight_scales_the_weight_only() {
        let options = AnalysisOptions {
            merge_policy: MergePolicy::Downweight,
            merge_weight: 0.5,
            ..Default::default()
        };
        let mut extractor = Extractor::new(options);

        let parsed = extractor
            .parse(raw_commit(2, vec![modified("a.rs"), modified("b.rs")]))
            .unwrap()
            .unwrap();

        assert!(parsed.counted);
        assert_eq!(parsed.weight, 0.5);
        assert_eq!(parsed.changes.len(), 2);
    }

    #[test]
    fn oversized_changesets_follow_the_bulk_policy() {
        let options = AnalysisOptions {
            max_changeset_size: 2,
            bulk_policy: BulkPolicy::Drop,
            ..Default::default()
        };
        let mut extractor = Extractor::new(options);

        let deltas = vec![modified("a.rs"), modified("b.rs"), modified("c.rs")];
        let parsed = extractor.parse(raw_commit(1, deltas.clone())).unwrap().unwrap();
        assert!(!parsed.counted);
        assert_eq!(parsed.changes.len(), 3);

        let options = AnalysisOptions {
            max_changeset_size: 2,
            bulk_policy: BulkPolicy::Downweight,
            ..Default::default()
        };
        let mut extractor = Extractor::new(options);
        let parsed = extractor.parse(raw_commit(1, deltas)).unwrap().unwrap();
        assert!(parsed.counted);
        assert!((parsed.weight - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn sub_threshold_renames_split_into_delete_and_add() {
        let mut extractor = Extractor::new(AnalysisOptions::default());

        let delta = RawDelta {
            status: RawStatus::Renamed,
            path: "src/new.rs".to_string(),
            old_path: Some("src/old.rs".to_string()),
            similarity: Some(40),
        };
        let parsed = extractor.parse(raw_commit(1, vec![delta])).unwrap().unwrap();

        assert_eq!(parsed.changes.len(), 2);
        assert_eq!(parsed.changes[0].kind, ChangeKind::Deleted);
        assert_eq!(parsed.changes[1].kind, ChangeKind::Added);
    }

    #[test]
    fn three_consecutive_parse_errors_abort() {
        let mut extractor = Extractor::new(AnalysisOptions::default());
        let bad = || {
            raw_commit(
                1,
                vec![RawDelta {
                    status: RawStatus::Unsupported("conflicted".to_string()),
                    path: "a.rs".to_string(),
                    old_path: None,
                    similarity: None,
                }],
            )
        };

        assert!(extractor.parse(bad()).unwrap().is_none());
        assert!(extractor.parse(bad()).unwrap().is_none());
        assert!(matches!(extractor.parse(bad()), Err(Error::Parse(_))));
    }

    #[test]
    fn a_good_commit_resets_the_failure_streak() {
        let mut extractor = Extractor::new(AnalysisOptions::default());
        let bad = || {
            raw_commit(
                1,
                vec![RawDelta {
                    status: RawStatus::Unsupported("conflicted".to_string()),
                    path: "a.rs".to_string(),
                    old_path: None,
                    similarity: None,
                }],
            )
        };

        assert!(extractor.parse(bad()).unwrap().is_none());
        assert!(extractor.parse(bad()).unwrap().is_none());
        assert!(extractor.parse(raw_commit(1, vec![modified("ok.rs")])).unwrap().is_some());
        assert!(extractor.parse(bad()).unwrap().is_none());
        assert_eq!(extractor.skipped(), 3);
    }
}
