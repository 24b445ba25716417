use std::collections::BTreeSet;
use std::collections::HashMap;
use std::collections::HashSet;

use itertools::Itertools;

use crate::core::Change;
use crate::core::ChangeKind;
use crate::core::Commit;
use crate::core::FileId;
use crate::core::FileIdentity;
use crate::core::RenameEvent;
use crate::extract::ParsedCommit;

/// A resolved commit: every change annotated with its identity, plus the
/// rename events that survived cycle checking.
#[derive(Debug, Clone)]
pub struct ResolvedCommit {
    pub commit: Commit,
    pub changes: Vec<Change>,
    pub renames: Vec<RenameEvent>,
    pub counted: bool,
    pub weight: f64,
    /// Distinct identities touched, sorted.
    pub ids: Vec<FileId>,
}

/// One link in an identity's rename chain.
#[derive(Debug, Clone)]
pub struct LineageRecord {
    pub file_id: FileId,
    pub seq: u32,
    pub event: RenameEvent,
}

/// Everything known about the file population once the walk is over.
#[derive(Debug, Clone)]
pub struct ResolvedFiles {
    pub identities: Vec<FileIdentity>,
    pub lineage: Vec<LineageRecord>,
    /// Every path ever observed, mapped to its terminal identity.
    pub paths: Vec<(String, FileId)>,
}

#[derive(Debug)]
struct IdentityState {
    path_current: String,
    past_paths: HashSet<String>,
    commits_total: u64,
    commits_filtered: u64,
    first_seen_at: i64,
    last_seen_at: i64,
}

impl IdentityState {
    fn new(path: &str, ts: i64) -> Self {
        Self {
            path_current: path.to_string(),
            past_paths: HashSet::new(),
            commits_total: 0,
            commits_filtered: 0,
            first_seen_at: ts,
            last_seen_at: ts,
        }
    }
}

/// Maps path observations to stable identities as the walk progresses.
///
/// Renames union the old path's identity onto the new path; the old path
/// stays searchable through the lineage table. A path deleted and later
/// recreated keeps its identity, continuing the same history.
#[derive(Debug, Default)]
pub struct IdentityResolver {
    by_path: HashMap<String, FileId>,
    terminal: HashMap<String, FileId>,
    states: Vec<IdentityState>,
    lineage: Vec<LineageRecord>,
}

impl IdentityResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn file_count(&self) -> usize {
        self.states.len()
    }

    /// The terminal identity of any path ever observed.
    pub fn resolve(&self, path: &str) -> Option<FileId> {
        self.terminal.get(path).copied()
    }

    /// Annotate one parsed commit with identities, applying rename unions.
    pub fn observe(&mut self, parsed: ParsedCommit) -> ResolvedCommit {
        let ParsedCommit { commit, changes: parsed_changes, counted, weight } = parsed;
        let ts = commit.committed_at;

        let mut changes = Vec::new();
        let mut renames = Vec::new();

        for change in parsed_changes {
            match change.kind {
                ChangeKind::Renamed { old_path, similarity } => {
                    self.apply_rename(
                        &commit,
                        old_path,
                        change.path,
                        similarity,
                        &mut changes,
                        &mut renames,
                    );
                }
                kind => {
                    let id = self.lookup_or_mint(&change.path, ts);
                    changes.push(Change {
                        commit_id: commit.id,
                        path: change.path,
                        kind,
                        file_id: id,
                    });
                }
            }
        }

        let ids: Vec<FileId> = changes.iter().map(|c| c.file_id).sorted().dedup().collect();

        for id in &ids {
            let state = &mut self.states[id.0 as usize];
            state.commits_total += 1;
            if counted {
                state.commits_filtered += 1;
            }
            state.last_seen_at = state.last_seen_at.max(ts);
            state.first_seen_at = state.first_seen_at.min(ts);
        }

        ResolvedCommit { commit, changes, renames, counted, weight, ids }
    }

    fn apply_rename(
        &mut self,
        commit: &Commit,
        old_path: String,
        new_path: String,
        similarity: u32,
        changes: &mut Vec<Change>,
        renames: &mut Vec<RenameEvent>,
    ) {
        let ts = commit.committed_at;
        let id = self.lookup_or_mint(&old_path, ts);

        if self.states[id.0 as usize].past_paths.contains(&new_path) {
            // A union here would close a rename cycle; the new path is an
            // independent file instead.
            log::warn!(
                "Rename {} -> {} at {} would revisit an earlier path; treating as independent",
                old_path,
                new_path,
                commit.id
            );

            changes.push(Change {
                commit_id: commit.id,
                path: old_path,
                kind: ChangeKind::Deleted,
                file_id: id,
            });

            let fresh = self.lookup_or_mint(&new_path, ts);
            changes.push(Change {
                commit_id: commit.id,
                path: new_path,
                kind: ChangeKind::Added,
                file_id: fresh,
            });
            return;
        }

        self.by_path.remove(&old_path);

        if let Some(displaced) = self.by_path.insert(new_path.clone(), id) {
            if displaced != id {
                log::debug!("Rename onto '{}' displaces identity {}", new_path, displaced);
            }
        }

        let state = &mut self.states[id.0 as usize];
        state.past_paths.insert(old_path.clone());
        state.path_current = new_path.clone();
        self.terminal.insert(old_path.clone(), id);
        self.terminal.insert(new_path.clone(), id);

        let event = RenameEvent {
            commit_id: commit.id,
            old_path: old_path.clone(),
            new_path: new_path.clone(),
            similarity,
        };
        let seq = self.lineage.iter().filter(|l| l.file_id == id).count() as u32;
        self.lineage.push(LineageRecord { file_id: id, seq, event: event.clone() });
        renames.push(event);

        changes.push(Change {
            commit_id: commit.id,
            path: new_path,
            kind: ChangeKind::Renamed { old_path, similarity },
            file_id: id,
        });
    }

    fn lookup_or_mint(&mut self, path: &str, ts: i64) -> FileId {
        if let Some(id) = self.by_path.get(path) {
            return *id;
        }

        let id = FileId(self.states.len() as u32);
        self.states.push(IdentityState::new(path, ts));
        self.by_path.insert(path.to_string(), id);
        self.terminal.insert(path.to_string(), id);
        id
    }

    /// Reconcile against the mirror's head listing and emit the final file
    /// population.
    ///
    /// The head listing is authoritative for `exists_at_head`; paths present
    /// at head but never observed in the walk are minted with zero counts so
    /// the two sets stay equal.
    pub fn finalize(mut self, head_paths: &BTreeSet<String>) -> ResolvedFiles {
        let mut minted = 0u64;
        for path in head_paths {
            if !self.by_path.contains_key(path) {
                self.lookup_or_mint(path, 0);
                minted += 1;
            }
        }

        if minted > 0 {
            log::info!("Minted {} identities for head paths never seen in the walk", minted);
        }

        let identities = self
            .states
            .iter()
            .enumerate()
            .map(|(i, state)| FileIdentity {
                id: FileId(i as u32),
                path_current: state.path_current.clone(),
                path_latest_observed: state.path_current.clone(),
                exists_at_head: head_paths.contains(&state.path_current)
                    && self.by_path.get(&state.path_current) == Some(&FileId(i as u32)),
                commits_total: state.commits_total,
                commits_filtered: state.commits_filtered,
                coupled_files: 0,
                first_seen_at: state.first_seen_at,
                last_seen_at: state.last_seen_at,
            })
            .collect();

        let paths = self.terminal.into_iter().sorted().collect();

        ResolvedFiles { identities, lineage: self.lineage, paths }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::CommitId;
    use crate::extract::ParsedChange;

    fn commit(n: u8, ts: i64) -> Commit {
        Commit {
            id: CommitId::from_hex(&format!("{:02x}", n).repeat(20)).unwrap(),
            author_name: "Ada".to_string(),
            author_email: "ada@example.com".to_string(),
            committed_at: ts,
            parent_count: 1,
            changeset_size: 0,
        }
    }

    fn parsed(n: u8, ts: i64, changes: Vec<(&str, ChangeKind)>) -> ParsedCommit {
        ParsedCommit {
            commit: commit(n, ts),
            changes: changes
                .into_iter()
                .map(|(path, kind)| ParsedChange { path: path.to_string(), kind })
                .collect(),
            counted: true,
            weight: 1.0,
        }
    }

    fn rename(old: &str, sim: u32) -> ChangeKind {
        ChangeKind::Renamed { old_path: old.to_string(), similarity: sim }
    }

    #[test]
    fn rename_chains_collapse_to_one_identity() {
        let mut resolver = IdentityResolver::new();
        resolver.observe(parsed(1, 100, vec![("a", ChangeKind::Added)]));
        resolver.observe(parsed(2, 200, vec![("b", rename("a", 90))]));
        resolver.observe(parsed(3, 300, vec![("c", rename("b", 95))]));

        let id = resolver.resolve("c").unwrap();
        assert_eq!(resolver.resolve("a"), Some(id));
        assert_eq!(resolver.resolve("b"), Some(id));

        let resolved = resolver.finalize(&BTreeSet::from(["c".to_string()]));
        let identity = &resolved.identities[id.0 as usize];
        assert_eq!(identity.path_current, "c");
        assert!(identity.exists_at_head);
        assert_eq!(resolved.lineage.len(), 2);
        assert_eq!(resolved.lineage[1].seq, 1);
    }

    #[test]
    fn delete_then_recreate_keeps_the_identity() {
        let mut resolver = IdentityResolver::new();
        resolver.observe(parsed(1, 100, vec![("a", ChangeKind::Added)]));
        let id = resolver.resolve("a").unwrap();

        resolver.observe(parsed(2, 200, vec![("a", ChangeKind::Deleted)]));
        resolver.observe(parsed(3, 300, vec![("a", ChangeKind::Added)]));

        assert_eq!(resolver.resolve("a"), Some(id));
        let resolved = resolver.finalize(&BTreeSet::from(["a".to_string()]));
        assert_eq!(resolved.identities[id.0 as usize].commits_total, 3);
    }

    #[test]
    fn rename_cycles_fall_back_to_independent_files() {
        let mut resolver = IdentityResolver::new();
        resolver.observe(parsed(1, 100, vec![("a", ChangeKind::Added)]));
        let first = resolver.resolve("a").unwrap();

        resolver.observe(parsed(2, 200, vec![("b", rename("a", 90))]));
        let back = resolver.observe(parsed(3, 300, vec![("a", rename("b", 90))]));

        // The reverse rename emits no event and mints a fresh identity.
        assert!(back.renames.is_empty());
        let recreated = resolver.resolve("a").unwrap();
        assert_ne!(recreated, first);
        assert_eq!(back.changes.len(), 2);
    }

    #[test]
    fn rename_onto_an_occupied_path_ends_the_displaced_identity() {
        let mut resolver = IdentityResolver::new();
        resolver.observe(parsed(1, 100, vec![("a", ChangeKind::Added), ("b", ChangeKind::Added)]));
        let a = resolver.resolve("a").unwrap();
        let b = resolver.resolve("b").unwrap();

        resolver.observe(parsed(2, 200, vec![("b", rename("a", 90))]));

        assert_eq!(resolver.resolve("b"), Some(a));
        let resolved = resolver.finalize(&BTreeSet::from(["b".to_string()]));
        assert!(resolved.identities[a.0 as usize].exists_at_head);
        assert!(!resolved.identities[b.0 as usize].exists_at_head);
    }

    #[test]
    fn uncounted_commits_only_touch_total_counts() {
        let mut resolver = IdentityResolver::new();
        resolver.observe(parsed(1, 100, vec![("a", ChangeKind::Added)]));

        let mut bulk = parsed(2, 200, vec![("a", ChangeKind::Modified)]);
        bulk.counted = false;
        resolver.observe(bulk);

        let id = resolver.resolve("a").unwrap();
        let resolved = resolver.finalize(&BTreeSet::from(["a".to_string()]));
        let identity = &resolved.identities[id.0 as usize];
        assert_eq!(identity.commits_total, 2);
        assert_eq!(identity.commits_filtered, 1);
    }

    #[test]
    fn head_paths_missing_from_the_walk_are_minted() {
        let resolver = IdentityResolver::new();
        let head = BTreeSet::from(["merge_only.rs".to_string()]);
        let resolved = resolver.finalize(&head);

        assert_eq!(resolved.identities.len(), 1);
        let identity = &resolved.identities[0];
        assert!(identity.exists_at_head);
        assert_eq!(identity.commits_total, 0);
    }
}
