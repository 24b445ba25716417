#![allow(dead_code)]

use std::cell::Cell;
use std::path::Path;

use git2::Repository;
use git2::Signature;
use git2::Time;

/// Builds a real git repository commit by commit, with deterministic,
/// strictly increasing timestamps.
pub struct TestRepo {
    dir: tempfile::TempDir,
    repo: Repository,
    clock: Cell<i64>,
}

impl TestRepo {
    pub fn new() -> TestRepo {
        let dir = tempfile::tempdir().expect("tempdir");
        let repo = Repository::init(dir.path()).expect("git init");
        Self { dir, repo, clock: Cell::new(1_700_000_000) }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn source(&self) -> String {
        self.dir.path().to_string_lossy().to_string()
    }

    fn tick(&self) -> i64 {
        let now = self.clock.get() + 3600;
        self.clock.set(now);
        now
    }

    /// Write the given files (content defaults make each revision unique),
    /// delete the given paths, and commit as the given author.
    pub fn commit_as(
        &self,
        author: (&str, &str),
        writes: &[(&str, &str)],
        removes: &[&str],
        message: &str,
    ) -> git2::Oid {
        for (rel, content) in writes {
            let full = self.dir.path().join(rel);
            if let Some(parent) = full.parent() {
                std::fs::create_dir_all(parent).expect("mkdir");
            }
            std::fs::write(full, content).expect("write");
        }

        let mut index = self.repo.index().expect("index");
        for (rel, _) in writes {
            index.add_path(Path::new(rel)).expect("add");
        }
        for rel in removes {
            let full = self.dir.path().join(rel);
            if full.exists() {
                std::fs::remove_file(full).expect("rm");
            }
            index.remove_path(Path::new(rel)).expect("remove");
        }
        index.write().expect("index write");

        let tree_id = index.write_tree().expect("write tree");
        let tree = self.repo.find_tree(tree_id).expect("find tree");

        let when = Time::new(self.tick(), 0);
        let sig = Signature::new(author.0, author.1, &when).expect("signature");

        let parents: Vec<git2::Commit> = match self.repo.head() {
            Ok(head) => vec![head.peel_to_commit().expect("head commit")],
            Err(_) => Vec::new(),
        };
        let parent_refs: Vec<&git2::Commit> = parents.iter().collect();

        self.repo
            .commit(Some("HEAD"), &sig, &sig, message, &tree, &parent_refs)
            .expect("commit")
    }

    pub fn commit(&self, writes: &[(&str, &str)], message: &str) -> git2::Oid {
        self.commit_as(("Ada", "ada@example.com"), writes, &[], message)
    }

    pub fn remove(&self, removes: &[&str], message: &str) -> git2::Oid {
        self.commit_as(("Ada", "ada@example.com"), &[], removes, message)
    }

    /// Move a file to a new path without touching its content, so rename
    /// detection sees an exact match.
    pub fn rename(&self, old: &str, new: &str, message: &str) -> git2::Oid {
        let content = std::fs::read_to_string(self.dir.path().join(old)).expect("read old");
        self.commit_as(("Ada", "ada@example.com"), &[(new, &content)], &[old], message)
    }

    /// Commit the given files with a second parent, producing a merge.
    pub fn merge_commit(&self, other_parent: git2::Oid, writes: &[(&str, &str)]) -> git2::Oid {
        for (rel, content) in writes {
            let full = self.dir.path().join(rel);
            if let Some(parent) = full.parent() {
                std::fs::create_dir_all(parent).expect("mkdir");
            }
            std::fs::write(full, content).expect("write");
        }

        let mut index = self.repo.index().expect("index");
        for (rel, _) in writes {
            index.add_path(Path::new(rel)).expect("add");
        }
        index.write().expect("index write");

        let tree_id = index.write_tree().expect("write tree");
        let tree = self.repo.find_tree(tree_id).expect("find tree");

        let when = Time::new(self.tick(), 0);
        let sig = Signature::new("Ada", "ada@example.com", &when).expect("signature");

        let first = self.repo.head().expect("head").peel_to_commit().expect("head commit");
        let second = self.repo.find_commit(other_parent).expect("other parent");

        self.repo
            .commit(Some("HEAD"), &sig, &sig, "merge", &tree, &[&first, &second])
            .expect("merge commit")
    }

    /// A side commit off the current HEAD, left for merging; HEAD itself is
    /// not moved.
    pub fn side_commit(&self, writes: &[(&str, &str)]) -> git2::Oid {
        for (rel, content) in writes {
            let full = self.dir.path().join(rel);
            if let Some(parent) = full.parent() {
                std::fs::create_dir_all(parent).expect("mkdir");
            }
            std::fs::write(full, content).expect("write");
        }

        let mut index = self.repo.index().expect("index");
        for (rel, _) in writes {
            index.add_path(Path::new(rel)).expect("add");
        }
        index.write().expect("index write");

        let tree_id = index.write_tree().expect("write tree");
        let tree = self.repo.find_tree(tree_id).expect("find tree");

        let when = Time::new(self.tick(), 0);
        let sig = Signature::new("Ada", "ada@example.com", &when).expect("signature");
        let head = self.repo.head().expect("head").peel_to_commit().expect("head commit");

        self.repo.commit(None, &sig, &sig, "side", &tree, &[&head]).expect("side commit")
    }
}

/// Run the full analysis for a test repository and hand back the registry.
pub fn analyze(repo: &TestRepo, options: cochange::AnalysisOptions) -> AnalyzedRepo {
    let data_dir = tempfile::tempdir().expect("data dir");
    let registry = cochange::registry::Registry::open(data_dir.path()).expect("registry");

    registry.create_repository("repo", &repo.source()).expect("create");
    registry.start_analysis("repo", options).expect("start");
    let status = registry.wait_for_run("repo").expect("wait");

    assert_eq!(
        status.state,
        cochange::orchestrator::RunState::Complete,
        "analysis failed: {:?}",
        status.error
    );

    AnalyzedRepo { _data_dir: data_dir, registry }
}

pub struct AnalyzedRepo {
    _data_dir: tempfile::TempDir,
    pub registry: cochange::registry::Registry,
}

impl AnalyzedRepo {
    pub fn engine(&self) -> cochange::query::QueryEngine {
        self.registry.query_engine("repo").expect("query engine")
    }
}
