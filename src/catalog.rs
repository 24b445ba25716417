use std::path::Path;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use rusqlite::Connection;

use crate::bulk::CommitRow;
use crate::core::ChangeKindToken;
use crate::core::CommitId;
use crate::core::CommitIdSet;
use crate::core::ComponentEdge;
use crate::core::Edge;
use crate::core::FileId;
use crate::core::FileIdentity;
use crate::errors::Error;
use crate::errors::Result;
use crate::options::AnalysisOptions;
use crate::resolve::LineageRecord;

pub const CATALOG_FILE: &str = "catalog.sqlite3";

const PRAGMAS: &str = r#"
    PRAGMA journal_mode = WAL;
    PRAGMA foreign_keys = ON;
"#;

const TABLES: &str = r#"
    CREATE TABLE IF NOT EXISTS meta (
        key TEXT NOT NULL PRIMARY KEY,
        value TEXT NOT NULL
    ) STRICT;

    CREATE TABLE IF NOT EXISTS files (
        id INTEGER NOT NULL PRIMARY KEY,
        path TEXT NOT NULL,
        path_latest_observed TEXT NOT NULL,
        exists_at_head INTEGER NOT NULL,
        commits_total INTEGER NOT NULL,
        commits_filtered INTEGER NOT NULL,
        coupled_files INTEGER NOT NULL,
        first_seen_at INTEGER NOT NULL,
        last_seen_at INTEGER NOT NULL
    ) STRICT;

    CREATE INDEX IF NOT EXISTS idx_files_path ON files (path);
    CREATE INDEX IF NOT EXISTS idx_files_head_commits
        ON files (exists_at_head, commits_filtered);

    CREATE TABLE IF NOT EXISTS paths (
        path TEXT NOT NULL PRIMARY KEY,
        file_id INTEGER NOT NULL REFERENCES files (id)
    ) STRICT;

    CREATE TABLE IF NOT EXISTS edges (
        src INTEGER NOT NULL REFERENCES files (id),
        dst INTEGER NOT NULL REFERENCES files (id),
        pair_count INTEGER NOT NULL,
        pair_weight REAL NOT NULL,
        src_count INTEGER NOT NULL,
        dst_count INTEGER NOT NULL,
        jaccard REAL NOT NULL,
        jaccard_weighted REAL NOT NULL,
        p_dst_given_src REAL NOT NULL,
        p_src_given_dst REAL NOT NULL,
        PRIMARY KEY (src, dst),
        CHECK (src < dst)
    ) STRICT;

    CREATE INDEX IF NOT EXISTS idx_edges_dst ON edges (dst);

    CREATE TABLE IF NOT EXISTS rename_lineage (
        file_id INTEGER NOT NULL REFERENCES files (id),
        seq INTEGER NOT NULL,
        commit_id TEXT NOT NULL,
        old_path TEXT NOT NULL,
        new_path TEXT NOT NULL,
        similarity INTEGER NOT NULL,
        PRIMARY KEY (file_id, seq)
    ) STRICT;

    CREATE TABLE IF NOT EXISTS component_edges (
        depth INTEGER NOT NULL,
        src TEXT NOT NULL,
        dst TEXT NOT NULL,
        cochanges INTEGER NOT NULL,
        avg_jaccard REAL NOT NULL,
        PRIMARY KEY (depth, src, dst)
    ) STRICT;

    CREATE TABLE IF NOT EXISTS commits (
        id TEXT NOT NULL PRIMARY KEY,
        author_name TEXT NOT NULL,
        author_email TEXT NOT NULL,
        committed_at INTEGER NOT NULL,
        parent_count INTEGER NOT NULL,
        is_merge INTEGER NOT NULL,
        changeset_size INTEGER NOT NULL,
        counted INTEGER NOT NULL,
        weight REAL NOT NULL
    ) STRICT;

    -- Streamed during extraction, before files and commits land; no
    -- foreign keys on purpose.
    CREATE TABLE IF NOT EXISTS file_commits (
        file_id INTEGER NOT NULL,
        commit_id TEXT NOT NULL,
        kind TEXT NOT NULL
            CHECK (kind IN ('added', 'modified', 'deleted', 'renamed')),
        counted INTEGER NOT NULL,
        PRIMARY KEY (file_id, commit_id)
    ) STRICT;

    CREATE INDEX IF NOT EXISTS idx_file_commits_commit ON file_commits (commit_id);

    CREATE TABLE IF NOT EXISTS snapshots (
        id INTEGER NOT NULL PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        algorithm TEXT NOT NULL,
        params TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        modularity REAL,
        description TEXT,
        tags TEXT
    ) STRICT;

    CREATE TABLE IF NOT EXISTS snapshot_clusters (
        snapshot_id INTEGER NOT NULL REFERENCES snapshots (id),
        cluster_id INTEGER NOT NULL,
        size INTEGER NOT NULL,
        avg_coupling REAL NOT NULL,
        total_churn INTEGER NOT NULL,
        hot_files TEXT NOT NULL,
        top_commits TEXT NOT NULL,
        common_authors TEXT NOT NULL,
        PRIMARY KEY (snapshot_id, cluster_id)
    ) STRICT;

    CREATE TABLE IF NOT EXISTS snapshot_cluster_files (
        snapshot_id INTEGER NOT NULL REFERENCES snapshots (id),
        cluster_id INTEGER NOT NULL,
        file_id INTEGER NOT NULL,
        PRIMARY KEY (snapshot_id, file_id)
    ) STRICT;
"#;

/// Handle to one repository's catalog store.
///
/// Readers open the live catalog directory; the orchestrator only ever
/// writes through [CatalogWriter] into a staging directory that is swapped
/// in atomically, so a reader never observes a partial run.
pub struct Catalog {
    conn: Connection,
}

impl Catalog {
    /// Open the catalog inside `dir`, failing with a state error when no
    /// completed analysis exists there.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Catalog> {
        let path = dir.as_ref().join(CATALOG_FILE);

        if !path.exists() {
            return Err(Error::state("analysis not complete: no catalog found"));
        }

        let conn = Connection::open(&path)?;
        conn.execute_batch(PRAGMAS)?;
        Ok(Self { conn })
    }

    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }

    pub fn meta(&self, key: &str) -> Result<Option<String>> {
        let mut stmt = self.conn.prepare_cached("SELECT value FROM meta WHERE key = ?")?;
        let mut rows = stmt.query([key])?;

        match rows.next()? {
            Some(row) => Ok(Some(row.get(0)?)),
            None => Ok(None),
        }
    }

    /// The options the producing run honored.
    pub fn options(&self) -> Result<AnalysisOptions> {
        let raw = self
            .meta("options")?
            .ok_or_else(|| Error::internal("catalog is missing its options record"))?;
        serde_json::from_str(&raw).map_err(|e| Error::internal(e.to_string()))
    }

    /// Terminal identity for any path ever observed.
    pub fn file_id_for_path(&self, path: &str) -> Result<Option<FileId>> {
        let mut stmt = self.conn.prepare_cached("SELECT file_id FROM paths WHERE path = ?")?;
        let mut rows = stmt.query([path])?;

        match rows.next()? {
            Some(row) => Ok(Some(FileId(row.get::<_, i64>(0)? as u32))),
            None => Ok(None),
        }
    }

    /// The commit-id set of one identity.
    ///
    /// This is the only way commit columns reach set operations; rows are
    /// parsed into [CommitId]s and nothing else.
    pub fn commit_set(&self, file_id: FileId, counted_only: bool) -> Result<CommitIdSet> {
        let sql = if counted_only {
            "SELECT commit_id FROM file_commits WHERE file_id = ? AND counted = 1"
        } else {
            "SELECT commit_id FROM file_commits WHERE file_id = ?"
        };

        let mut stmt = self.conn.prepare_cached(sql)?;
        let mut rows = stmt.query([file_id.0 as i64])?;
        let mut set = CommitIdSet::new();

        while let Some(row) = rows.next()? {
            let hex: String = row.get(0)?;
            set.insert(CommitId::from_hex(&hex)?);
        }

        Ok(set)
    }
}

/// Transactional write API, used only by the orchestrator during a run.
///
/// Each `write_*` call commits one artifact atomically.
pub struct CatalogWriter {
    conn: Connection,
}

impl CatalogWriter {
    pub fn create<P: AsRef<Path>>(dir: P) -> Result<CatalogWriter> {
        std::fs::create_dir_all(dir.as_ref())?;
        let conn = Connection::open(dir.as_ref().join(CATALOG_FILE))?;
        conn.execute_batch(PRAGMAS)?;
        conn.execute_batch(TABLES)?;
        Ok(Self { conn })
    }

    pub fn write_meta(&mut self, options: &AnalysisOptions, extra: &[(&str, String)]) -> Result<()> {
        let tx = self.conn.transaction()?;
        {
            let mut stmt =
                tx.prepare_cached("INSERT OR REPLACE INTO meta (key, value) VALUES (?, ?)")?;
            let encoded = serde_json::to_string(options)
                .map_err(|e| Error::internal(e.to_string()))?;
            stmt.execute(("options", encoded))?;

            for (key, value) in extra {
                stmt.execute((key, value))?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn write_files(&mut self, files: &[FileIdentity]) -> Result<()> {
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO files (id, path, path_latest_observed, exists_at_head, \
                 commits_total, commits_filtered, coupled_files, first_seen_at, last_seen_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )?;

            for file in files {
                stmt.execute((
                    file.id.0 as i64,
                    &file.path_current,
                    &file.path_latest_observed,
                    file.exists_at_head as i64,
                    file.commits_total as i64,
                    file.commits_filtered as i64,
                    file.coupled_files as i64,
                    file.first_seen_at,
                    file.last_seen_at,
                ))?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn write_paths(&mut self, paths: &[(String, FileId)]) -> Result<()> {
        let tx = self.conn.transaction()?;
        {
            let mut stmt =
                tx.prepare_cached("INSERT OR REPLACE INTO paths (path, file_id) VALUES (?, ?)")?;

            for (path, file_id) in paths {
                stmt.execute((path, file_id.0 as i64))?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn write_edges(&mut self, edges: &[Edge]) -> Result<()> {
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO edges (src, dst, pair_count, pair_weight, src_count, dst_count, \
                 jaccard, jaccard_weighted, p_dst_given_src, p_src_given_dst) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )?;

            for edge in edges {
                stmt.execute((
                    edge.src.0 as i64,
                    edge.dst.0 as i64,
                    edge.pair_count as i64,
                    edge.pair_weight,
                    edge.src_count as i64,
                    edge.dst_count as i64,
                    edge.jaccard,
                    edge.jaccard_weighted,
                    edge.p_dst_given_src,
                    edge.p_src_given_dst,
                ))?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn write_lineage(&mut self, lineage: &[LineageRecord]) -> Result<()> {
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO rename_lineage \
                 (file_id, seq, commit_id, old_path, new_path, similarity) \
                 VALUES (?, ?, ?, ?, ?, ?)",
            )?;

            for record in lineage {
                stmt.execute((
                    record.file_id.0 as i64,
                    record.seq as i64,
                    record.event.commit_id.to_string(),
                    &record.event.old_path,
                    &record.event.new_path,
                    record.event.similarity as i64,
                ))?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn write_components(&mut self, components: &[ComponentEdge]) -> Result<()> {
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO component_edges (depth, src, dst, cochanges, avg_jaccard) \
                 VALUES (?, ?, ?, ?, ?)",
            )?;

            for component in components {
                stmt.execute((
                    component.depth as i64,
                    &component.src,
                    &component.dst,
                    component.cochanges as i64,
                    component.avg_jaccard,
                ))?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn write_commits(&mut self, rows: &[CommitRow]) -> Result<()> {
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO commits (id, author_name, author_email, committed_at, \
                 parent_count, is_merge, changeset_size, counted, weight) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )?;

            for row in rows {
                stmt.execute((
                    row.id.to_string(),
                    &row.author_name,
                    &row.author_email,
                    row.committed_at,
                    row.parent_count as i64,
                    row.is_merge as i64,
                    row.changeset_size as i64,
                    row.counted as i64,
                    row.weight,
                ))?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn write_file_commits(
        &mut self,
        rows: &[(FileId, CommitId, ChangeKindToken, bool)],
    ) -> Result<()> {
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR REPLACE INTO file_commits (file_id, commit_id, kind, counted) \
                 VALUES (?, ?, ?, ?)",
            )?;

            for (file_id, commit_id, kind, counted) in rows {
                stmt.execute((
                    file_id.0 as i64,
                    commit_id.to_string(),
                    kind.to_string(),
                    *counted as i64,
                ))?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn finish(self) -> Result<()> {
        self.conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;
        Ok(())
    }
}

/// A staging directory that becomes the live catalog directory atomically.
pub struct Staging {
    dir: Option<tempfile::TempDir>,
}

impl Staging {
    /// Create a staging directory next to the live one so the final rename
    /// stays on one filesystem.
    pub fn create(repo_dir: &Path) -> Result<Staging> {
        std::fs::create_dir_all(repo_dir)?;
        let dir = tempfile::Builder::new().prefix("staging-").tempdir_in(repo_dir)?;
        Ok(Self { dir: Some(dir) })
    }

    pub fn path(&self) -> &Path {
        self.dir.as_ref().expect("staging already committed").path()
    }

    /// Swap the staging directory into place as `live`.
    ///
    /// The previous catalog directory stays intact until the new one is in
    /// place; readers holding it open are unaffected.
    pub fn commit(mut self, live: &Path) -> Result<()> {
        let staged = self.dir.take().expect("staging already committed").into_path();

        let retired = live.with_extension(format!("old-{}", now_unix_nanos()));

        if live.exists() {
            std::fs::rename(live, &retired)?;
        }

        if let Err(e) = std::fs::rename(&staged, live) {
            // Roll the previous catalog back before surfacing the failure.
            if retired.exists() {
                let _ = std::fs::rename(&retired, live);
            }
            return Err(e.into());
        }

        if retired.exists() {
            let _ = std::fs::remove_dir_all(&retired);
        }

        Ok(())
    }
}

pub fn now_unix() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0)
}

fn now_unix_nanos() -> u128 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_nanos()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn commit_id(n: u8) -> CommitId {
        CommitId::from_hex(&format!("{:02x}", n).repeat(20)).unwrap()
    }

    fn identity(id: u32, path: &str) -> FileIdentity {
        FileIdentity {
            id: FileId(id),
            path_current: path.to_string(),
            path_latest_observed: path.to_string(),
            exists_at_head: true,
            commits_total: 3,
            commits_filtered: 2,
            coupled_files: 1,
            first_seen_at: 100,
            last_seen_at: 300,
        }
    }

    #[test]
    fn a_written_catalog_swaps_in_and_reads_back() {
        let repo_dir = tempfile::tempdir().unwrap();
        let staging = Staging::create(repo_dir.path()).unwrap();

        let mut writer = CatalogWriter::create(staging.path()).unwrap();
        writer.write_files(&[identity(0, "a.rs"), identity(1, "b.rs")]).unwrap();
        writer
            .write_paths(&[("a.rs".to_string(), FileId(0)), ("b.rs".to_string(), FileId(1))])
            .unwrap();
        writer
            .write_commits(&[CommitRow {
                id: commit_id(1),
                author_name: "Ada".to_string(),
                author_email: "ada@example.com".to_string(),
                committed_at: 100,
                parent_count: 1,
                is_merge: false,
                changeset_size: 2,
                counted: true,
                weight: 1.0,
            }])
            .unwrap();
        writer
            .write_file_commits(&[
                (FileId(0), commit_id(1), ChangeKindToken::Added, true),
                (FileId(1), commit_id(1), ChangeKindToken::Added, false),
            ])
            .unwrap();
        writer.write_meta(&AnalysisOptions::default(), &[]).unwrap();
        writer.finish().unwrap();

        let live = repo_dir.path().join("catalog");
        staging.commit(&live).unwrap();

        let catalog = Catalog::open(&live).unwrap();
        assert_eq!(catalog.file_id_for_path("a.rs").unwrap(), Some(FileId(0)));
        assert_eq!(catalog.file_id_for_path("gone.rs").unwrap(), None);
        assert_eq!(catalog.options().unwrap(), AnalysisOptions::default());

        let all = catalog.commit_set(FileId(1), false).unwrap();
        let counted = catalog.commit_set(FileId(1), true).unwrap();
        assert_eq!(all.len(), 1);
        assert!(counted.is_empty());
    }

    #[test]
    fn opening_a_missing_catalog_is_a_state_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(Catalog::open(dir.path().join("nope")), Err(Error::State(_))));
    }

    #[test]
    fn the_kind_column_rejects_values_outside_the_vocabulary() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = CatalogWriter::create(dir.path()).unwrap();
        writer.write_files(&[identity(0, "a.rs")]).unwrap();
        writer
            .write_commits(&[CommitRow {
                id: commit_id(1),
                author_name: String::new(),
                author_email: String::new(),
                committed_at: 0,
                parent_count: 1,
                is_merge: false,
                changeset_size: 1,
                counted: true,
                weight: 1.0,
            }])
            .unwrap();

        let result = writer.conn.execute(
            "INSERT INTO file_commits (file_id, commit_id, kind, counted) VALUES (?, ?, ?, 1)",
            (0i64, commit_id(1).to_string(), "2024-01-01T00:00:00Z"),
        );
        assert!(result.is_err());
    }
}
