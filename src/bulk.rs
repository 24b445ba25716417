use std::fs::File;
use std::path::Path;
use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;

use crate::core::Change;
use crate::core::ChangeKind;
use crate::core::ChangeKindToken;
use crate::core::Commit;
use crate::core::CommitId;
use crate::core::FileId;
use crate::errors::Result;

const COMMITS_FILE: &str = "commits.csv";
const CHANGES_FILE: &str = "changes.csv";

/// One row of the commits table.
#[derive(Debug, Clone, PartialEq)]
#[derive(Serialize, Deserialize)]
pub struct CommitRow {
    pub id: CommitId,
    pub author_name: String,
    pub author_email: String,
    pub committed_at: i64,
    pub parent_count: usize,
    pub is_merge: bool,
    pub changeset_size: usize,
    /// Whether the commit passed the counting policies.
    pub counted: bool,
    pub weight: f64,
}

impl CommitRow {
    pub fn new(commit: &Commit, counted: bool, weight: f64) -> Self {
        Self {
            id: commit.id,
            author_name: commit.author_name.clone(),
            author_email: commit.author_email.clone(),
            committed_at: commit.committed_at,
            parent_count: commit.parent_count,
            is_merge: commit.is_merge(),
            changeset_size: commit.changeset_size,
            counted,
            weight,
        }
    }
}

/// One row of the changes table. The `kind` column is the closed
/// [ChangeKindToken] vocabulary; rename detail sits in its own columns.
#[derive(Debug, Clone, PartialEq)]
#[derive(Serialize, Deserialize)]
pub struct ChangeRow {
    pub commit_id: CommitId,
    pub file_id: FileId,
    pub path: String,
    pub kind: ChangeKindToken,
    pub old_path: Option<String>,
    pub similarity: Option<u32>,
}

impl ChangeRow {
    pub fn from_change(change: &Change) -> Self {
        let (old_path, similarity) = match &change.kind {
            ChangeKind::Renamed { old_path, similarity } => {
                (Some(old_path.clone()), Some(*similarity))
            }
            _ => (None, None),
        };

        Self {
            commit_id: change.commit_id,
            file_id: change.file_id,
            path: change.path.clone(),
            kind: change.kind.token(),
            old_path,
            similarity,
        }
    }
}

/// Streams commit and change rows into the two columnar files.
pub struct BulkWriter {
    commits: csv::Writer<File>,
    changes: csv::Writer<File>,
}

impl BulkWriter {
    pub fn create<P: AsRef<Path>>(dir: P) -> Result<BulkWriter> {
        std::fs::create_dir_all(dir.as_ref())?;
        let commits = csv::Writer::from_path(dir.as_ref().join(COMMITS_FILE))?;
        let changes = csv::Writer::from_path(dir.as_ref().join(CHANGES_FILE))?;
        Ok(Self { commits, changes })
    }

    pub fn append_commit(&mut self, row: &CommitRow) -> Result<()> {
        self.commits.serialize(row)?;
        Ok(())
    }

    pub fn append_change(&mut self, row: &ChangeRow) -> Result<()> {
        self.changes.serialize(row)?;
        Ok(())
    }

    pub fn finish(mut self) -> Result<()> {
        self.commits.flush()?;
        self.changes.flush()?;
        Ok(())
    }
}

/// Read access to the bulk files.
pub struct BulkReader {
    dir: PathBuf,
}

impl BulkReader {
    pub fn open<P: AsRef<Path>>(dir: P) -> BulkReader {
        Self { dir: dir.as_ref().to_path_buf() }
    }

    pub fn commits(&self) -> Result<Vec<CommitRow>> {
        let mut reader = csv::Reader::from_path(self.dir.join(COMMITS_FILE))?;
        let mut rows = Vec::new();

        for row in reader.deserialize() {
            rows.push(row?);
        }

        Ok(rows)
    }

    /// Stream change rows grouped by commit, in write order.
    ///
    /// The full change stream never materializes; one commit's rows are held
    /// at a time.
    pub fn changesets(&self) -> Result<ChangesetIter> {
        let reader = csv::Reader::from_path(self.dir.join(CHANGES_FILE))?;
        Ok(ChangesetIter { rows: reader.into_deserialize(), pending: None })
    }
}

pub struct ChangesetIter {
    rows: csv::DeserializeRecordsIntoIter<File, ChangeRow>,
    pending: Option<ChangeRow>,
}

impl Iterator for ChangesetIter {
    type Item = Result<(CommitId, Vec<ChangeRow>)>;

    fn next(&mut self) -> Option<Self::Item> {
        let first = match self.pending.take() {
            Some(row) => row,
            None => match self.rows.next()? {
                Ok(row) => row,
                Err(e) => return Some(Err(e.into())),
            },
        };

        let commit_id = first.commit_id;
        let mut group = vec![first];

        for row in self.rows.by_ref() {
            match row {
                Ok(row) if row.commit_id == commit_id => group.push(row),
                Ok(row) => {
                    self.pending = Some(row);
                    break;
                }
                Err(e) => return Some(Err(e.into())),
            }
        }

        Some(Ok((commit_id, group)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn commit_id(n: u8) -> CommitId {
        CommitId::from_hex(&format!("{:02x}", n).repeat(20)).unwrap()
    }

    fn change_row(commit: u8, file: u32, kind: ChangeKindToken) -> ChangeRow {
        ChangeRow {
            commit_id: commit_id(commit),
            file_id: FileId(file),
            path: format!("src/file{}.rs", file),
            kind,
            old_path: None,
            similarity: None,
        }
    }

    #[test]
    fn rows_survive_a_write_read_cycle_grouped_by_commit() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = BulkWriter::create(dir.path()).unwrap();

        writer
            .append_commit(&CommitRow {
                id: commit_id(1),
                author_name: "Ada".to_string(),
                author_email: "ada@example.com".to_string(),
                committed_at: 100,
                parent_count: 1,
                is_merge: false,
                changeset_size: 2,
                counted: true,
                weight: 1.0,
            })
            .unwrap();

        writer.append_change(&change_row(1, 0, ChangeKindToken::Added)).unwrap();
        writer.append_change(&change_row(1, 1, ChangeKindToken::Added)).unwrap();
        writer.append_change(&change_row(2, 0, ChangeKindToken::Modified)).unwrap();
        writer.finish().unwrap();

        let reader = BulkReader::open(dir.path());
        assert_eq!(reader.commits().unwrap().len(), 1);

        let groups: Vec<_> = reader.changesets().unwrap().map(|g| g.unwrap()).collect();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].0, commit_id(1));
        assert_eq!(groups[0].1.len(), 2);
        assert_eq!(groups[1].1.len(), 1);
    }

    #[test]
    fn rename_detail_round_trips_through_its_own_columns() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = BulkWriter::create(dir.path()).unwrap();

        let change = Change {
            commit_id: commit_id(3),
            path: "src/new.rs".to_string(),
            kind: ChangeKind::Renamed { old_path: "src/old.rs".to_string(), similarity: 91 },
            file_id: FileId(7),
        };
        writer.append_change(&ChangeRow::from_change(&change)).unwrap();
        writer
            .append_commit(&CommitRow {
                id: commit_id(3),
                author_name: String::new(),
                author_email: String::new(),
                committed_at: 0,
                parent_count: 1,
                is_merge: false,
                changeset_size: 1,
                counted: true,
                weight: 1.0,
            })
            .unwrap();
        writer.finish().unwrap();

        let groups: Vec<_> =
            BulkReader::open(dir.path()).changesets().unwrap().map(|g| g.unwrap()).collect();
        let row = &groups[0].1[0];
        assert_eq!(row.kind, ChangeKindToken::Renamed);
        assert_eq!(row.old_path.as_deref(), Some("src/old.rs"));
        assert_eq!(row.similarity, Some(91));
    }
}
