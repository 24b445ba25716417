use std::collections::HashMap;
use std::collections::HashSet;

use itertools::Itertools;
use serde::Serialize;
use serde_json::Value;

use crate::catalog::now_unix;
use crate::catalog::Catalog;
use crate::cluster::ClusterResult;
use crate::core::CommitId;
use crate::core::FileId;
use crate::errors::Error;
use crate::errors::Result;

/// Hot files, top commits, and authors kept per cluster.
const ENRICHMENT_LIMIT: usize = 5;

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotMeta {
    pub id: i64,
    pub name: String,
    pub algorithm: String,
    pub params: Value,
    pub created_at: i64,
    pub modularity: Option<f64>,
    pub description: Option<String>,
    pub tags: Vec<String>,
    pub cluster_count: u64,
    pub file_count: u64,
}

#[derive(Debug, Clone, Serialize, serde::Deserialize)]
pub struct HotFile {
    pub file_id: FileId,
    pub path: String,
    pub revisions: u64,
}

#[derive(Debug, Clone, Serialize, serde::Deserialize)]
pub struct TopCommit {
    pub commit_id: CommitId,
    pub files_in_cluster: u64,
    pub changeset_size: u64,
    /// Fraction of the changeset inside the cluster.
    pub containment: f64,
}

#[derive(Debug, Clone, Serialize, serde::Deserialize)]
pub struct CommonAuthor {
    pub author_name: String,
    pub author_email: String,
    pub commits: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClusterDetail {
    pub cluster_id: i64,
    pub size: u64,
    /// Mean jaccard over intra-cluster edges; 0 for singletons.
    pub avg_coupling: f64,
    /// Summed revisions of the member identities.
    pub total_churn: u64,
    pub hot_files: Vec<HotFile>,
    pub top_commits: Vec<TopCommit>,
    pub common_authors: Vec<CommonAuthor>,
    pub files: Vec<HotFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotDetail {
    pub meta: SnapshotMeta,
    pub clusters: Vec<ClusterDetail>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotEdge {
    pub cluster_id: i64,
    pub src: FileId,
    pub dst: FileId,
    pub pair_count: u64,
    pub jaccard: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SnapshotComparison {
    pub files_moved: u64,
    pub clusters_split: u64,
    pub clusters_merged: u64,
    /// Fraction of co-clustered pairs that stay co-clustered.
    pub stability_score: f64,
}

/// Snapshot CRUD over the catalog's snapshot tables.
///
/// Writes go through one transaction per snapshot; the partition property is
/// backed by the `(snapshot_id, file_id)` primary key, so a file landing in
/// two clusters is a constraint violation, not silent corruption.
pub struct SnapshotStore<'a> {
    catalog: &'a Catalog,
}

impl<'a> SnapshotStore<'a> {
    pub fn new(catalog: &'a Catalog) -> Self {
        Self { catalog }
    }

    pub fn save(
        &self,
        name: &str,
        result: &ClusterResult,
        description: Option<&str>,
        tags: &[String],
    ) -> Result<i64> {
        let enriched: Vec<ClusterDetail> = result
            .clusters
            .iter()
            .map(|c| self.enrich(c.id, &c.files))
            .collect::<Result<_>>()?;

        let conn = self.catalog.conn();
        conn.execute_batch("BEGIN")?;

        let outcome = (|| -> Result<i64> {
            conn.prepare_cached(
                "INSERT INTO snapshots \
                 (name, algorithm, params, created_at, modularity, description, tags) \
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )?
            .execute((
                name,
                result.algorithm.to_string(),
                result.params.to_string(),
                now_unix(),
                result.modularity,
                description,
                serde_json::to_string(tags).map_err(|e| Error::internal(e.to_string()))?,
            ))?;

            let snapshot_id = conn.last_insert_rowid();

            let mut cluster_stmt = conn.prepare_cached(
                "INSERT INTO snapshot_clusters \
                 (snapshot_id, cluster_id, size, avg_coupling, total_churn, hot_files, \
                 top_commits, common_authors) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            )?;
            let mut file_stmt = conn.prepare_cached(
                "INSERT INTO snapshot_cluster_files (snapshot_id, cluster_id, file_id) \
                 VALUES (?, ?, ?)",
            )?;

            for detail in &enriched {
                cluster_stmt.execute((
                    snapshot_id,
                    detail.cluster_id,
                    detail.size as i64,
                    detail.avg_coupling,
                    detail.total_churn as i64,
                    encode(&detail.hot_files)?,
                    encode(&detail.top_commits)?,
                    encode(&detail.common_authors)?,
                ))?;

                for file in &detail.files {
                    file_stmt.execute((snapshot_id, detail.cluster_id, file.file_id.0 as i64))?;
                }
            }

            Ok(snapshot_id)
        })();

        match outcome {
            Ok(id) => {
                conn.execute_batch("COMMIT")?;
                Ok(id)
            }
            Err(e) => {
                let _ = conn.execute_batch("ROLLBACK");
                Err(e)
            }
        }
    }

    fn enrich(&self, cluster_id: i64, files: &[FileId]) -> Result<ClusterDetail> {
        let conn = self.catalog.conn();

        let mut members = Vec::new();
        let mut file_stmt =
            conn.prepare_cached("SELECT path, commits_total FROM files WHERE id = ?")?;
        for file in files {
            let (path, revisions): (String, i64) =
                file_stmt.query_row([file.0 as i64], |row| Ok((row.get(0)?, row.get(1)?)))?;
            members.push(HotFile { file_id: *file, path, revisions: revisions as u64 });
        }

        let total_churn = members.iter().map(|m| m.revisions).sum();

        let mut hot_files = members.clone();
        hot_files.sort_by(|a, b| b.revisions.cmp(&a.revisions).then_with(|| a.path.cmp(&b.path)));
        hot_files.truncate(ENRICHMENT_LIMIT);

        let member_set: HashSet<FileId> = files.iter().copied().collect();
        let avg_coupling = self.avg_coupling(&member_set)?;
        let top_commits = self.top_commits(&member_set)?;
        let common_authors = self.common_authors(files)?;

        Ok(ClusterDetail {
            cluster_id,
            size: files.len() as u64,
            avg_coupling,
            total_churn,
            hot_files,
            top_commits,
            common_authors,
            files: members,
        })
    }

    fn avg_coupling(&self, members: &HashSet<FileId>) -> Result<f64> {
        if members.len() < 2 {
            return Ok(0.0);
        }

        let conn = self.catalog.conn();
        let mut stmt = conn.prepare_cached("SELECT src, dst, jaccard FROM edges")?;
        let mut rows = stmt.query([])?;

        let mut sum = 0.0;
        let mut count = 0u64;

        while let Some(row) = rows.next()? {
            let src = FileId(row.get::<_, i64>(0)? as u32);
            let dst = FileId(row.get::<_, i64>(1)? as u32);

            if members.contains(&src) && members.contains(&dst) {
                sum += row.get::<_, f64>(2)?;
                count += 1;
            }
        }

        Ok(if count == 0 { 0.0 } else { sum / count as f64 })
    }

    fn top_commits(&self, members: &HashSet<FileId>) -> Result<Vec<TopCommit>> {
        let conn = self.catalog.conn();

        // Member-file count per commit.
        let mut per_commit: HashMap<String, (u64, u64)> = HashMap::new();
        {
            let mut stmt = conn
                .prepare_cached("SELECT commit_id, file_id FROM file_commits WHERE counted = 1")?;
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                let commit: String = row.get(0)?;
                let file = FileId(row.get::<_, i64>(1)? as u32);
                if members.contains(&file) {
                    per_commit.entry(commit).or_insert((0, 0)).0 += 1;
                }
            }
        }

        let mut size_stmt =
            conn.prepare_cached("SELECT changeset_size FROM commits WHERE id = ?")?;
        for (commit, entry) in per_commit.iter_mut() {
            let size: i64 = size_stmt.query_row([commit], |row| row.get(0))?;
            entry.1 = size as u64;
        }

        let mut top: Vec<TopCommit> = per_commit
            .into_iter()
            .filter(|(_, (in_cluster, _))| *in_cluster >= 2)
            .map(|(commit, (in_cluster, changeset_size))| {
                Ok(TopCommit {
                    commit_id: CommitId::from_hex(&commit)?,
                    files_in_cluster: in_cluster,
                    changeset_size,
                    containment: if changeset_size == 0 {
                        0.0
                    } else {
                        in_cluster as f64 / changeset_size as f64
                    },
                })
            })
            .collect::<Result<_>>()?;

        top.sort_by(|a, b| {
            b.containment
                .partial_cmp(&a.containment)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.files_in_cluster.cmp(&a.files_in_cluster))
                .then(a.commit_id.cmp(&b.commit_id))
        });
        top.truncate(ENRICHMENT_LIMIT);
        Ok(top)
    }

    fn common_authors(&self, files: &[FileId]) -> Result<Vec<CommonAuthor>> {
        if files.is_empty() {
            return Ok(Vec::new());
        }

        let conn = self.catalog.conn();
        let placeholders = files.iter().map(|_| "?").join(", ");
        let sql = format!(
            "SELECT c.author_name, c.author_email, COUNT(DISTINCT c.id) \
             FROM file_commits fc JOIN commits c ON c.id = fc.commit_id \
             WHERE fc.file_id IN ({}) \
             GROUP BY c.author_name, c.author_email \
             ORDER BY COUNT(DISTINCT c.id) DESC, c.author_email \
             LIMIT {}",
            placeholders, ENRICHMENT_LIMIT
        );

        let mut stmt = conn.prepare(&sql)?;
        let params = files.iter().map(|f| f.0 as i64).collect::<Vec<_>>();
        let mut rows = stmt.query(rusqlite::params_from_iter(params))?;
        let mut authors = Vec::new();

        while let Some(row) = rows.next()? {
            authors.push(CommonAuthor {
                author_name: row.get(0)?,
                author_email: row.get(1)?,
                commits: row.get::<_, i64>(2)? as u64,
            });
        }

        Ok(authors)
    }

    pub fn list(&self) -> Result<Vec<SnapshotMeta>> {
        let conn = self.catalog.conn();
        let mut stmt = conn.prepare_cached(
            "SELECT s.id, s.name, s.algorithm, s.params, s.created_at, s.modularity, \
             s.description, s.tags, \
             (SELECT COUNT(*) FROM snapshot_clusters sc WHERE sc.snapshot_id = s.id), \
             (SELECT COUNT(*) FROM snapshot_cluster_files sf WHERE sf.snapshot_id = s.id) \
             FROM snapshots s ORDER BY s.id",
        )?;

        let mut rows = stmt.query([])?;
        let mut snapshots = Vec::new();

        while let Some(row) = rows.next()? {
            snapshots.push(meta_from_row(row)?);
        }

        Ok(snapshots)
    }

    pub fn get(&self, id: i64) -> Result<SnapshotDetail> {
        let meta = self
            .list()?
            .into_iter()
            .find(|s| s.id == id)
            .ok_or_else(|| Error::not_found(format!("no snapshot with id {}", id)))?;

        let conn = self.catalog.conn();
        let mut stmt = conn.prepare_cached(
            "SELECT cluster_id, size, avg_coupling, total_churn, hot_files, top_commits, \
             common_authors FROM snapshot_clusters WHERE snapshot_id = ? ORDER BY cluster_id",
        )?;

        let mut rows = stmt.query([id])?;
        let mut clusters = Vec::new();

        while let Some(row) = rows.next()? {
            let cluster_id: i64 = row.get(0)?;
            clusters.push(ClusterDetail {
                cluster_id,
                size: row.get::<_, i64>(1)? as u64,
                avg_coupling: row.get(2)?,
                total_churn: row.get::<_, i64>(3)? as u64,
                hot_files: decode(&row.get::<_, String>(4)?)?,
                top_commits: decode(&row.get::<_, String>(5)?)?,
                common_authors: decode(&row.get::<_, String>(6)?)?,
                files: Vec::new(),
            });
        }

        let mut file_stmt = conn.prepare_cached(
            "SELECT scf.cluster_id, scf.file_id, f.path, f.commits_total \
             FROM snapshot_cluster_files scf JOIN files f ON f.id = scf.file_id \
             WHERE scf.snapshot_id = ? ORDER BY scf.file_id",
        )?;
        let mut rows = file_stmt.query([id])?;

        let mut by_cluster: HashMap<i64, Vec<HotFile>> = HashMap::new();
        while let Some(row) = rows.next()? {
            by_cluster.entry(row.get(0)?).or_default().push(HotFile {
                file_id: FileId(row.get::<_, i64>(1)? as u32),
                path: row.get(2)?,
                revisions: row.get::<_, i64>(3)? as u64,
            });
        }

        for cluster in clusters.iter_mut() {
            cluster.files = by_cluster.remove(&cluster.cluster_id).unwrap_or_default();
        }

        // Noise sorts to the front on cluster_id; put it last.
        clusters.sort_by_key(|c| if c.cluster_id == -1 { i64::MAX } else { c.cluster_id });

        Ok(SnapshotDetail { meta, clusters })
    }

    pub fn delete(&self, id: i64) -> Result<()> {
        let conn = self.catalog.conn();

        let existing: i64 =
            conn.query_row("SELECT COUNT(*) FROM snapshots WHERE id = ?", [id], |r| r.get(0))?;
        if existing == 0 {
            return Err(Error::not_found(format!("no snapshot with id {}", id)));
        }

        conn.execute_batch("BEGIN")?;
        let outcome = (|| -> Result<()> {
            conn.execute("DELETE FROM snapshot_cluster_files WHERE snapshot_id = ?", [id])?;
            conn.execute("DELETE FROM snapshot_clusters WHERE snapshot_id = ?", [id])?;
            conn.execute("DELETE FROM snapshots WHERE id = ?", [id])?;
            Ok(())
        })();

        match outcome {
            Ok(()) => {
                conn.execute_batch("COMMIT")?;
                Ok(())
            }
            Err(e) => {
                let _ = conn.execute_batch("ROLLBACK");
                Err(e)
            }
        }
    }

    /// Rename or retag a snapshot; the partition itself never mutates.
    pub fn update_meta(
        &self,
        id: i64,
        name: Option<&str>,
        description: Option<&str>,
        tags: Option<&[String]>,
    ) -> Result<()> {
        let conn = self.catalog.conn();

        let existing: i64 =
            conn.query_row("SELECT COUNT(*) FROM snapshots WHERE id = ?", [id], |r| r.get(0))?;
        if existing == 0 {
            return Err(Error::not_found(format!("no snapshot with id {}", id)));
        }

        if let Some(name) = name {
            conn.execute("UPDATE snapshots SET name = ? WHERE id = ?", (name, id))?;
        }
        if let Some(description) = description {
            conn.execute(
                "UPDATE snapshots SET description = ? WHERE id = ?",
                (description, id),
            )?;
        }
        if let Some(tags) = tags {
            let encoded =
                serde_json::to_string(tags).map_err(|e| Error::internal(e.to_string()))?;
            conn.execute("UPDATE snapshots SET tags = ? WHERE id = ?", (encoded, id))?;
        }

        Ok(())
    }

    /// Intra-cluster coupling edges of one snapshot.
    pub fn edges(&self, id: i64) -> Result<Vec<SnapshotEdge>> {
        let partition = self.partition(id)?;
        let conn = self.catalog.conn();
        let mut stmt = conn.prepare_cached("SELECT src, dst, pair_count, jaccard FROM edges")?;
        let mut rows = stmt.query([])?;
        let mut edges = Vec::new();

        while let Some(row) = rows.next()? {
            let src = FileId(row.get::<_, i64>(0)? as u32);
            let dst = FileId(row.get::<_, i64>(1)? as u32);

            if let (Some(a), Some(b)) = (partition.get(&src), partition.get(&dst)) {
                if a == b {
                    edges.push(SnapshotEdge {
                        cluster_id: *a,
                        src,
                        dst,
                        pair_count: row.get::<_, i64>(2)? as u64,
                        jaccard: row.get(3)?,
                    });
                }
            }
        }

        edges.sort_by(|x, y| {
            (x.cluster_id, x.src, x.dst).cmp(&(y.cluster_id, y.src, y.dst))
        });
        Ok(edges)
    }

    fn partition(&self, id: i64) -> Result<HashMap<FileId, i64>> {
        let conn = self.catalog.conn();

        let existing: i64 =
            conn.query_row("SELECT COUNT(*) FROM snapshots WHERE id = ?", [id], |r| r.get(0))?;
        if existing == 0 {
            return Err(Error::not_found(format!("no snapshot with id {}", id)));
        }

        let mut stmt = conn.prepare_cached(
            "SELECT file_id, cluster_id FROM snapshot_cluster_files WHERE snapshot_id = ?",
        )?;
        let mut rows = stmt.query([id])?;
        let mut partition = HashMap::new();

        while let Some(row) = rows.next()? {
            partition.insert(FileId(row.get::<_, i64>(0)? as u32), row.get(1)?);
        }

        Ok(partition)
    }

    /// Compare two snapshots over the identities they share.
    pub fn compare(&self, a: i64, b: i64) -> Result<SnapshotComparison> {
        let part_a = self.partition(a)?;
        let part_b = self.partition(b)?;

        let common: Vec<FileId> =
            part_a.keys().filter(|id| part_b.contains_key(id)).copied().sorted().collect();

        Ok(compare_partitions(
            &common.iter().map(|id| part_a[id]).collect::<Vec<_>>(),
            &common.iter().map(|id| part_b[id]).collect::<Vec<_>>(),
        ))
    }
}

/// Compare two parallel label vectors.
fn compare_partitions(a: &[i64], b: &[i64]) -> SnapshotComparison {
    let mut sizes_a: HashMap<i64, u64> = HashMap::new();
    let mut sizes_b: HashMap<i64, u64> = HashMap::new();
    let mut cells: HashMap<(i64, i64), u64> = HashMap::new();

    for (&la, &lb) in a.iter().zip(b) {
        *sizes_a.entry(la).or_insert(0) += 1;
        *sizes_b.entry(lb).or_insert(0) += 1;
        *cells.entry((la, lb)).or_insert(0) += 1;
    }

    let choose2 = |n: u64| n * n.saturating_sub(1) / 2;
    let pairs_a: u64 = sizes_a.values().map(|&n| choose2(n)).sum();
    let pairs_b: u64 = sizes_b.values().map(|&n| choose2(n)).sum();
    let pairs_both: u64 = cells.values().map(|&n| choose2(n)).sum();
    let pairs_either = pairs_a + pairs_b - pairs_both;

    let stability_score =
        if pairs_either == 0 { 1.0 } else { pairs_both as f64 / pairs_either as f64 };

    // Best-overlap match of each left cluster onto a right cluster.
    let mut best_match: HashMap<i64, i64> = HashMap::new();
    let mut spans: HashMap<i64, HashSet<i64>> = HashMap::new();
    for (&(la, lb), &n) in &cells {
        spans.entry(la).or_default().insert(lb);
        let current = best_match.get(&la).map(|lb| cells[&(la, *lb)]);
        if current.map_or(true, |c| n > c || (n == c && lb < best_match[&la])) {
            best_match.insert(la, lb);
        }
    }

    let files_moved = a
        .iter()
        .zip(b)
        .filter(|&(la, lb)| best_match.get(la) != Some(lb))
        .count() as u64;

    let clusters_split = spans.values().filter(|targets| targets.len() > 1).count() as u64;

    let mut match_counts: HashMap<i64, u64> = HashMap::new();
    for target in best_match.values() {
        *match_counts.entry(*target).or_insert(0) += 1;
    }
    let clusters_merged = match_counts.values().filter(|&&n| n > 1).count() as u64;

    SnapshotComparison { files_moved, clusters_split, clusters_merged, stability_score }
}

fn encode<T: Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| Error::internal(e.to_string()))
}

fn decode<T: serde::de::DeserializeOwned>(raw: &str) -> Result<T> {
    serde_json::from_str(raw).map_err(|e| Error::internal(e.to_string()))
}

fn meta_from_row(row: &rusqlite::Row<'_>) -> Result<SnapshotMeta> {
    let params: String = row.get(3)?;
    let tags: Option<String> = row.get(7)?;

    Ok(SnapshotMeta {
        id: row.get(0)?,
        name: row.get(1)?,
        algorithm: row.get(2)?,
        params: serde_json::from_str(&params).map_err(|e| Error::internal(e.to_string()))?,
        created_at: row.get(4)?,
        modularity: row.get(5)?,
        description: row.get(6)?,
        tags: match tags {
            Some(raw) => decode(&raw)?,
            None => Vec::new(),
        },
        cluster_count: row.get::<_, i64>(8)? as u64,
        file_count: row.get::<_, i64>(9)? as u64,
    })
}
