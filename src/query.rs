use std::collections::BTreeMap;
use std::collections::HashSet;

use itertools::Itertools;
use serde::Serialize;
use strum::VariantNames;

use crate::catalog::Catalog;
use crate::core::folder_prefix;
use crate::core::ChangeKindToken;
use crate::core::CommitId;
use crate::core::ComponentEdge;
use crate::core::FileId;
use crate::errors::Error;
use crate::errors::Result;
use crate::options::AnalysisOptions;

/// Fixed weights of the derived risk score.
const RISK_COMMIT_WEIGHT: f64 = 1.0;
const RISK_COUPLING_WEIGHT: f64 = 2.0;

/// Coupled files shown inline in file details.
const DETAILS_COUPLING_LIMIT: usize = 5;

/// The orderable coupling metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[derive(strum::Display, strum::EnumString, strum::VariantNames)]
#[strum(serialize_all = "snake_case")]
pub enum CouplingMetric {
    Jaccard,
    JaccardWeighted,
    PairCount,
    PDstGivenSrc,
    PSrcGivenDst,
}

/// Parse a metric token, listing the valid ones on failure.
pub fn parse_metric(token: &str) -> Result<CouplingMetric> {
    token.parse().map_err(|_| {
        Error::validation(format!(
            "unknown metric '{}'; valid metrics are: {}",
            token,
            CouplingMetric::VARIANTS.join(", ")
        ))
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[derive(strum::Display, strum::EnumString, strum::VariantNames)]
#[strum(serialize_all = "snake_case")]
pub enum SortBy {
    #[default]
    Path,
    Commits,
    Risk,
}

pub fn parse_sort_by(token: &str) -> Result<SortBy> {
    token.parse().map_err(|_| {
        Error::validation(format!(
            "unknown sort key '{}'; valid keys are: {}",
            token,
            SortBy::VARIANTS.join(", ")
        ))
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[derive(strum::Display, strum::EnumString, strum::VariantNames)]
#[strum(serialize_all = "snake_case")]
pub enum SortDir {
    #[default]
    Asc,
    Desc,
}

pub fn parse_sort_dir(token: &str) -> Result<SortDir> {
    token.parse().map_err(|_| {
        Error::validation(format!(
            "unknown sort direction '{}'; valid directions are: {}",
            token,
            SortDir::VARIANTS.join(", ")
        ))
    })
}

/// One coupled neighbor, oriented so the probabilities read from the queried
/// file towards this one.
#[derive(Debug, Clone, PartialEq)]
#[derive(Serialize)]
pub struct CoupledFile {
    pub file_id: FileId,
    pub path: String,
    pub exists_at_head: bool,
    pub pair_count: u64,
    pub jaccard: f64,
    pub jaccard_weighted: f64,
    pub p_dst_given_src: f64,
    pub p_src_given_dst: f64,
}

impl CoupledFile {
    pub fn metric(&self, metric: CouplingMetric) -> f64 {
        match metric {
            CouplingMetric::Jaccard => self.jaccard,
            CouplingMetric::JaccardWeighted => self.jaccard_weighted,
            CouplingMetric::PairCount => self.pair_count as f64,
            CouplingMetric::PDstGivenSrc => self.p_dst_given_src,
            CouplingMetric::PSrcGivenDst => self.p_src_given_dst,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GraphNode {
    pub file_id: FileId,
    pub path: String,
    pub commits: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct GraphEdge {
    pub src: FileId,
    pub dst: FileId,
    pub pair_count: u64,
    pub jaccard: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CouplingGraph {
    pub focus: FileId,
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CommitRef {
    pub id: CommitId,
    pub author_name: String,
    pub author_email: String,
    pub committed_at: i64,
    pub changeset_size: u64,
    pub is_merge: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileMetadata {
    pub file_id: FileId,
    pub path: String,
    pub exists_at_head: bool,
    pub commits_total: u64,
    pub commits_filtered: u64,
    pub coupled_files: u64,
    pub first_commit_at: Option<i64>,
    pub last_commit_at: Option<i64>,
    pub risk: f64,
    pub coupled: Vec<CoupledFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HistoryEntry {
    pub commit: CommitRef,
    pub kind: ChangeKindToken,
    pub counted: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct LineageEntry {
    pub seq: u32,
    pub commit_id: CommitId,
    pub old_path: String,
    pub new_path: String,
    pub similarity: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuthorShare {
    pub author_name: String,
    pub author_email: String,
    pub commits: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileAuthors {
    pub authors: Vec<AuthorShare>,
    /// Smallest number of top contributors holding over half the commits.
    pub bus_factor: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct ActivityBucket {
    pub month: String,
    pub commits: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileSummary {
    pub file_id: FileId,
    pub path: String,
    pub exists_at_head: bool,
    pub commits_total: u64,
    pub commits_filtered: u64,
    pub coupled_files: u64,
    pub risk: f64,
    pub last_seen_at: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct FolderSummary {
    pub path: String,
    pub depth: u32,
    pub file_count: u64,
    pub files_at_head: u64,
    pub commits_total: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct FolderDetails {
    pub path: String,
    pub file_count: u64,
    pub files_at_head: u64,
    pub commits_total: u64,
    pub top_files: Vec<FileSummary>,
    pub coupled_folders: Vec<ComponentEdge>,
}

/// The composable file listing query.
#[derive(Debug, Clone)]
pub struct FilesQuery {
    pub sort_by: SortBy,
    pub sort_dir: SortDir,
    pub offset: u64,
    pub limit: u64,
    pub prefix: Option<String>,
    pub search: Option<String>,
    pub current_only: bool,
}

impl Default for FilesQuery {
    fn default() -> Self {
        Self {
            sort_by: SortBy::default(),
            sort_dir: SortDir::default(),
            offset: 0,
            limit: 50,
            prefix: None,
            search: None,
            current_only: false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Stats {
    pub files: u64,
    pub files_at_head: u64,
    pub commits: u64,
    pub commits_counted: u64,
    pub edges: u64,
    pub component_edges: u64,
    pub snapshots: u64,
    /// The thresholds the producing run honored.
    pub thresholds: AnalysisOptions,
    pub source: Option<String>,
    pub analyzed_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Hotspot {
    pub file_id: FileId,
    pub path: String,
    /// Unfiltered count; filtering never hides a hotspot.
    pub commits_total: u64,
    pub commits_filtered: u64,
    pub coupled_files: u64,
    pub risk: f64,
}

/// Read-only query surface over one repository's catalog.
pub struct QueryEngine {
    catalog: Catalog,
}

impl QueryEngine {
    pub fn new(catalog: Catalog) -> Self {
        Self { catalog }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    fn resolve_id(&self, path: &str) -> Result<FileId> {
        self.catalog
            .file_id_for_path(path)?
            .ok_or_else(|| Error::not_found(format!("no file matches path '{}'", path)))
    }

    /// Files coupled to `path`, strongest first under `metric`.
    pub fn coupling(
        &self,
        path: &str,
        metric: CouplingMetric,
        min_weight: f64,
        limit: usize,
        current_only: bool,
    ) -> Result<Vec<CoupledFile>> {
        let id = self.resolve_id(path)?;
        let mut neighbors = self.neighbors_of(id)?;

        neighbors.retain(|n| n.metric(metric) >= min_weight);
        if current_only {
            neighbors.retain(|n| n.exists_at_head);
        }

        neighbors.sort_by(|a, b| {
            b.metric(metric)
                .partial_cmp(&a.metric(metric))
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.path.cmp(&b.path))
        });
        neighbors.truncate(limit);

        Ok(neighbors)
    }

    fn neighbors_of(&self, id: FileId) -> Result<Vec<CoupledFile>> {
        let conn = self.catalog.conn();
        let mut stmt = conn.prepare_cached(
            "SELECT e.src, e.dst, e.pair_count, e.jaccard, e.jaccard_weighted, \
             e.p_dst_given_src, e.p_src_given_dst, f.path, f.exists_at_head \
             FROM edges e \
             JOIN files f ON f.id = CASE WHEN e.src = ?1 THEN e.dst ELSE e.src END \
             WHERE e.src = ?1 OR e.dst = ?1",
        )?;

        let mut rows = stmt.query([id.0 as i64])?;
        let mut neighbors = Vec::new();

        while let Some(row) = rows.next()? {
            let src = FileId(row.get::<_, i64>(0)? as u32);
            let dst = FileId(row.get::<_, i64>(1)? as u32);
            let is_src = src == id;

            let p_fwd: f64 = row.get(5)?;
            let p_rev: f64 = row.get(6)?;

            neighbors.push(CoupledFile {
                file_id: if is_src { dst } else { src },
                path: row.get(7)?,
                exists_at_head: row.get::<_, i64>(8)? != 0,
                pair_count: row.get::<_, i64>(2)? as u64,
                jaccard: row.get(3)?,
                jaccard_weighted: row.get(4)?,
                p_dst_given_src: if is_src { p_fwd } else { p_rev },
                p_src_given_dst: if is_src { p_rev } else { p_fwd },
            });
        }

        Ok(neighbors)
    }

    /// The focus file, its strongest neighbors, and every edge among them.
    pub fn coupling_graph(&self, path: &str, limit: usize) -> Result<CouplingGraph> {
        let focus = self.resolve_id(path)?;

        let mut neighbors = self.neighbors_of(focus)?;
        neighbors.sort_by(|a, b| {
            b.jaccard
                .partial_cmp(&a.jaccard)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.path.cmp(&b.path))
        });
        neighbors.truncate(limit);

        let mut node_ids: Vec<FileId> = vec![focus];
        node_ids.extend(neighbors.iter().map(|n| n.file_id));
        let node_set: HashSet<FileId> = node_ids.iter().copied().collect();

        let mut nodes = Vec::new();
        let mut edges = Vec::new();
        let mut seen = HashSet::new();

        for node in &node_ids {
            nodes.push(self.graph_node(*node)?);

            for neighbor in self.neighbors_of(*node)? {
                if !node_set.contains(&neighbor.file_id) {
                    continue;
                }

                let (a, b) = if *node < neighbor.file_id {
                    (*node, neighbor.file_id)
                } else {
                    (neighbor.file_id, *node)
                };

                if seen.insert((a, b)) {
                    edges.push(GraphEdge {
                        src: a,
                        dst: b,
                        pair_count: neighbor.pair_count,
                        jaccard: neighbor.jaccard,
                    });
                }
            }
        }

        edges.sort_by(|x, y| (x.src, x.dst).cmp(&(y.src, y.dst)));
        Ok(CouplingGraph { focus, nodes, edges })
    }

    fn graph_node(&self, id: FileId) -> Result<GraphNode> {
        let conn = self.catalog.conn();
        let mut stmt =
            conn.prepare_cached("SELECT path, commits_total FROM files WHERE id = ?")?;
        let mut rows = stmt.query([id.0 as i64])?;

        match rows.next()? {
            Some(row) => Ok(GraphNode {
                file_id: id,
                path: row.get(0)?,
                commits: row.get::<_, i64>(1)? as u64,
            }),
            None => Err(Error::not_found(format!("no file with id {}", id))),
        }
    }

    /// Commits where both identities changed together, newest first.
    ///
    /// Works on the two commit-id sets and nothing else, so the result is
    /// exactly the stored pair count for a surviving edge.
    pub fn coupling_evidence(&self, src: FileId, dst: FileId) -> Result<Vec<CommitRef>> {
        self.graph_node(src)?;
        self.graph_node(dst)?;

        let src_set = self.catalog.commit_set(src, true)?;
        let dst_set = self.catalog.commit_set(dst, true)?;

        let mut refs = Vec::new();
        for commit_id in src_set.intersection(&dst_set) {
            refs.push(self.commit_ref(commit_id)?);
        }

        refs.sort_by(|a, b| b.committed_at.cmp(&a.committed_at).then_with(|| b.id.cmp(&a.id)));
        Ok(refs)
    }

    fn commit_ref(&self, id: CommitId) -> Result<CommitRef> {
        let conn = self.catalog.conn();
        let mut stmt = conn.prepare_cached(
            "SELECT author_name, author_email, committed_at, changeset_size, is_merge \
             FROM commits WHERE id = ?",
        )?;
        let mut rows = stmt.query([id.to_string()])?;

        match rows.next()? {
            Some(row) => Ok(CommitRef {
                id,
                author_name: row.get(0)?,
                author_email: row.get(1)?,
                committed_at: row.get(2)?,
                changeset_size: row.get::<_, i64>(3)? as u64,
                is_merge: row.get::<_, i64>(4)? != 0,
            }),
            None => Err(Error::internal(format!("commit {} missing from catalog", id))),
        }
    }

    pub fn file_details(&self, path: &str) -> Result<FileMetadata> {
        let id = self.resolve_id(path)?;
        let conn = self.catalog.conn();
        let mut stmt = conn.prepare_cached(
            "SELECT path, exists_at_head, commits_total, commits_filtered, coupled_files \
             FROM files WHERE id = ?",
        )?;
        let mut rows = stmt.query([id.0 as i64])?;
        let row = rows.next()?.ok_or_else(|| Error::internal("paths row without file"))?;

        let commits_total: i64 = row.get(2)?;
        let coupled_files: i64 = row.get(4)?;

        let (first, last) = self.commit_bounds(id)?;

        let mut coupled = self.neighbors_of(id)?;
        coupled.sort_by(|a, b| {
            b.jaccard
                .partial_cmp(&a.jaccard)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.path.cmp(&b.path))
        });
        coupled.truncate(DETAILS_COUPLING_LIMIT);

        Ok(FileMetadata {
            file_id: id,
            path: row.get(0)?,
            exists_at_head: row.get::<_, i64>(1)? != 0,
            commits_total: commits_total as u64,
            commits_filtered: row.get::<_, i64>(3)? as u64,
            coupled_files: coupled_files as u64,
            first_commit_at: first,
            last_commit_at: last,
            risk: risk_score(commits_total as u64, coupled_files as u64),
            coupled,
        })
    }

    fn commit_bounds(&self, id: FileId) -> Result<(Option<i64>, Option<i64>)> {
        let conn = self.catalog.conn();
        let mut stmt = conn.prepare_cached(
            "SELECT MIN(c.committed_at), MAX(c.committed_at) \
             FROM file_commits fc JOIN commits c ON c.id = fc.commit_id \
             WHERE fc.file_id = ?",
        )?;
        let mut rows = stmt.query([id.0 as i64])?;

        match rows.next()? {
            Some(row) => Ok((row.get(0)?, row.get(1)?)),
            None => Ok((None, None)),
        }
    }

    pub fn file_history(&self, path: &str, limit: usize) -> Result<Vec<HistoryEntry>> {
        let id = self.resolve_id(path)?;
        let conn = self.catalog.conn();
        let mut stmt = conn.prepare_cached(
            "SELECT c.id, c.author_name, c.author_email, c.committed_at, c.changeset_size, \
             c.is_merge, fc.kind, fc.counted \
             FROM file_commits fc JOIN commits c ON c.id = fc.commit_id \
             WHERE fc.file_id = ? \
             ORDER BY c.committed_at DESC, c.id DESC \
             LIMIT ?",
        )?;

        let mut rows = stmt.query((id.0 as i64, limit as i64))?;
        let mut entries = Vec::new();

        while let Some(row) = rows.next()? {
            let kind: String = row.get(6)?;
            entries.push(HistoryEntry {
                commit: CommitRef {
                    id: CommitId::from_hex(&row.get::<_, String>(0)?)?,
                    author_name: row.get(1)?,
                    author_email: row.get(2)?,
                    committed_at: row.get(3)?,
                    changeset_size: row.get::<_, i64>(4)? as u64,
                    is_merge: row.get::<_, i64>(5)? != 0,
                },
                kind: kind
                    .parse()
                    .map_err(|_| Error::internal(format!("bad kind token '{}'", kind)))?,
                counted: row.get::<_, i64>(7)? != 0,
            });
        }

        Ok(entries)
    }

    pub fn file_lineage(&self, path: &str) -> Result<Vec<LineageEntry>> {
        let id = self.resolve_id(path)?;
        let conn = self.catalog.conn();
        let mut stmt = conn.prepare_cached(
            "SELECT seq, commit_id, old_path, new_path, similarity \
             FROM rename_lineage WHERE file_id = ? ORDER BY seq",
        )?;

        let mut rows = stmt.query([id.0 as i64])?;
        let mut entries = Vec::new();

        while let Some(row) = rows.next()? {
            entries.push(LineageEntry {
                seq: row.get::<_, i64>(0)? as u32,
                commit_id: CommitId::from_hex(&row.get::<_, String>(1)?)?,
                old_path: row.get(2)?,
                new_path: row.get(3)?,
                similarity: row.get::<_, i64>(4)? as u32,
            });
        }

        Ok(entries)
    }

    pub fn file_authors(&self, path: &str) -> Result<FileAuthors> {
        let id = self.resolve_id(path)?;
        let conn = self.catalog.conn();
        let mut stmt = conn.prepare_cached(
            "SELECT c.author_name, c.author_email, COUNT(*) \
             FROM file_commits fc JOIN commits c ON c.id = fc.commit_id \
             WHERE fc.file_id = ? \
             GROUP BY c.author_name, c.author_email \
             ORDER BY COUNT(*) DESC, c.author_email",
        )?;

        let mut rows = stmt.query([id.0 as i64])?;
        let mut authors = Vec::new();

        while let Some(row) = rows.next()? {
            authors.push(AuthorShare {
                author_name: row.get(0)?,
                author_email: row.get(1)?,
                commits: row.get::<_, i64>(2)? as u64,
            });
        }

        let total: u64 = authors.iter().map(|a| a.commits).sum();
        let mut covered = 0;
        let mut bus_factor = 0;
        for author in &authors {
            covered += author.commits;
            bus_factor += 1;
            if covered * 2 > total {
                break;
            }
        }

        Ok(FileAuthors { authors, bus_factor })
    }

    pub fn file_activity(&self, path: &str) -> Result<Vec<ActivityBucket>> {
        let id = self.resolve_id(path)?;
        let conn = self.catalog.conn();
        let mut stmt = conn.prepare_cached(
            "SELECT c.committed_at \
             FROM file_commits fc JOIN commits c ON c.id = fc.commit_id \
             WHERE fc.file_id = ?",
        )?;

        let mut rows = stmt.query([id.0 as i64])?;
        let mut buckets: BTreeMap<String, u64> = BTreeMap::new();

        while let Some(row) = rows.next()? {
            let ts: i64 = row.get(0)?;
            *buckets.entry(month_of(ts)).or_insert(0) += 1;
        }

        Ok(buckets.into_iter().map(|(month, commits)| ActivityBucket { month, commits }).collect())
    }

    /// All file summaries matching the composed filters.
    pub fn files(&self, query: &FilesQuery) -> Result<Vec<FileSummary>> {
        if query.limit == 0 {
            return Err(Error::validation("limit must be positive"));
        }

        let mut sql = String::from(
            "SELECT id, path, exists_at_head, commits_total, commits_filtered, coupled_files, \
             last_seen_at FROM files WHERE 1 = 1",
        );
        let mut params: Vec<rusqlite::types::Value> = Vec::new();

        if query.current_only {
            sql.push_str(" AND exists_at_head = 1");
        }

        if let Some(prefix) = &query.prefix {
            sql.push_str(" AND (path = ? OR path LIKE ? || '/%')");
            params.push(prefix.clone().into());
            params.push(prefix.clone().into());
        }

        if let Some(search) = &query.search {
            sql.push_str(" AND instr(lower(path), lower(?)) > 0");
            params.push(search.clone().into());
        }

        let direction = match query.sort_dir {
            SortDir::Asc => "ASC",
            SortDir::Desc => "DESC",
        };

        match query.sort_by {
            SortBy::Path => {
                sql.push_str(&format!(" ORDER BY path {}, id ASC", direction));
            }
            SortBy::Commits => {
                sql.push_str(&format!(" ORDER BY commits_total {}, path ASC, id ASC", direction));
            }
            SortBy::Risk => {
                sql.push_str(&format!(
                    " ORDER BY ({} * commits_total + {} * coupled_files) {}, path ASC, id ASC",
                    RISK_COMMIT_WEIGHT, RISK_COUPLING_WEIGHT, direction
                ));
            }
        }

        sql.push_str(" LIMIT ? OFFSET ?");
        params.push((query.limit as i64).into());
        params.push((query.offset as i64).into());

        let conn = self.catalog.conn();
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query(rusqlite::params_from_iter(params))?;
        let mut files = Vec::new();

        while let Some(row) = rows.next()? {
            files.push(file_summary_from_row(row)?);
        }

        Ok(files)
    }

    pub fn folders(&self, depth: u32) -> Result<Vec<FolderSummary>> {
        validate_depth(depth)?;

        let mut groups: BTreeMap<String, (u64, u64, u64)> = BTreeMap::new();

        for file in self.all_file_summaries()? {
            let Some(prefix) = folder_prefix(&file.path, depth as usize) else {
                continue;
            };

            let entry = groups.entry(prefix).or_insert((0, 0, 0));
            entry.0 += 1;
            entry.1 += file.exists_at_head as u64;
            entry.2 += file.commits_total;
        }

        Ok(groups
            .into_iter()
            .map(|(path, (file_count, files_at_head, commits_total))| FolderSummary {
                path,
                depth,
                file_count,
                files_at_head,
                commits_total,
            })
            .collect())
    }

    pub fn folder_details(&self, path: &str) -> Result<FolderDetails> {
        let prefix = path.trim_end_matches('/');
        let mut files: Vec<FileSummary> = self
            .all_file_summaries()?
            .into_iter()
            .filter(|f| {
                f.path.strip_prefix(prefix).map_or(false, |rest| rest.starts_with('/'))
            })
            .collect();

        if files.is_empty() {
            return Err(Error::not_found(format!("no files under folder '{}'", prefix)));
        }

        let file_count = files.len() as u64;
        let files_at_head = files.iter().filter(|f| f.exists_at_head).count() as u64;
        let commits_total = files.iter().map(|f| f.commits_total).sum();

        files.sort_by(|a, b| {
            b.commits_total.cmp(&a.commits_total).then_with(|| a.path.cmp(&b.path))
        });
        files.truncate(10);

        let conn = self.catalog.conn();
        let mut stmt = conn.prepare_cached(
            "SELECT depth, src, dst, cochanges, avg_jaccard FROM component_edges \
             WHERE src = ? OR dst = ? ORDER BY cochanges DESC",
        )?;
        let mut rows = stmt.query([prefix, prefix])?;
        let mut coupled_folders = Vec::new();

        while let Some(row) = rows.next()? {
            coupled_folders.push(ComponentEdge {
                depth: row.get::<_, i64>(0)? as u32,
                src: row.get(1)?,
                dst: row.get(2)?,
                cochanges: row.get::<_, i64>(3)? as u64,
                avg_jaccard: row.get(4)?,
            });
        }

        Ok(FolderDetails {
            path: prefix.to_string(),
            file_count,
            files_at_head,
            commits_total,
            top_files: files,
            coupled_folders,
        })
    }

    /// The valid component identifiers at `depth`.
    pub fn list_components(&self, depth: u32) -> Result<Vec<String>> {
        validate_depth(depth)?;

        Ok(self
            .all_file_summaries()?
            .iter()
            .filter_map(|f| folder_prefix(&f.path, depth as usize))
            .sorted()
            .dedup()
            .collect())
    }

    pub fn modules(&self, depth: u32) -> Result<Vec<ComponentEdge>> {
        validate_depth(depth)?;

        let conn = self.catalog.conn();
        let mut stmt = conn.prepare_cached(
            "SELECT depth, src, dst, cochanges, avg_jaccard FROM component_edges \
             WHERE depth = ? ORDER BY cochanges DESC, src, dst",
        )?;
        let mut rows = stmt.query([depth as i64])?;
        let mut modules = Vec::new();

        while let Some(row) = rows.next()? {
            modules.push(ComponentEdge {
                depth: row.get::<_, i64>(0)? as u32,
                src: row.get(1)?,
                dst: row.get(2)?,
                cochanges: row.get::<_, i64>(3)? as u64,
                avg_jaccard: row.get(4)?,
            });
        }

        Ok(modules)
    }

    pub fn stats(&self) -> Result<Stats> {
        let count = |sql: &str| -> Result<u64> {
            let n: i64 = self.catalog.conn().query_row(sql, [], |row| row.get(0))?;
            Ok(n as u64)
        };

        Ok(Stats {
            files: count("SELECT COUNT(*) FROM files")?,
            files_at_head: count("SELECT COUNT(*) FROM files WHERE exists_at_head = 1")?,
            commits: count("SELECT COUNT(*) FROM commits")?,
            commits_counted: count("SELECT COUNT(*) FROM commits WHERE counted = 1")?,
            edges: count("SELECT COUNT(*) FROM edges")?,
            component_edges: count("SELECT COUNT(*) FROM component_edges")?,
            snapshots: count("SELECT COUNT(*) FROM snapshots")?,
            thresholds: self.catalog.options()?,
            source: self.catalog.meta("source")?,
            analyzed_at: self.catalog.meta("analyzed_at")?.and_then(|v| v.parse().ok()),
        })
    }

    /// Files ranked by unfiltered commit count, so thresholds never hide a
    /// hotspot.
    pub fn hotspots(&self, limit: usize) -> Result<Vec<Hotspot>> {
        let conn = self.catalog.conn();
        let mut stmt = conn.prepare_cached(
            "SELECT id, path, commits_total, commits_filtered, coupled_files FROM files \
             ORDER BY commits_total DESC, path ASC, id ASC LIMIT ?",
        )?;

        let mut rows = stmt.query([limit as i64])?;
        let mut hotspots = Vec::new();

        while let Some(row) = rows.next()? {
            let commits_total = row.get::<_, i64>(2)? as u64;
            let coupled_files = row.get::<_, i64>(4)? as u64;
            hotspots.push(Hotspot {
                file_id: FileId(row.get::<_, i64>(0)? as u32),
                path: row.get(1)?,
                commits_total,
                commits_filtered: row.get::<_, i64>(3)? as u64,
                coupled_files,
                risk: risk_score(commits_total, coupled_files),
            });
        }

        Ok(hotspots)
    }

    fn all_file_summaries(&self) -> Result<Vec<FileSummary>> {
        let conn = self.catalog.conn();
        let mut stmt = conn.prepare_cached(
            "SELECT id, path, exists_at_head, commits_total, commits_filtered, coupled_files, \
             last_seen_at FROM files ORDER BY path",
        )?;

        let mut rows = stmt.query([])?;
        let mut files = Vec::new();

        while let Some(row) = rows.next()? {
            files.push(file_summary_from_row(row)?);
        }

        Ok(files)
    }
}

fn file_summary_from_row(row: &rusqlite::Row<'_>) -> Result<FileSummary> {
    let commits_total = row.get::<_, i64>(3)? as u64;
    let coupled_files = row.get::<_, i64>(5)? as u64;

    Ok(FileSummary {
        file_id: FileId(row.get::<_, i64>(0)? as u32),
        path: row.get(1)?,
        exists_at_head: row.get::<_, i64>(2)? != 0,
        commits_total,
        commits_filtered: row.get::<_, i64>(4)? as u64,
        coupled_files,
        risk: risk_score(commits_total, coupled_files),
        last_seen_at: row.get(6)?,
    })
}

fn risk_score(commits_total: u64, coupled_files: u64) -> f64 {
    RISK_COMMIT_WEIGHT * commits_total as f64 + RISK_COUPLING_WEIGHT * coupled_files as f64
}

fn validate_depth(depth: u32) -> Result<()> {
    if !(1..=3).contains(&depth) {
        return Err(Error::validation(format!("depth must be within 1-3, got {}", depth)));
    }
    Ok(())
}

/// `YYYY-MM` of a unix timestamp, using the civil-from-days conversion.
fn month_of(ts: i64) -> String {
    let days = ts.div_euclid(86_400);
    let (year, month) = civil_from_days(days);
    format!("{:04}-{:02}", year, month)
}

fn civil_from_days(days: i64) -> (i64, u32) {
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let year = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let month = if mp < 10 { mp + 3 } else { mp - 9 };
    (if month <= 2 { year + 1 } else { year }, month as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bulk::CommitRow;
    use crate::catalog::CatalogWriter;
    use crate::core::Edge;
    use crate::core::FileIdentity;

    fn commit_id(n: u8) -> CommitId {
        CommitId::from_hex(&format!("{:02x}", n).repeat(20)).unwrap()
    }

    fn identity(id: u32, path: &str, commits: u64, at_head: bool) -> FileIdentity {
        FileIdentity {
            id: FileId(id),
            path_current: path.to_string(),
            path_latest_observed: path.to_string(),
            exists_at_head: at_head,
            commits_total: commits,
            commits_filtered: commits,
            coupled_files: 0,
            first_seen_at: 100,
            last_seen_at: 200,
        }
    }

    fn edge(src: u32, dst: u32, pair: u64, src_count: u64, dst_count: u64) -> Edge {
        let jaccard = pair as f64 / (src_count + dst_count - pair) as f64;
        Edge {
            src: FileId(src),
            dst: FileId(dst),
            pair_count: pair,
            pair_weight: pair as f64 / 2.0,
            src_count,
            dst_count,
            jaccard,
            jaccard_weighted: jaccard / 2.0,
            p_dst_given_src: pair as f64 / src_count as f64,
            p_src_given_dst: pair as f64 / dst_count as f64,
        }
    }

    /// Three files: a lockfile pair plus a bystander, with the commits and
    /// file_commits rows to back evidence queries.
    fn engine() -> QueryEngine {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = CatalogWriter::create(dir.path()).unwrap();

        let files = vec![
            identity(0, "frontend/package.json", 10, true),
            identity(1, "frontend/package-lock.json", 9, true),
            identity(2, "src/runtime/engine.rs", 4, false),
        ];
        writer.write_files(&files).unwrap();
        writer
            .write_paths(
                &files.iter().map(|f| (f.path_current.clone(), f.id)).collect::<Vec<_>>(),
            )
            .unwrap();
        writer.write_edges(&[edge(0, 1, 9, 10, 9), edge(0, 2, 2, 10, 4)]).unwrap();

        let commits: Vec<CommitRow> = (1..=10)
            .map(|n| CommitRow {
                id: commit_id(n),
                author_name: if n % 2 == 0 { "Ada" } else { "Grace" }.to_string(),
                author_email: if n % 2 == 0 { "ada@example.com" } else { "grace@example.com" }
                    .to_string(),
                committed_at: 1_700_000_000 + n as i64 * 86_400,
                parent_count: 1,
                is_merge: false,
                changeset_size: 2,
                counted: true,
                weight: 1.0,
            })
            .collect();
        writer.write_commits(&commits).unwrap();

        let mut file_commits = Vec::new();
        for n in 1..=10u8 {
            file_commits.push((FileId(0), commit_id(n), ChangeKindToken::Modified, true));
        }
        for n in 1..=9u8 {
            file_commits.push((FileId(1), commit_id(n), ChangeKindToken::Modified, true));
        }
        for n in [2u8, 4] {
            file_commits.push((FileId(2), commit_id(n), ChangeKindToken::Modified, true));
        }
        writer.write_file_commits(&file_commits).unwrap();
        writer.write_meta(&AnalysisOptions::default(), &[]).unwrap();
        writer.finish().unwrap();

        // Leak the tempdir so the catalog outlives this constructor.
        let path = dir.into_path();
        QueryEngine::new(Catalog::open(path).unwrap())
    }

    #[test]
    fn coupling_orders_by_metric_and_resolves_orientation() {
        let engine = engine();
        let coupled = engine
            .coupling("frontend/package.json", CouplingMetric::Jaccard, 0.0, 5, false)
            .unwrap();

        assert_eq!(coupled.len(), 2);
        assert_eq!(coupled[0].path, "frontend/package-lock.json");
        assert!(coupled[0].jaccard > 0.85);
        assert!(coupled[0].p_dst_given_src >= 0.9);

        // Reverse orientation swaps the conditional probabilities.
        let reverse = engine
            .coupling("frontend/package-lock.json", CouplingMetric::Jaccard, 0.0, 5, false)
            .unwrap();
        assert_eq!(reverse[0].path, "frontend/package.json");
        assert_eq!(reverse[0].jaccard, coupled[0].jaccard);
        assert!((reverse[0].p_dst_given_src - 1.0).abs() < 1e-9);
    }

    #[test]
    fn coupling_missing_path_is_not_found_and_unknown_metric_is_validation() {
        let engine = engine();
        assert!(matches!(
            engine.coupling("nope.rs", CouplingMetric::Jaccard, 0.0, 5, false),
            Err(Error::NotFound(_))
        ));

        let err = parse_metric("bogus").unwrap_err();
        match err {
            Error::Validation(msg) => {
                for metric in CouplingMetric::VARIANTS {
                    assert!(msg.contains(metric), "message should list {}", metric);
                }
            }
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn current_only_filters_deleted_files() {
        let engine = engine();
        let coupled = engine
            .coupling("frontend/package.json", CouplingMetric::Jaccard, 0.0, 5, true)
            .unwrap();
        assert_eq!(coupled.len(), 1);
        assert_eq!(coupled[0].path, "frontend/package-lock.json");
    }

    #[test]
    fn evidence_matches_the_stored_pair_count() {
        let engine = engine();
        let refs = engine.coupling_evidence(FileId(0), FileId(1)).unwrap();
        assert_eq!(refs.len(), 9);
        assert!(refs.windows(2).all(|w| w[0].committed_at >= w[1].committed_at));
    }

    #[test]
    fn files_pagination_returns_disjoint_pages() {
        let engine = engine();
        let query = FilesQuery {
            sort_by: SortBy::Commits,
            sort_dir: SortDir::Desc,
            limit: 2,
            ..Default::default()
        };
        let page1 = engine.files(&query).unwrap();
        let page2 = engine.files(&FilesQuery { offset: 2, ..query }).unwrap();

        assert_eq!(page1.len(), 2);
        assert_eq!(page2.len(), 1);

        let all: HashSet<String> =
            page1.iter().chain(&page2).map(|f| f.path.clone()).collect();
        assert_eq!(all.len(), 3);
    }

    #[test]
    fn files_search_is_case_insensitive_substring() {
        let engine = engine();
        let query = FilesQuery { search: Some("RUNTIME".to_string()), ..Default::default() };
        let found = engine.files(&query).unwrap();

        assert_eq!(found.len(), 1);
        assert_eq!(found[0].path, "src/runtime/engine.rs");
    }

    #[test]
    fn files_prefix_matches_whole_segments() {
        let engine = engine();
        let query = FilesQuery { prefix: Some("frontend".to_string()), ..Default::default() };
        assert_eq!(engine.files(&query).unwrap().len(), 2);

        let query = FilesQuery { prefix: Some("front".to_string()), ..Default::default() };
        assert!(engine.files(&query).unwrap().is_empty());
    }

    #[test]
    fn coupling_graph_includes_neighbor_neighbor_edges() {
        let engine = engine();
        let graph = engine.coupling_graph("frontend/package.json", 5).unwrap();

        assert_eq!(graph.nodes.len(), 3);
        assert_eq!(graph.edges.len(), 2);
        assert!(graph.edges.iter().all(|e| e.src < e.dst));
    }

    #[test]
    fn file_details_populates_every_field() {
        let engine = engine();
        let details = engine.file_details("frontend/package.json").unwrap();

        assert_eq!(details.commits_total, 10);
        assert!(details.exists_at_head);
        assert!(details.first_commit_at.is_some());
        assert!(details.last_commit_at.is_some());
        assert_eq!(details.coupled.len(), 2);
    }

    #[test]
    fn authors_and_bus_factor_cover_half_the_commits() {
        let engine = engine();
        let authors = engine.file_authors("frontend/package.json").unwrap();

        assert_eq!(authors.authors.len(), 2);
        assert_eq!(authors.bus_factor, 1);
    }

    #[test]
    fn hotspots_rank_by_unfiltered_commits() {
        let engine = engine();
        let hotspots = engine.hotspots(2).unwrap();

        assert_eq!(hotspots.len(), 2);
        assert_eq!(hotspots[0].path, "frontend/package.json");
        assert!(hotspots[0].risk >= hotspots[0].commits_total as f64);
    }

    #[test]
    fn month_bucketing_uses_civil_dates() {
        assert_eq!(month_of(0), "1970-01");
        assert_eq!(month_of(1_700_000_000), "2023-11");
    }

    #[test]
    fn depth_outside_one_to_three_is_a_validation_error() {
        let engine = engine();
        assert!(matches!(engine.folders(0), Err(Error::Validation(_))));
        assert!(matches!(engine.modules(9), Err(Error::Validation(_))));
        assert_eq!(engine.list_components(1).unwrap(), vec!["frontend", "src"]);
        assert_eq!(engine.list_components(2).unwrap(), vec!["src/runtime"]);
    }
}
