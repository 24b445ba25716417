use std::collections::HashMap;

use itertools::Itertools;
use petgraph::unionfind::UnionFind;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde_json::json;
use serde_json::Value;
use strum::VariantNames;

use crate::catalog::Catalog;
use crate::core::FileId;
use crate::errors::Error;
use crate::errors::Result;

/// The clustering algorithm catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[derive(strum::Display, strum::EnumString, strum::VariantNames)]
#[strum(serialize_all = "snake_case")]
pub enum Algorithm {
    Louvain,
    Hierarchical,
    Dbscan,
    LabelPropagation,
    ConnectedComponents,
}

pub fn parse_algorithm(token: &str) -> Result<Algorithm> {
    token.parse().map_err(|_| {
        Error::validation(format!(
            "unknown algorithm '{}'; valid algorithms are: {}",
            token,
            Algorithm::VARIANTS.join(", ")
        ))
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[derive(strum::Display, strum::EnumString, strum::VariantNames)]
#[strum(serialize_all = "snake_case")]
pub enum Linkage {
    #[default]
    Ward,
    Complete,
    Average,
    Single,
}

/// The per-algorithm parameter set with every default resolved.
#[derive(Debug, Clone, PartialEq)]
pub enum Params {
    Louvain { resolution: f64, min_weight: f64, random_state: u64 },
    Hierarchical {
        n_clusters: Option<usize>,
        distance_threshold: Option<f64>,
        linkage: Linkage,
        min_weight: f64,
    },
    Dbscan { eps: f64, min_samples: usize, min_weight: f64 },
    LabelPropagation { max_iterations: usize, min_weight: f64 },
    ConnectedComponents { min_weight: f64 },
}

impl Params {
    /// Parse and validate the raw parameter bag for `algorithm`.
    ///
    /// Unknown keys, wrong types, and out-of-range values are validation
    /// errors, never internal ones.
    pub fn parse(algorithm: Algorithm, bag: &serde_json::Map<String, Value>) -> Result<Params> {
        let recognized: &[&str] = match algorithm {
            Algorithm::Louvain => &["resolution", "min_weight", "random_state"],
            Algorithm::Hierarchical => {
                &["n_clusters", "distance_threshold", "linkage", "min_weight"]
            }
            Algorithm::Dbscan => &["eps", "min_samples", "min_weight"],
            Algorithm::LabelPropagation => &["max_iterations", "min_weight"],
            Algorithm::ConnectedComponents => &["min_weight"],
        };

        for key in bag.keys() {
            if !recognized.contains(&key.as_str()) {
                return Err(Error::validation(format!(
                    "unknown parameter '{}' for {}; recognized parameters are: {}",
                    key,
                    algorithm,
                    recognized.join(", ")
                )));
            }
        }

        let min_weight = get_f64(bag, "min_weight")?.unwrap_or(0.0);
        if min_weight < 0.0 {
            return Err(Error::validation("min_weight must be non-negative"));
        }

        let params = match algorithm {
            Algorithm::Louvain => {
                let resolution = get_f64(bag, "resolution")?.unwrap_or(1.0);
                if resolution <= 0.0 {
                    return Err(Error::validation("resolution must be positive"));
                }
                Params::Louvain {
                    resolution,
                    min_weight,
                    random_state: get_u64(bag, "random_state")?.unwrap_or(0),
                }
            }
            Algorithm::Hierarchical => {
                let n_clusters = get_u64(bag, "n_clusters")?.map(|n| n as usize);
                let distance_threshold = get_f64(bag, "distance_threshold")?;

                match (n_clusters, distance_threshold) {
                    (None, None) => {
                        return Err(Error::validation(
                            "hierarchical clustering requires one of n_clusters or \
                             distance_threshold",
                        ));
                    }
                    (Some(_), Some(_)) => {
                        return Err(Error::validation(
                            "n_clusters and distance_threshold are mutually exclusive",
                        ));
                    }
                    _ => {}
                }

                if n_clusters == Some(0) {
                    return Err(Error::validation("n_clusters must be positive"));
                }

                let linkage = match bag.get("linkage") {
                    None => Linkage::default(),
                    Some(Value::String(token)) => token.parse().map_err(|_| {
                        Error::validation(format!(
                            "unknown linkage '{}'; valid linkages are: {}",
                            token,
                            Linkage::VARIANTS.join(", ")
                        ))
                    })?,
                    Some(other) => {
                        return Err(Error::validation(format!(
                            "linkage must be a string, got {}",
                            other
                        )));
                    }
                };

                Params::Hierarchical { n_clusters, distance_threshold, linkage, min_weight }
            }
            Algorithm::Dbscan => {
                let eps = get_f64(bag, "eps")?.unwrap_or(0.5);
                if eps <= 0.0 {
                    return Err(Error::validation("eps must be positive"));
                }
                let min_samples = get_u64(bag, "min_samples")?.unwrap_or(5) as usize;
                if min_samples == 0 {
                    return Err(Error::validation("min_samples must be positive"));
                }
                Params::Dbscan { eps, min_samples, min_weight }
            }
            Algorithm::LabelPropagation => {
                let max_iterations = get_u64(bag, "max_iterations")?.unwrap_or(100) as usize;
                if max_iterations == 0 {
                    return Err(Error::validation("max_iterations must be positive"));
                }
                Params::LabelPropagation { max_iterations, min_weight }
            }
            Algorithm::ConnectedComponents => Params::ConnectedComponents { min_weight },
        };

        Ok(params)
    }

    pub fn min_weight(&self) -> f64 {
        match self {
            Params::Louvain { min_weight, .. }
            | Params::Hierarchical { min_weight, .. }
            | Params::Dbscan { min_weight, .. }
            | Params::LabelPropagation { min_weight, .. }
            | Params::ConnectedComponents { min_weight } => *min_weight,
        }
    }

    /// The actual parameter bag used, defaults included.
    pub fn resolved(&self) -> Value {
        match self {
            Params::Louvain { resolution, min_weight, random_state } => json!({
                "resolution": resolution,
                "min_weight": min_weight,
                "random_state": random_state,
            }),
            Params::Hierarchical { n_clusters, distance_threshold, linkage, min_weight } => {
                json!({
                    "n_clusters": n_clusters,
                    "distance_threshold": distance_threshold,
                    "linkage": linkage.to_string(),
                    "min_weight": min_weight,
                })
            }
            Params::Dbscan { eps, min_samples, min_weight } => json!({
                "eps": eps,
                "min_samples": min_samples,
                "min_weight": min_weight,
            }),
            Params::LabelPropagation { max_iterations, min_weight } => json!({
                "max_iterations": max_iterations,
                "min_weight": min_weight,
            }),
            Params::ConnectedComponents { min_weight } => json!({
                "min_weight": min_weight,
            }),
        }
    }
}

fn get_f64(bag: &serde_json::Map<String, Value>, key: &str) -> Result<Option<f64>> {
    match bag.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value
            .as_f64()
            .map(Some)
            .ok_or_else(|| Error::validation(format!("{} must be a number, got {}", key, value))),
    }
}

fn get_u64(bag: &serde_json::Map<String, Value>, key: &str) -> Result<Option<u64>> {
    match bag.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value.as_u64().map(Some).ok_or_else(|| {
            Error::validation(format!("{} must be a non-negative integer, got {}", key, value))
        }),
    }
}

/// A read-only snapshot of the coupling graph, restricted and filtered.
///
/// Nodes are every identity with at least one catalog edge inside the
/// restriction; `min_weight` filters edges only, so weakly connected nodes
/// stay and come out as singletons or noise.
#[derive(Debug, Clone)]
pub struct GraphView {
    pub nodes: Vec<FileId>,
    pub paths: Vec<String>,
    pub adj: Vec<Vec<(usize, f64)>>,
    pub total_weight: f64,
}

impl GraphView {
    pub fn load(catalog: &Catalog, prefix: Option<&str>, min_weight: f64) -> Result<GraphView> {
        let conn = catalog.conn();
        let mut stmt = conn.prepare_cached(
            "SELECT e.src, e.dst, e.jaccard, fs.path, fd.path \
             FROM edges e \
             JOIN files fs ON fs.id = e.src \
             JOIN files fd ON fd.id = e.dst",
        )?;

        let mut rows = stmt.query([])?;
        let mut nodes = Vec::new();
        let mut edges = Vec::new();

        while let Some(row) = rows.next()? {
            let src = FileId(row.get::<_, i64>(0)? as u32);
            let dst = FileId(row.get::<_, i64>(1)? as u32);
            let jaccard: f64 = row.get(2)?;
            let src_path: String = row.get(3)?;
            let dst_path: String = row.get(4)?;

            if let Some(prefix) = prefix {
                if !in_folder(&src_path, prefix) || !in_folder(&dst_path, prefix) {
                    continue;
                }
            }

            nodes.push((src, src_path));
            nodes.push((dst, dst_path));
            edges.push((src, dst, jaccard));
        }

        let nodes: Vec<(FileId, String)> =
            nodes.into_iter().sorted_by_key(|(id, _)| *id).dedup().collect();

        Ok(Self::build(nodes, &edges, min_weight))
    }

    pub fn build(
        nodes: Vec<(FileId, String)>,
        edges: &[(FileId, FileId, f64)],
        min_weight: f64,
    ) -> GraphView {
        let index: HashMap<FileId, usize> =
            nodes.iter().enumerate().map(|(i, (id, _))| (*id, i)).collect();

        let mut adj = vec![Vec::new(); nodes.len()];
        let mut total_weight = 0.0;

        for (src, dst, weight) in edges {
            if *weight < min_weight {
                continue;
            }

            let (Some(&a), Some(&b)) = (index.get(src), index.get(dst)) else {
                continue;
            };

            adj[a].push((b, *weight));
            adj[b].push((a, *weight));
            total_weight += weight;
        }

        let (nodes, paths) = nodes.into_iter().unzip();
        GraphView { nodes, paths, adj, total_weight }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

fn in_folder(path: &str, prefix: &str) -> bool {
    path.strip_prefix(prefix).map_or(false, |rest| rest.starts_with('/'))
}

/// One cluster of the partition. Noise carries id -1.
#[derive(Debug, Clone, PartialEq)]
pub struct Cluster {
    pub id: i64,
    pub files: Vec<FileId>,
}

#[derive(Debug, Clone)]
pub struct ClusterResult {
    pub algorithm: Algorithm,
    pub params: Value,
    pub clusters: Vec<Cluster>,
    pub modularity: Option<f64>,
}

/// Run one clustering algorithm over a graph view.
///
/// Every node of the view lands in exactly one cluster; DBSCAN noise becomes
/// the trailing cluster with id -1.
pub fn run(view: &GraphView, algorithm: Algorithm, params: &Params) -> Result<ClusterResult> {
    let labels: Vec<i64> = match params {
        Params::Louvain { resolution, random_state, .. } => {
            louvain(view, *resolution, *random_state).into_iter().map(|c| c as i64).collect()
        }
        Params::Hierarchical { n_clusters, distance_threshold, linkage, .. } => {
            hierarchical(view, *n_clusters, *distance_threshold, *linkage)
                .into_iter()
                .map(|c| c as i64)
                .collect()
        }
        Params::Dbscan { eps, min_samples, .. } => dbscan(view, *eps, *min_samples),
        Params::LabelPropagation { max_iterations, .. } => {
            label_propagation(view, *max_iterations).into_iter().map(|c| c as i64).collect()
        }
        Params::ConnectedComponents { .. } => {
            connected_components(view).into_iter().map(|c| c as i64).collect()
        }
    };

    let modularity = match algorithm {
        Algorithm::Louvain => {
            let resolution = match params {
                Params::Louvain { resolution, .. } => *resolution,
                _ => 1.0,
            };
            Some(modularity(view, &labels, resolution))
        }
        Algorithm::LabelPropagation | Algorithm::ConnectedComponents => {
            Some(modularity(view, &labels, 1.0))
        }
        Algorithm::Hierarchical | Algorithm::Dbscan => None,
    };

    Ok(ClusterResult {
        algorithm,
        params: params.resolved(),
        clusters: to_clusters(view, &labels),
        modularity,
    })
}

/// Group labeled nodes into clusters ordered by size, noise last.
fn to_clusters(view: &GraphView, labels: &[i64]) -> Vec<Cluster> {
    let mut groups: HashMap<i64, Vec<FileId>> = HashMap::new();
    for (i, label) in labels.iter().enumerate() {
        groups.entry(*label).or_default().push(view.nodes[i]);
    }

    let mut noise = Vec::new();
    let mut regular = Vec::new();
    for (label, mut files) in groups {
        files.sort();
        if label == -1 {
            noise = files;
        } else {
            regular.push(files);
        }
    }

    regular.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a[0].cmp(&b[0])));

    let mut clusters: Vec<Cluster> = regular
        .into_iter()
        .enumerate()
        .map(|(i, files)| Cluster { id: i as i64, files })
        .collect();

    if !noise.is_empty() {
        clusters.push(Cluster { id: -1, files: noise });
    }

    clusters
}

/// Weighted modularity of a partition at resolution `gamma`.
pub fn modularity(view: &GraphView, labels: &[i64], gamma: f64) -> f64 {
    let m = view.total_weight;
    if m <= 0.0 {
        return 0.0;
    }

    let degree: Vec<f64> =
        view.adj.iter().map(|n| n.iter().map(|(_, w)| *w).sum()).collect();

    let mut internal: HashMap<i64, f64> = HashMap::new();
    let mut community_degree: HashMap<i64, f64> = HashMap::new();

    for (u, neighbors) in view.adj.iter().enumerate() {
        *community_degree.entry(labels[u]).or_insert(0.0) += degree[u];

        for (v, w) in neighbors {
            if *v > u && labels[*v] == labels[u] {
                *internal.entry(labels[u]).or_insert(0.0) += w;
            }
        }
    }

    let mut q = 0.0;
    for (label, d) in community_degree {
        let w_in = internal.get(&label).copied().unwrap_or(0.0);
        q += w_in / m - gamma * (d / (2.0 * m)).powi(2);
    }

    q
}

/// Louvain community detection with a resolution parameter.
///
/// `random_state` seeds the node visiting order; everything else is
/// deterministic.
fn louvain(view: &GraphView, resolution: f64, random_state: u64) -> Vec<usize> {
    let n = view.len();
    if n == 0 {
        return Vec::new();
    }

    let mut rng = rand::rngs::StdRng::seed_from_u64(random_state);

    // Working graph: adjacency maps with self-loop weights, plus the mapping
    // from original node to current supernode.
    let mut adj: Vec<HashMap<usize, f64>> = view
        .adj
        .iter()
        .map(|neighbors| {
            let mut map = HashMap::new();
            for (v, w) in neighbors {
                *map.entry(*v).or_insert(0.0) += w;
            }
            map
        })
        .collect();
    let mut membership: Vec<usize> = (0..n).collect();

    loop {
        let size = adj.len();
        let degree: Vec<f64> = adj
            .iter()
            .enumerate()
            .map(|(u, m)| m.iter().map(|(v, w)| if *v == u { 2.0 * w } else { *w }).sum())
            .collect();
        let m2: f64 = degree.iter().sum();

        if m2 <= 0.0 {
            break;
        }

        let mut community: Vec<usize> = (0..size).collect();
        let mut sigma_tot = degree.clone();

        let mut order: Vec<usize> = (0..size).collect();
        order.shuffle(&mut rng);

        let mut improved = false;
        loop {
            let mut moved = false;

            for &u in &order {
                let current = community[u];
                sigma_tot[current] -= degree[u];

                let mut link_weight: HashMap<usize, f64> = HashMap::new();
                for (&v, &w) in &adj[u] {
                    if v != u {
                        *link_weight.entry(community[v]).or_insert(0.0) += w;
                    }
                }

                let gain = |c: usize, w_uc: f64| w_uc - resolution * degree[u] * sigma_tot[c] / m2;

                let mut best = current;
                let mut best_gain = gain(current, link_weight.get(&current).copied().unwrap_or(0.0));

                for (&c, &w_uc) in link_weight.iter().sorted_by_key(|(c, _)| **c) {
                    let g = gain(c, w_uc);
                    if g > best_gain + 1e-12 {
                        best = c;
                        best_gain = g;
                    }
                }

                sigma_tot[best] += degree[u];
                community[u] = best;

                if best != current {
                    moved = true;
                    improved = true;
                }
            }

            if !moved {
                break;
            }
        }

        if !improved {
            break;
        }

        // Renumber communities densely and aggregate.
        let mut renumber: HashMap<usize, usize> = HashMap::new();
        for &c in community.iter().sorted() {
            let next = renumber.len();
            renumber.entry(c).or_insert(next);
        }

        for node_membership in membership.iter_mut() {
            *node_membership = renumber[&community[*node_membership]];
        }

        let communities = renumber.len();
        if communities == size {
            break;
        }

        let mut aggregated: Vec<HashMap<usize, f64>> = vec![HashMap::new(); communities];
        for (u, neighbors) in adj.iter().enumerate() {
            let cu = renumber[&community[u]];
            for (&v, &w) in neighbors {
                let cv = renumber[&community[v]];
                if u == v {
                    *aggregated[cu].entry(cv).or_insert(0.0) += w;
                } else if u < v {
                    if cu == cv {
                        *aggregated[cu].entry(cu).or_insert(0.0) += w;
                    } else {
                        *aggregated[cu].entry(cv).or_insert(0.0) += w;
                        *aggregated[cv].entry(cu).or_insert(0.0) += w;
                    }
                }
            }
        }

        adj = aggregated;
    }

    membership
}

/// Agglomerative clustering over co-change distance (1 - jaccard).
///
/// Unconnected pairs sit at the maximum distance of 1. Cut either at a target
/// cluster count or at a distance threshold.
fn hierarchical(
    view: &GraphView,
    n_clusters: Option<usize>,
    distance_threshold: Option<f64>,
    linkage: Linkage,
) -> Vec<usize> {
    let n = view.len();
    if n == 0 {
        return Vec::new();
    }

    // Ward updates run on squared distances; thresholds are squared to match.
    let square = linkage == Linkage::Ward;
    let base = |d: f64| if square { d * d } else { d };
    let threshold = distance_threshold.map(base);

    let mut dist = vec![vec![base(1.0); n]; n];
    for (u, neighbors) in view.adj.iter().enumerate() {
        for (v, w) in neighbors {
            dist[u][*v] = base(1.0 - w.min(1.0));
        }
    }

    let mut active: Vec<bool> = vec![true; n];
    let mut sizes: Vec<f64> = vec![1.0; n];
    let mut labels: Vec<usize> = (0..n).collect();
    let mut remaining = n;
    let target = n_clusters.unwrap_or(1).min(n);

    while remaining > target {
        let mut best: Option<(usize, usize, f64)> = None;
        for i in 0..n {
            if !active[i] {
                continue;
            }
            for j in (i + 1)..n {
                if !active[j] {
                    continue;
                }
                if best.map_or(true, |(_, _, d)| dist[i][j] < d) {
                    best = Some((i, j, dist[i][j]));
                }
            }
        }

        let Some((i, j, d)) = best else { break };

        if let Some(threshold) = threshold {
            if d > threshold {
                break;
            }
        }

        for k in 0..n {
            if !active[k] || k == i || k == j {
                continue;
            }

            let (ni, nj, nk) = (sizes[i], sizes[j], sizes[k]);
            let merged = match linkage {
                Linkage::Single => dist[i][k].min(dist[j][k]),
                Linkage::Complete => dist[i][k].max(dist[j][k]),
                Linkage::Average => (ni * dist[i][k] + nj * dist[j][k]) / (ni + nj),
                Linkage::Ward => {
                    ((ni + nk) * dist[i][k] + (nj + nk) * dist[j][k] - nk * dist[i][j])
                        / (ni + nj + nk)
                }
            };
            dist[i][k] = merged;
            dist[k][i] = merged;
        }

        sizes[i] += sizes[j];
        active[j] = false;
        remaining -= 1;

        for label in labels.iter_mut() {
            if *label == j {
                *label = i;
            }
        }
    }

    renumber_dense(&labels)
}

/// Density clustering over co-change distance; unreached nodes are noise.
fn dbscan(view: &GraphView, eps: f64, min_samples: usize) -> Vec<i64> {
    let n = view.len();
    let neighbors: Vec<Vec<usize>> = view
        .adj
        .iter()
        .map(|adjacent| {
            adjacent
                .iter()
                .filter(|(_, w)| 1.0 - w.min(1.0) <= eps)
                .map(|(v, _)| *v)
                .sorted()
                .collect()
        })
        .collect();

    // A point counts itself towards the density bar.
    let core: Vec<bool> = neighbors.iter().map(|adj| adj.len() + 1 >= min_samples).collect();

    let mut labels: Vec<i64> = vec![-1; n];
    let mut next = 0i64;

    for start in 0..n {
        if labels[start] != -1 || !core[start] {
            continue;
        }

        let cluster = next;
        next += 1;
        labels[start] = cluster;
        let mut queue = vec![start];

        while let Some(u) = queue.pop() {
            for &v in &neighbors[u] {
                if labels[v] == -1 {
                    labels[v] = cluster;
                    if core[v] {
                        queue.push(v);
                    }
                }
            }
        }
    }

    labels
}

/// Weighted label propagation with deterministic node order and smallest-label
/// tie breaking.
fn label_propagation(view: &GraphView, max_iterations: usize) -> Vec<usize> {
    let n = view.len();
    let mut labels: Vec<usize> = (0..n).collect();

    for _ in 0..max_iterations {
        let mut changed = false;

        for u in 0..n {
            if view.adj[u].is_empty() {
                continue;
            }

            let mut weight_by_label: HashMap<usize, f64> = HashMap::new();
            for (v, w) in &view.adj[u] {
                *weight_by_label.entry(labels[*v]).or_insert(0.0) += w;
            }

            let best = weight_by_label
                .iter()
                .sorted_by(|(la, wa), (lb, wb)| {
                    wb.partial_cmp(wa).unwrap_or(std::cmp::Ordering::Equal).then(la.cmp(lb))
                })
                .next()
                .map(|(label, _)| *label)
                .unwrap_or(labels[u]);

            if best != labels[u] {
                labels[u] = best;
                changed = true;
            }
        }

        if !changed {
            break;
        }
    }

    renumber_dense(&labels)
}

fn connected_components(view: &GraphView) -> Vec<usize> {
    let n = view.len();
    let mut union = UnionFind::<usize>::new(n);

    for (u, neighbors) in view.adj.iter().enumerate() {
        for (v, _) in neighbors {
            union.union(u, *v);
        }
    }

    let labels: Vec<usize> = (0..n).map(|u| union.find(u)).collect();
    renumber_dense(&labels)
}

fn renumber_dense(labels: &[usize]) -> Vec<usize> {
    let mut renumber: HashMap<usize, usize> = HashMap::new();
    labels
        .iter()
        .map(|label| {
            let next = renumber.len();
            *renumber.entry(*label).or_insert(next)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Two tight triangles joined by one weak edge.
    fn two_triangles() -> GraphView {
        let nodes = (0..6).map(|i| (FileId(i), format!("f{}.rs", i))).collect();
        let edges = vec![
            (FileId(0), FileId(1), 0.9),
            (FileId(1), FileId(2), 0.8),
            (FileId(0), FileId(2), 0.85),
            (FileId(3), FileId(4), 0.9),
            (FileId(4), FileId(5), 0.8),
            (FileId(3), FileId(5), 0.85),
            (FileId(2), FileId(3), 0.05),
        ];
        GraphView::build(nodes, &edges, 0.0)
    }

    fn assert_partition(view: &GraphView, clusters: &[Cluster]) {
        let total: usize = clusters.iter().map(|c| c.files.len()).sum();
        assert_eq!(total, view.len());

        let distinct: std::collections::HashSet<FileId> =
            clusters.iter().flat_map(|c| c.files.iter().copied()).collect();
        assert_eq!(distinct.len(), view.len());
    }

    fn files_of(cluster: &Cluster) -> Vec<u32> {
        cluster.files.iter().map(|f| f.0).collect()
    }

    #[test]
    fn louvain_separates_the_triangles() {
        let view = two_triangles();
        let params = Params::parse(Algorithm::Louvain, &serde_json::Map::new()).unwrap();
        let result = run(&view, Algorithm::Louvain, &params).unwrap();

        assert_partition(&view, &result.clusters);
        assert_eq!(result.clusters.len(), 2);
        assert_eq!(files_of(&result.clusters[0]), vec![0, 1, 2]);
        assert_eq!(files_of(&result.clusters[1]), vec![3, 4, 5]);
        assert!(result.modularity.unwrap() > 0.3);
        assert_eq!(result.params["resolution"], 1.0);
    }

    #[test]
    fn connected_components_split_on_min_weight() {
        let nodes = (0..6).map(|i| (FileId(i), format!("f{}.rs", i))).collect::<Vec<_>>();
        let edges = vec![
            (FileId(0), FileId(1), 0.9),
            (FileId(1), FileId(2), 0.8),
            (FileId(3), FileId(4), 0.9),
            (FileId(4), FileId(5), 0.8),
            (FileId(2), FileId(3), 0.05),
        ];

        let joined = GraphView::build(nodes.clone(), &edges, 0.0);
        let params = Params::ConnectedComponents { min_weight: 0.0 };
        let result = run(&joined, Algorithm::ConnectedComponents, &params).unwrap();
        assert_eq!(result.clusters.len(), 1);

        let split = GraphView::build(nodes, &edges, 0.1);
        let result = run(&split, Algorithm::ConnectedComponents, &params).unwrap();
        assert_eq!(result.clusters.len(), 2);
        assert_partition(&split, &result.clusters);
    }

    #[test]
    fn dbscan_marks_sparse_nodes_as_noise() {
        let view = two_triangles();
        let bag = serde_json::Map::from_iter([
            ("eps".to_string(), json!(0.3)),
            ("min_samples".to_string(), json!(3)),
        ]);
        let params = Params::parse(Algorithm::Dbscan, &bag).unwrap();
        let result = run(&view, Algorithm::Dbscan, &params).unwrap();

        assert_partition(&view, &result.clusters);
        assert!(result.modularity.is_none());
        assert_eq!(result.clusters.len(), 2);
        assert!(result.clusters.iter().all(|c| c.id != -1));

        // A lone node with no strong neighbors becomes noise.
        let nodes = vec![
            (FileId(0), "a.rs".to_string()),
            (FileId(1), "b.rs".to_string()),
            (FileId(2), "c.rs".to_string()),
            (FileId(9), "loner.rs".to_string()),
        ];
        let edges = vec![
            (FileId(0), FileId(1), 0.9),
            (FileId(1), FileId(2), 0.9),
            (FileId(0), FileId(2), 0.9),
            (FileId(2), FileId(9), 0.05),
        ];
        let view = GraphView::build(nodes, &edges, 0.0);
        let result = run(&view, Algorithm::Dbscan, &params).unwrap();

        let noise = result.clusters.last().unwrap();
        assert_eq!(noise.id, -1);
        assert_eq!(files_of(noise), vec![9]);
    }

    #[test]
    fn label_propagation_finds_the_two_communities() {
        let view = two_triangles();
        let params = Params::parse(Algorithm::LabelPropagation, &serde_json::Map::new()).unwrap();
        let result = run(&view, Algorithm::LabelPropagation, &params).unwrap();

        assert_partition(&view, &result.clusters);
        assert_eq!(result.clusters.len(), 2);
        assert!(result.modularity.is_some());
    }

    #[test]
    fn hierarchical_cuts_at_the_requested_cluster_count() {
        let view = two_triangles();

        for linkage in ["single", "complete", "average", "ward"] {
            let bag = serde_json::Map::from_iter([
                ("n_clusters".to_string(), json!(2)),
                ("linkage".to_string(), json!(linkage)),
            ]);
            let params = Params::parse(Algorithm::Hierarchical, &bag).unwrap();
            let result = run(&view, Algorithm::Hierarchical, &params).unwrap();

            assert_partition(&view, &result.clusters);
            assert_eq!(result.clusters.len(), 2, "linkage {}", linkage);
            assert_eq!(files_of(&result.clusters[0]), vec![0, 1, 2]);
        }
    }

    #[test]
    fn hierarchical_without_a_cut_parameter_is_a_validation_error() {
        let err = Params::parse(Algorithm::Hierarchical, &serde_json::Map::new()).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        let bag = serde_json::Map::from_iter([
            ("n_clusters".to_string(), json!(2)),
            ("distance_threshold".to_string(), json!(0.5)),
        ]);
        assert!(matches!(
            Params::parse(Algorithm::Hierarchical, &bag),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn unknown_parameters_and_algorithms_are_validation_errors() {
        let bag = serde_json::Map::from_iter([("gamma".to_string(), json!(1.5))]);
        assert!(matches!(
            Params::parse(Algorithm::Louvain, &bag),
            Err(Error::Validation(_))
        ));

        assert!(matches!(parse_algorithm("kmeans"), Err(Error::Validation(_))));
        assert_eq!(parse_algorithm("label_propagation").unwrap(), Algorithm::LabelPropagation);
    }

    #[test]
    fn resolved_params_echo_defaults() {
        let params = Params::parse(Algorithm::Dbscan, &serde_json::Map::new()).unwrap();
        let resolved = params.resolved();
        assert_eq!(resolved["eps"], 0.5);
        assert_eq!(resolved["min_samples"], 5);
        assert_eq!(resolved["min_weight"], 0.0);
    }
}
