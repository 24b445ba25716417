use std::collections::HashMap;
use std::collections::HashSet;

use itertools::Itertools;
use rayon::prelude::*;

use crate::core::folder_prefix;
use crate::core::ComponentEdge;
use crate::core::Edge;
use crate::core::FileId;
use crate::core::FileIdentity;
use crate::errors::Error;
use crate::errors::Result;
use crate::options::AnalysisOptions;

/// Folder depths aggregated into component edges.
pub const COMPONENT_DEPTHS: [u32; 3] = [1, 2, 3];

/// One policy-passing commit's contribution to pair counting.
#[derive(Debug, Clone)]
pub struct Changeset {
    /// Distinct identities changed, sorted.
    pub ids: Vec<FileId>,
    pub weight: f64,
}

#[derive(Debug, Clone, Copy, Default)]
struct PairCounter {
    count: u64,
    weight: f64,
}

/// The bounded in-memory co-change accumulator.
///
/// Keyed by canonical ordered pair; commits stream through and never stay in
/// memory. Shards fold into local accumulators that merge by summation, so
/// the result is independent of sharding.
#[derive(Debug, Default)]
pub struct GraphAccumulator {
    src_count: HashMap<FileId, u64>,
    src_weight: HashMap<FileId, f64>,
    pairs: HashMap<(FileId, FileId), PairCounter>,
}

impl GraphAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, changeset: &Changeset) {
        let ids = &changeset.ids;
        let w = changeset.weight;

        for id in ids {
            *self.src_count.entry(*id).or_insert(0) += 1;
            *self.src_weight.entry(*id).or_insert(0.0) += w;
        }

        let pair_share = w / ids.len() as f64;
        for (i, a) in ids.iter().enumerate() {
            for b in &ids[i + 1..] {
                let counter = self.pairs.entry((*a, *b)).or_default();
                counter.count += 1;
                counter.weight += pair_share;
            }
        }
    }

    /// Fold a shard of changesets in parallel and merge the result.
    pub fn add_shard(&mut self, shard: &[Changeset]) {
        let folded = shard
            .par_chunks(64)
            .fold(GraphAccumulator::new, |mut acc, chunk| {
                for changeset in chunk {
                    acc.add(changeset);
                }
                acc
            })
            .reduce(GraphAccumulator::new, |mut a, b| {
                a.merge(b);
                a
            });

        self.merge(folded);
    }

    pub fn merge(&mut self, other: GraphAccumulator) {
        for (id, n) in other.src_count {
            *self.src_count.entry(id).or_insert(0) += n;
        }
        for (id, w) in other.src_weight {
            *self.src_weight.entry(id).or_insert(0.0) += w;
        }
        for (pair, counter) in other.pairs {
            let entry = self.pairs.entry(pair).or_default();
            entry.count += counter.count;
            entry.weight += counter.weight;
        }
    }

    pub fn pair_count(&self, a: FileId, b: FileId) -> u64 {
        let key = if a < b { (a, b) } else { (b, a) };
        self.pairs.get(&key).map(|c| c.count).unwrap_or(0)
    }
}

#[derive(Debug, Clone)]
pub struct GraphOutput {
    pub edges: Vec<Edge>,
    pub components: Vec<ComponentEdge>,
}

/// Derive the coupling graph from a finished accumulator.
///
/// Applies the min-revisions and min-cooccurrence filters, computes the
/// metrics, aggregates folder-level components, truncates to the strongest
/// `topk_edges_per_file` per identity, and records each identity's surviving
/// edge count back onto `identities`.
pub fn build_graph(
    acc: &GraphAccumulator,
    identities: &mut [FileIdentity],
    options: &AnalysisOptions,
) -> Result<GraphOutput> {
    let survivors: HashSet<FileId> = acc
        .src_count
        .iter()
        .filter(|(_, n)| **n >= options.min_revisions)
        .map(|(id, _)| *id)
        .collect();

    let mut candidates = Vec::new();

    for (&(a, b), counter) in &acc.pairs {
        if a == b {
            return Err(Error::internal(format!("self-pair recorded for identity {}", a)));
        }

        if !survivors.contains(&a) || !survivors.contains(&b) {
            continue;
        }

        if counter.count >= options.min_cooccurrence {
            candidates.push(make_edge(acc, a, b, *counter)?);
        }
    }

    candidates.sort_by(|x, y| (x.src, x.dst).cmp(&(y.src, y.dst)));

    // Folder aggregates come from the same min-cooccurrence pool as edges;
    // top-K only caps per-file fan-out and must not thin them.
    let components = aggregate_components(&candidates, identities, options);

    let edges = truncate_top_k(candidates, options.topk_edges_per_file);

    let mut coupled: HashMap<FileId, u64> = HashMap::new();
    for edge in &edges {
        *coupled.entry(edge.src).or_insert(0) += 1;
        *coupled.entry(edge.dst).or_insert(0) += 1;
    }

    for identity in identities.iter_mut() {
        identity.coupled_files = coupled.get(&identity.id).copied().unwrap_or(0);
    }

    Ok(GraphOutput { edges, components })
}

fn make_edge(acc: &GraphAccumulator, a: FileId, b: FileId, counter: PairCounter) -> Result<Edge> {
    let src_count = acc.src_count[&a];
    let dst_count = acc.src_count[&b];
    let pair_count = counter.count;

    if pair_count > src_count.min(dst_count) {
        return Err(Error::internal(format!(
            "pair count {} exceeds endpoint counts for ({}, {})",
            pair_count, a, b
        )));
    }

    let denom = (src_count + dst_count - pair_count) as f64;
    if denom <= 0.0 {
        return Err(Error::internal(format!("empty union for pair ({}, {})", a, b)));
    }

    let src_weight = acc.src_weight[&a];
    let dst_weight = acc.src_weight[&b];
    let denom_weighted = src_weight + dst_weight - counter.weight;
    if denom_weighted <= 0.0 {
        return Err(Error::internal(format!("empty weighted union for pair ({}, {})", a, b)));
    }

    Ok(Edge {
        src: a,
        dst: b,
        pair_count,
        pair_weight: counter.weight,
        src_count,
        dst_count,
        jaccard: pair_count as f64 / denom,
        jaccard_weighted: counter.weight / denom_weighted,
        p_dst_given_src: pair_count as f64 / src_count as f64,
        p_src_given_dst: pair_count as f64 / dst_count as f64,
    })
}

/// Keep an edge only when both endpoints rank it among their own top K, so
/// no identity ends up with more than K edges.
fn truncate_top_k(candidates: Vec<Edge>, k: usize) -> Vec<Edge> {
    let mut ranked: HashMap<FileId, Vec<(usize, FileId)>> = HashMap::new();

    for (index, edge) in candidates.iter().enumerate() {
        ranked.entry(edge.src).or_default().push((index, edge.dst));
        ranked.entry(edge.dst).or_default().push((index, edge.src));
    }

    let mut kept: HashMap<usize, usize> = HashMap::new();

    for entries in ranked.values_mut() {
        entries.sort_by(|&(i, a_other), &(j, b_other)| {
            let a = &candidates[i];
            let b = &candidates[j];
            b.jaccard
                .partial_cmp(&a.jaccard)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.pair_count.cmp(&a.pair_count))
                .then(a_other.cmp(&b_other))
        });

        for &(index, _) in entries.iter().take(k) {
            *kept.entry(index).or_insert(0) += 1;
        }
    }

    candidates
        .into_iter()
        .enumerate()
        .filter(|(index, _)| kept.get(index) == Some(&2))
        .map(|(_, edge)| edge)
        .collect()
}

fn aggregate_components(
    edges: &[Edge],
    identities: &[FileIdentity],
    options: &AnalysisOptions,
) -> Vec<ComponentEdge> {
    let paths: HashMap<FileId, &str> =
        identities.iter().map(|f| (f.id, f.path_current.as_str())).collect();

    let mut aggregates: HashMap<(u32, String, String), (u64, f64, u64)> = HashMap::new();

    for edge in edges {
        let (Some(src_path), Some(dst_path)) = (paths.get(&edge.src), paths.get(&edge.dst))
        else {
            continue;
        };

        for depth in COMPONENT_DEPTHS {
            let (Some(a), Some(b)) = (
                folder_prefix(src_path, depth as usize),
                folder_prefix(dst_path, depth as usize),
            ) else {
                continue;
            };

            if a == b {
                continue;
            }

            let key = if a < b { (depth, a, b) } else { (depth, b, a) };
            let entry = aggregates.entry(key).or_insert((0, 0.0, 0));
            entry.0 += edge.pair_count;
            entry.1 += edge.jaccard;
            entry.2 += 1;
        }
    }

    aggregates
        .into_iter()
        .filter(|(_, (cochanges, _, _))| *cochanges >= options.min_component_cooccurrence)
        .map(|((depth, src, dst), (cochanges, jaccard_sum, pairs))| ComponentEdge {
            depth,
            src,
            dst,
            cochanges,
            avg_jaccard: jaccard_sum / pairs as f64,
        })
        .sorted_by(|a, b| (a.depth, &a.src, &a.dst).cmp(&(b.depth, &b.src, &b.dst)))
        .collect()
}
