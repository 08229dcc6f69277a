//! Deterministic duplicate merge for P3 clusters.
//!
//! Clusters sharing a tag are compared pairwise on title token sets. Pairs at
//! or above the threshold are unioned; every component of two or more merges
//! into its lowest id. P1 and P2 clusters are never considered.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::db::{DbError, DeskDb};
use crate::error::PipelineError;
use crate::executor::RunContext;
use crate::types::Priority;
use crate::util::title_tokens;

const MOTIVE: &str = "title similarity";

/// Union-Find over cluster ids with path compression and union by rank.
pub struct UnionFind {
    parent: HashMap<i64, i64>,
    rank: HashMap<i64, usize>,
}

impl UnionFind {
    pub fn new(ids: &[i64]) -> Self {
        Self {
            parent: ids.iter().map(|&id| (id, id)).collect(),
            rank: ids.iter().map(|&id| (id, 0)).collect(),
        }
    }

    /// Root of the component containing `id`, compressing the path on the way.
    pub fn find(&mut self, id: i64) -> i64 {
        let parent = *self.parent.get(&id).unwrap_or(&id);
        if parent == id {
            return id;
        }
        let root = self.find(parent);
        self.parent.insert(id, root);
        root
    }

    /// Returns false when both were already in one component.
    pub fn union(&mut self, a: i64, b: i64) -> bool {
        let (root_a, root_b) = (self.find(a), self.find(b));
        if root_a == root_b {
            return false;
        }
        let rank_a = *self.rank.get(&root_a).unwrap_or(&0);
        let rank_b = *self.rank.get(&root_b).unwrap_or(&0);
        if rank_a < rank_b {
            self.parent.insert(root_a, root_b);
        } else {
            self.parent.insert(root_b, root_a);
            if rank_a == rank_b {
                self.rank.insert(root_a, rank_a + 1);
            }
        }
        true
    }

    /// Every component, each sorted ascending, ordered by smallest member.
    pub fn components(&mut self) -> Vec<Vec<i64>> {
        let ids: Vec<i64> = self.parent.keys().copied().collect();
        let mut by_root: HashMap<i64, Vec<i64>> = HashMap::new();
        for id in ids {
            let root = self.find(id);
            by_root.entry(root).or_default().push(id);
        }
        let mut components: Vec<Vec<i64>> = by_root
            .into_values()
            .map(|mut members| {
                members.sort_unstable();
                members
            })
            .collect();
        components.sort_by_key(|c| c[0]);
        components
    }
}

/// Token-set Jaccard. Two empty sets score 0.
pub fn jaccard_similarity(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f64 / union as f64
}

/// Components of the graph on `ids` formed by edges scoring >= `threshold`.
pub fn components_from_edges(ids: &[i64], edges: &[(i64, i64, f64)], threshold: f64) -> Vec<Vec<i64>> {
    let mut uf = UnionFind::new(ids);
    for &(a, b, score) in edges {
        if score >= threshold {
            uf.union(a, b);
        }
    }
    uf.components()
}

/// Pairwise edges between titles.
pub fn title_edges(titles: &[(i64, String)]) -> Vec<(i64, i64, f64)> {
    let tokens: Vec<(i64, HashSet<String>)> = titles
        .iter()
        .map(|(id, title)| (*id, title_tokens(title).into_iter().collect()))
        .collect();
    let mut edges = Vec::new();
    for (i, (a, ta)) in tokens.iter().enumerate() {
        for (b, tb) in tokens.iter().skip(i + 1) {
            edges.push((*a, *b, jaccard_similarity(ta, tb)));
        }
    }
    edges
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FallbackReport {
    pub candidates: usize,
    pub components_merged: usize,
    pub clusters_discarded: usize,
}

/// Merge near-identical P3 clusters of the context's day.
pub fn run_fallback(db: &DeskDb, ctx: &RunContext) -> Result<FallbackReport, PipelineError> {
    let mut by_tag: BTreeMap<String, Vec<(i64, String)>> = BTreeMap::new();
    for cluster in db.active_clusters_for_day(&ctx.day)? {
        if cluster.priority == Some(Priority::P3) {
            by_tag
                .entry(cluster.tag.unwrap_or_default())
                .or_default()
                .push((cluster.id, cluster.title));
        }
    }

    let mut report = FallbackReport {
        candidates: by_tag.values().map(Vec::len).sum(),
        ..Default::default()
    };
    for (tag, titles) in by_tag {
        if titles.len() < 2 {
            continue;
        }
        let ids: Vec<i64> = titles.iter().map(|(id, _)| *id).collect();
        let components = components_from_edges(
            &ids,
            &title_edges(&titles),
            ctx.pipeline.similarity_threshold,
        );
        for component in components.into_iter().filter(|c| c.len() >= 2) {
            let (destination, sources) = (component[0], &component[1..]);
            let outcome = db.with_transaction(|tx| -> Result<_, DbError> {
                tx.merge_clusters(destination, sources, MOTIVE, &ctx.run_id)
            });
            match outcome {
                Ok(outcome) => {
                    log::info!(
                        "Consolidate: tag '{}' merged {:?} into {} by title similarity",
                        tag,
                        outcome.merged_sources,
                        destination
                    );
                    report.components_merged += 1;
                    report.clusters_discarded += outcome.merged_sources.len();
                }
                Err(DbError::Integrity(reason)) => {
                    log::warn!("Consolidate: similarity merge into {} rejected: {}", destination, reason);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
    Ok(report)
}
