use anyhow::Result;
use clap::ValueEnum;
use serde::Serialize;

use crate::data::distance_matrix::DistanceMatrix;

pub mod agglomerative;
pub mod components;

#[derive(ValueEnum, Serialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum OrderingMethod {
    /// NeighborNet agglomeration with 3-way/4-way joins.
    #[default]
    Agglomerative,
    /// Singleton/pair component merging on a cycle graph.
    Components,
}

impl OrderingMethod {
    pub fn as_str(&self) -> &str {
        match self {
            OrderingMethod::Agglomerative => "agglomerative",
            OrderingMethod::Components => "components",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "components" | "Components" => OrderingMethod::Components,
            "agglomerative" | "Agglomerative" => OrderingMethod::Agglomerative,
            _ => OrderingMethod::default(),
        }
    }
}

/// Circular ordering of the taxa in `dist` as `[0, t1, ..., tn]`.
pub fn compute_order(method: OrderingMethod, dist: &DistanceMatrix) -> Result<Vec<usize>> {
    match method {
        OrderingMethod::Agglomerative => agglomerative::compute_order_agglomerative(dist),
        OrderingMethod::Components => components::compute_order_components(dist),
    }
}

/// `cycle` is `[0, ...]` followed by a permutation of `1..=n`.
pub fn is_valid_cycle(cycle: &[usize], n: usize) -> bool {
    if cycle.len() != n + 1 || cycle.first() != Some(&0) {
        return false;
    }
    let mut seen = vec![false; n + 1];
    for &t in &cycle[1..] {
        if t == 0 || t > n || seen[t] {
            return false;
        }
        seen[t] = true;
    }
    true
}
