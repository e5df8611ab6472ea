//! Simplified NeighborNet ordering over singleton/pair components.
//!
//! Every active group holds one or two taxa. Each merge adds one edge to an
//! undirected graph on the taxa; once a single pair remains, a closing edge
//! turns the graph into a Hamiltonian cycle that is read off from taxon 1.

use anyhow::{Context, Result, bail, ensure};
use log::{debug, trace};
use ndarray::Array2;
use petgraph::Undirected;
use petgraph::graph::{Graph, NodeIndex};
use rayon::prelude::*;

use crate::data::distance_matrix::DistanceMatrix;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Component {
    Single(usize),
    Pair(usize, usize),
}

impl Component {
    fn size(self) -> usize {
        match self {
            Component::Single(_) => 1,
            Component::Pair(..) => 2,
        }
    }

    fn members(self) -> impl Iterator<Item = usize> {
        let (a, b) = match self {
            Component::Single(a) => (a, None),
            Component::Pair(a, b) => (a, Some(b)),
        };
        std::iter::once(a).chain(b)
    }

    fn first(self) -> usize {
        match self {
            Component::Single(a) | Component::Pair(a, _) => a,
        }
    }

    /// Partner of `p` inside a pair.
    fn partner(self, p: usize) -> Result<usize> {
        match self {
            Component::Pair(a, b) if a == p => Ok(b),
            Component::Pair(a, b) if b == p => Ok(a),
            _ => bail!("taxon {} has no partner in {:?}", p, self),
        }
    }
}

/// Circular ordering via the component merge heuristic.
///
/// Returns `[0, t1, ..., tn]` starting at taxon 1 and stepping first to its
/// smaller-labelled neighbour.
pub fn compute_order_components(dist: &DistanceMatrix) -> Result<Vec<usize>> {
    let n_tax = dist.n();
    if n_tax <= 3 {
        return Ok((0..=n_tax).collect());
    }
    let mut merger = Merger::new(dist);
    merger.run()?;
    merger.read_cycle()
}

struct Merger {
    /// 1-based, padded working distances.
    d: Array2<f64>,
    components: Vec<Component>,
    graph: Graph<usize, (), Undirected>,
    nodes: Vec<NodeIndex>,
}

impl Merger {
    fn new(dist: &DistanceMatrix) -> Self {
        let n_tax = dist.n();
        let mut d = Array2::<f64>::zeros((n_tax + 1, n_tax + 1));
        for i in 1..=n_tax {
            for j in 1..=n_tax {
                d[[i, j]] = dist.taxa(i, j);
            }
        }
        let mut graph = Graph::default();
        let mut nodes = vec![NodeIndex::end(); n_tax + 1];
        for (t, slot) in nodes.iter_mut().enumerate().skip(1) {
            *slot = graph.add_node(t);
        }
        Self {
            d,
            components: (1..=n_tax).map(Component::Single).collect(),
            graph,
            nodes,
        }
    }

    fn connect(&mut self, a: usize, b: usize) {
        trace!("edge {} -- {}", a, b);
        self.graph.add_edge(self.nodes[a], self.nodes[b], ());
    }

    fn set(&mut self, a: usize, b: usize, v: f64) {
        self.d[[a, b]] = v;
        self.d[[b, a]] = v;
    }

    /// Taxa of every component other than those at `ip` and `iq`.
    fn others(&self, ip: usize, iq: usize) -> Vec<usize> {
        self.components
            .iter()
            .enumerate()
            .filter(|&(i, _)| i != ip && i != iq)
            .flat_map(|(_, c)| c.members())
            .collect()
    }

    fn run(&mut self) -> Result<()> {
        while self.components.len() >= 2 {
            let sums = RowSums::new(&self.components, &self.d);
            let (ip, iq) = closest_components(&self.components, &self.d, &sums);
            let (pc, qc) = (self.components[ip], self.components[iq]);
            debug!("Merging {:?} with {:?}", pc, qc);

            let merged = match (pc, qc) {
                (Component::Single(p), Component::Single(q)) => {
                    self.connect(p, q);
                    Component::Pair(p, q)
                }
                (Component::Single(p), Component::Pair(..)) => {
                    let q = closest_member_1_vs_2(ip, iq, &self.d, &self.components, &sums)?;
                    let qb = qc.partner(q)?;
                    let pq = (self.d[[p, qb]] + self.d[[q, qb]] + self.d[[p, q]]) / 3.0;
                    self.set(p, qb, pq);
                    for r in self.others(ip, iq) {
                        if r == p || r == q || r == qb {
                            continue;
                        }
                        let pr = (2.0 * self.d[[p, r]] + self.d[[q, r]]) / 3.0;
                        let qbr = (2.0 * self.d[[qb, r]] + self.d[[q, r]]) / 3.0;
                        self.set(p, r, pr);
                        self.set(qb, r, qbr);
                    }
                    self.connect(p, q);
                    Component::Pair(p, qb)
                }
                (Component::Pair(..), Component::Pair(..)) => {
                    let (p, q) = closest_members_2_vs_2(ip, iq, &self.d, &self.components, &sums)?;
                    let pb = pc.partner(p)?;
                    let qb = qc.partner(q)?;
                    let d = &self.d;
                    let outer = (d[[pb, p]]
                        + d[[pb, q]]
                        + d[[pb, qb]]
                        + d[[p, q]]
                        + d[[p, qb]]
                        + d[[q, qb]])
                        / 6.0;
                    self.set(pb, qb, outer);
                    for r in self.others(ip, iq) {
                        if r == p || r == q || r == pb || r == qb {
                            continue;
                        }
                        let d = &self.d;
                        let pbr = d[[pb, r]] / 2.0 + d[[p, r]] / 3.0 + d[[q, r]] / 6.0;
                        let qbr = d[[p, r]] / 6.0 + d[[q, r]] / 3.0 + d[[qb, r]] / 2.0;
                        self.set(pb, r, pbr);
                        self.set(qb, r, qbr);
                    }
                    self.connect(p, q);
                    Component::Pair(pb, qb)
                }
                (Component::Pair(..), Component::Single(_)) => {
                    bail!("closest pair not ordered by size: {:?} vs {:?}", pc, qc)
                }
            };
            self.components[ip] = merged;
            self.components.remove(iq);
        }

        match self.components.first().copied() {
            Some(Component::Pair(p, q)) => {
                self.connect(p, q);
                Ok(())
            }
            other => bail!("merging ended with {:?} instead of one pair", other),
        }
    }

    /// Walk the cycle from taxon 1, stepping first to its smaller neighbour.
    fn read_cycle(&self) -> Result<Vec<usize>> {
        let n = self.nodes.len() - 1;
        let mut order = Vec::with_capacity(n + 1);
        order.push(0);

        let start = self.nodes[1];
        let neigh: Vec<NodeIndex> = self.graph.neighbors(start).collect();
        ensure!(
            neigh.len() == 2,
            "ordering graph is not a cycle: taxon 1 has degree {}",
            neigh.len()
        );
        let mut prev = start;
        let mut cur = neigh[0].min(neigh[1]);
        order.push(self.graph[start]);
        while order.len() <= n {
            order.push(self.graph[cur]);
            let nb: Vec<NodeIndex> = self.graph.neighbors(cur).collect();
            ensure!(
                nb.len() == 2,
                "ordering graph is not a cycle: taxon {} has degree {}",
                self.graph[cur],
                nb.len()
            );
            let next = if nb[0] == prev { nb[1] } else { nb[0] };
            prev = cur;
            cur = next;
        }
        Ok(order)
    }
}

fn avg_comp_comp(d: &Array2<f64>, p: Component, q: Component) -> f64 {
    match (p, q) {
        (Component::Single(a), Component::Single(b)) => d[[a, b]],
        (Component::Single(a), Component::Pair(b, bb)) => (d[[a, b]] + d[[a, bb]]) / 2.0,
        (Component::Pair(a, ab), Component::Single(b)) => (d[[a, b]] + d[[ab, b]]) / 2.0,
        (Component::Pair(a, ab), Component::Pair(b, bb)) => {
            (d[[a, b]] + d[[a, bb]] + d[[ab, b]] + d[[ab, bb]]) / 4.0
        }
    }
}

fn avg_taxon_comp(d: &Array2<f64>, p: usize, q: Component) -> f64 {
    match q {
        Component::Single(b) => d[[p, b]],
        Component::Pair(b, bb) => (d[[p, b]] + d[[p, bb]]) / 2.0,
    }
}

/// Row sums of the current merge step.
struct RowSums {
    /// `Σ avg(x, S)` over components `S` not holding taxon `x`, by taxon.
    taxon: Vec<f64>,
    /// `Σ avg(P, S)` over components `S ≠ P`, by component index.
    component: Vec<f64>,
}

impl RowSums {
    /// O(n·m): one pass per taxon over the `m` components.
    fn new(components: &[Component], d: &Array2<f64>) -> Self {
        let per_component: Vec<Vec<(usize, f64)>> = components
            .par_iter()
            .enumerate()
            .map(|(ic, &c)| {
                c.members()
                    .map(|x| {
                        let total: f64 = components
                            .iter()
                            .enumerate()
                            .filter(|&(i, _)| i != ic)
                            .map(|(_, &s)| avg_taxon_comp(d, x, s))
                            .sum();
                        (x, total)
                    })
                    .collect()
            })
            .collect();

        let mut taxon = vec![0.0; d.nrows()];
        let mut component = Vec::with_capacity(components.len());
        for members in &per_component {
            let mut total = 0.0;
            for &(x, r) in members {
                taxon[x] = r;
                total += r;
            }
            // avg(P, S) is the mean of its members' averages to S.
            component.push(total / members.len() as f64);
        }
        Self { taxon, component }
    }

    /// `(m - 2) D(P,Q) - R(P) - R(Q)`, where `R` leaves out both `P` and `Q`.
    fn pair_score(
        &self,
        components: &[Component],
        d: &Array2<f64>,
        ip: usize,
        iq: usize,
    ) -> f64 {
        let m = components.len() as f64;
        m * avg_comp_comp(d, components[ip], components[iq])
            - self.component[ip]
            - self.component[iq]
    }
}

/// Component pair with the lowest [`RowSums::pair_score`], smaller first.
///
/// Rows are scanned in parallel; ties resolve to the lowest `(ip, iq)`.
fn closest_components(
    components: &[Component],
    d: &Array2<f64>,
    sums: &RowSums,
) -> (usize, usize) {
    let m = components.len();
    let ordered = |ip: usize, iq: usize| {
        if components[ip].size() > components[iq].size() {
            (iq, ip)
        } else {
            (ip, iq)
        }
    };
    if m == 2 {
        return if components[0].size() < components[1].size() {
            (0, 1)
        } else {
            (1, 0)
        };
    }

    let (_, ip, iq) = (0..m - 1)
        .into_par_iter()
        .map(|ip| {
            let mut best = (f64::INFINITY, ip, ip + 1);
            for iq in (ip + 1)..m {
                let score = sums.pair_score(components, d, ip, iq);
                if score < best.0 {
                    best = (score, ip, iq);
                }
            }
            best
        })
        .reduce(
            || (f64::INFINITY, 0, 1),
            |a, b| match a.0.total_cmp(&b.0) {
                std::cmp::Ordering::Less => a,
                std::cmp::Ordering::Greater => b,
                std::cmp::Ordering::Equal if (a.1, a.2) <= (b.1, b.2) => a,
                std::cmp::Ordering::Equal => b,
            },
        );
    ordered(ip, iq)
}

/// Member of the pair at `iq` that the singleton at `ip` attaches to.
///
/// Minimises `(m - 1) d(q, p) - R(q)`; the terms shared by both members
/// cancel, so only the taxon row sums are needed.
fn closest_member_1_vs_2(
    ip: usize,
    iq: usize,
    d: &Array2<f64>,
    components: &[Component],
    sums: &RowSums,
) -> Result<usize> {
    let p = components[ip].first();
    let Component::Pair(q1, q2) = components[iq] else {
        bail!("expected a pair at index {}", iq);
    };
    let scale = components.len() as f64 - 1.0;
    let score = |q: usize| scale * d[[q, p]] - sums.taxon[q];
    Ok(if score(q1) <= score(q2) { q1 } else { q2 })
}

/// Members of the pairs at `ip` and `iq` that get connected.
fn closest_members_2_vs_2(
    ip: usize,
    iq: usize,
    d: &Array2<f64>,
    components: &[Component],
    sums: &RowSums,
) -> Result<(usize, usize)> {
    let (pc, qc) = (components[ip], components[iq]);
    let (Component::Pair(p1, p2), Component::Pair(q1, q2)) = (pc, qc) else {
        bail!("expected two pairs at indices {} and {}", ip, iq);
    };

    // Row sum of `x` with the other pair counted by its two members.
    let row = |x: usize, other: Component| sums.taxon[x] + avg_taxon_comp(d, x, other);
    let m = components.len() as f64;
    let mut best = (f64::INFINITY, (p1, q1));
    for (p, q) in [(p1, q1), (p2, q1), (p1, q2), (p2, q2)] {
        let score = m * d[[p, q]] - row(p, qc) - row(q, pc);
        if score < best.0 {
            best = (score, (p, q));
        }
    }
    Ok(best.1)
}
