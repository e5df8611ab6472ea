//! NeighborNet agglomeration (Bryant & Huson 2005) producing a circular ordering.
//!
//! Nodes live in an arena and refer to each other by index. Active clusters
//! form a doubly-linked list hanging off a header node at index 0; every
//! 3-way join pushes the index of its first new node onto a stack that the
//! expansion phase unwinds in reverse.

use anyhow::{Context, Result, anyhow, ensure};
use log::debug;
use ndarray::Array2;

use crate::data::distance_matrix::DistanceMatrix;

const EPS: f64 = 1e-12;
const HEAD: usize = 0;

#[derive(Clone, Debug, Default)]
struct Node {
    id: usize,
    next: Option<usize>,
    prev: Option<usize>,
    /// Partner when this node is one half of a paired cluster.
    nbr: Option<usize>,
    ch1: Option<usize>,
    ch2: Option<usize>,
    sx: f64,
    rx: f64,
}

impl Node {
    fn new(id: usize) -> Self {
        Self { id, ..Default::default() }
    }
}

struct Arena {
    nodes: Vec<Node>,
    d: Array2<f64>,
    n_tax: usize,
    /// Highest node id handed out so far.
    last_id: usize,
}

/// Circular ordering by NeighborNet agglomeration.
///
/// Returns `[0, t1, ..., tn]`: a leading 0 sentinel then the 1-based cycle,
/// starting at taxon 1 and oriented towards the smaller of its two neighbours.
pub fn compute_order_agglomerative(dist: &DistanceMatrix) -> Result<Vec<usize>> {
    let n_tax = dist.n();
    if n_tax <= 3 {
        return Ok((0..=n_tax).collect());
    }
    let mut arena = Arena::new(dist);
    let joins = arena.agglomerate()?;
    debug!("Agglomeration finished with {} joins", joins.len());
    arena.expand(joins)
}

impl Arena {
    fn new(dist: &DistanceMatrix) -> Self {
        let n_tax = dist.n();
        let capacity = 3 * n_tax;
        let mut d = Array2::<f64>::zeros((capacity, capacity));
        for i in 1..=n_tax {
            for j in 1..=n_tax {
                d[[i, j]] = dist.taxa(i, j);
            }
        }

        let mut nodes = vec![Node::default(); capacity];
        nodes[HEAD] = Node::new(0);
        let mut prev = HEAD;
        for id in 1..=n_tax {
            nodes[id] = Node::new(id);
            nodes[id].prev = Some(prev);
            nodes[prev].next = Some(id);
            prev = id;
        }

        Self {
            nodes,
            d,
            n_tax,
            last_id: n_tax,
        }
    }

    #[inline]
    fn dist(&self, a: usize, b: usize) -> f64 {
        self.d[[self.nodes[a].id, self.nodes[b].id]]
    }

    /// Active nodes in list order.
    fn actives(&self) -> Vec<usize> {
        let mut out = Vec::new();
        let mut cur = self.nodes[HEAD].next;
        while let Some(p) = cur {
            out.push(p);
            cur = self.nodes[p].next;
        }
        out
    }

    /// True unless `p` is the larger-id half of a pair; each cluster is
    /// represented by exactly one such node.
    #[inline]
    fn represents_cluster(&self, p: usize) -> bool {
        self.nodes[p]
            .nbr
            .map_or(true, |nb| self.nodes[nb].id > self.nodes[p].id)
    }

    /// Mean distance between the clusters containing `p` and `q`.
    fn cluster_dist(&self, p: usize, q: usize) -> f64 {
        match (self.nodes[p].nbr, self.nodes[q].nbr) {
            (None, None) => self.dist(p, q),
            (Some(pb), None) => 0.5 * (self.dist(p, q) + self.dist(pb, q)),
            (None, Some(qb)) => 0.5 * (self.dist(p, q) + self.dist(p, qb)),
            (Some(pb), Some(qb)) => {
                0.25 * (self.dist(p, q) + self.dist(p, qb) + self.dist(pb, q) + self.dist(pb, qb))
            }
        }
    }

    /// Cluster row sums, written to both halves of each pair.
    fn compute_sx(&mut self, actives: &[usize]) {
        for &p in actives {
            self.nodes[p].sx = 0.0;
        }
        for (pi, &p) in actives.iter().enumerate() {
            if !self.represents_cluster(p) {
                continue;
            }
            for &q in &actives[pi + 1..] {
                let counts = match self.nodes[q].nbr {
                    None => true,
                    Some(nb) => self.nodes[nb].id > self.nodes[q].id && nb != p,
                };
                if !counts {
                    continue;
                }
                let dpq = self.cluster_dist(p, q);
                self.nodes[p].sx += dpq;
                if let Some(pb) = self.nodes[p].nbr {
                    self.nodes[pb].sx += dpq;
                }
                self.nodes[q].sx += dpq;
                if let Some(qb) = self.nodes[q].nbr {
                    self.nodes[qb].sx += dpq;
                }
            }
        }
    }

    /// Cluster pair minimising `(m - 2) D(p,q) - S(p) - S(q)`.
    fn closest_clusters(&self, actives: &[usize], num_clusters: usize) -> Result<(usize, usize)> {
        let mut best: Option<(usize, usize, f64)> = None;
        for (pi, &p) in actives.iter().enumerate() {
            if !self.represents_cluster(p) {
                continue;
            }
            for &q in &actives[..pi] {
                if !self.represents_cluster(q) || self.nodes[q].nbr == Some(p) {
                    continue;
                }
                let dpq = self.cluster_dist(p, q);
                let qpq = (num_clusters as f64 - 2.0) * dpq - self.nodes[p].sx - self.nodes[q].sx;
                let replace = match best {
                    None => true,
                    Some((bp, bq, bv)) => {
                        qpq - bv < -EPS
                            || ((qpq - bv).abs() <= EPS
                                && self.id_pair(p, q) < self.id_pair(bp, bq))
                    }
                };
                if replace {
                    best = Some((p, q, qpq));
                }
            }
        }
        best.map(|(p, q, _)| (p, q))
            .context("no candidate cluster pair among active nodes")
    }

    #[inline]
    fn id_pair(&self, a: usize, b: usize) -> (usize, usize) {
        let (ia, ib) = (self.nodes[a].id, self.nodes[b].id);
        if ia <= ib { (ia, ib) } else { (ib, ia) }
    }

    /// Row sum for `z` where the candidate clusters count as singletons.
    fn compute_rx(&self, z: usize, cx: usize, cy: usize, actives: &[usize]) -> f64 {
        let mut rx = 0.0;
        for &p in actives {
            let full = p == cx
                || self.nodes[cx].nbr == Some(p)
                || p == cy
                || self.nodes[cy].nbr == Some(p)
                || self.nodes[p].nbr.is_none();
            let term = self.dist(z, p);
            rx += if full { term } else { term / 2.0 };
        }
        rx
    }

    /// Pick which members of the two chosen clusters to connect.
    fn choose_members(
        &mut self,
        cx: usize,
        cy: usize,
        actives: &[usize],
        num_clusters: usize,
    ) -> (usize, usize) {
        let (cxb, cyb) = (self.nodes[cx].nbr, self.nodes[cy].nbr);
        if cxb.is_some() || cyb.is_some() {
            for z in [Some(cx), cxb, Some(cy), cyb].into_iter().flatten() {
                self.nodes[z].rx = self.compute_rx(z, cx, cy, actives);
            }
        }

        let m = num_clusters + usize::from(cxb.is_some()) + usize::from(cyb.is_some());
        let score = |a: usize, b: usize| {
            (m as f64 - 2.0) * self.dist(a, b) - self.nodes[a].rx - self.nodes[b].rx
        };

        let (mut x, mut y) = (cx, cy);
        let mut best = score(cx, cy);
        if let Some(xb) = cxb {
            let v = score(xb, cy);
            if v - best < -EPS {
                best = v;
                (x, y) = (xb, cy);
            }
        }
        if let Some(yb) = cyb {
            let v = score(cx, yb);
            if v - best < -EPS {
                best = v;
                (x, y) = (cx, yb);
            }
        }
        if let (Some(xb), Some(yb)) = (cxb, cyb) {
            if score(xb, yb) - best < -EPS {
                (x, y) = (xb, yb);
            }
        }
        (x, y)
    }

    fn agglomerate(&mut self) -> Result<Vec<usize>> {
        let mut joins = Vec::new();
        let mut num_active = self.n_tax;
        let mut num_clusters = self.n_tax;

        while num_active > 3 {
            if num_active == 4 && num_clusters == 2 {
                self.close_last_two_pairs(&mut joins)?;
                break;
            }

            let actives = self.actives();
            self.compute_sx(&actives);
            let (cx, cy) = self.closest_clusters(&actives, num_clusters)?;
            let (x, y) = self.choose_members(cx, cy, &actives, num_clusters);

            match (self.nodes[x].nbr, self.nodes[y].nbr) {
                (None, None) => {
                    self.nodes[x].nbr = Some(y);
                    self.nodes[y].nbr = Some(x);
                    num_clusters -= 1;
                }
                (None, Some(yb)) => {
                    self.join3(x, y, yb, &mut joins)?;
                    num_active -= 1;
                    num_clusters -= 1;
                }
                (Some(xb), None) => {
                    self.join3(y, x, xb, &mut joins)?;
                    num_active -= 1;
                    num_clusters -= 1;
                }
                (Some(xb), Some(yb)) => {
                    // Two sequential 3-way joins: xb,x,y then u,v,yb.
                    let u = self.join3(xb, x, y, &mut joins)?;
                    let v = self.nodes[u].nbr.context("new node lost its partner")?;
                    self.join3(u, v, yb, &mut joins)?;
                    num_active -= 2;
                    num_clusters -= 1;
                }
            }
        }
        Ok(joins)
    }

    /// Four active nodes in two pairs: join in the orientation with the
    /// smaller cross distance.
    fn close_last_two_pairs(&mut self, joins: &mut Vec<usize>) -> Result<()> {
        let actives = self.actives();
        ensure!(actives.len() == 4, "expected four active nodes");
        let p = actives[0];
        let q = if Some(actives[1]) != self.nodes[p].nbr {
            actives[1]
        } else {
            actives[2]
        };
        let pn = self.nodes[p].nbr.context("expected partner of p")?;
        let qn = self.nodes[q].nbr.context("expected partner of q")?;
        let straight = self.dist(p, q) + self.dist(pn, qn);
        let crossed = self.dist(p, qn) + self.dist(pn, q);
        if straight < crossed {
            self.join3(p, q, qn, joins)?;
        } else {
            self.join3(p, qn, q, joins)?;
        }
        Ok(())
    }

    /// Replace `x`, `y`, `z` (y adjacent to both) by a new pair `u`, `v`,
    /// blending distances 2/3 : 1/3. Returns `u`; `u` is pushed on `joins`.
    fn join3(&mut self, x: usize, y: usize, z: usize, joins: &mut Vec<usize>) -> Result<usize> {
        let u = self.last_id + 1;
        let v = self.last_id + 2;
        ensure!(v < self.nodes.len(), "node capacity exceeded");
        self.last_id = v;

        self.nodes[u] = Node {
            id: u,
            nbr: Some(v),
            ch1: Some(x),
            ch2: Some(y),
            ..Default::default()
        };
        self.nodes[v] = Node {
            id: v,
            nbr: Some(u),
            ch1: Some(y),
            ch2: Some(z),
            ..Default::default()
        };

        self.replace_in_list(x, u);
        self.replace_in_list(z, v);
        self.unlink(y);

        let (xid, yid, zid) = (self.nodes[x].id, self.nodes[y].id, self.nodes[z].id);
        for p in self.actives() {
            if p == u || p == v {
                continue;
            }
            let pid = self.nodes[p].id;
            let du = (2.0 / 3.0) * self.d[[xid, pid]] + (1.0 / 3.0) * self.d[[yid, pid]];
            let dv = (2.0 / 3.0) * self.d[[zid, pid]] + (1.0 / 3.0) * self.d[[yid, pid]];
            self.d[[u, pid]] = du;
            self.d[[pid, u]] = du;
            self.d[[v, pid]] = dv;
            self.d[[pid, v]] = dv;
        }
        self.d[[u, v]] = 0.0;
        self.d[[v, u]] = 0.0;
        self.d[[u, u]] = 0.0;
        self.d[[v, v]] = 0.0;

        joins.push(u);
        Ok(u)
    }

    fn replace_in_list(&mut self, old: usize, new: usize) {
        let (prev, next) = (self.nodes[old].prev, self.nodes[old].next);
        self.nodes[new].prev = prev;
        self.nodes[new].next = next;
        if let Some(nx) = next {
            self.nodes[nx].prev = Some(new);
        }
        if let Some(pv) = prev {
            self.nodes[pv].next = Some(new);
        }
    }

    fn unlink(&mut self, y: usize) {
        let (prev, next) = (self.nodes[y].prev, self.nodes[y].next);
        if let Some(nx) = next {
            self.nodes[nx].prev = prev;
        }
        if let Some(pv) = prev {
            self.nodes[pv].next = next;
        }
    }

    /* ---------------------------- expansion ---------------------------- */

    fn expand(&mut self, mut joins: Vec<usize>) -> Result<Vec<usize>> {
        ensure!(!joins.is_empty(), "join stack is empty");

        // Close the remaining three actives into a ring.
        let x0 = self.nodes[HEAD].next.context("need three active nodes")?;
        let y0 = self.nodes[x0].next.context("need three active nodes")?;
        let z0 = self.nodes[y0].next.context("need three active nodes")?;
        self.nodes[z0].next = Some(x0);
        self.nodes[x0].prev = Some(z0);

        while let Some(top) = joins.pop() {
            let mut u = top;
            let mut v = self.nodes[u].nbr.context("joined node without partner")?;
            let mut x = self.nodes[u].ch1.context("joined node without first child")?;
            let y = self.nodes[u].ch2.context("joined node without second child")?;
            let mut z = self.nodes[v].ch2.context("partner without second child")?;

            if self.nodes[v].next == Some(u) {
                std::mem::swap(&mut u, &mut v);
                std::mem::swap(&mut x, &mut z);
            } else if self.nodes[u].next != Some(v) {
                return Err(anyhow!(
                    "expansion invariant broken: nodes {} and {} are not adjacent",
                    u,
                    v
                ));
            }

            let before = self.nodes[u].prev.context("ring broken before join")?;
            let after = self.nodes[v].next.context("ring broken after join")?;
            self.link(before, x);
            self.link(x, y);
            self.link(y, z);
            self.link(z, after);
        }

        self.read_cycle()
    }

    #[inline]
    fn link(&mut self, a: usize, b: usize) {
        self.nodes[a].next = Some(b);
        self.nodes[b].prev = Some(a);
    }

    fn step(&self, a: usize, forward: bool) -> Result<usize> {
        let nxt = if forward {
            self.nodes[a].next
        } else {
            self.nodes[a].prev
        };
        nxt.context("ring broken during traversal")
    }

    fn is_leaf(&self, a: usize) -> bool {
        (1..=self.n_tax).contains(&self.nodes[a].id)
    }

    fn next_leaf(&self, start: usize, forward: bool) -> Result<usize> {
        let mut a = start;
        loop {
            a = self.step(a, forward)?;
            ensure!(a != start, "ring contains no other leaf");
            if self.is_leaf(a) {
                return Ok(self.nodes[a].id);
            }
        }
    }

    /// Walk the ring from taxon 1 towards its smaller-labelled neighbour.
    fn read_cycle(&self) -> Result<Vec<usize>> {
        let entry = self.nodes[HEAD].next.context("no active nodes")?;
        let mut start = entry;
        while self.nodes[start].id != 1 {
            start = self.step(start, true)?;
            ensure!(start != entry, "taxon 1 not found in ring");
        }
        let forward = self.next_leaf(start, true)? <= self.next_leaf(start, false)?;

        let mut cycle = Vec::with_capacity(self.n_tax + 1);
        cycle.push(0);
        let mut a = start;
        loop {
            if self.is_leaf(a) {
                cycle.push(self.nodes[a].id);
                if cycle.len() == self.n_tax + 1 {
                    break;
                }
            }
            a = self.step(a, forward)?;
            ensure!(a != start, "ring holds fewer than {} taxa", self.n_tax);
        }
        Ok(cycle)
    }
}
