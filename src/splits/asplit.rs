use fixedbitset::FixedBitSet;
use serde::Serialize;
use std::fmt::{self, Display};
use std::hash::{Hash, Hasher};

/// A weighted bipartition of the taxa `1..=ntax`.
///
/// `side` is the taxon set the split was built from (for circular splits the
/// arc `cycle[i..j-1]`), `other` its complement. Bit 0 is never set.
#[derive(Debug, Clone)]
pub struct ASplit {
    side: FixedBitSet,
    other: FixedBitSet,
    ntax: usize,
    weight: f64,
}

impl ASplit {
    /// Build a split from one side; the other side is its complement in `1..=ntax`.
    pub fn from_side(side: FixedBitSet, ntax: usize, weight: f64) -> Self {
        let mut side_bits = FixedBitSet::with_capacity(ntax + 1);
        side_bits.union_with(&side);
        side_bits.set(0, false);
        let other = complement_1_based(&side_bits, ntax);
        Self {
            side: side_bits,
            other,
            ntax,
            weight,
        }
    }

    /// Build a split from an explicit list of 1-based taxa on one side.
    pub fn from_taxa(taxa: &[usize], ntax: usize, weight: f64) -> Self {
        let mut side = FixedBitSet::with_capacity(ntax + 1);
        for &t in taxa {
            debug_assert!(t >= 1 && t <= ntax, "taxon {} out of range", t);
            side.insert(t);
        }
        Self::from_side(side, ntax, weight)
    }

    pub fn weight(&self) -> f64 {
        self.weight
    }

    pub fn set_weight(&mut self, w: f64) {
        self.weight = w;
    }

    /// The side this split was constructed from.
    pub fn side(&self) -> &FixedBitSet {
        &self.side
    }

    /// The complement of [`ASplit::side`].
    pub fn other(&self) -> &FixedBitSet {
        &self.other
    }

    pub fn ntax(&self) -> usize {
        self.ntax
    }

    /// Taxa on the constructed side, ascending.
    pub fn taxa(&self) -> Vec<usize> {
        self.side.ones().collect()
    }

    /// Cardinality of the smaller side.
    pub fn size(&self) -> usize {
        self.side.count_ones(..).min(self.other.count_ones(..))
    }

    /// A split is trivial if one side holds a single taxon.
    pub fn is_trivial(&self) -> bool {
        self.size() == 1
    }

    pub fn part_containing(&self, t: usize) -> &FixedBitSet {
        if self.side.contains(t) { &self.side } else { &self.other }
    }

    /// Does this split put taxa `a` and `b` (1-based) on different sides?
    pub fn separates(&self, a: usize, b: usize) -> bool {
        self.side.contains(a) != self.side.contains(b)
    }
}

impl PartialEq for ASplit {
    /// Equality is on the partition only, anchored at taxon 1.
    fn eq(&self, other: &Self) -> bool {
        self.ntax == other.ntax
            && self
                .part_containing(1)
                .ones()
                .eq(other.part_containing(1).ones())
    }
}
impl Eq for ASplit {}

impl Hash for ASplit {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.ntax.hash(state);
        for t in self.part_containing(1).ones() {
            t.hash(state);
        }
    }
}

impl Display for ASplit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let join = |bs: &FixedBitSet| {
            bs.ones()
                .map(|t| t.to_string())
                .collect::<Vec<_>>()
                .join(",")
        };
        write!(
            f,
            "{{{}}} | {{{}}} weight={}",
            join(&self.side),
            join(&self.other),
            self.weight
        )
    }
}

/// Plain record form used for reports and bindings.
#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct SplitRecord {
    pub taxa: Vec<usize>,
    pub size: usize,
    pub weight: f64,
}

impl From<&ASplit> for SplitRecord {
    fn from(s: &ASplit) -> Self {
        Self {
            taxa: s.taxa(),
            size: s.size(),
            weight: s.weight(),
        }
    }
}

fn complement_1_based(a: &FixedBitSet, ntax: usize) -> FixedBitSet {
    let mut out = FixedBitSet::with_capacity(ntax + 1);
    for i in 1..=ntax {
        if !a.contains(i) {
            out.insert(i);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn complement_and_size() {
        let s = ASplit::from_taxa(&[2, 4], 5, 1.5);
        assert_eq!(s.taxa(), vec![2, 4]);
        assert_eq!(s.other().ones().collect::<Vec<_>>(), vec![1, 3, 5]);
        assert_eq!(s.size(), 2);
        assert!(!s.is_trivial());
        assert!(s.separates(2, 3));
        assert!(!s.separates(1, 3));
    }

    #[test]
    fn trivial_either_way() {
        assert!(ASplit::from_taxa(&[3], 4, 0.0).is_trivial());
        assert!(ASplit::from_taxa(&[1, 2, 4], 4, 0.0).is_trivial());
    }

    #[test]
    fn equality_ignores_orientation_and_weight() {
        let s1 = ASplit::from_taxa(&[1, 3], 5, 1.0);
        let s2 = ASplit::from_taxa(&[2, 4, 5], 5, 7.0);
        assert_eq!(s1, s2);
        assert_ne!(s1, ASplit::from_taxa(&[1, 4], 5, 1.0));
    }

    #[test]
    fn display_shape() {
        let s = ASplit::from_taxa(&[2], 3, 0.5).to_string();
        assert_eq!(s, "{2} | {1,3} weight=0.5");
    }
}
