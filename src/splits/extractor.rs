use fixedbitset::FixedBitSet;

use crate::splits::asplit::ASplit;
use crate::weights::circular_ops::npairs;

/// Turn packed circular weights into splits.
///
/// Pair `(i, j)` becomes the split with side `cycle[i..j]` and weight
/// `max(x, 0)`. It is kept if the weight exceeds `cutoff` or either side is a
/// single taxon.
pub fn extract_splits(cycle: &[usize], x: &[f64], cutoff: f64) -> Vec<ASplit> {
    let n = cycle.len().saturating_sub(1);
    debug_assert_eq!(x.len(), npairs(n));

    let mut out = Vec::new();
    let mut idx = 0usize;
    for i in 1..=n {
        // Grow the arc one taxon at a time as j advances.
        let mut side = FixedBitSet::with_capacity(n + 1);
        for j in (i + 1)..=n {
            side.insert(cycle[j - 1]);
            let w = x[idx].max(0.0);
            let size = j - i;
            if w > cutoff || size == 1 || size == n - 1 {
                out.push(ASplit::from_side(side.clone(), n, w));
            }
            idx += 1;
        }
    }
    out
}
