//! L2 distance kernels and bounded top-K candidate list.

use crate::store::Match;

const LANES: usize = 8;

/// Squared Euclidean distance.
///
/// Accumulates eight independent lanes so LLVM can vectorize the loop
/// without target-specific intrinsics.
#[inline]
pub fn l2_squared(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    let mut acc = [0.0f32; LANES];

    let a_chunks = a.chunks_exact(LANES);
    let b_chunks = b.chunks_exact(LANES);
    let (a_tail, b_tail) = (a_chunks.remainder(), b_chunks.remainder());

    for (ca, cb) in a_chunks.zip(b_chunks) {
        for i in 0..LANES {
            let d = ca[i] - cb[i];
            acc[i] += d * d;
        }
    }

    let mut sum: f32 = acc.iter().sum();
    for (x, y) in a_tail.iter().zip(b_tail) {
        let d = x - y;
        sum += d * d;
    }
    sum
}

#[inline]
pub fn l2(a: &[f32], b: &[f32]) -> f32 {
    l2_squared(a, b).sqrt()
}

/// Squared distance between a query and a little-endian encoded vector.
#[inline]
pub fn l2_squared_le_bytes(query: &[f32], bytes: &[u8]) -> f32 {
    debug_assert_eq!(query.len() * 4, bytes.len());
    query
        .iter()
        .zip(bytes.chunks_exact(4))
        .map(|(q, c)| {
            let d = q - f32::from_le_bytes([c[0], c[1], c[2], c[3]]);
            d * d
        })
        .sum()
}

/// Candidate list holding at most `k` matches, ascending by distance.
///
/// Equal distances keep insertion order, so ties resolve by scan order.
#[derive(Debug)]
pub struct TopK {
    k: usize,
    items: Vec<Match>,
}

impl TopK {
    pub fn new(k: usize) -> Self {
        Self {
            k,
            items: Vec::with_capacity(k.min(1024)),
        }
    }

    /// Whether a candidate at `distance` would enter the list.
    pub fn accepts(&self, distance: f32) -> bool {
        if self.k == 0 {
            return false;
        }
        match self.items.last() {
            _ if self.items.len() < self.k => true,
            Some(worst) => distance < worst.distance,
            None => true,
        }
    }

    /// Offer a candidate; the id is only materialized if it is kept.
    pub fn offer(&mut self, distance: f32, id: impl FnOnce() -> String) {
        if !self.accepts(distance) {
            return;
        }
        let candidate = Match { id: id(), distance };
        if self.items.len() < self.k {
            self.items.push(candidate);
        } else if let Some(worst) = self.items.last_mut() {
            *worst = candidate;
        }
        sort_ascending(&mut self.items);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn into_sorted(self) -> Vec<Match> {
        self.items
    }
}

/// Stable ascending sort by distance.
pub fn sort_ascending(items: &mut [Match]) {
    items.sort_by(|a, b| a.distance.total_cmp(&b.distance));
}

/// Merge per-partition results into one global top-K list.
pub fn merge(partials: impl IntoIterator<Item = Vec<Match>>, k: usize) -> Vec<Match> {
    let mut all: Vec<Match> = partials.into_iter().flatten().collect();
    sort_ascending(&mut all);
    all.truncate(k);
    all
}
