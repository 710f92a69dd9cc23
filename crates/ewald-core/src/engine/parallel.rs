//! Data-parallel region plumbing.
//!
//! Every region partitions the atom range into per-thread chunks; each chunk
//! owns full-length local accumulators that are merged by summation once the
//! region joins. No shared mutable state is touched inside a chunk, which is
//! the race-freedom contract all kernels rely on.

use std::ops::Range;

#[cfg(feature = "parallel")]
use rayon::prelude::*;

/// Splits `[0, n)` into roughly even chunks, one per worker.
pub fn atom_chunks(n: usize) -> Vec<Range<usize>> {
    let workers = num_workers().min(n.max(1));
    let size = n.div_ceil(workers);
    (0..workers)
        .map(|w| (w * size).min(n)..((w + 1) * size).min(n))
        .filter(|r| !r.is_empty())
        .collect()
}

#[cfg(feature = "parallel")]
fn num_workers() -> usize {
    rayon::current_num_threads()
}

#[cfg(not(feature = "parallel"))]
fn num_workers() -> usize {
    1
}

/// Runs `kernel` over each chunk of the atom range and merges the per-chunk
/// accumulators.
pub fn region<A, K, M>(n_atoms: usize, kernel: K, merge: M) -> Option<A>
where
    A: Send,
    K: Fn(Range<usize>) -> A + Sync,
    M: Fn(A, A) -> A + Sync + Send,
{
    let chunks = atom_chunks(n_atoms);
    #[cfg(feature = "parallel")]
    {
        chunks.into_par_iter().map(&kernel).reduce_with(&merge)
    }
    #[cfg(not(feature = "parallel"))]
    {
        chunks.into_iter().map(&kernel).reduce(merge)
    }
}

/// Runs two independent sections, concurrently when requested.
pub fn sections<L, R, LO, RO>(concurrent: bool, left: L, right: R) -> (LO, RO)
where
    L: FnOnce() -> LO + Send,
    R: FnOnce() -> RO + Send,
    LO: Send,
    RO: Send,
{
    #[cfg(feature = "parallel")]
    {
        if concurrent {
            return rayon::join(left, right);
        }
    }
    let _ = concurrent;
    (left(), right())
}

/// Element-wise vector sum used by accumulator merges.
pub fn merge_vec<T: Copy + std::ops::Add<Output = T>>(mut a: Vec<T>, b: Vec<T>) -> Vec<T> {
    for (x, y) in a.iter_mut().zip(b) {
        *x = *x + y;
    }
    a
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunks_cover_range_without_overlap() {
        let chunks = atom_chunks(103);
        let mut seen = vec![false; 103];
        for c in chunks {
            for i in c {
                assert!(!seen[i]);
                seen[i] = true;
            }
        }
        assert!(seen.iter().all(|&s| s));
    }

    #[test]
    fn empty_range_produces_no_chunks() {
        assert!(atom_chunks(0).is_empty());
    }

    #[test]
    fn region_merges_chunk_sums() {
        let total = region(
            1000,
            |range| range.map(|i| i as u64).sum::<u64>(),
            |a, b| a + b,
        )
        .unwrap_or(0);
        assert_eq!(total, 999 * 1000 / 2);
    }
}
