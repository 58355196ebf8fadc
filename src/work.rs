use std::ops::Range;

use crate::sample::{Sample, Scored};

/// A set of (branch_id, sequence_id) pairs to be scored, kept branch-major so
/// consecutive pairs share a branch and reuse one tiny tree. The `is_last`
/// marker doubles as the pipeline's end-of-stream token.
#[derive(Debug, Clone, Default)]
pub struct Work {
    pairs: Vec<(usize, usize)>,
    is_last: bool,
}

impl Work {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cartesian work set over half-open branch and sequence ranges,
    /// branch-major.
    pub fn from_ranges(branches: Range<usize>, sequences: Range<usize>) -> Self {
        let mut pairs = Vec::with_capacity(branches.len() * sequences.len());
        for b in branches {
            for s in sequences.clone() {
                pairs.push((b, s));
            }
        }
        Self {
            pairs,
            is_last: false,
        }
    }

    /// Rebuilds a work set from the surviving (query, branch) pairs of a
    /// filtered sample, for the thorough phase.
    pub fn from_sample<T: Scored>(sample: &Sample<T>) -> Self {
        let mut pairs = Vec::new();
        for pq in sample.iter() {
            for p in pq.placements.iter() {
                pairs.push((p.branch_id(), pq.sequence_id));
            }
        }
        pairs.sort_unstable();
        Self {
            pairs,
            is_last: false,
        }
    }

    pub fn last_marker() -> Self {
        Self {
            pairs: Vec::new(),
            is_last: true,
        }
    }

    pub fn is_last(&self) -> bool {
        self.is_last
    }

    pub fn set_last(&mut self, last: bool) {
        self.is_last = last;
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, (usize, usize)> {
        self.pairs.iter()
    }
}

impl FromIterator<(usize, usize)> for Work {
    fn from_iter<I: IntoIterator<Item = (usize, usize)>>(iter: I) -> Self {
        Self {
            pairs: iter.into_iter().collect(),
            is_last: false,
        }
    }
}

/// Carves a work set into at most `n` contiguous shards of roughly equal
/// size.
pub fn split(work: &Work, n: usize) -> Vec<Work> {
    if work.is_empty() || n == 0 {
        return Vec::new();
    }
    let shard = work.len().div_ceil(n);
    work.pairs
        .chunks(shard)
        .map(|c| Work {
            pairs: c.to_vec(),
            is_last: false,
        })
        .collect()
}

/// Recombines shards by concatenation.
pub fn merge(parts: Vec<Work>) -> Work {
    let mut out = Work::new();
    for part in parts {
        out.pairs.extend(part.pairs);
        out.is_last |= part.is_last;
    }
    out
}
