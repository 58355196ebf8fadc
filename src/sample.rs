use std::collections::HashMap;

use crate::utils::logsumexp;

/// A fully scored placement of one query on one reference branch. The LWR is
/// meaningful only after [`compute_and_set_lwr`].
#[derive(Debug, Clone, Copy)]
pub struct Placement {
    pub branch_id: usize,
    pub likelihood: f64,
    pub lwr: f64,
    pub pendant_length: f64,
    pub distal_length: f64,
}

/// Space-saving placement used during preplacement, without LWR.
#[derive(Debug, Clone, Copy)]
pub struct SlimPlacement {
    pub branch_id: usize,
    pub likelihood: f64,
    pub pendant_length: f64,
    pub distal_length: f64,
}

impl From<Placement> for SlimPlacement {
    fn from(p: Placement) -> Self {
        Self {
            branch_id: p.branch_id,
            likelihood: p.likelihood,
            pendant_length: p.pendant_length,
            distal_length: p.distal_length,
        }
    }
}

impl From<SlimPlacement> for Placement {
    fn from(p: SlimPlacement) -> Self {
        Self {
            branch_id: p.branch_id,
            likelihood: p.likelihood,
            lwr: 0.0,
            pendant_length: p.pendant_length,
            distal_length: p.distal_length,
        }
    }
}

/// Common view over slim and full placements, used by collapse and the work
/// reconstruction for the thorough phase.
pub trait Scored {
    fn branch_id(&self) -> usize;
    fn likelihood(&self) -> f64;
}

impl Scored for Placement {
    fn branch_id(&self) -> usize {
        self.branch_id
    }
    fn likelihood(&self) -> f64 {
        self.likelihood
    }
}

impl Scored for SlimPlacement {
    fn branch_id(&self) -> usize {
        self.branch_id
    }
    fn likelihood(&self) -> f64 {
        self.likelihood
    }
}

/// All placements of one query sequence.
#[derive(Debug, Clone)]
pub struct PQuery<T> {
    pub sequence_id: usize,
    pub header: String,
    pub placements: Vec<T>,
}

/// Per-query placement lists, optionally annotated with the reference newick.
#[derive(Debug, Clone)]
pub struct Sample<T> {
    pquerys: Vec<PQuery<T>>,
    index: HashMap<usize, usize>,
    pub newick: Option<String>,
}

impl<T> Default for Sample<T> {
    fn default() -> Self {
        Self {
            pquerys: Vec::new(),
            index: HashMap::new(),
            newick: None,
        }
    }
}

impl<T> Sample<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.pquerys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pquerys.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, PQuery<T>> {
        self.pquerys.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, PQuery<T>> {
        self.pquerys.iter_mut()
    }

    pub fn add_placement(&mut self, sequence_id: usize, header: &str, placement: T) {
        match self.index.get(&sequence_id) {
            Some(&i) => self.pquerys[i].placements.push(placement),
            None => {
                self.index.insert(sequence_id, self.pquerys.len());
                self.pquerys.push(PQuery {
                    sequence_id,
                    header: header.to_string(),
                    placements: vec![placement],
                });
            }
        }
    }

    pub fn clear(&mut self) {
        self.pquerys.clear();
        self.index.clear();
    }
}

impl From<Sample<SlimPlacement>> for Sample<Placement> {
    fn from(slim: Sample<SlimPlacement>) -> Self {
        Self {
            pquerys: slim
                .pquerys
                .into_iter()
                .map(|pq| PQuery {
                    sequence_id: pq.sequence_id,
                    header: pq.header,
                    placements: pq.placements.into_iter().map(Placement::from).collect(),
                })
                .collect(),
            index: slim.index,
            newick: slim.newick,
        }
    }
}

/// Normalises each query's placements into likelihood weight ratios.
pub fn compute_and_set_lwr(sample: &mut Sample<Placement>) {
    for pq in sample.iter_mut() {
        let logls: Vec<f64> = pq.placements.iter().map(|p| p.likelihood).collect();
        let lse = logsumexp(&logls);
        for p in pq.placements.iter_mut() {
            p.lwr = (p.likelihood - lse).exp();
        }
    }
}

/// Merges duplicate sequence ids, then de-duplicates placements on the same
/// branch keeping the best-likelihood copy; stable in input order otherwise.
pub fn collapse<T: Scored + Copy>(sample: &mut Sample<T>) {
    let mut merged: Vec<PQuery<T>> = Vec::with_capacity(sample.pquerys.len());
    let mut index: HashMap<usize, usize> = HashMap::new();
    for pq in sample.pquerys.drain(..) {
        match index.get(&pq.sequence_id) {
            Some(&i) => merged[i].placements.extend(pq.placements),
            None => {
                index.insert(pq.sequence_id, merged.len());
                merged.push(pq);
            }
        }
    }
    for pq in merged.iter_mut() {
        let mut by_branch: HashMap<usize, usize> = HashMap::new();
        let mut kept: Vec<T> = Vec::with_capacity(pq.placements.len());
        for p in pq.placements.drain(..) {
            match by_branch.get(&p.branch_id()) {
                Some(&i) => {
                    if p.likelihood() > kept[i].likelihood() {
                        kept[i] = p;
                    }
                }
                None => {
                    by_branch.insert(p.branch_id(), kept.len());
                    kept.push(p);
                }
            }
        }
        pq.placements = kept;
    }
    sample.pquerys = merged;
    sample.index = index;
}

fn sort_by_lwr(placements: &mut [Placement]) {
    placements.sort_by(|a, b| b.lwr.total_cmp(&a.lwr));
}

/// Keeps, per query, placements with LWR ≥ threshold, bounded by min/max
/// counts, sorted by descending LWR.
pub fn discard_by_support_threshold(
    sample: &mut Sample<Placement>,
    threshold: f64,
    min: usize,
    max: usize,
) {
    for pq in sample.iter_mut() {
        sort_by_lwr(&mut pq.placements);
        let above = pq.placements.iter().filter(|p| p.lwr >= threshold).count();
        let keep = above.clamp(min, max).min(pq.placements.len());
        pq.placements.truncate(keep);
    }
}

/// Keeps, per query, the best placements whose cumulative LWR first reaches
/// the threshold, bounded by min/max counts.
pub fn discard_by_accumulated_threshold(
    sample: &mut Sample<Placement>,
    threshold: f64,
    min: usize,
    max: usize,
) {
    for pq in sample.iter_mut() {
        sort_by_lwr(&mut pq.placements);
        let mut acc = 0.0;
        let mut count = 0usize;
        for p in pq.placements.iter() {
            count += 1;
            acc += p.lwr;
            if acc >= threshold {
                break;
            }
        }
        let keep = count.clamp(min, max).min(pq.placements.len());
        pq.placements.truncate(keep);
    }
}

/// Removes the lowest `fraction` of each query's placements by LWR.
pub fn discard_bottom_x_percent(sample: &mut Sample<Placement>, fraction: f64) {
    let fraction = fraction.clamp(0.0, 1.0);
    for pq in sample.iter_mut() {
        sort_by_lwr(&mut pq.placements);
        let remove = (fraction * pq.placements.len() as f64).floor() as usize;
        let keep = pq.placements.len().saturating_sub(remove).max(1);
        pq.placements.truncate(keep);
    }
}

/// Moves every sub-sample into `dst`, combining entries for the same
/// sequence id.
pub fn merge<T>(dst: &mut Sample<T>, parts: Vec<Sample<T>>) {
    for part in parts {
        if dst.newick.is_none() {
            dst.newick = part.newick.clone();
        }
        for pq in part.pquerys {
            match dst.index.get(&pq.sequence_id) {
                Some(&i) => dst.pquerys[i].placements.extend(pq.placements),
                None => {
                    dst.index.insert(pq.sequence_id, dst.pquerys.len());
                    dst.pquerys.push(pq);
                }
            }
        }
    }
}
