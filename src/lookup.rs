use std::sync::{Mutex, MutexGuard, OnceLock};

use anyhow::{Result, anyhow, bail};
use ndarray::Array2;

use crate::model::{Alphabet, CharMap};

/// Per-branch precomputed site-likelihood tables, keyed by branch_id. Each
/// table holds the per-site log-likelihood of every alphabet symbol placed at
/// that branch. Population happens exactly once per branch under the branch
/// mutex; readers go lock-free after `has_branch` observes the table.
pub struct LookupStore {
    locks: Vec<Mutex<()>>,
    store: Vec<OnceLock<Array2<f64>>>,
    charmap: CharMap,
}

impl LookupStore {
    pub fn new(num_branches: usize, num_states: usize) -> Result<Self> {
        let alphabet = Alphabet::for_states(num_states)?;
        Ok(Self {
            locks: (0..num_branches).map(|_| Mutex::new(())).collect(),
            store: (0..num_branches).map(|_| OnceLock::new()).collect(),
            charmap: CharMap::new(alphabet),
        })
    }

    pub fn num_branches(&self) -> usize {
        self.store.len()
    }

    pub fn charmap(&self) -> &CharMap {
        &self.charmap
    }

    pub fn char_map_size(&self) -> usize {
        self.charmap.size()
    }

    /// Serializes lazy initialisation of one branch's table.
    pub fn lock_branch(&self, branch_id: usize) -> Result<MutexGuard<'_, ()>> {
        if branch_id >= self.locks.len() {
            bail!("branch id {branch_id} out of bounds in lookup store");
        }
        self.locks[branch_id]
            .lock()
            .map_err(|_| anyhow!("branch {branch_id} lookup mutex poisoned"))
    }

    pub fn has_branch(&self, branch_id: usize) -> bool {
        branch_id < self.store.len() && self.store[branch_id].get().is_some()
    }

    pub fn init_branch(&self, branch_id: usize, table: Array2<f64>) -> Result<()> {
        if branch_id >= self.store.len() {
            bail!("branch id {branch_id} out of bounds in lookup store");
        }
        if table.ncols() != self.charmap.size() {
            bail!(
                "lookup table has {} columns, alphabet has {} symbols",
                table.ncols(),
                self.charmap.size()
            );
        }
        self.store[branch_id]
            .set(table)
            .map_err(|_| anyhow!("lookup table for branch {branch_id} initialized twice"))
    }

    /// Sums the precomputed per-site log-likelihood of `seq` at `branch_id`.
    /// This is the prescoring hot loop.
    pub fn sum_precomputed_sitelk(&self, branch_id: usize, seq: &str) -> Result<f64> {
        let table = self
            .store
            .get(branch_id)
            .and_then(|s| s.get())
            .ok_or_else(|| anyhow!("lookup table for branch {branch_id} not initialized"))?;
        let bytes = seq.as_bytes();
        if bytes.len() != table.nrows() {
            bail!(
                "query length {} does not match {} lookup sites",
                bytes.len(),
                table.nrows()
            );
        }

        let mut sum = 0.0f64;
        let mut site = 0usize;
        while site + 4 <= bytes.len() {
            let sum_one = table[[site, self.charmap.index(bytes[site])?]]
                + table[[site + 1, self.charmap.index(bytes[site + 1])?]];
            let sum_two = table[[site + 2, self.charmap.index(bytes[site + 2])?]]
                + table[[site + 3, self.charmap.index(bytes[site + 3])?]];
            sum += sum_one + sum_two;
            site += 4;
        }
        while site < bytes.len() {
            sum += table[[site, self.charmap.index(bytes[site])?]];
            site += 1;
        }
        Ok(sum)
    }
}
