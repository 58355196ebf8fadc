use anyhow::{Result, bail};

use crate::opt::DEFAULT_BRANCH_LENGTH;

/// Runtime knobs for the placement run. Built by the CLI, threaded through
/// the driver and the tiny-tree kernel.
#[derive(Debug, Clone)]
pub struct Options {
    pub chunk_size: usize,
    pub num_threads: usize,
    pub prescoring: bool,
    pub prescoring_threshold: f64,
    pub prescoring_by_percentage: bool,
    pub support_threshold: f64,
    pub acc_threshold: bool,
    pub filter_min: usize,
    pub filter_max: usize,
    pub opt_branches: bool,
    pub opt_model: bool,
    pub repeats: bool,
    pub default_pendant_length: f64,
    pub progress: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            chunk_size: 1000,
            num_threads: 0,
            prescoring: false,
            prescoring_threshold: 0.99,
            prescoring_by_percentage: false,
            support_threshold: 0.01,
            acc_threshold: false,
            filter_min: 1,
            filter_max: 7,
            opt_branches: false,
            opt_model: false,
            repeats: false,
            default_pendant_length: DEFAULT_BRANCH_LENGTH,
            progress: true,
        }
    }
}

impl Options {
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            bail!("configuration error: chunk_size must be > 0");
        }
        if !(0.0..=1.0).contains(&self.prescoring_threshold) {
            bail!(
                "configuration error: prescoring_threshold {} outside [0, 1]",
                self.prescoring_threshold
            );
        }
        if !(0.0..=1.0).contains(&self.support_threshold) {
            bail!(
                "configuration error: support_threshold {} outside [0, 1]",
                self.support_threshold
            );
        }
        if self.filter_min == 0 {
            bail!("configuration error: filter_min must be at least 1");
        }
        if self.filter_min > self.filter_max {
            bail!(
                "configuration error: filter_min {} exceeds filter_max {}",
                self.filter_min,
                self.filter_max
            );
        }
        if self.default_pendant_length <= 0.0 {
            bail!("configuration error: default_pendant_length must be > 0");
        }
        Ok(())
    }
}
