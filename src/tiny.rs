use anyhow::{Result, bail};
use ndarray::Array2;

use crate::clv::Resident;
use crate::io::Sequence;
use crate::kernel::{self, Edge};
use crate::lookup::LookupStore;
use crate::model::ModelParams;
use crate::opt;
use crate::options::Options;
use crate::sample::Placement;
use crate::tree::Tree;

/// Ephemeral three-taxon subtree scoring queries against one reference
/// branch: the branch split into proximal and distal halves meeting at a new
/// inner node, plus a pendant edge carrying the query tip.
pub struct TinyTree<'a> {
    tree: &'a Tree,
    lookup: &'a LookupStore,
    branch_id: usize,
    thorough: bool,
    default_pendant: f64,
    original_length: f64,
    proximal: Resident,
    distal: Resident,
    proximal_length: f64,
    distal_length: f64,
    pendant_length: f64,
    pmat_proximal: Vec<f64>,
    pmat_distal: Vec<f64>,
    pmat_pendant: Vec<f64>,
    inner_clv: Vec<f64>,
    inner_scaler: Vec<u32>,
}

impl<'a> TinyTree<'a> {
    pub fn new(
        tree: &'a Tree,
        lookup: &'a LookupStore,
        half_edge: usize,
        branch_id: usize,
        thorough: bool,
        options: &Options,
    ) -> Result<Self> {
        let edge = &tree.topology.edges[half_edge];
        let twin = tree.topology.twin(half_edge);
        let original_length = edge.length;
        let proximal = tree.get_clv(half_edge)?;
        let distal = tree.get_clv(twin)?;

        let params = &tree.partition.params;
        let sites = tree.partition.sites;
        let pmat_len = params.rate_cats * params.states * params.states;

        let mut tiny = Self {
            tree,
            lookup,
            branch_id,
            thorough,
            default_pendant: options.default_pendant_length,
            original_length,
            proximal,
            distal,
            proximal_length: 0.5 * original_length,
            distal_length: 0.5 * original_length,
            pendant_length: options.default_pendant_length,
            pmat_proximal: vec![0.0; pmat_len],
            pmat_distal: vec![0.0; pmat_len],
            pmat_pendant: vec![0.0; pmat_len],
            inner_clv: vec![0.0; kernel::clv_len(params, sites)],
            inner_scaler: vec![0u32; sites],
        };
        tiny.set_pendant(tiny.pendant_length)?;
        tiny.set_split(tiny.proximal_length)?;

        if !thorough {
            tiny.ensure_lookup()?;
        }
        Ok(tiny)
    }

    pub fn branch_id(&self) -> usize {
        self.branch_id
    }

    pub fn params(&self) -> &ModelParams {
        &self.tree.partition.params
    }

    pub fn original_length(&self) -> f64 {
        self.original_length
    }

    pub fn proximal_length(&self) -> f64 {
        self.proximal_length
    }

    pub fn pendant_length(&self) -> f64 {
        self.pendant_length
    }

    pub fn distal_length(&self) -> f64 {
        self.distal_length
    }

    /// Moves the attachment point: proximal = x, distal = original − x, with
    /// both half pmatrices and the inner partial refreshed.
    pub fn set_split(&mut self, x: f64) -> Result<()> {
        if !x.is_finite() || x < 0.0 || x > self.original_length + opt::TOL_BRANCH_LEN {
            bail!("split position {x} outside [0, {}]", self.original_length);
        }
        self.proximal_length = x;
        self.distal_length = (self.original_length - x).max(0.0);
        let params = &self.tree.partition.params;
        kernel::update_pmatrix(params, &mut self.pmat_proximal, self.proximal_length)?;
        kernel::update_pmatrix(params, &mut self.pmat_distal, self.distal_length)?;
        kernel::update_partial(
            params,
            &mut self.inner_clv,
            &mut self.inner_scaler,
            self.proximal.edge(),
            &self.pmat_proximal,
            self.distal.edge(),
            &self.pmat_distal,
        )
    }

    pub fn set_pendant(&mut self, x: f64) -> Result<()> {
        self.pendant_length = x;
        kernel::update_pmatrix(&self.tree.partition.params, &mut self.pmat_pendant, x)
    }

    /// Log-likelihood across the pendant edge at the current lengths.
    pub fn pendant_edge_logl(&self, query: &[u8]) -> Result<f64> {
        kernel::edge_loglikelihood(
            &self.tree.partition.params,
            Edge::plain(&self.inner_clv, Some(&self.inner_scaler)),
            Edge::tip(query),
            &self.pmat_pendant,
            None,
        )
    }

    pub fn pendant_sumtable(&self, query: &[u8]) -> Result<kernel::Sumtable> {
        kernel::update_sumtable(
            &self.tree.partition.params,
            Edge::plain(&self.inner_clv, Some(&self.inner_scaler)),
            Edge::tip(query),
        )
    }

    /// Populates this branch's lookup table: one per-site log-likelihood
    /// column per alphabet symbol, scored at the midpoint split with the
    /// default pendant length.
    fn ensure_lookup(&mut self) -> Result<()> {
        let _guard = self.lookup.lock_branch(self.branch_id)?;
        if self.lookup.has_branch(self.branch_id) {
            return Ok(());
        }
        let sites = self.tree.partition.sites;
        let map_size = self.lookup.char_map_size();
        let mut table = Array2::<f64>::zeros((sites, map_size));
        let mut persite = vec![0.0f64; sites];
        for m in 0..map_size {
            let chars = vec![m as u8; sites];
            kernel::edge_loglikelihood(
                &self.tree.partition.params,
                Edge::plain(&self.inner_clv, Some(&self.inner_scaler)),
                Edge::tip(&chars),
                &self.pmat_pendant,
                Some(&mut persite),
            )?;
            for (site, v) in persite.iter().enumerate() {
                table[[site, m]] = *v;
            }
        }
        self.lookup.init_branch(self.branch_id, table)
    }

    /// Scores one query against this branch.
    pub fn place(&mut self, query: &Sequence) -> Result<Placement> {
        if query.sequence().len() != self.tree.partition.sites {
            bail!(
                "query {:?} has {} sites, reference alignment has {}",
                query.header(),
                query.sequence().len(),
                self.tree.partition.sites
            );
        }
        if !self.thorough {
            let logl = self
                .lookup
                .sum_precomputed_sitelk(self.branch_id, query.sequence())?;
            return Ok(Placement {
                branch_id: self.branch_id,
                likelihood: logl,
                lwr: 0.0,
                pendant_length: self.default_pendant,
                distal_length: 0.5 * self.original_length,
            });
        }

        let chars = self
            .tree
            .partition
            .params
            .charmap
            .encode(query.sequence())?;

        // fresh starting point for every query on this branch
        self.set_pendant(self.default_pendant)?;
        self.set_split(0.5 * self.original_length)?;

        let result = opt::optimize_pendant_placement(self, &chars)?;
        Ok(Placement {
            branch_id: self.branch_id,
            likelihood: result.logl,
            lwr: 0.0,
            pendant_length: result.pendant,
            distal_length: self.distal_length,
        })
    }
}
