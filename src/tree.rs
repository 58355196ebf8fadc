use anyhow::{Context, Result, bail};

use crate::clv::{Resident, ResidentSet};
use crate::io::binary::BinaryStore;
use crate::io::{Msa, newick};
use crate::kernel::{self, Partition};
use crate::model::{ModelParams, SubstModel};
use crate::options::Options;

/// Sentinel for "no half-edge" (`next` of a tip).
pub const NONE: usize = usize::MAX;

/// One directed half of an undirected branch. Inner nodes are rings of three
/// half-edges linked through `next`; `twin` crosses the branch.
#[derive(Debug, Clone)]
pub struct HalfEdge {
    pub twin: usize,
    pub next: usize,
    pub clv_index: usize,
    pub scaler_index: usize,
    pub pmatrix_index: usize,
    pub length: f64,
    pub label: Option<String>,
}

impl HalfEdge {
    pub fn is_tip(&self) -> bool {
        self.next == NONE
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TreeNumbers {
    pub tip_nodes: usize,
    pub inner_nodes: usize,
    pub branches: usize,
    pub nodes: usize,
}

impl TreeNumbers {
    pub fn new(tips: usize) -> Self {
        Self {
            tip_nodes: tips,
            inner_nodes: tips - 2,
            branches: 2 * tips - 3,
            nodes: 2 * tips - 2,
        }
    }
}

/// Unrooted binary reference topology held as a half-edge arena.
#[derive(Debug, Clone)]
pub struct Topology {
    pub edges: Vec<HalfEdge>,
    pub root: usize,
    pub nums: TreeNumbers,
}

impl Topology {
    #[inline]
    pub fn next(&self, h: usize) -> usize {
        self.edges[h].next
    }

    #[inline]
    pub fn twin(&self, h: usize) -> usize {
        self.edges[h].twin
    }

    /// One half-edge per undirected branch, postorder over the three subtrees
    /// hanging off the canonical root ring. The returned position is the
    /// branch_id used everywhere.
    pub fn query_branches(&self) -> Result<Vec<usize>> {
        fn rec(topo: &Topology, h: usize, out: &mut Vec<usize>) {
            if !topo.edges[h].is_tip() {
                rec(topo, topo.twin(topo.next(h)), out);
                rec(topo, topo.twin(topo.next(topo.next(h))), out);
            }
            out.push(h);
        }
        let mut out = Vec::with_capacity(self.nums.branches);
        let r = self.root;
        rec(self, self.twin(r), &mut out);
        rec(self, self.twin(self.next(r)), &mut out);
        rec(self, self.twin(self.next(self.next(r))), &mut out);
        if out.len() != self.nums.branches {
            bail!(
                "traversal found {} branches but the tree declares {}",
                out.len(),
                self.nums.branches
            );
        }
        Ok(out)
    }

    /// Sets `pmatrix_index` on both halves of every branch to its branch_id.
    pub fn assign_pmatrix_indices(&mut self) -> Result<Vec<usize>> {
        let branches = self.query_branches()?;
        for (i, &h) in branches.iter().enumerate() {
            let t = self.edges[h].twin;
            self.edges[h].pmatrix_index = i;
            self.edges[t].pmatrix_index = i;
        }
        Ok(branches)
    }

    /// Newick string with `{branch_id}` annotations, emitted by the same
    /// depth-first traversal that numbers the branches.
    pub fn numbered_newick(&self) -> String {
        fn rec(topo: &Topology, h: usize, out: &mut String, index: &mut usize) {
            let e = &topo.edges[h];
            if e.is_tip() {
                out.push_str(e.label.as_deref().unwrap_or(""));
            } else {
                out.push('(');
                rec(topo, topo.twin(topo.next(h)), out, index);
                out.push(',');
                rec(topo, topo.twin(topo.next(topo.next(h))), out, index);
                out.push(')');
            }
            out.push_str(&format!(":{}{{{}}}", e.length, *index));
            *index += 1;
        }
        let mut out = String::new();
        let mut index = 0usize;
        let r = self.root;
        out.push('(');
        rec(self, self.twin(r), &mut out, &mut index);
        out.push(',');
        rec(self, self.twin(self.next(r)), &mut out, &mut index);
        out.push(',');
        rec(self, self.twin(self.next(self.next(r))), &mut out, &mut index);
        out.push_str(");");
        out
    }

    pub fn tip_half_edges(&self) -> Vec<usize> {
        (0..self.edges.len())
            .filter(|&h| self.edges[h].is_tip())
            .collect()
    }

    pub fn sum_branch_lengths(&self) -> f64 {
        self.edges.iter().map(|e| e.length).sum::<f64>() / 2.0
    }

    pub fn set_all_branch_lengths(&mut self, length: f64) {
        for e in self.edges.iter_mut() {
            e.length = length;
        }
    }

    pub fn set_branch_length(&mut self, half_edge: usize, length: f64) {
        let t = self.edges[half_edge].twin;
        self.edges[half_edge].length = length;
        self.edges[t].length = length;
    }
}

/// The reference tree bundle: topology, substitution model, numerical
/// partition, branch list, and the CLV resident set.
pub struct Tree {
    pub topology: Topology,
    pub model: SubstModel,
    pub partition: Partition,
    pub branches: Vec<usize>,
    residents: ResidentSet,
}

impl Tree {
    pub fn from_files(
        tree_file: &std::path::Path,
        ref_msa: &Msa,
        model: SubstModel,
        options: &Options,
    ) -> Result<Self> {
        let text = std::fs::read_to_string(tree_file)
            .with_context(|| format!("failed to read tree file {tree_file:?}"))?;
        let mut topology = newick::parse_newick(&text)?;
        let branches = topology.assign_pmatrix_indices()?;

        let params = ModelParams::build(&model)?;
        let sites = ref_msa.num_sites();
        if sites == 0 {
            bail!("reference MSA is empty");
        }
        let nums = topology.nums;
        let partition = Partition::new(params, sites, nums.branches);
        let residents = ResidentSet::new(
            nums.tip_nodes,
            3 * nums.inner_nodes,
            true,
            None,
        );

        let mut tree = Self {
            topology,
            model,
            partition,
            branches,
            residents,
        };
        tree.link_msa(ref_msa)?;
        tree.update_all_pmatrices()?;
        tree.recompute_clvs()?;

        if options.opt_branches || options.opt_model {
            crate::opt::optimize_reference(&mut tree, ref_msa, options)?;
        }
        Ok(tree)
    }

    /// Rebuilds the bundle from a persisted binary partition. CLVs and
    /// tipchars stay on disk and fault in on first use.
    pub fn from_binary(bin_file: &std::path::Path) -> Result<Self> {
        let store = BinaryStore::open(bin_file)?;
        let header = store.header().clone();
        let model = store.subst_model()?;
        let mut topology = newick::parse_newick(store.newick())?;
        let branches = topology.assign_pmatrix_indices()?;
        let nums = topology.nums;
        if nums.tip_nodes != header.tips {
            bail!(
                "binary partition declares {} tips but its tree has {}",
                header.tips,
                nums.tip_nodes
            );
        }
        let params = ModelParams::build(&model)?;
        let partition = Partition::new(params, header.sites, nums.branches);
        let residents = ResidentSet::new(
            header.tips,
            header.inner_clvs,
            header.pattern_tip,
            Some(store),
        );
        let mut tree = Self {
            topology,
            model,
            partition,
            branches,
            residents,
        };
        tree.update_all_pmatrices()?;
        Ok(tree)
    }

    pub fn residents(&self) -> &ResidentSet {
        &self.residents
    }

    pub fn num_sites(&self) -> usize {
        self.partition.sites
    }

    /// Resolves the CLV (or tipchar) buffer behind a half-edge, faulting it
    /// in from the backing store if necessary.
    pub fn get_clv(&self, half_edge: usize) -> Result<Resident> {
        let e = &self.topology.edges[half_edge];
        self.residents.get(e.clv_index, e.scaler_index)
    }

    fn link_msa(&mut self, ref_msa: &Msa) -> Result<()> {
        let charmap = &self.partition.params.charmap;
        for h in self.topology.tip_half_edges() {
            let e = &self.topology.edges[h];
            let label = e.label.as_deref().unwrap_or("");
            let seq = ref_msa.find(label).with_context(|| {
                format!("tip label {label:?} not found in the reference MSA")
            })?;
            let chars = charmap
                .encode(seq.sequence())
                .with_context(|| format!("bad character in reference sequence {label:?}"))?;
            self.residents.set_tipchars(e.clv_index, chars)?;
        }
        Ok(())
    }

    pub fn update_all_pmatrices(&mut self) -> Result<()> {
        let mut indices = Vec::with_capacity(self.branches.len());
        let mut lengths = Vec::with_capacity(self.branches.len());
        for &h in &self.branches {
            let e = &self.topology.edges[h];
            indices.push(e.pmatrix_index);
            lengths.push(e.length);
        }
        self.partition.update_prob_matrices(&indices, &lengths)
    }

    /// Drops all inner CLVs and recomputes them bottom-up for every oriented
    /// half-edge.
    pub fn recompute_clvs(&self) -> Result<()> {
        self.residents.clear_inner();
        for h in 0..self.topology.edges.len() {
            if !self.topology.edges[h].is_tip() {
                self.ensure_clv(h)?;
            }
        }
        Ok(())
    }

    fn ensure_clv(&self, h: usize) -> Result<()> {
        let e = &self.topology.edges[h];
        if e.is_tip() || self.residents.is_resident(e.clv_index) {
            return Ok(());
        }
        if self.residents.has_backing() {
            // fault in from the persisted partition instead of recomputing
            self.residents.get(e.clv_index, e.scaler_index)?;
            return Ok(());
        }
        let c1 = self.topology.twin(self.topology.next(h));
        let c2 = self.topology.twin(self.topology.next(self.topology.next(h)));
        self.ensure_clv(c1)?;
        self.ensure_clv(c2)?;

        let r1 = self.get_clv(c1)?;
        let r2 = self.get_clv(c2)?;
        let params = &self.partition.params;
        let mut clv = vec![0.0f64; kernel::clv_len(params, self.partition.sites)];
        let mut scaler = vec![0u32; self.partition.sites];
        kernel::update_partial(
            params,
            &mut clv,
            &mut scaler,
            r1.edge(),
            self.partition.pmatrix(self.topology.edges[c1].pmatrix_index)?,
            r2.edge(),
            self.partition.pmatrix(self.topology.edges[c2].pmatrix_index)?,
        )?;
        self.residents.set_clv(e.clv_index, clv)?;
        self.residents.set_scaler(e.scaler_index, scaler)?;
        Ok(())
    }

    /// Log-likelihood of the reference alignment on the reference tree,
    /// evaluated across the canonical root branch.
    pub fn ref_tree_logl(&self) -> Result<f64> {
        let r = self.topology.root;
        let t = self.topology.twin(r);
        self.ensure_clv(r)?;
        self.ensure_clv(t)?;
        let a = self.get_clv(r)?;
        let b = self.get_clv(t)?;
        kernel::edge_loglikelihood(
            &self.partition.params,
            a.edge(),
            b.edge(),
            self.partition.pmatrix(self.topology.edges[r].pmatrix_index)?,
            None,
        )
    }
}
