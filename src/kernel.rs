use anyhow::{Result, bail};

use crate::model::ModelParams;

pub const SCALER_NONE: usize = usize::MAX;

const SCALE_THRESHOLD: f64 = 1e-240;
const SCALE_FACTOR: f64 = 1e240;

/// A conditional likelihood endpoint: either a dense per-site-per-rate-per-state
/// buffer, or a tip character buffer expanded through the model's state profiles.
#[derive(Clone, Copy)]
pub enum ClvView<'a> {
    Plain(&'a [f64]),
    Tip(&'a [u8]),
}

/// One endpoint of an edge computation: the CLV plus its optional per-site
/// scaler counts.
#[derive(Clone, Copy)]
pub struct Edge<'a> {
    pub clv: ClvView<'a>,
    pub scaler: Option<&'a [u32]>,
}

impl<'a> Edge<'a> {
    pub fn plain(clv: &'a [f64], scaler: Option<&'a [u32]>) -> Self {
        Self {
            clv: ClvView::Plain(clv),
            scaler,
        }
    }

    pub fn tip(chars: &'a [u8]) -> Self {
        Self {
            clv: ClvView::Tip(chars),
            scaler: None,
        }
    }

    #[inline]
    fn states<'b>(&'b self, params: &'b ModelParams, site: usize, rate: usize) -> &'b [f64] {
        match self.clv {
            ClvView::Plain(clv) => {
                let off = (site * params.rate_cats + rate) * params.states;
                &clv[off..off + params.states]
            }
            ClvView::Tip(chars) => params.tip_profile(chars[site] as usize),
        }
    }

    #[inline]
    fn scale_count(&self, site: usize) -> u32 {
        self.scaler.map_or(0, |s| s[site])
    }

    fn site_count(&self, params: &ModelParams) -> usize {
        match self.clv {
            ClvView::Plain(clv) => clv.len() / (params.rate_cats * params.states),
            ClvView::Tip(chars) => chars.len(),
        }
    }
}

pub fn clv_len(params: &ModelParams, sites: usize) -> usize {
    sites * params.rate_cats * params.states
}

/// Log-likelihood of the data on both sides of an edge, integrated over the
/// edge's probability matrices. Optionally records per-site log-likelihoods.
pub fn edge_loglikelihood(
    params: &ModelParams,
    a: Edge,
    b: Edge,
    pmatrix: &[f64],
    mut persite: Option<&mut [f64]>,
) -> Result<f64> {
    let states = params.states;
    let sites = a.site_count(params);
    if b.site_count(params) != sites {
        bail!("edge endpoints disagree on site count");
    }
    let ln_scale = SCALE_THRESHOLD.ln();
    let cat_weight = 1.0 / params.rate_cats as f64;

    let mut total = 0.0;
    for site in 0..sites {
        let mut site_l = 0.0;
        for r in 0..params.rate_cats {
            let pm = &pmatrix[r * states * states..(r + 1) * states * states];
            let av = a.states(params, site, r);
            let bv = b.states(params, site, r);
            for i in 0..states {
                let ai = params.freqs[i] * av[i];
                if ai == 0.0 {
                    continue;
                }
                let row = &pm[i * states..(i + 1) * states];
                let mut inner = 0.0;
                for j in 0..states {
                    inner += row[j] * bv[j];
                }
                site_l += ai * inner;
            }
        }
        site_l *= cat_weight;
        let counts = (a.scale_count(site) + b.scale_count(site)) as f64;
        let logl = site_l.ln() + counts * ln_scale;
        if !logl.is_finite() {
            bail!("kernel error: non-finite site log-likelihood at site {site}");
        }
        if let Some(buf) = persite.as_deref_mut() {
            buf[site] = logl;
        }
        total += logl;
    }
    Ok(total)
}

/// Rebuilds the rate-category transition matrices for one branch length from
/// the model eigendecomposition.
pub fn update_pmatrix(params: &ModelParams, pmatrix: &mut [f64], t: f64) -> Result<()> {
    if !t.is_finite() || t < 0.0 {
        bail!("kernel error: invalid branch length {t}");
    }
    let states = params.states;
    let mut expd = vec![0.0f64; states];
    for r in 0..params.rate_cats {
        let rt = params.rates[r] * t;
        for (k, e) in expd.iter_mut().enumerate() {
            *e = (params.eigenvals[k] * rt).exp();
        }
        let pm = &mut pmatrix[r * states * states..(r + 1) * states * states];
        for i in 0..states {
            for j in 0..states {
                let mut v = 0.0;
                for k in 0..states {
                    v += params.eigenvecs[i * states + k]
                        * expd[k]
                        * params.inv_eigenvecs[k * states + j];
                }
                pm[i * states + j] = v.max(0.0);
            }
        }
    }
    Ok(())
}

/// Computes an inner CLV from its two children through their probability
/// matrices, accumulating child scaler counts and scaling on underflow.
pub fn update_partial(
    params: &ModelParams,
    parent_clv: &mut [f64],
    parent_scaler: &mut [u32],
    child1: Edge,
    pmatrix1: &[f64],
    child2: Edge,
    pmatrix2: &[f64],
) -> Result<()> {
    let states = params.states;
    let sites = child1.site_count(params);
    if child2.site_count(params) != sites {
        bail!("partial update children disagree on site count");
    }
    if parent_clv.len() != clv_len(params, sites) || parent_scaler.len() != sites {
        bail!("partial update output buffers have wrong shape");
    }

    for site in 0..sites {
        let mut site_max = 0.0f64;
        for r in 0..params.rate_cats {
            let pm1 = &pmatrix1[r * states * states..(r + 1) * states * states];
            let pm2 = &pmatrix2[r * states * states..(r + 1) * states * states];
            let c1 = child1.states(params, site, r);
            let c2 = child2.states(params, site, r);
            let out =
                &mut parent_clv[(site * params.rate_cats + r) * states..][..states];
            for i in 0..states {
                let row1 = &pm1[i * states..(i + 1) * states];
                let row2 = &pm2[i * states..(i + 1) * states];
                let mut x1 = 0.0;
                let mut x2 = 0.0;
                for j in 0..states {
                    x1 += row1[j] * c1[j];
                    x2 += row2[j] * c2[j];
                }
                let v = x1 * x2;
                out[i] = v;
                site_max = site_max.max(v);
            }
        }
        let mut count = child1.scale_count(site) + child2.scale_count(site);
        if site_max < SCALE_THRESHOLD {
            if site_max == 0.0 {
                bail!("kernel error: zero partial likelihood at site {site}");
            }
            for r in 0..params.rate_cats {
                let out =
                    &mut parent_clv[(site * params.rate_cats + r) * states..][..states];
                for v in out.iter_mut() {
                    *v *= SCALE_FACTOR;
                }
            }
            count += 1;
        }
        parent_scaler[site] = count;
    }
    Ok(())
}

/// Per-site spectral coefficients of an edge likelihood, caching everything
/// that does not depend on the branch length. With the sumtable in hand the
/// likelihood and its first two derivatives in the length are analytic sums.
pub struct Sumtable {
    data: Vec<f64>,
    sites: usize,
    scale_ln: f64,
}

pub fn update_sumtable(params: &ModelParams, a: Edge, b: Edge) -> Result<Sumtable> {
    let states = params.states;
    let sites = a.site_count(params);
    if b.site_count(params) != sites {
        bail!("sumtable endpoints disagree on site count");
    }
    let mut data = vec![0.0f64; sites * params.rate_cats * states];
    let mut total_counts = 0u64;
    for site in 0..sites {
        total_counts += (a.scale_count(site) + b.scale_count(site)) as u64;
        for r in 0..params.rate_cats {
            let av = a.states(params, site, r);
            let bv = b.states(params, site, r);
            let out = &mut data[(site * params.rate_cats + r) * states..][..states];
            for k in 0..states {
                let mut left = 0.0;
                let mut right = 0.0;
                for i in 0..states {
                    left += params.freqs[i] * av[i] * params.eigenvecs[i * states + k];
                    right += params.inv_eigenvecs[k * states + i] * bv[i];
                }
                out[k] = left * right;
            }
        }
    }
    Ok(Sumtable {
        data,
        sites,
        scale_ln: total_counts as f64 * SCALE_THRESHOLD.ln(),
    })
}

impl Sumtable {
    /// Returns (logl, d logl / dt, d^2 logl / dt^2) at branch length `t`.
    pub fn derivatives(&self, params: &ModelParams, t: f64) -> Result<(f64, f64, f64)> {
        let states = params.states;
        let cat_weight = 1.0 / params.rate_cats as f64;
        let mut logl = self.scale_ln;
        let mut d1 = 0.0;
        let mut d2 = 0.0;
        for site in 0..self.sites {
            let mut l = 0.0;
            let mut dl = 0.0;
            let mut ddl = 0.0;
            for r in 0..params.rate_cats {
                let rate = params.rates[r];
                let row = &self.data[(site * params.rate_cats + r) * states..][..states];
                for k in 0..states {
                    let lr = params.eigenvals[k] * rate;
                    let term = row[k] * (lr * t).exp();
                    l += term;
                    dl += lr * term;
                    ddl += lr * lr * term;
                }
            }
            l *= cat_weight;
            dl *= cat_weight;
            ddl *= cat_weight;
            if !(l > 0.0) || !l.is_finite() {
                bail!("kernel error: non-positive site likelihood in derivative at site {site}");
            }
            logl += l.ln();
            d1 += dl / l;
            d2 += (ddl * l - dl * dl) / (l * l);
        }
        Ok((logl, d1, d2))
    }
}

/// The numerical state bundle for the reference tree: model parameters plus
/// one probability-matrix slot per branch. CLV and scaler buffers live in the
/// resident set.
#[derive(Debug, Clone)]
pub struct Partition {
    pub params: ModelParams,
    pub sites: usize,
    pmatrices: Vec<Vec<f64>>,
}

impl Partition {
    pub fn new(params: ModelParams, sites: usize, num_pmatrices: usize) -> Self {
        let len = params.rate_cats * params.states * params.states;
        Self {
            params,
            sites,
            pmatrices: vec![vec![0.0; len]; num_pmatrices],
        }
    }

    pub fn num_pmatrices(&self) -> usize {
        self.pmatrices.len()
    }

    pub fn pmatrix(&self, index: usize) -> Result<&[f64]> {
        if index >= self.pmatrices.len() {
            bail!("pmatrix index {index} out of bounds");
        }
        Ok(&self.pmatrices[index])
    }

    pub fn update_prob_matrices(&mut self, indices: &[usize], lengths: &[f64]) -> Result<()> {
        if indices.len() != lengths.len() {
            bail!("pmatrix index and length lists differ in size");
        }
        for (&idx, &len) in indices.iter().zip(lengths.iter()) {
            if idx >= self.pmatrices.len() {
                bail!("pmatrix index {idx} out of bounds");
            }
            update_pmatrix(&self.params, &mut self.pmatrices[idx], len)?;
        }
        Ok(())
    }
}
