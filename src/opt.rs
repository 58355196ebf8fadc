use anyhow::{Result, bail};
use rand::rngs::SmallRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::io::Msa;
use crate::kernel::update_sumtable;
use crate::model::ModelParams;
use crate::options::Options;
use crate::tiny::TinyTree;
use crate::tree::Tree;

pub const MIN_BRANCH_LEN: f64 = 1e-6;
pub const MAX_BRANCH_LEN: f64 = 100.0;
pub const DEFAULT_BRANCH_LENGTH: f64 = 0.1;
pub const TOL_BRANCH_LEN: f64 = 1e-4;
pub const OPT_EPSILON: f64 = 0.01;

const GOLD: f64 = 0.381_966_011_250_105_1;

/// One-dimensional Brent minimisation on [xmin, xmax].
pub fn minimize_brent(
    xmin: f64,
    xguess: f64,
    xmax: f64,
    xtol: f64,
    f: &mut dyn FnMut(f64) -> Result<f64>,
) -> Result<(f64, f64)> {
    if !(xmin < xmax) {
        bail!("brent bracket [{xmin}, {xmax}] is empty");
    }
    let (mut a, mut b) = (xmin, xmax);
    let mut x = xguess.clamp(a, b);
    let mut w = x;
    let mut v = x;
    let mut fx = f(x)?;
    let mut fw = fx;
    let mut fv = fx;
    let mut d = 0.0f64;
    let mut e = 0.0f64;

    for _ in 0..100 {
        let m = 0.5 * (a + b);
        let tol1 = xtol * x.abs() + 1e-12;
        let tol2 = 2.0 * tol1;
        if (x - m).abs() <= tol2 - 0.5 * (b - a) {
            break;
        }
        let mut use_golden = true;
        if e.abs() > tol1 {
            // parabolic fit through x, w, v
            let r = (x - w) * (fx - fv);
            let mut q = (x - v) * (fx - fw);
            let mut p = (x - v) * q - (x - w) * r;
            q = 2.0 * (q - r);
            if q > 0.0 {
                p = -p;
            }
            q = q.abs();
            let etemp = e;
            e = d;
            if p.abs() < (0.5 * q * etemp).abs() && p > q * (a - x) && p < q * (b - x) {
                d = p / q;
                let u = x + d;
                if u - a < tol2 || b - u < tol2 {
                    d = if m > x { tol1 } else { -tol1 };
                }
                use_golden = false;
            }
        }
        if use_golden {
            e = if x < m { b - x } else { a - x };
            d = GOLD * e;
        }
        let u = if d.abs() >= tol1 {
            x + d
        } else if d > 0.0 {
            x + tol1
        } else {
            x - tol1
        };
        let fu = f(u)?;
        if fu <= fx {
            if u < x {
                b = x;
            } else {
                a = x;
            }
            v = w;
            fv = fw;
            w = x;
            fw = fx;
            x = u;
            fx = fu;
        } else {
            if u < x {
                a = u;
            } else {
                b = u;
            }
            if fu <= fw || w == x {
                v = w;
                fv = fw;
                w = u;
                fw = fu;
            } else if fu <= fv || v == x || v == w {
                v = u;
                fv = fu;
            }
        }
    }
    Ok((x, fx))
}

/// Safeguarded 1-D Newton–Raphson on the derivative of the objective.
/// `deriv` returns (f', f'') of the function being minimised.
pub fn minimize_newton(
    xmin: f64,
    xguess: f64,
    xmax: f64,
    tol: f64,
    max_iter: usize,
    deriv: &mut dyn FnMut(f64) -> Result<(f64, f64)>,
) -> Result<f64> {
    let mut x = xguess.clamp(xmin, xmax);
    for _ in 0..max_iter {
        let (df, ddf) = deriv(x)?;
        if !df.is_finite() || !ddf.is_finite() {
            bail!("kernel error: non-finite derivative in newton step at x={x}");
        }
        if df.abs() < tol {
            break;
        }
        let new_x = if ddf > 0.0 {
            let cand = x - df / ddf;
            if cand > xmin && cand < xmax {
                cand
            } else if df > 0.0 {
                0.5 * (x + xmin)
            } else {
                0.5 * (x + xmax)
            }
        } else if df > 0.0 {
            // wrong curvature, halve toward the descending boundary
            0.5 * (x + xmin)
        } else {
            0.5 * (x + xmax)
        };
        let step = (new_x - x).abs();
        x = new_x;
        if step < tol {
            break;
        }
    }
    Ok(x)
}

#[derive(Debug, Clone, Copy)]
pub struct PendantPlacement {
    pub logl: f64,
    pub proximal: f64,
    pub pendant: f64,
}

/// Monotonicity guard for the placement optimiser, in the negative
/// log-likelihood convention: a candidate is worse when the objective rose by
/// more than a relative epsilon, with the absolute value keeping the
/// comparison sign-safe on both sides of zero.
pub fn worse_than_previous(new_nll: f64, old_nll: f64) -> bool {
    new_nll - old_nll > new_nll.abs() * 1e-14
}

/// Branch-length optimisation for one query on one branch: slide the
/// insertion point along the reference branch with Brent, then Newton on the
/// pendant length, iterated until convergence or a non-improving step (which
/// restores the previous lengths).
pub fn optimize_pendant_placement(tiny: &mut TinyTree, query: &[u8]) -> Result<PendantPlacement> {
    let original_length = tiny.original_length();
    let mut smoothings = 32u32;

    // negative log-likelihood convention throughout
    let mut nll = -tiny.pendant_edge_logl(query)?;

    while smoothings > 0 {
        let old_proximal = tiny.proximal_length();
        let old_pendant = tiny.pendant_length();

        let xmax = original_length.max(MIN_BRANCH_LEN * 2.0);
        let mut xguess = tiny.proximal_length();
        if xguess < MIN_BRANCH_LEN || xguess > xmax {
            xguess = DEFAULT_BRANCH_LENGTH.min(0.5 * xmax);
        }
        let (xres, _) = minimize_brent(MIN_BRANCH_LEN, xguess, xmax, TOL_BRANCH_LEN, &mut |x| {
            tiny.set_split(x)?;
            Ok(-tiny.pendant_edge_logl(query)?)
        })?;
        tiny.set_split(xres)?;

        let sumtable = tiny.pendant_sumtable(query)?;
        let params = tiny.params().clone();
        let mut pguess = tiny.pendant_length();
        if pguess < MIN_BRANCH_LEN || pguess > MAX_BRANCH_LEN {
            pguess = DEFAULT_BRANCH_LENGTH;
        }
        let pres = minimize_newton(
            MIN_BRANCH_LEN,
            pguess,
            MAX_BRANCH_LEN,
            TOL_BRANCH_LEN,
            10,
            &mut |x| {
                let (_, d1, d2) = sumtable.derivatives(&params, x)?;
                Ok((-d1, -d2))
            },
        )?;
        tiny.set_pendant(pres)?;

        let new_nll = -tiny.pendant_edge_logl(query)?;

        // worse than the previous iteration: restore and stop
        if worse_than_previous(new_nll, nll) {
            tiny.set_split(old_proximal)?;
            tiny.set_pendant(old_pendant)?;
            break;
        }

        smoothings -= 1;
        if (new_nll - nll).abs() < TOL_BRANCH_LEN {
            nll = new_nll;
            break;
        }
        nll = new_nll;
    }

    Ok(PendantPlacement {
        logl: -nll,
        proximal: tiny.proximal_length(),
        pendant: tiny.pendant_length(),
    })
}

/// Startup reoptimisation of the reference tree: empirical base frequencies,
/// optional branch-length smoothing rounds, optional gamma-alpha search,
/// iterated until the reference log-likelihood stops improving.
pub fn optimize_reference(tree: &mut Tree, ref_msa: &Msa, options: &Options) -> Result<()> {
    if !options.opt_branches && !options.opt_model {
        return Ok(());
    }

    let freqs = empirical_frequencies(ref_msa, &tree.partition.params)?;
    tree.model.set_frequencies(&freqs)?;
    rebuild_params(tree)?;

    if options.opt_branches {
        tree.topology.set_all_branch_lengths(DEFAULT_BRANCH_LENGTH);
        tree.update_all_pmatrices()?;
        tree.recompute_clvs()?;
    }

    let mut cur = tree.ref_tree_logl()?;
    let mut rng = SmallRng::seed_from_u64(0x5eed);

    for _round in 0..10 {
        let prev = cur;

        if options.opt_model {
            let guess = tree.model.alpha;
            let (best_alpha, _) = minimize_brent(0.02, guess, 100.0, 1e-2, &mut |a| {
                tree.model.alpha = a;
                rebuild_params(tree)?;
                Ok(-tree.ref_tree_logl()?)
            })?;
            tree.model.alpha = best_alpha;
            rebuild_params(tree)?;
        }

        if options.opt_branches {
            smooth_branch_lengths(tree, &mut rng)?;
        }

        cur = tree.ref_tree_logl()?;
        if (cur - prev).abs() < OPT_EPSILON {
            break;
        }
    }
    Ok(())
}

fn rebuild_params(tree: &mut Tree) -> Result<()> {
    tree.partition.params = ModelParams::build(&tree.model)?;
    tree.update_all_pmatrices()?;
    tree.recompute_clvs()?;
    Ok(())
}

/// One smoothing round: Newton on every branch length in shuffled order
/// against the current CLVs, then a full CLV refresh.
fn smooth_branch_lengths(tree: &mut Tree, rng: &mut SmallRng) -> Result<()> {
    let mut order: Vec<usize> = (0..tree.branches.len()).collect();
    order.shuffle(rng);
    for b in order {
        let h = tree.branches[b];
        let t = tree.topology.twin(h);
        let a = tree.get_clv(h)?;
        let c = tree.get_clv(t)?;
        let sumtable = update_sumtable(&tree.partition.params, a.edge(), c.edge())?;
        let params = tree.partition.params.clone();
        let guess = tree.topology.edges[h].length;
        let xres = minimize_newton(
            MIN_BRANCH_LEN,
            guess,
            MAX_BRANCH_LEN,
            TOL_BRANCH_LEN,
            10,
            &mut |x| {
                let (_, d1, d2) = sumtable.derivatives(&params, x)?;
                Ok((-d1, -d2))
            },
        )?;
        tree.topology.set_branch_length(h, xres);
    }
    tree.update_all_pmatrices()?;
    tree.recompute_clvs()?;
    Ok(())
}

fn empirical_frequencies(msa: &Msa, params: &ModelParams) -> Result<Vec<f64>> {
    let states = params.states;
    let mut counts = vec![0.0f64; states];
    for seq in msa.iter() {
        for &c in seq.sequence().as_bytes() {
            let idx = params.charmap.index(c)?;
            let profile = params.tip_profile(idx);
            let total: f64 = profile.iter().sum();
            for s in 0..states {
                counts[s] += profile[s] / total;
            }
        }
    }
    let total: f64 = counts.iter().sum();
    if total <= 0.0 {
        bail!("reference MSA has no usable characters for empirical frequencies");
    }
    Ok(counts.into_iter().map(|c| c / total).collect())
}
