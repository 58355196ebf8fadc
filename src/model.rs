use anyhow::{Result, bail};

use crate::utils::gamma_quantile;

pub const INVALID: usize = usize::MAX;

const NT_MAP: &[u8] = b"ACGTRYSWKMBDHVN-";
const NT_MASKS: [u32; 16] = [
    0b0001, 0b0010, 0b0100, 0b1000, // A C G T
    0b0101, 0b1010, 0b0110, 0b1001, // R Y S W
    0b1100, 0b0011, 0b1110, 0b1101, // K M B D
    0b1011, 0b0111, 0b1111, 0b1111, // H V N -
];

const AA_MAP: &[u8] = b"ARNDCQEGHILKMFPSTWYVBZX-";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Alphabet {
    Dna,
    AminoAcid,
}

impl Alphabet {
    pub fn states(self) -> usize {
        match self {
            Alphabet::Dna => 4,
            Alphabet::AminoAcid => 20,
        }
    }

    pub fn for_states(states: usize) -> Result<Self> {
        match states {
            4 => Ok(Alphabet::Dna),
            20 => Ok(Alphabet::AminoAcid),
            _ => bail!("unsupported state count {states}, expected 4 or 20"),
        }
    }

    pub fn map(self) -> &'static [u8] {
        match self {
            Alphabet::Dna => NT_MAP,
            Alphabet::AminoAcid => AA_MAP,
        }
    }

    fn mask(self, map_index: usize) -> u32 {
        match self {
            Alphabet::Dna => NT_MASKS[map_index],
            Alphabet::AminoAcid => match AA_MAP[map_index] {
                b'B' => (1 << 2) | (1 << 3), // N or D
                b'Z' => (1 << 5) | (1 << 6), // Q or E
                b'X' | b'-' => (1 << 20) - 1,
                _ => 1 << map_index,
            },
        }
    }
}

/// Maps sequence characters to alphabet indices and state profiles. The
/// reverse table aliases lower and upper case; unmapped ASCII codes carry the
/// INVALID sentinel.
#[derive(Debug, Clone)]
pub struct CharMap {
    alphabet: Alphabet,
    reverse: [usize; 128],
}

impl CharMap {
    pub fn new(alphabet: Alphabet) -> Self {
        let mut reverse = [INVALID; 128];
        for (i, &c) in alphabet.map().iter().enumerate() {
            reverse[c as usize] = i;
            reverse[c.to_ascii_lowercase() as usize] = i;
        }
        if alphabet == Alphabet::Dna {
            // U aliases T
            reverse[b'U' as usize] = reverse[b'T' as usize];
            reverse[b'u' as usize] = reverse[b'T' as usize];
        }
        Self { alphabet, reverse }
    }

    pub fn alphabet(&self) -> Alphabet {
        self.alphabet
    }

    pub fn size(&self) -> usize {
        self.alphabet.map().len()
    }

    pub fn index(&self, c: u8) -> Result<usize> {
        let pos = if (c as usize) < 128 {
            self.reverse[c as usize]
        } else {
            INVALID
        };
        if pos == INVALID {
            bail!("invalid character in sequence: {:?}", c as char);
        }
        Ok(pos)
    }

    /// Encodes a sequence into alphabet indices.
    pub fn encode(&self, seq: &str) -> Result<Vec<u8>> {
        seq.bytes().map(|c| self.index(c).map(|i| i as u8)).collect()
    }
}

/// Substitution model descriptor: everything needed to derive the numerical
/// parameters, in the form the user states it.
#[derive(Debug, Clone)]
pub struct SubstModel {
    pub name: String,
    pub alphabet: Alphabet,
    pub alpha: f64,
    pub rate_cats: usize,
    pub subst_rates: Vec<f64>,
    pub base_freqs: Vec<f64>,
}

impl SubstModel {
    pub fn parse(descriptor: &str, alpha: f64, rate_cats: usize) -> Result<Self> {
        if alpha <= 0.0 {
            bail!("configuration error: alpha must be > 0, got {alpha}");
        }
        if rate_cats == 0 {
            bail!("configuration error: rate_cats must be > 0");
        }
        let name = descriptor.trim().to_ascii_uppercase();
        let (alphabet, subst_rates) = match name.as_str() {
            "JC69" | "GTR" => (Alphabet::Dna, vec![1.0; 6]),
            "HKY" => {
                // transition/transversion 4:1; order AC AG AT CG CT GT
                (Alphabet::Dna, vec![1.0, 4.0, 1.0, 1.0, 4.0, 1.0])
            }
            "PROTGTR" => (Alphabet::AminoAcid, vec![1.0; 190]),
            _ => bail!("unknown model descriptor: {descriptor}"),
        };
        let states = alphabet.states();
        Ok(Self {
            name,
            alphabet,
            alpha,
            rate_cats,
            subst_rates,
            base_freqs: vec![1.0 / states as f64; states],
        })
    }

    pub fn set_frequencies(&mut self, freqs: &[f64]) -> Result<()> {
        let states = self.alphabet.states();
        if freqs.len() != states {
            bail!(
                "frequency vector length {} does not match state count {}",
                freqs.len(),
                states
            );
        }
        let total: f64 = freqs.iter().sum();
        if total <= 0.0 || freqs.iter().any(|f| *f < 0.0) {
            bail!("frequencies must be non-negative with positive sum");
        }
        // floor unseen states so the sqrt-frequency symmetrization stays finite
        let floored: Vec<f64> = freqs.iter().map(|f| (f / total).max(1e-8)).collect();
        let refloor: f64 = floored.iter().sum();
        self.base_freqs = floored.into_iter().map(|f| f / refloor).collect();
        Ok(())
    }
}

/// Derived numerical parameters: eigendecomposition of the normalized rate
/// matrix, discrete-gamma category rates, and tip state profiles.
#[derive(Debug, Clone)]
pub struct ModelParams {
    pub states: usize,
    pub rate_cats: usize,
    pub rates: Vec<f64>,
    pub freqs: Vec<f64>,
    pub eigenvals: Vec<f64>,
    pub eigenvecs: Vec<f64>,     // U, row-major, columns are eigenvectors
    pub inv_eigenvecs: Vec<f64>, // U^-1
    pub charmap: CharMap,
    tip_profiles: Vec<f64>, // map_size x states
}

impl ModelParams {
    pub fn build(model: &SubstModel) -> Result<Self> {
        let states = model.alphabet.states();
        let expected = states * (states - 1) / 2;
        if model.subst_rates.len() != expected {
            bail!(
                "substitution rate count {} does not match {} for {} states",
                model.subst_rates.len(),
                expected,
                states
            );
        }
        let freqs = model.base_freqs.clone();

        // assemble Q with stationary frequencies, normalize the expected rate to 1
        let mut q = vec![0.0f64; states * states];
        let mut r = 0usize;
        for i in 0..states {
            for j in (i + 1)..states {
                q[i * states + j] = model.subst_rates[r] * freqs[j];
                q[j * states + i] = model.subst_rates[r] * freqs[i];
                r += 1;
            }
        }
        for i in 0..states {
            let row_sum: f64 = (0..states).filter(|j| *j != i).map(|j| q[i * states + j]).sum();
            q[i * states + i] = -row_sum;
        }
        let scale: f64 = -(0..states).map(|i| freqs[i] * q[i * states + i]).sum::<f64>();
        if scale <= 0.0 || !scale.is_finite() {
            bail!("degenerate rate matrix: normalization scale {scale}");
        }
        for v in q.iter_mut() {
            *v /= scale;
        }

        // symmetrize with sqrt(pi), eigendecompose, transform back
        let sqrt_pi: Vec<f64> = freqs.iter().map(|f| f.sqrt()).collect();
        let mut b = vec![0.0f64; states * states];
        for i in 0..states {
            for j in 0..states {
                b[i * states + j] = q[i * states + j] * sqrt_pi[i] / sqrt_pi[j];
            }
        }
        let (eigenvals, v) = jacobi_eigen(&mut b, states)?;
        let mut eigenvecs = vec![0.0f64; states * states];
        let mut inv_eigenvecs = vec![0.0f64; states * states];
        for i in 0..states {
            for k in 0..states {
                eigenvecs[i * states + k] = v[i * states + k] / sqrt_pi[i];
                inv_eigenvecs[k * states + i] = v[i * states + k] * sqrt_pi[i];
            }
        }

        let rates = gamma_category_rates(model.alpha, model.rate_cats);

        let charmap = CharMap::new(model.alphabet);
        let map_size = charmap.size();
        let mut tip_profiles = vec![0.0f64; map_size * states];
        for m in 0..map_size {
            let mask = model.alphabet.mask(m);
            for s in 0..states {
                if mask & (1 << s) != 0 {
                    tip_profiles[m * states + s] = 1.0;
                }
            }
        }

        Ok(Self {
            states,
            rate_cats: model.rate_cats,
            rates,
            freqs,
            eigenvals,
            eigenvecs,
            inv_eigenvecs,
            charmap,
            tip_profiles,
        })
    }

    #[inline]
    pub fn tip_profile(&self, map_index: usize) -> &[f64] {
        &self.tip_profiles[map_index * self.states..(map_index + 1) * self.states]
    }
}

/// Discrete-gamma category rates (median rule), normalized to mean 1.
fn gamma_category_rates(alpha: f64, cats: usize) -> Vec<f64> {
    if cats == 1 {
        return vec![1.0];
    }
    let mut rates: Vec<f64> = (0..cats)
        .map(|k| gamma_quantile((2 * k + 1) as f64 / (2 * cats) as f64, alpha, alpha))
        .collect();
    let mean = rates.iter().sum::<f64>() / cats as f64;
    for r in rates.iter_mut() {
        *r /= mean;
    }
    rates
}

/// Cyclic Jacobi eigendecomposition of a symmetric matrix. Destroys `a`,
/// returns eigenvalues and the accumulated rotation matrix (columns are
/// eigenvectors), both row-major.
fn jacobi_eigen(a: &mut [f64], n: usize) -> Result<(Vec<f64>, Vec<f64>)> {
    let mut v = vec![0.0f64; n * n];
    for i in 0..n {
        v[i * n + i] = 1.0;
    }
    for _sweep in 0..100 {
        let mut off = 0.0;
        for i in 0..n {
            for j in (i + 1)..n {
                off += a[i * n + j] * a[i * n + j];
            }
        }
        if off < 1e-30 {
            let evals = (0..n).map(|i| a[i * n + i]).collect();
            return Ok((evals, v));
        }
        for p in 0..n {
            for q in (p + 1)..n {
                let apq = a[p * n + q];
                if apq.abs() < 1e-300 {
                    continue;
                }
                let theta = (a[q * n + q] - a[p * n + p]) / (2.0 * apq);
                let t = theta.signum() / (theta.abs() + (theta * theta + 1.0).sqrt());
                let c = 1.0 / (t * t + 1.0).sqrt();
                let s = t * c;
                for k in 0..n {
                    let akp = a[k * n + p];
                    let akq = a[k * n + q];
                    a[k * n + p] = c * akp - s * akq;
                    a[k * n + q] = s * akp + c * akq;
                }
                for k in 0..n {
                    let apk = a[p * n + k];
                    let aqk = a[q * n + k];
                    a[p * n + k] = c * apk - s * aqk;
                    a[q * n + k] = s * apk + c * aqk;
                }
                for k in 0..n {
                    let vkp = v[k * n + p];
                    let vkq = v[k * n + q];
                    v[k * n + p] = c * vkp - s * vkq;
                    v[k * n + q] = s * vkp + c * vkq;
                }
            }
        }
    }
    bail!("jacobi eigendecomposition did not converge")
}
