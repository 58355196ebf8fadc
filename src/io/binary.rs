use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use anyhow::{Context, Result, bail};

use crate::clv::ClvPayload;
use crate::kernel::SCALER_NONE;
use crate::model::{Alphabet, SubstModel};
use crate::tree::Tree;

const MAGIC: &[u8; 4] = b"EPAB";
const VERSION: u32 = 1;

/// Shape block of the persisted partition.
#[derive(Debug, Clone)]
pub struct BinaryHeader {
    pub states: usize,
    pub sites: usize,
    pub rate_cats: usize,
    pub alpha: f64,
    pub tips: usize,
    pub inner_clvs: usize,
    pub pattern_tip: bool,
    pub subst_rates: Vec<f64>,
    pub freqs: Vec<f64>,
}

/// Read side of the binary partition format: header up front, then offset
/// tables, then one payload blob per slot. Slots load individually so the
/// resident set can fault them in on demand.
pub struct BinaryStore {
    file: File,
    header: BinaryHeader,
    newick: String,
    tip_offsets: Vec<u64>,
    clv_offsets: Vec<u64>,
    scaler_offsets: Vec<u64>,
}

impl BinaryStore {
    pub fn open(path: &Path) -> Result<Self> {
        let mut file =
            File::open(path).with_context(|| format!("failed to open binary file {path:?}"))?;
        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != MAGIC {
            bail!("{path:?} is not a binary partition file");
        }
        let version = read_u32(&mut file)?;
        if version != VERSION {
            bail!("unsupported binary partition version {version}");
        }
        let states = read_u64(&mut file)? as usize;
        let sites = read_u64(&mut file)? as usize;
        let rate_cats = read_u64(&mut file)? as usize;
        let tips = read_u64(&mut file)? as usize;
        let inner_clvs = read_u64(&mut file)? as usize;
        let pattern_tip = read_u8(&mut file)? != 0;
        let alpha = read_f64(&mut file)?;
        let subst_rates = read_f64_vec(&mut file)?;
        let freqs = read_f64_vec(&mut file)?;
        let newick_len = read_u64(&mut file)? as usize;
        let mut newick_bytes = vec![0u8; newick_len];
        file.read_exact(&mut newick_bytes)?;
        let newick = String::from_utf8(newick_bytes).context("binary newick is not UTF-8")?;

        let tip_offsets = read_u64_vec(&mut file, tips)?;
        let clv_offsets = read_u64_vec(&mut file, inner_clvs)?;
        let scaler_offsets = read_u64_vec(&mut file, inner_clvs)?;

        Ok(Self {
            file,
            header: BinaryHeader {
                states,
                sites,
                rate_cats,
                alpha,
                tips,
                inner_clvs,
                pattern_tip,
                subst_rates,
                freqs,
            },
            newick,
            tip_offsets,
            clv_offsets,
            scaler_offsets,
        })
    }

    pub fn header(&self) -> &BinaryHeader {
        &self.header
    }

    pub fn newick(&self) -> &str {
        &self.newick
    }

    pub fn subst_model(&self) -> Result<SubstModel> {
        let alphabet = Alphabet::for_states(self.header.states)?;
        Ok(SubstModel {
            name: "BINARY".to_string(),
            alphabet,
            alpha: self.header.alpha,
            rate_cats: self.header.rate_cats,
            subst_rates: self.header.subst_rates.clone(),
            base_freqs: self.header.freqs.clone(),
        })
    }

    pub fn load_clv(&mut self, clv_index: usize) -> Result<Vec<f64>> {
        if clv_index < self.header.tips {
            bail!("clv index {clv_index} addresses a tip slot");
        }
        let rel = clv_index - self.header.tips;
        let offset = *self
            .clv_offsets
            .get(rel)
            .ok_or_else(|| anyhow::anyhow!("clv index {clv_index} not in binary file"))?;
        self.file.seek(SeekFrom::Start(offset))?;
        let len = self.header.sites * self.header.rate_cats * self.header.states;
        let mut out = vec![0.0f64; len];
        for v in out.iter_mut() {
            *v = read_f64(&mut self.file)?;
        }
        Ok(out)
    }

    pub fn load_tipchars(&mut self, tip_index: usize) -> Result<Vec<u8>> {
        let offset = *self
            .tip_offsets
            .get(tip_index)
            .ok_or_else(|| anyhow::anyhow!("tip index {tip_index} not in binary file"))?;
        self.file.seek(SeekFrom::Start(offset))?;
        let mut out = vec![0u8; self.header.sites];
        self.file.read_exact(&mut out)?;
        Ok(out)
    }

    pub fn load_scaler(&mut self, scaler_index: usize) -> Result<Vec<u32>> {
        if scaler_index < self.header.tips {
            bail!("scaler index {scaler_index} addresses a tip slot");
        }
        let rel = scaler_index - self.header.tips;
        let offset = *self
            .scaler_offsets
            .get(rel)
            .ok_or_else(|| anyhow::anyhow!("scaler index {scaler_index} not in binary file"))?;
        self.file.seek(SeekFrom::Start(offset))?;
        let mut out = vec![0u32; self.header.sites];
        for v in out.iter_mut() {
            *v = read_u32(&mut self.file)?;
        }
        Ok(out)
    }
}

/// Persists the fully computed partition: header, offset tables, then every
/// tipchar, CLV and scaler slot.
pub fn store_partition(path: &Path, tree: &Tree) -> Result<()> {
    tree.recompute_clvs()?;

    let nums = tree.topology.nums;
    let tips = nums.tip_nodes;
    let inner_clvs = 3 * nums.inner_nodes;
    let params = &tree.partition.params;

    let mut file =
        File::create(path).with_context(|| format!("failed to create binary file {path:?}"))?;
    file.write_all(MAGIC)?;
    write_u32(&mut file, VERSION)?;
    write_u64(&mut file, params.states as u64)?;
    write_u64(&mut file, tree.partition.sites as u64)?;
    write_u64(&mut file, params.rate_cats as u64)?;
    write_u64(&mut file, tips as u64)?;
    write_u64(&mut file, inner_clvs as u64)?;
    write_u8(&mut file, 1)?;
    write_f64(&mut file, tree.model.alpha)?;
    write_f64_vec(&mut file, &tree.model.subst_rates)?;
    write_f64_vec(&mut file, &tree.model.base_freqs)?;
    let newick = tree.topology.numbered_newick();
    write_u64(&mut file, newick.len() as u64)?;
    file.write_all(newick.as_bytes())?;

    // placeholder offset tables, patched after the payloads are laid down
    let table_pos = file.stream_position()?;
    for _ in 0..(tips + 2 * inner_clvs) {
        write_u64(&mut file, 0)?;
    }

    let mut tip_offsets = vec![0u64; tips];
    let mut clv_offsets = vec![0u64; inner_clvs];
    let mut scaler_offsets = vec![0u64; inner_clvs];

    for i in 0..tips {
        tip_offsets[i] = file.stream_position()?;
        match tree.residents().get(i, SCALER_NONE)?.payload {
            ClvPayload::Tipchars(chars) => file.write_all(&chars)?,
            ClvPayload::Clv(_) => bail!("tip slot {i} holds a dense CLV, expected characters"),
        }
    }
    for rel in 0..inner_clvs {
        let idx = tips + rel;
        let resident = tree.residents().get(idx, idx)?;
        clv_offsets[rel] = file.stream_position()?;
        match &resident.payload {
            ClvPayload::Clv(clv) => {
                for v in clv.iter() {
                    write_f64(&mut file, *v)?;
                }
            }
            ClvPayload::Tipchars(_) => bail!("inner slot {idx} holds tip characters"),
        }
        scaler_offsets[rel] = file.stream_position()?;
        let scaler = resident
            .scaler
            .ok_or_else(|| anyhow::anyhow!("inner slot {idx} has no scaler"))?;
        for v in scaler.iter() {
            write_u32(&mut file, *v)?;
        }
    }

    file.seek(SeekFrom::Start(table_pos))?;
    for v in tip_offsets
        .iter()
        .chain(clv_offsets.iter())
        .chain(scaler_offsets.iter())
    {
        write_u64(&mut file, *v)?;
    }
    file.flush()?;
    Ok(())
}

fn read_u8(r: &mut impl Read) -> Result<u8> {
    let mut b = [0u8; 1];
    r.read_exact(&mut b)?;
    Ok(b[0])
}

fn read_u32(r: &mut impl Read) -> Result<u32> {
    let mut b = [0u8; 4];
    r.read_exact(&mut b)?;
    Ok(u32::from_le_bytes(b))
}

fn read_u64(r: &mut impl Read) -> Result<u64> {
    let mut b = [0u8; 8];
    r.read_exact(&mut b)?;
    Ok(u64::from_le_bytes(b))
}

fn read_f64(r: &mut impl Read) -> Result<f64> {
    let mut b = [0u8; 8];
    r.read_exact(&mut b)?;
    Ok(f64::from_le_bytes(b))
}

fn read_f64_vec(r: &mut impl Read) -> Result<Vec<f64>> {
    let n = read_u64(r)? as usize;
    let mut out = Vec::with_capacity(n);
    for _ in 0..n {
        out.push(read_f64(r)?);
    }
    Ok(out)
}

fn read_u64_vec(r: &mut impl Read, n: usize) -> Result<Vec<u64>> {
    let mut out = Vec::with_capacity(n);
    for _ in 0..n {
        out.push(read_u64(r)?);
    }
    Ok(out)
}

fn write_u8(w: &mut impl Write, v: u8) -> Result<()> {
    w.write_all(&[v])?;
    Ok(())
}

fn write_u32(w: &mut impl Write, v: u32) -> Result<()> {
    w.write_all(&v.to_le_bytes())?;
    Ok(())
}

fn write_u64(w: &mut impl Write, v: u64) -> Result<()> {
    w.write_all(&v.to_le_bytes())?;
    Ok(())
}

fn write_f64(w: &mut impl Write, v: f64) -> Result<()> {
    w.write_all(&v.to_le_bytes())?;
    Ok(())
}

fn write_f64_vec(w: &mut impl Write, vals: &[f64]) -> Result<()> {
    write_u64(w, vals.len() as u64)?;
    for v in vals {
        write_f64(w, *v)?;
    }
    Ok(())
}
