use std::sync::{Arc, Mutex};

use anyhow::{Result, anyhow, bail};

use crate::io::binary::BinaryStore;
use crate::kernel::{Edge, SCALER_NONE};

/// Payload of one resident slot: tips carry character buffers in pattern-tip
/// mode, inner slots carry dense CLVs.
#[derive(Debug, Clone)]
pub enum ClvPayload {
    Clv(Arc<Vec<f64>>),
    Tipchars(Arc<Vec<u8>>),
}

/// A resolved slot: the payload plus the co-resident scaler, if any. Holding
/// the `Arc`s keeps the buffers alive independently of later fault-ins.
#[derive(Debug, Clone)]
pub struct Resident {
    pub payload: ClvPayload,
    pub scaler: Option<Arc<Vec<u32>>>,
}

impl Resident {
    pub fn edge(&self) -> Edge<'_> {
        match &self.payload {
            ClvPayload::Clv(clv) => Edge::plain(clv, self.scaler.as_ref().map(|s| s.as_slice())),
            ClvPayload::Tipchars(chars) => Edge::tip(chars),
        }
    }
}

/// Owns the per-node CLV, tipchar and scaler buffers of the reference
/// partition. Buffers are served by index and faulted in from the binary
/// backing store on miss; one mutex per slot serializes fault-in.
pub struct ResidentSet {
    slots: Vec<Mutex<Option<ClvPayload>>>,
    scalers: Vec<Mutex<Option<Arc<Vec<u32>>>>>,
    tips: usize,
    pattern_tip: bool,
    backing: Option<Mutex<BinaryStore>>,
}

impl ResidentSet {
    pub fn new(
        tips: usize,
        inner_clvs: usize,
        pattern_tip: bool,
        backing: Option<BinaryStore>,
    ) -> Self {
        let total = tips + inner_clvs;
        Self {
            slots: (0..total).map(|_| Mutex::new(None)).collect(),
            scalers: (0..total).map(|_| Mutex::new(None)).collect(),
            tips,
            pattern_tip,
            backing: backing.map(Mutex::new),
        }
    }

    pub fn num_slots(&self) -> usize {
        self.slots.len()
    }

    pub fn tips(&self) -> usize {
        self.tips
    }

    /// Resolves a slot, faulting the payload (and scaler) in from the backing
    /// store when not resident.
    pub fn get(&self, clv_index: usize, scaler_index: usize) -> Result<Resident> {
        if clv_index >= self.slots.len() {
            bail!(
                "clv index {clv_index} out of bounds ({} slots declared)",
                self.slots.len()
            );
        }
        let payload = {
            let mut slot = self
                .slots[clv_index]
                .lock()
                .map_err(|_| anyhow!("clv slot {clv_index} mutex poisoned"))?;
            match slot.as_ref() {
                Some(p) => p.clone(),
                None => {
                    let p = self.fault_in(clv_index)?;
                    *slot = Some(p.clone());
                    p
                }
            }
        };

        let scaler = if scaler_index == SCALER_NONE {
            None
        } else {
            if scaler_index >= self.scalers.len() {
                bail!(
                    "scaler index {scaler_index} out of bounds ({} slots declared)",
                    self.scalers.len()
                );
            }
            let mut slot = self
                .scalers[scaler_index]
                .lock()
                .map_err(|_| anyhow!("scaler slot {scaler_index} mutex poisoned"))?;
            if slot.is_none() {
                let backing = self.backing.as_ref().ok_or_else(|| {
                    anyhow!("scaler {scaler_index} not resident and no backing store")
                })?;
                let mut store = backing
                    .lock()
                    .map_err(|_| anyhow!("backing store mutex poisoned"))?;
                *slot = Some(Arc::new(store.load_scaler(scaler_index)?));
            }
            slot.clone()
        };

        Ok(Resident { payload, scaler })
    }

    fn fault_in(&self, clv_index: usize) -> Result<ClvPayload> {
        let backing = self
            .backing
            .as_ref()
            .ok_or_else(|| anyhow!("clv {clv_index} not resident and no backing store"))?;
        let mut store = backing
            .lock()
            .map_err(|_| anyhow!("backing store mutex poisoned"))?;
        if self.pattern_tip && clv_index < self.tips {
            Ok(ClvPayload::Tipchars(Arc::new(
                store.load_tipchars(clv_index)?,
            )))
        } else {
            Ok(ClvPayload::Clv(Arc::new(store.load_clv(clv_index)?)))
        }
    }

    pub fn has_backing(&self) -> bool {
        self.backing.is_some()
    }

    pub fn is_resident(&self, clv_index: usize) -> bool {
        clv_index < self.slots.len()
            && self.slots[clv_index]
                .lock()
                .map(|s| s.is_some())
                .unwrap_or(false)
    }

    pub fn set_tipchars(&self, clv_index: usize, chars: Vec<u8>) -> Result<()> {
        if clv_index >= self.tips {
            bail!("tipchar index {clv_index} is not a tip slot");
        }
        let mut slot = self
            .slots[clv_index]
            .lock()
            .map_err(|_| anyhow!("clv slot {clv_index} mutex poisoned"))?;
        *slot = Some(ClvPayload::Tipchars(Arc::new(chars)));
        Ok(())
    }

    pub fn set_clv(&self, clv_index: usize, clv: Vec<f64>) -> Result<()> {
        if clv_index >= self.slots.len() {
            bail!("clv index {clv_index} out of bounds");
        }
        let mut slot = self
            .slots[clv_index]
            .lock()
            .map_err(|_| anyhow!("clv slot {clv_index} mutex poisoned"))?;
        *slot = Some(ClvPayload::Clv(Arc::new(clv)));
        Ok(())
    }

    pub fn set_scaler(&self, scaler_index: usize, scaler: Vec<u32>) -> Result<()> {
        if scaler_index >= self.scalers.len() {
            bail!("scaler index {scaler_index} out of bounds");
        }
        let mut slot = self
            .scalers[scaler_index]
            .lock()
            .map_err(|_| anyhow!("scaler slot {scaler_index} mutex poisoned"))?;
        *slot = Some(Arc::new(scaler));
        Ok(())
    }

    /// Drops every inner CLV and scaler so they recompute or fault in again.
    pub fn clear_inner(&self) {
        for slot in self.slots.iter().skip(self.tips) {
            if let Ok(mut s) = slot.lock() {
                *s = None;
            }
        }
        for slot in self.scalers.iter().skip(self.tips) {
            if let Ok(mut s) = slot.lock() {
                *s = None;
            }
        }
    }

    /// Eviction hook. The resident set currently never evicts; the hook
    /// reports the bytes a future policy would reclaim for this slot.
    pub fn evict(&self, clv_index: usize) -> usize {
        if clv_index >= self.slots.len() {
            return 0;
        }
        match self.slots[clv_index].lock() {
            Ok(slot) => match slot.as_ref() {
                Some(ClvPayload::Clv(v)) => v.len() * std::mem::size_of::<f64>(),
                Some(ClvPayload::Tipchars(v)) => v.len(),
                None => 0,
            },
            Err(_) => 0,
        }
    }
}
