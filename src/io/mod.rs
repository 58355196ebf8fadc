pub mod binary;
pub mod fasta;
pub mod jplace;
pub mod newick;

use anyhow::{Result, bail};

/// One aligned sequence: FASTA header plus residues.
#[derive(Debug, Clone, Default)]
pub struct Sequence {
    header: String,
    sequence: String,
}

impl Sequence {
    pub fn new(header: String, sequence: String) -> Self {
        Self { header, sequence }
    }

    pub fn header(&self) -> &str {
        &self.header
    }

    pub fn sequence(&self) -> &str {
        &self.sequence
    }
}

/// A dense alignment block: sequence_id is the position, all sequences share
/// one length.
#[derive(Debug, Clone, Default)]
pub struct Msa {
    sequences: Vec<Sequence>,
    num_sites: usize,
}

impl Msa {
    pub fn from_sequences(sequences: Vec<Sequence>) -> Result<Self> {
        let num_sites = sequences.first().map_or(0, |s| s.sequence.len());
        for (i, s) in sequences.iter().enumerate() {
            if s.sequence.len() != num_sites {
                bail!(
                    "sequence {} ({:?}) has length {}, expected {}",
                    i,
                    s.header,
                    s.sequence.len(),
                    num_sites
                );
            }
        }
        Ok(Self {
            sequences,
            num_sites,
        })
    }

    pub fn num_sites(&self) -> usize {
        self.num_sites
    }

    pub fn len(&self) -> usize {
        self.sequences.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sequences.is_empty()
    }

    pub fn get(&self, sequence_id: usize) -> Result<&Sequence> {
        self.sequences.get(sequence_id).ok_or_else(|| {
            anyhow::anyhow!(
                "sequence id {sequence_id} out of bounds for chunk of {}",
                self.sequences.len()
            )
        })
    }

    /// Finds a sequence whose header's first whitespace-delimited token
    /// matches `label`.
    pub fn find(&self, label: &str) -> Option<&Sequence> {
        self.sequences
            .iter()
            .find(|s| s.header.split_whitespace().next() == Some(label))
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Sequence> {
        self.sequences.iter()
    }
}
