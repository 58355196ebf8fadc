use anyhow::{Context, Result, bail};
use flate2::read::GzDecoder;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use super::{Msa, Sequence};

fn open_reader(path: &Path) -> Result<Box<dyn BufRead>> {
    let file = File::open(path).with_context(|| format!("failed to open {:?}", path))?;
    if path.extension().map(|e| e == "gz").unwrap_or(false) {
        Ok(Box::new(BufReader::new(GzDecoder::new(file))))
    } else {
        Ok(Box::new(BufReader::new(file)))
    }
}

/// Reads a whole FASTA file as one alignment block.
pub fn read_fasta(path: &Path) -> Result<Msa> {
    let mut reader = FastaReader::new(path)?;
    let msa = reader.read_next(usize::MAX)?;
    if msa.is_empty() {
        bail!("no sequences found in {:?}", path);
    }
    Ok(msa)
}

/// Streams sequences from a FASTA file (plain or gzipped) in chunks, for one
/// pipeline cycle each.
pub struct FastaReader {
    reader: Box<dyn BufRead>,
    pending_header: Option<String>,
    num_read: usize,
}

impl FastaReader {
    pub fn new(path: &Path) -> Result<Self> {
        let mut reader = open_reader(path)?;
        let mut pending_header = None;
        let mut line = String::new();
        loop {
            line.clear();
            if reader.read_line(&mut line)? == 0 {
                break;
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match trimmed.strip_prefix('>') {
                Some(h) => {
                    pending_header = Some(h.trim().to_string());
                    break;
                }
                None => bail!("expected FASTA header in {:?}, found {:?}", path, trimmed),
            }
        }
        Ok(Self {
            reader,
            pending_header,
            num_read: 0,
        })
    }

    /// Total sequences handed out so far.
    pub fn num_read(&self) -> usize {
        self.num_read
    }

    /// Reads up to `max` sequences; an empty result signals end of stream.
    pub fn read_next(&mut self, max: usize) -> Result<Msa> {
        let mut sequences = Vec::new();
        let mut line = String::new();
        while sequences.len() < max {
            let Some(header) = self.pending_header.take() else {
                break;
            };
            let mut seq = String::new();
            loop {
                line.clear();
                if self.reader.read_line(&mut line)? == 0 {
                    break;
                }
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                if let Some(h) = trimmed.strip_prefix('>') {
                    self.pending_header = Some(h.trim().to_string());
                    break;
                }
                seq.push_str(trimmed);
            }
            if seq.is_empty() {
                bail!("sequence {header:?} is empty");
            }
            sequences.push(Sequence::new(header, seq));
        }
        self.num_read += sequences.len();
        Msa::from_sequences(sequences)
    }
}
