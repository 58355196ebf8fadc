use std::cell::{Cell, RefCell};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::rc::Rc;

use anyhow::{Context, Result, anyhow, bail};
use rayon::prelude::*;

use crate::io::fasta::FastaReader;
use crate::io::{Msa, jplace};
use crate::lookup::LookupStore;
use crate::options::Options;
use crate::pipeline::make_pipeline;
use crate::progress;
use crate::sample::{
    self, Placement, Sample, Scored, SlimPlacement, compute_and_set_lwr,
    discard_bottom_x_percent, discard_by_accumulated_threshold, discard_by_support_threshold,
};
use crate::tiny::TinyTree;
use crate::tree::Tree;
use crate::work::{self, Work};

/// Scores every (branch, sequence) pair of a work set, fanning the shards out
/// across the rayon pool. Consecutive pairs on the same branch reuse one tiny
/// tree; results land in shard-local samples that are merged and collapsed at
/// the end.
pub fn place_work<T>(
    to_place: &Work,
    msa: &Msa,
    reference_tree: &Tree,
    sample: &mut Sample<T>,
    do_blo: bool,
    options: &Options,
    lookup_store: &LookupStore,
    seq_id_offset: usize,
) -> Result<()>
where
    T: From<Placement> + Scored + Copy + Send,
{
    let num_threads = rayon::current_num_threads().max(1);
    let multiplicity = if num_threads > 1 { 8 } else { 1 };
    let work_parts = work::split(to_place, num_threads * multiplicity);

    let sample_parts: Vec<Sample<T>> = work_parts
        .par_iter()
        .map(|part| -> Result<Sample<T>> {
            let mut local = Sample::new();
            let mut prev_branch_id = usize::MAX;
            let mut branch: Option<TinyTree> = None;

            for &(branch_id, seq_id) in part.iter() {
                if branch_id != prev_branch_id || branch.is_none() {
                    if branch_id >= reference_tree.branches.len() {
                        bail!("work refers to branch {branch_id} beyond the branch list");
                    }
                    branch = Some(TinyTree::new(
                        reference_tree,
                        lookup_store,
                        reference_tree.branches[branch_id],
                        branch_id,
                        do_blo,
                        options,
                    )?);
                }
                if let Some(tiny) = branch.as_mut() {
                    let seq = msa.get(seq_id)?;
                    local.add_placement(
                        seq_id_offset + seq_id,
                        seq.header(),
                        T::from(tiny.place(seq)?),
                    );
                }
                prev_branch_id = branch_id;
            }
            Ok(local)
        })
        .collect::<Result<Vec<_>>>()?;

    sample::merge(sample, sample_parts);
    sample::collapse(sample);
    Ok(())
}

struct StreamState {
    reader: FastaReader,
    chunk: Msa,
    num_sequences: usize,
    chunk_num: usize,
}

/// Streams query chunks through the placement pipeline and writes the
/// placement record. Two wirings: prescoring
/// (ingest → preplace → select → thorough → write) and direct
/// (ingest → thorough → write).
pub fn run(
    tree: &Tree,
    query_file: &Path,
    outdir: &Path,
    options: &Options,
    invocation: &str,
) -> Result<()> {
    let num_branches = tree.topology.nums.branches;
    let sites = tree.num_sites();
    let chunk_size = options.chunk_size;
    let lookups = LookupStore::new(num_branches, tree.partition.params.states)?;
    let lookups = &lookups;

    let out_path = outdir.join("epa_result.jplace");
    let state = Rc::new(RefCell::new(StreamState {
        reader: FastaReader::new(query_file)?,
        chunk: Msa::default(),
        num_sequences: 0,
        chunk_num: 0,
    }));
    let outfile: Rc<RefCell<Option<BufWriter<File>>>> = Rc::new(RefCell::new(None));
    let wrote_sample = Rc::new(Cell::new(false));
    let progress = progress::PlacementProgress::new(options.progress);

    let init_pipe = {
        let outfile = outfile.clone();
        let out_path = out_path.clone();
        let newick = tree.topology.numbered_newick();
        move || -> Result<()> {
            let file = File::create(&out_path)
                .with_context(|| format!("failed to create {out_path:?}"))?;
            let mut writer = BufWriter::new(file);
            writer.write_all(jplace::init_jplace_string(&newick).as_bytes())?;
            *outfile.borrow_mut() = Some(writer);
            Ok(())
        }
    };

    let perloop_prehook = {
        let state = state.clone();
        move || -> Result<()> {
            let mut st = state.borrow_mut();
            st.chunk = st.reader.read_next(chunk_size)?;
            st.num_sequences = st.chunk.len();
            st.chunk_num += 1;
            Ok(())
        }
    };

    let ingestion = {
        let state = state.clone();
        move || -> Result<Work> {
            let st = state.borrow();
            if st.num_sequences == 0 {
                return Ok(Work::last_marker());
            }
            for seq in st.chunk.iter() {
                if seq.sequence().len() != sites {
                    bail!(
                        "query {:?} has {} sites, reference alignment has {}",
                        seq.header(),
                        seq.sequence().len(),
                        sites
                    );
                }
            }
            Ok(Work::from_ranges(0..num_branches, 0..st.num_sequences))
        }
    };

    let preplacement = {
        let state = state.clone();
        move |work: Work| -> Result<Sample<SlimPlacement>> {
            let st = state.borrow();
            let mut result = Sample::new();
            place_work(&work, &st.chunk, tree, &mut result, false, options, lookups, 0)?;
            Ok(result)
        }
    };

    let candidate_selection = move |slim: Sample<SlimPlacement>| -> Result<Work> {
        let mut sample: Sample<Placement> = slim.into();
        compute_and_set_lwr(&mut sample);
        if options.prescoring_by_percentage {
            discard_bottom_x_percent(&mut sample, 1.0 - options.prescoring_threshold);
        } else {
            discard_by_accumulated_threshold(
                &mut sample,
                options.prescoring_threshold,
                options.filter_min,
                options.filter_max,
            );
        }
        Ok(Work::from_sample(&sample))
    };

    let thorough_placement = {
        let state = state.clone();
        move |work: Work| -> Result<Sample<Placement>> {
            let st = state.borrow();
            let seq_id_offset = st.reader.num_read() - st.num_sequences;
            let mut result = Sample::new();
            place_work(
                &work,
                &st.chunk,
                tree,
                &mut result,
                true,
                options,
                lookups,
                seq_id_offset,
            )?;
            Ok(result)
        }
    };

    let write_result = {
        let state = state.clone();
        let outfile = outfile.clone();
        let wrote_sample = wrote_sample.clone();
        let progress = progress.clone();
        move |mut sample: Sample<Placement>| -> Result<()> {
            compute_and_set_lwr(&mut sample);
            if options.acc_threshold {
                discard_by_accumulated_threshold(
                    &mut sample,
                    options.support_threshold,
                    options.filter_min,
                    options.filter_max,
                );
            } else {
                discard_by_support_threshold(
                    &mut sample,
                    options.support_threshold,
                    options.filter_min,
                    options.filter_max,
                );
            }

            if !sample.is_empty() {
                let mut out = outfile.borrow_mut();
                let writer = out
                    .as_mut()
                    .ok_or_else(|| anyhow!("placement output file was never opened"))?;
                if wrote_sample.get() {
                    writer.write_all(b",\n")?;
                }
                writer.write_all(jplace::sample_to_jplace_string(&sample)?.as_bytes())?;
                wrote_sample.set(true);
            }

            let st = state.borrow();
            progress.chunk_done(st.chunk_num, st.reader.num_read());
            Ok(())
        }
    };

    let finalize_pipe = {
        let state = state.clone();
        let outfile = outfile.clone();
        let progress = progress.clone();
        let invocation = invocation.to_string();
        move || -> Result<()> {
            let mut out = outfile.borrow_mut();
            let writer = out
                .as_mut()
                .ok_or_else(|| anyhow!("placement output file was never opened"))?;
            writer.write_all(jplace::finalize_jplace_string(&invocation).as_bytes())?;
            writer.flush()?;
            progress.finish(state.borrow().reader.num_read());
            Ok(())
        }
    };

    if options.prescoring {
        make_pipeline(ingestion, perloop_prehook, init_pipe, finalize_pipe)
            .push(preplacement)
            .push(candidate_selection)
            .push(thorough_placement)
            .push(write_result)
            .process()
    } else {
        make_pipeline(ingestion, perloop_prehook, init_pipe, finalize_pipe)
            .push(thorough_placement)
            .push(write_result)
            .process()
    }
}
