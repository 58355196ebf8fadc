use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;

use epa_rs::io::binary::store_partition;
use epa_rs::io::fasta::read_fasta;
use epa_rs::model::SubstModel;
use epa_rs::opt::DEFAULT_BRANCH_LENGTH;
use epa_rs::place;
use epa_rs::progress;
use epa_rs::{Options, Tree};

#[derive(Parser, Debug)]
#[command(name = "epa")]
#[command(about = "Evolutionary placement of query sequences on a reference tree", long_about = None)]
struct Cli {
    /// Reference tree in newick format
    tree_file: PathBuf,
    /// Reference alignment in FASTA format
    ref_msa_file: PathBuf,
    /// Query sequences in FASTA format (optionally gzipped)
    query_file: PathBuf,
    /// Output directory
    outdir: PathBuf,
    /// Load the reference from a persisted binary partition instead; the
    /// tree and alignment arguments are ignored
    #[arg(short = 'b', long)]
    from_binary: Option<PathBuf>,
    /// Persist the reference partition to a binary file after startup
    #[arg(long)]
    store_binary: Option<PathBuf>,
    /// Substitution model descriptor
    #[arg(long, default_value = "JC69")]
    model: String,
    #[arg(long, default_value_t = 1.0)]
    alpha: f64,
    #[arg(long, default_value_t = 4)]
    rate_cats: usize,
    /// Queries per pipeline cycle
    #[arg(long, default_value_t = 1000)]
    chunk_size: usize,
    /// Thread-pool size; 0 uses the host default
    #[arg(long, default_value_t = 0)]
    num_threads: usize,
    /// Enable two-phase placement with candidate prescoring
    #[arg(short = 'g', long)]
    prescoring: bool,
    #[arg(long, default_value_t = 0.99)]
    prescoring_threshold: f64,
    /// Prescoring keeps the top fraction instead of an accumulated mass
    #[arg(long)]
    prescoring_by_percentage: bool,
    #[arg(long, default_value_t = 0.01)]
    support_threshold: f64,
    /// Final filter uses accumulated LWR instead of per-placement support
    #[arg(long)]
    acc_threshold: bool,
    #[arg(long, default_value_t = 1)]
    filter_min: usize,
    #[arg(long, default_value_t = 7)]
    filter_max: usize,
    /// Reoptimize reference branch lengths at startup
    #[arg(long)]
    opt_branches: bool,
    /// Reoptimize model rate parameters at startup
    #[arg(long)]
    opt_model: bool,
    /// Enable site-pattern compression in the partition
    #[arg(long)]
    repeats: bool,
    #[arg(long, default_value_t = DEFAULT_BRANCH_LENGTH)]
    default_pendant_length: f64,
    #[arg(long)]
    no_progress: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let invocation = std::env::args().collect::<Vec<_>>().join(" ");

    let options = Options {
        chunk_size: cli.chunk_size,
        num_threads: cli.num_threads,
        prescoring: cli.prescoring,
        prescoring_threshold: cli.prescoring_threshold,
        prescoring_by_percentage: cli.prescoring_by_percentage,
        support_threshold: cli.support_threshold,
        acc_threshold: cli.acc_threshold,
        filter_min: cli.filter_min,
        filter_max: cli.filter_max,
        opt_branches: cli.opt_branches,
        opt_model: cli.opt_model,
        repeats: cli.repeats,
        default_pendant_length: cli.default_pendant_length,
        progress: !cli.no_progress,
    };
    options.validate()?;

    if options.num_threads > 0 {
        rayon::ThreadPoolBuilder::new()
            .num_threads(options.num_threads)
            .build_global()
            .context("failed to size the thread pool")?;
    }

    std::fs::create_dir_all(&cli.outdir)
        .with_context(|| format!("failed to create output directory {:?}", cli.outdir))?;

    let tree = if let Some(bin_file) = &cli.from_binary {
        Tree::from_binary(bin_file)?
    } else {
        let ref_msa = if options.progress {
            let pb = progress::io_spinner("Reading reference MSA");
            let msa = read_fasta(&cli.ref_msa_file)?;
            pb.finish_with_message("Reading reference MSA done");
            msa
        } else {
            read_fasta(&cli.ref_msa_file)?
        };
        let model = SubstModel::parse(&cli.model, cli.alpha, cli.rate_cats)?;
        Tree::from_files(&cli.tree_file, &ref_msa, model, &options)?
    };

    println!(
        "Reference tree: {} tips, {} branches, total length {:.6}",
        tree.topology.nums.tip_nodes,
        tree.topology.nums.branches,
        tree.topology.sum_branch_lengths()
    );
    println!("Reference tree log-likelihood: {:.6}", tree.ref_tree_logl()?);

    if let Some(bin_file) = &cli.store_binary {
        store_partition(bin_file, &tree)?;
        println!("Binary partition written to {}", bin_file.display());
    }

    place::run(&tree, &cli.query_file, &cli.outdir, &options, &invocation)?;

    println!(
        "Output file: {}",
        cli.outdir.join("epa_result.jplace").display()
    );
    Ok(())
}
