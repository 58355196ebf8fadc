use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use epa_rs::io::{Msa, Sequence};
use epa_rs::lookup::LookupStore;
use epa_rs::place::place_work;
use epa_rs::sample::{Placement, Sample, compute_and_set_lwr};
use epa_rs::tiny::TinyTree;
use epa_rs::work::Work;
use epa_rs::{Options, Tree};

const REF_A: &str = "ACGTACGTACGTACGTACGTACGTACGTACGT";
const REF_B: &str = "TGCAACGTACGTACGTTGCAACGTACGTACGT";
const REF_C: &str = "ACGTTGCAACGTACGTACGTTGCAACGTTGCA";

fn unique_temp_path(prefix: &str, ext: &str) -> PathBuf {
    let mut path = std::env::temp_dir();
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system time is before unix epoch")
        .as_nanos();
    path.push(format!("{prefix}_{}_{}.{}", std::process::id(), nanos, ext));
    path
}

fn three_taxon_tree_with(seq_a: &str, seq_b: &str, seq_c: &str) -> Tree {
    let tree_path = unique_temp_path("epa_scenario_tree", "nwk");
    fs::write(&tree_path, "((A:0.1,B:0.1):0.1,C:0.2);").expect("failed to write tree");
    let msa = Msa::from_sequences(vec![
        Sequence::new("A".into(), seq_a.into()),
        Sequence::new("B".into(), seq_b.into()),
        Sequence::new("C".into(), seq_c.into()),
    ])
    .expect("bad reference MSA");
    let model = epa_rs::model::SubstModel::parse("JC69", 1.0, 4).expect("bad model");
    let tree =
        Tree::from_files(&tree_path, &msa, model, &Options::default()).expect("tree build failed");
    let _ = fs::remove_file(tree_path);
    tree
}

fn three_taxon_tree() -> Tree {
    three_taxon_tree_with(REF_A, REF_B, REF_C)
}

fn revcomp(seq: &str) -> String {
    seq.bytes()
        .rev()
        .map(|c| match c {
            b'A' => 'T',
            b'C' => 'G',
            b'G' => 'C',
            b'T' => 'A',
            other => other as char,
        })
        .collect()
}

fn tip_branch_id(tree: &Tree, label: &str) -> usize {
    (0..tree.branches.len())
        .find(|&i| {
            let h = tree.branches[i];
            let e = &tree.topology.edges[h];
            let t = &tree.topology.edges[tree.topology.twin(h)];
            e.label.as_deref() == Some(label) || t.label.as_deref() == Some(label)
        })
        .expect("tip branch not found")
}

fn place_all(tree: &Tree, queries: Msa, thorough: bool) -> Sample<Placement> {
    let lookup = LookupStore::new(tree.branches.len(), 4).expect("lookup store");
    let work = Work::from_ranges(0..tree.branches.len(), 0..queries.len());
    let mut sample: Sample<Placement> = Sample::new();
    place_work(
        &work,
        &queries,
        tree,
        &mut sample,
        thorough,
        &Options::default(),
        &lookup,
        0,
    )
    .expect("placement failed");
    compute_and_set_lwr(&mut sample);
    sample
}

#[test]
fn identical_query_places_on_its_own_pendant_branch() {
    let tree = three_taxon_tree();
    let queries = Msa::from_sequences(vec![Sequence::new("query".into(), REF_A.into())]).unwrap();
    let sample = place_all(&tree, queries, true);

    let pq = sample.iter().next().expect("query missing from sample");
    let best = pq
        .placements
        .iter()
        .max_by(|a, b| a.lwr.total_cmp(&b.lwr))
        .unwrap();
    assert_eq!(best.branch_id, tip_branch_id(&tree, "A"));
    assert!(
        best.pendant_length < 0.05,
        "identical query should attach with a short pendant, got {}",
        best.pendant_length
    );
    assert!(best.lwr > 0.9, "expected confident placement, lwr={}", best.lwr);
}

#[test]
fn each_reference_tip_recovers_itself() {
    let tree = three_taxon_tree();
    for (label, seq) in [("A", REF_A), ("B", REF_B), ("C", REF_C)] {
        let queries =
            Msa::from_sequences(vec![Sequence::new(label.to_string(), seq.into())]).unwrap();
        let sample = place_all(&tree, queries, true);
        let pq = sample.iter().next().unwrap();
        let best = pq
            .placements
            .iter()
            .max_by(|a, b| a.lwr.total_cmp(&b.lwr))
            .unwrap();
        assert_eq!(
            best.branch_id,
            tip_branch_id(&tree, label),
            "query {label} placed on the wrong branch"
        );
    }
}

#[test]
fn reverse_complement_query_shifts_off_its_tip_with_low_confidence() {
    // strand-asymmetric reference, so the reverse complement of A resembles
    // no tip and in particular no longer fits A's pendant branch
    let seq_a = "AAACAAACAAACAAACAAACAAACAAACAAAC";
    let seq_b = "TTTGTTTGAAACAAACAAACAAACAAACAAAC";
    let seq_c = "AAACAAACTTTGTTTGTTTGAAACAAACAAAC";
    let tree = three_taxon_tree_with(seq_a, seq_b, seq_c);

    let control = Msa::from_sequences(vec![Sequence::new("fwd".into(), seq_a.into())]).unwrap();
    let sample = place_all(&tree, control, true);
    let best = sample
        .iter()
        .next()
        .unwrap()
        .placements
        .iter()
        .max_by(|a, b| a.lwr.total_cmp(&b.lwr))
        .unwrap()
        .clone();
    assert_eq!(best.branch_id, tip_branch_id(&tree, "A"));
    assert!(best.lwr > 0.9);

    let queries =
        Msa::from_sequences(vec![Sequence::new("rc".into(), revcomp(seq_a))]).unwrap();
    let sample = place_all(&tree, queries, true);
    let pq = sample.iter().next().unwrap();
    for p in &pq.placements {
        assert!(
            p.lwr < 0.5,
            "reverse-complement query must not place confidently, lwr={}",
            p.lwr
        );
    }
}

#[test]
fn fully_ambiguous_query_spreads_weight_evenly() {
    let tree = three_taxon_tree();
    let queries =
        Msa::from_sequences(vec![Sequence::new("alln".into(), "N".repeat(32))]).unwrap();
    let sample = place_all(&tree, queries, true);
    let pq = sample.iter().next().unwrap();
    assert_eq!(pq.placements.len(), 3);
    for p in &pq.placements {
        assert!(
            (p.lwr - 1.0 / 3.0).abs() < 0.05,
            "all-N query should be indifferent, lwr={}",
            p.lwr
        );
        assert!(p.lwr < 0.5);
    }
}

#[test]
fn invalid_query_character_is_rejected() {
    let tree = three_taxon_tree();
    let mut bad = REF_A.to_string();
    bad.replace_range(3..4, "J");
    let queries = Msa::from_sequences(vec![Sequence::new("bad".into(), bad)]).unwrap();

    let lookup = LookupStore::new(tree.branches.len(), 4).unwrap();
    let work = Work::from_ranges(0..tree.branches.len(), 0..1);
    let mut sample: Sample<Placement> = Sample::new();
    let err = place_work(
        &work,
        &queries,
        &tree,
        &mut sample,
        true,
        &Options::default(),
        &lookup,
        0,
    )
    .expect_err("invalid character must fail placement");
    assert!(err.to_string().contains("invalid character"));
}

#[test]
fn lookup_sum_matches_fresh_pendant_edge_likelihood() {
    let tree = three_taxon_tree();
    let options = Options::default();
    let lookup = LookupStore::new(tree.branches.len(), 4).unwrap();

    for branch_id in 0..tree.branches.len() {
        let half_edge = tree.branches[branch_id];
        // prescoring construction populates the branch table
        let _pre = TinyTree::new(&tree, &lookup, half_edge, branch_id, false, &options).unwrap();
        assert!(lookup.has_branch(branch_id));

        for query in [REF_A, REF_B, REF_C, "NNNNACGTACGTACGTACGTACGTACGTACGT"] {
            let summed = lookup.sum_precomputed_sitelk(branch_id, query).unwrap();
            let tiny =
                TinyTree::new(&tree, &lookup, half_edge, branch_id, true, &options).unwrap();
            let chars = tree.partition.params.charmap.encode(query).unwrap();
            let fresh = tiny.pendant_edge_logl(&chars).unwrap();
            assert!(
                (summed - fresh).abs() < 1e-9,
                "branch {branch_id}: lookup sum {summed} != fresh {fresh}"
            );
        }
    }
}

#[test]
fn thorough_placement_never_scores_below_the_midpoint_start() {
    let tree = three_taxon_tree();
    let options = Options::default();
    let lookup = LookupStore::new(tree.branches.len(), 4).unwrap();
    let query = Sequence::new("q".into(), REF_B.into());
    let chars = tree.partition.params.charmap.encode(query.sequence()).unwrap();

    for branch_id in 0..tree.branches.len() {
        let half_edge = tree.branches[branch_id];
        let mut tiny =
            TinyTree::new(&tree, &lookup, half_edge, branch_id, true, &options).unwrap();
        let midpoint_logl = tiny.pendant_edge_logl(&chars).unwrap();
        let placement = tiny.place(&query).unwrap();
        assert!(
            placement.likelihood >= midpoint_logl - 1e-6,
            "branch {branch_id}: optimised {} below start {}",
            placement.likelihood,
            midpoint_logl
        );
    }
}

#[test]
fn repeated_thorough_placement_is_deterministic() {
    let tree = three_taxon_tree();
    let options = Options::default();
    let lookup = LookupStore::new(tree.branches.len(), 4).unwrap();
    let query = Sequence::new("q".into(), REF_C.into());
    let branch_id = 1;
    let mut tiny =
        TinyTree::new(&tree, &lookup, tree.branches[branch_id], branch_id, true, &options)
            .unwrap();
    let first = tiny.place(&query).unwrap();
    let second = tiny.place(&query).unwrap();
    assert_eq!(first.likelihood, second.likelihood);
    assert_eq!(first.pendant_length, second.pendant_length);
    assert_eq!(first.distal_length, second.distal_length);
}

#[test]
fn scores_are_invariant_across_thread_counts() {
    let tree = three_taxon_tree();
    let queries = Msa::from_sequences(vec![
        Sequence::new("q0".into(), REF_A.into()),
        Sequence::new("q1".into(), REF_B.into()),
        Sequence::new("q2".into(), REF_C.into()),
        Sequence::new("q3".into(), "N".repeat(32)),
    ])
    .unwrap();

    let mut by_threads: Vec<HashMap<(usize, usize), f64>> = Vec::new();
    for threads in [1usize, 4, 8] {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build()
            .expect("failed to build pool");
        let sample = pool.install(|| place_all(&tree, queries.clone(), true));
        let mut scores = HashMap::new();
        for pq in sample.iter() {
            for p in &pq.placements {
                scores.insert((pq.sequence_id, p.branch_id), p.likelihood);
            }
        }
        by_threads.push(scores);
    }

    let base = &by_threads[0];
    for other in &by_threads[1..] {
        assert_eq!(base.len(), other.len());
        for (key, logl) in base {
            let got = other.get(key).expect("missing (sequence, branch) pair");
            assert!(
                (logl - got).abs() < 1e-10,
                "scores differ across thread counts for {key:?}: {logl} vs {got}"
            );
        }
    }
}
