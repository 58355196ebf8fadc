use std::fs;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;

use epa_rs::io::{Msa, Sequence, fasta::read_fasta};
use epa_rs::model::SubstModel;
use epa_rs::place;
use epa_rs::{Options, Tree};

const TREE: &str = "((A:0.1,B:0.2):0.1,(C:0.15,D:0.1):0.2,(E:0.1,F:0.12):0.15);";
const BASE: &str = "ACGTACGTACGTACGTACGTACGTACGTACGTACGTACGTACGTACGT";
const LABELS: [&str; 6] = ["A", "B", "C", "D", "E", "F"];

fn unique_temp_path(prefix: &str, ext: &str) -> PathBuf {
    let mut path = std::env::temp_dir();
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system time is before unix epoch")
        .as_nanos();
    path.push(format!("{prefix}_{}_{}.{}", std::process::id(), nanos, ext));
    path
}

fn complement_block(base: &str, start: usize, len: usize) -> String {
    base.bytes()
        .enumerate()
        .map(|(i, c)| {
            if i >= start && i < start + len {
                match c {
                    b'A' => 'T',
                    b'C' => 'G',
                    b'G' => 'C',
                    b'T' => 'A',
                    other => other as char,
                }
            } else {
                c as char
            }
        })
        .collect()
}

fn tip_sequence(tip: usize) -> String {
    complement_block(BASE, tip * 8, 8)
}

fn six_taxon_fixture() -> (Tree, PathBuf) {
    let tree_path = unique_temp_path("epa_pipeline_tree", "nwk");
    fs::write(&tree_path, TREE).expect("failed to write tree");
    let msa = Msa::from_sequences(
        LABELS
            .iter()
            .enumerate()
            .map(|(i, l)| Sequence::new(l.to_string(), tip_sequence(i)))
            .collect(),
    )
    .expect("bad reference MSA");
    let model = SubstModel::parse("JC69", 1.0, 4).expect("bad model");
    let tree =
        Tree::from_files(&tree_path, &msa, model, &Options::default()).expect("tree build failed");
    let _ = fs::remove_file(&tree_path);

    let query_path = unique_temp_path("epa_pipeline_queries", "fasta");
    let mut fasta = String::new();
    for (i, l) in LABELS.iter().enumerate() {
        fasta.push_str(&format!(">query_{l}\n{}\n", tip_sequence(i)));
    }
    fs::write(&query_path, fasta).expect("failed to write queries");
    (tree, query_path)
}

/// Extracts the `{n}` edge number following `label:` in the jplace tree
/// string.
fn edge_num_of_tip(tree_string: &str, label: &str) -> usize {
    let needle = format!("{label}:");
    let at = tree_string.find(&needle).expect("tip missing in tree string");
    let rest = &tree_string[at..];
    let open = rest.find('{').expect("no edge annotation");
    let close = rest.find('}').expect("unterminated edge annotation");
    rest[open + 1..close].parse().expect("bad edge number")
}

fn run_and_parse(options: &Options, query_path: &PathBuf, tree: &Tree) -> Value {
    let outdir = unique_temp_path("epa_pipeline_out", "d");
    fs::create_dir_all(&outdir).expect("failed to create outdir");
    place::run(tree, query_path, &outdir, options, "integration-test").expect("pipeline failed");
    let text =
        fs::read_to_string(outdir.join("epa_result.jplace")).expect("missing jplace output");
    let parsed: Value = serde_json::from_str(&text).expect("output is not valid JSON");
    let _ = fs::remove_dir_all(outdir);
    parsed
}

fn check_each_query_hits_its_tip(result: &Value) {
    let tree_string = result["tree"].as_str().expect("tree field missing");
    let placements = result["placements"].as_array().expect("placements missing");
    assert_eq!(placements.len(), LABELS.len());

    for entry in placements {
        let name = entry["n"][0].as_str().expect("query name missing");
        let label = name.strip_prefix("query_").expect("unexpected query name");
        let expected_edge = edge_num_of_tip(tree_string, label);
        let best = &entry["p"][0];
        let edge = best[0].as_u64().expect("edge num not an integer") as usize;
        assert_eq!(
            edge, expected_edge,
            "query {name} placed on edge {edge}, expected {expected_edge}"
        );
        let lwr = best[2].as_f64().expect("lwr missing");
        assert!(lwr > 0.5, "query {name}: weak placement lwr={lwr}");
    }
}

#[test]
fn direct_pipeline_places_every_query_on_its_tip() {
    let (tree, query_path) = six_taxon_fixture();
    let options = Options {
        chunk_size: 4, // six queries across two cycles
        progress: false,
        ..Options::default()
    };
    let result = run_and_parse(&options, &query_path, &tree);
    check_each_query_hits_its_tip(&result);

    assert_eq!(result["version"], 3);
    let fields: Vec<&str> = result["fields"]
        .as_array()
        .expect("fields missing")
        .iter()
        .map(|f| f.as_str().expect("field not a string"))
        .collect();
    assert_eq!(
        fields,
        [
            "edge_num",
            "likelihood",
            "like_weight_ratio",
            "distal_length",
            "pendant_length"
        ]
    );
    assert_eq!(result["metadata"]["invocation"], "integration-test");
    let _ = fs::remove_file(query_path);
}

#[test]
fn chunk_size_ten_with_ninety_five_queries_writes_every_entry() {
    let (tree, small_query_path) = six_taxon_fixture();
    let _ = fs::remove_file(small_query_path);

    // 95 queries over chunks of 10: nine full cycles plus a final chunk of 5
    let query_path = unique_temp_path("epa_pipeline_queries95", "fasta");
    let mut fasta = String::new();
    for i in 0..95 {
        fasta.push_str(&format!(">q{i}\n{}\n", tip_sequence(i % LABELS.len())));
    }
    fs::write(&query_path, fasta).expect("failed to write queries");

    let options = Options {
        chunk_size: 10,
        progress: false,
        ..Options::default()
    };
    let result = run_and_parse(&options, &query_path, &tree);
    let placements = result["placements"].as_array().expect("placements missing");
    assert_eq!(placements.len(), 95, "one record per query across all chunks");

    let mut names: Vec<&str> = placements
        .iter()
        .map(|e| e["n"][0].as_str().expect("query name missing"))
        .collect();
    names.sort_unstable();
    names.dedup();
    assert_eq!(names.len(), 95, "every query appears exactly once");
    for i in 0..95 {
        let name = format!("q{i}");
        assert!(
            names.binary_search(&name.as_str()).is_ok(),
            "query {name} missing from the record"
        );
    }

    let _ = fs::remove_file(query_path);
}

#[test]
fn prescoring_pipeline_matches_direct_top_placements() {
    let (tree, query_path) = six_taxon_fixture();
    let options = Options {
        chunk_size: 4,
        prescoring: true,
        prescoring_threshold: 0.99,
        progress: false,
        ..Options::default()
    };
    let result = run_and_parse(&options, &query_path, &tree);
    check_each_query_hits_its_tip(&result);
    let _ = fs::remove_file(query_path);
}

#[test]
fn prescoring_by_percentage_still_recovers_tips() {
    let (tree, query_path) = six_taxon_fixture();
    let options = Options {
        chunk_size: 6,
        prescoring: true,
        prescoring_threshold: 0.5, // keep the top half of candidate branches
        prescoring_by_percentage: true,
        progress: false,
        ..Options::default()
    };
    let result = run_and_parse(&options, &query_path, &tree);
    check_each_query_hits_its_tip(&result);
    let _ = fs::remove_file(query_path);
}

#[test]
fn gzipped_queries_stream_like_plain_ones() {
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::io::Write;

    let (tree, query_path) = six_taxon_fixture();
    let gz_path = unique_temp_path("epa_pipeline_queries", "fasta.gz");
    let plain = fs::read(&query_path).expect("failed to read plain queries");
    let mut enc = GzEncoder::new(
        fs::File::create(&gz_path).expect("failed to create gz"),
        Compression::default(),
    );
    enc.write_all(&plain).expect("failed to compress");
    enc.finish().expect("failed to finish gz");

    let msa = read_fasta(&gz_path).expect("failed to read gz fasta");
    assert_eq!(msa.len(), LABELS.len());

    let options = Options {
        chunk_size: 3,
        progress: false,
        ..Options::default()
    };
    let result = run_and_parse(&options, &gz_path, &tree);
    check_each_query_hits_its_tip(&result);

    let _ = fs::remove_file(query_path);
    let _ = fs::remove_file(gz_path);
}
