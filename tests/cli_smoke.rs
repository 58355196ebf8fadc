use serde_json::Value;
use std::fs;
use std::path::PathBuf;
use std::process::Command;
use std::time::{SystemTime, UNIX_EPOCH};

fn unique_temp_path(prefix: &str, ext: &str) -> PathBuf {
    let mut path = std::env::temp_dir();
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system time is before unix epoch")
        .as_nanos();
    path.push(format!("{prefix}_{}_{}.{}", std::process::id(), nanos, ext));
    path
}

fn find_epa_binary() -> PathBuf {
    if let Ok(path) = std::env::var("CARGO_BIN_EXE_epa") {
        return PathBuf::from(path);
    }

    let current = std::env::current_exe().expect("failed to get current exe path");
    let deps_dir = current
        .parent()
        .expect("failed to get deps dir from current exe")
        .to_path_buf();
    let debug_dir = deps_dir
        .parent()
        .expect("failed to get debug dir from deps dir")
        .to_path_buf();

    let direct = debug_dir.join("epa");
    if direct.exists() {
        return direct;
    }

    for entry in fs::read_dir(&deps_dir).expect("failed to read target deps dir") {
        let entry = entry.expect("failed to read deps entry");
        let path = entry.path();
        let name = path
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or_default();
        if !name.starts_with("epa-") {
            continue;
        }
        if name.ends_with(".d") || name.ends_with(".rlib") || name.ends_with(".rmeta") {
            continue;
        }
        if path.is_file() {
            return path;
        }
    }

    panic!("failed to find epa binary in CARGO_BIN_EXE_epa or target/debug");
}

fn write_fixture() -> (PathBuf, PathBuf, PathBuf, PathBuf) {
    let tree = unique_temp_path("epa_cli_tree", "nwk");
    let ref_msa = unique_temp_path("epa_cli_ref", "fasta");
    let queries = unique_temp_path("epa_cli_queries", "fasta");
    let outdir = unique_temp_path("epa_cli_out", "d");

    fs::write(&tree, "((A:0.1,B:0.1):0.1,C:0.2);\n").expect("failed to write tree");
    fs::write(
        &ref_msa,
        concat!(
            ">A\nACGTACGTACGTACGTACGTACGTACGTACGT\n",
            ">B\nTGCAACGTACGTACGTTGCAACGTACGTACGT\n",
            ">C\nACGTTGCAACGTACGTACGTTGCAACGTTGCA\n",
        ),
    )
    .expect("failed to write reference msa");
    fs::write(
        &queries,
        concat!(
            ">q0\nACGTACGTACGTACGTACGTACGTACGTACGT\n",
            ">q1\nTGCAACGTACGTACGTTGCAACGTACGTACGT\n",
            ">q2\nACGTTGCAACGTACGTACGTTGCAACGTTGCA\n",
            ">q3\nACGTACGTNCGTACGTACGTACGTACGTACGT\n",
            ">q4\nACGTACGTACGTACGTTGCAACGTACGTACGT\n",
        ),
    )
    .expect("failed to write queries");
    (tree, ref_msa, queries, outdir)
}

#[test]
fn cli_places_queries_and_writes_jplace() {
    let (tree, ref_msa, queries, outdir) = write_fixture();
    let exe = find_epa_binary();
    let status = Command::new(&exe)
        .arg(&tree)
        .arg(&ref_msa)
        .arg(&queries)
        .arg(&outdir)
        .arg("--chunk-size")
        .arg("2")
        .arg("--no-progress")
        .status()
        .expect("failed to run epa binary");
    assert!(status.success(), "epa exited with non-zero status");

    let out = fs::read_to_string(outdir.join("epa_result.jplace"))
        .expect("failed to read jplace output");
    let v: Value = serde_json::from_str(&out).expect("output json is invalid");

    let tree_string = v["tree"].as_str().expect("tree field missing");
    assert!(tree_string.contains("{0}"), "tree lacks edge numbering");

    let placements = v["placements"].as_array().expect("placements missing");
    assert_eq!(placements.len(), 5, "expected one entry per query");
    for entry in placements {
        let rows = entry["p"].as_array().expect("placement rows missing");
        assert!(!rows.is_empty());
        for row in rows {
            let row = row.as_array().expect("placement row is not an array");
            assert_eq!(row.len(), 5);
            let lwr = row[2].as_f64().expect("lwr missing");
            assert!((0.0..=1.0).contains(&lwr));
        }
    }
    assert_eq!(v["version"], 3);
    assert!(v["metadata"]["invocation"].as_str().is_some());

    let _ = fs::remove_file(tree);
    let _ = fs::remove_file(ref_msa);
    let _ = fs::remove_file(queries);
    let _ = fs::remove_dir_all(outdir);
}

#[test]
fn cli_prescoring_run_succeeds() {
    let (tree, ref_msa, queries, outdir) = write_fixture();
    let exe = find_epa_binary();
    let status = Command::new(&exe)
        .arg(&tree)
        .arg(&ref_msa)
        .arg(&queries)
        .arg(&outdir)
        .arg("--prescoring")
        .arg("--no-progress")
        .status()
        .expect("failed to run epa binary");
    assert!(status.success(), "epa exited with non-zero status");

    let out = fs::read_to_string(outdir.join("epa_result.jplace"))
        .expect("failed to read jplace output");
    let v: Value = serde_json::from_str(&out).expect("output json is invalid");
    assert_eq!(v["placements"].as_array().expect("placements").len(), 5);

    let _ = fs::remove_file(tree);
    let _ = fs::remove_file(ref_msa);
    let _ = fs::remove_file(queries);
    let _ = fs::remove_dir_all(outdir);
}

#[test]
fn cli_fails_on_missing_tree_file() {
    let (_tree, ref_msa, queries, outdir) = write_fixture();
    let exe = find_epa_binary();
    let status = Command::new(&exe)
        .arg("/nonexistent/tree.nwk")
        .arg(&ref_msa)
        .arg(&queries)
        .arg(&outdir)
        .arg("--no-progress")
        .status()
        .expect("failed to run epa binary");
    assert!(!status.success(), "missing input must exit non-zero");

    let _ = fs::remove_file(ref_msa);
    let _ = fs::remove_file(queries);
    let _ = fs::remove_dir_all(outdir);
}

#[test]
fn cli_rejects_incompatible_filter_bounds() {
    let (tree, ref_msa, queries, outdir) = write_fixture();
    let exe = find_epa_binary();
    let status = Command::new(&exe)
        .arg(&tree)
        .arg(&ref_msa)
        .arg(&queries)
        .arg(&outdir)
        .arg("--filter-min")
        .arg("5")
        .arg("--filter-max")
        .arg("2")
        .arg("--no-progress")
        .status()
        .expect("failed to run epa binary");
    assert!(!status.success(), "bad configuration must exit non-zero");

    let _ = fs::remove_file(tree);
    let _ = fs::remove_file(ref_msa);
    let _ = fs::remove_file(queries);
    let _ = fs::remove_dir_all(outdir);
}
