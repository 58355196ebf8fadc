use std::collections::HashSet;

use epa_rs::io::newick::parse_newick;

const NEWICK: &str = "((A:0.1,B:0.2):0.05,(C:0.15,D:0.1):0.2,E:0.3);";

#[test]
fn branch_enumeration_counts_and_unique_pmatrix_indices() {
    let mut topo = parse_newick(NEWICK).expect("failed to parse newick");
    let branches = topo.assign_pmatrix_indices().expect("branch query failed");

    let tips = topo.nums.tip_nodes;
    assert_eq!(tips, 5);
    assert_eq!(branches.len(), 2 * tips - 3);

    let mut pmatrix_seen = HashSet::new();
    let mut edge_seen = HashSet::new();
    for &h in &branches {
        let e = &topo.edges[h];
        assert!(
            pmatrix_seen.insert(e.pmatrix_index),
            "duplicate pmatrix index {}",
            e.pmatrix_index
        );
        let undirected = (h.min(e.twin), h.max(e.twin));
        assert!(edge_seen.insert(undirected), "branch listed twice");
    }
}

#[test]
fn inner_rings_close_after_three_steps() {
    let topo = parse_newick(NEWICK).expect("failed to parse newick");
    for h in 0..topo.edges.len() {
        if topo.edges[h].is_tip() {
            continue;
        }
        let once = topo.next(h);
        let twice = topo.next(once);
        assert_eq!(topo.next(twice), h, "ring does not close at half-edge {h}");
        assert_ne!(once, h);
        assert_ne!(twice, h);
    }
}

#[test]
fn twin_is_involutive_and_lengths_match() {
    let topo = parse_newick(NEWICK).expect("failed to parse newick");
    for h in 0..topo.edges.len() {
        let t = topo.twin(h);
        assert_eq!(topo.twin(t), h);
        assert_eq!(topo.edges[h].length, topo.edges[t].length);
    }
}

#[test]
fn clv_indices_are_unique_per_oriented_node() {
    let topo = parse_newick(NEWICK).expect("failed to parse newick");
    let tips = topo.nums.tip_nodes;
    let mut seen = HashSet::new();
    for e in &topo.edges {
        assert!(seen.insert(e.clv_index), "duplicate clv index {}", e.clv_index);
        if e.is_tip() {
            assert!(e.clv_index < tips);
        } else {
            assert!(e.clv_index >= tips);
            assert!(e.clv_index < tips + 3 * topo.nums.inner_nodes);
        }
    }
}

#[test]
fn numbered_newick_round_trips_topology_and_numbering() {
    let mut topo = parse_newick(NEWICK).expect("failed to parse newick");
    topo.assign_pmatrix_indices().expect("branch query failed");
    let numbered = topo.numbered_newick();

    let mut reparsed = parse_newick(&numbered).expect("failed to reparse numbered newick");
    reparsed
        .assign_pmatrix_indices()
        .expect("branch query failed on reparse");

    assert_eq!(reparsed.nums.tip_nodes, topo.nums.tip_nodes);
    assert_eq!(reparsed.nums.branches, topo.nums.branches);
    assert_eq!(reparsed.numbered_newick(), numbered);
}

#[test]
fn rooted_binary_input_collapses_to_unrooted() {
    let topo = parse_newick("((A:0.1,B:0.1):0.1,C:0.2);").expect("failed to parse");
    assert_eq!(topo.nums.tip_nodes, 3);
    assert_eq!(topo.nums.branches, 3);
    assert_eq!(topo.nums.inner_nodes, 1);
    // the two root edges merged into one branch of combined length
    let merged = topo
        .edges
        .iter()
        .find(|e| e.label.as_deref() == Some("C"))
        .expect("tip C missing");
    assert!((merged.length - 0.3).abs() < 1e-12);
}

#[test]
fn malformed_newick_is_rejected() {
    assert!(parse_newick("((A:0.1,B:0.2):0.1;").is_err());
    assert!(parse_newick("(A:0.1,B:0.2);").is_err());
    assert!(parse_newick("((A:0.1,B:0.2,C:0.1):0.1,D:0.2);").is_err());
}
