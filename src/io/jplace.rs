use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::json;

use crate::sample::{Placement, Sample};

/// One record per query. The placement tuple serializes as the jplace `p`
/// row: [edge_num, likelihood, like_weight_ratio, distal_length,
/// pendant_length].
#[derive(Serialize)]
struct PlacementEntry<'a> {
    p: Vec<(usize, f64, f64, f64, f64)>,
    n: [&'a str; 1],
}

/// Opens the placement record: reference tree plus the placements array.
pub fn init_jplace_string(numbered_newick: &str) -> String {
    format!(
        "{{\n  \"tree\": {},\n  \"placements\":\n  [\n",
        json!(numbered_newick)
    )
}

/// One entry per query, placement rows sorted as the filters left them
/// (descending LWR).
pub fn sample_to_jplace_string(sample: &Sample<Placement>) -> Result<String> {
    let mut entries = Vec::with_capacity(sample.len());
    for pq in sample.iter() {
        let entry = PlacementEntry {
            p: pq
                .placements
                .iter()
                .map(|p| {
                    (
                        p.branch_id,
                        p.likelihood,
                        p.lwr,
                        p.distal_length,
                        p.pendant_length,
                    )
                })
                .collect(),
            n: [pq.header.as_str()],
        };
        let json = serde_json::to_string(&entry)
            .with_context(|| format!("failed to serialize placements of {:?}", pq.header))?;
        entries.push(format!("    {json}"));
    }
    Ok(entries.join(",\n"))
}

/// Closes the record with the field legend and the invocation string.
pub fn finalize_jplace_string(invocation: &str) -> String {
    format!(
        "\n  ],\n  \"metadata\": {},\n  \"version\": 3,\n  \"fields\": [\"edge_num\", \"likelihood\", \"like_weight_ratio\", \"distal_length\", \"pendant_length\"]\n}}\n",
        json!({ "invocation": invocation })
    )
}
