//! Parsing of `EXPLAIN (FORMAT JSON)` output into a flat [`Plan`]
//! classification the analyzer and index auditor consume.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// Flattened view of a plan tree.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Plan {
    pub total_cost: f64,
    pub startup_cost: f64,
    pub est_rows: i64,
    pub node_types: Vec<String>,
    pub has_seq_scan: bool,
    pub has_sort: bool,
    pub has_hash_join: bool,
    pub has_nested_loop: bool,
    pub depth: usize,
    /// Relations hit by a sequential scan, with the column names that
    /// appear in that scan's filter predicate.
    pub seq_scans: Vec<SeqScan>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeqScan {
    pub relation: String,
    pub filter_columns: Vec<String>,
}

/// Parses the JSON value returned by `EXPLAIN (FORMAT JSON)`: an array
/// with one object holding the root under `"Plan"`.
pub fn parse_explain(value: &serde_json::Value) -> Option<Plan> {
    let root = value.get(0)?.get("Plan")?;
    let mut plan = Plan {
        total_cost: root.get("Total Cost")?.as_f64()?,
        startup_cost: root.get("Startup Cost").and_then(|v| v.as_f64()).unwrap_or(0.0),
        est_rows: root.get("Plan Rows").and_then(|v| v.as_i64()).unwrap_or(0),
        ..Plan::default()
    };
    walk(root, 1, &mut plan);
    Some(plan)
}

fn walk(node: &serde_json::Value, depth: usize, plan: &mut Plan) {
    plan.depth = plan.depth.max(depth);
    let node_type = node
        .get("Node Type")
        .and_then(|v| v.as_str())
        .unwrap_or("Unknown");
    plan.node_types.push(node_type.to_string());

    match node_type {
        "Seq Scan" => {
            plan.has_seq_scan = true;
            if let Some(relation) = node.get("Relation Name").and_then(|v| v.as_str()) {
                let filter = node.get("Filter").and_then(|v| v.as_str()).unwrap_or("");
                plan.seq_scans.push(SeqScan {
                    relation: relation.to_string(),
                    filter_columns: predicate_columns(filter),
                });
            }
        }
        "Sort" | "Incremental Sort" => plan.has_sort = true,
        "Hash Join" => plan.has_hash_join = true,
        "Nested Loop" => plan.has_nested_loop = true,
        _ => {}
    }

    if let Some(children) = node.get("Plans").and_then(|v| v.as_array()) {
        for child in children {
            walk(child, depth + 1, plan);
        }
    }
}

/// Column names referenced on the left side of comparisons in a plan
/// predicate such as `((status)::text = 'open'::text)`.
pub fn predicate_columns(predicate: &str) -> Vec<String> {
    static COLUMN_RE: OnceLock<Regex> = OnceLock::new();
    let re = COLUMN_RE.get_or_init(|| {
        // `(column ... op` possibly with a cast between name and operator.
        Regex::new(r"\(*([a-zA-Z_][a-zA-Z0-9_]*)\)*(?:::[a-z_ ]+)?\s*(?:=|<>|<=|>=|<|>|~~| IS )")
            .unwrap_or_else(|e| unreachable!("static regex: {e}"))
    });
    let mut columns: Vec<String> = Vec::new();
    for cap in re.captures_iter(predicate) {
        let name = cap[1].to_string();
        if !columns.contains(&name) {
            columns.push(name);
        }
    }
    columns
}
