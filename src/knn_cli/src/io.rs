//! Point file parsing and result formatting.

use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use knn_cuda::{KnnResult, Neighbor, PointSet, SearchTiming};
use serde::Serialize;

/// Parse whitespace-separated points, one per line.
///
/// Blank lines are skipped and `#` starts a comment. Every point must have the
/// same number of coordinates.
pub fn parse_points(text: &str) -> Result<PointSet> {
    let mut rows: Vec<Vec<f32>> = Vec::new();

    for (line_no, line) in text.lines().enumerate() {
        let content = line.split('#').next().unwrap_or("").trim();
        if content.is_empty() {
            continue;
        }

        let row = content
            .split_whitespace()
            .map(|token| {
                token.parse::<f32>().with_context(|| {
                    format!("line {}: invalid coordinate '{token}'", line_no + 1)
                })
            })
            .collect::<Result<Vec<_>>>()?;

        if let Some(first) = rows.first() {
            if first.len() != row.len() {
                bail!(
                    "line {}: expected {} coordinates, found {}",
                    line_no + 1,
                    first.len(),
                    row.len()
                );
            }
        }
        rows.push(row);
    }

    if rows.is_empty() {
        bail!("no points found");
    }
    Ok(PointSet::from_rows(&rows)?)
}

/// Read and parse a point file.
pub fn load_points(path: &Path) -> Result<PointSet> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    parse_points(&text).with_context(|| format!("failed to parse {}", path.display()))
}

/// One line per query: `index:distance` pairs separated by spaces.
pub fn format_text(result: &KnnResult) -> String {
    let mut out = String::new();
    for q in 0..result.query_count {
        let line: Vec<String> = result
            .neighbors(q)
            .iter()
            .map(|n| format!("{}:{}", n.index, n.distance))
            .collect();
        let _ = writeln!(out, "{}", line.join(" "));
    }
    out
}

#[derive(Serialize)]
struct JsonReport<'a> {
    backend: &'a str,
    k: usize,
    query_count: usize,
    batch_size: usize,
    batch_count: usize,
    neighbors: Vec<Vec<Neighbor>>,
    timing: &'a SearchTiming,
}

/// Full result as pretty-printed JSON.
pub fn format_json(result: &KnnResult) -> Result<String> {
    let report = JsonReport {
        backend: &result.backend,
        k: result.k,
        query_count: result.query_count,
        batch_size: result.batch_size,
        batch_count: result.batch_count,
        neighbors: (0..result.query_count).map(|q| result.neighbors(q)).collect(),
        timing: &result.timing,
    };
    Ok(serde_json::to_string_pretty(&report)?)
}
