use anyhow::{Context, Result, anyhow, ensure};
use log::{debug, warn};
use ndarray::Array2;
use serde::Serialize;
use std::{fs, path::Path, time::Instant};

use crate::data::distance_matrix::DistanceMatrix;

/// What the reader found out about a delimited distance table.
#[derive(Serialize, Clone, Debug)]
pub struct ParseMeta {
    pub delimiter: char,
    pub has_header: bool,
    pub has_index: bool,
    pub symmetry_pairs_fixed: usize,
    pub load_sec: f64,
}

/// Read a delimited (`,` `\t` `;` `|` or space) square distance table.
///
/// A header row and/or a leading label column are detected automatically;
/// labels default to `t1..tn`. Slightly asymmetric input is averaged with a
/// warning, anything else invalid is rejected by [`DistanceMatrix::new`].
pub fn read_distance_matrix<P: AsRef<Path>>(
    path: P,
) -> Result<(DistanceMatrix, Vec<String>, ParseMeta)> {
    let path = path.as_ref();
    let t_load = Instant::now();
    let text =
        fs::read_to_string(path).with_context(|| format!("reading '{}'", path.display()))?;

    let first_line = text
        .lines()
        .find(|l| !l.trim().is_empty() && !l.trim_start().starts_with('#'))
        .ok_or_else(|| anyhow!("no data lines found in '{}'", path.display()))?;
    let delim = detect_delim(first_line);
    debug!("Detected delimiter: {:?}", delim);

    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .comment(Some(b'#'))
        .delimiter(delim as u8)
        .from_reader(text.as_bytes());

    let mut rows: Vec<Vec<String>> = Vec::new();
    for rec in rdr.records() {
        let rec = rec?;
        let row: Vec<String> = rec
            .iter()
            .map(|s| s.trim().to_string())
            .filter(|s| delim != ' ' || !s.is_empty())
            .collect();
        if row.iter().any(|t| !t.is_empty()) {
            rows.push(row);
        }
    }
    ensure!(!rows.is_empty(), "empty table in '{}'", path.display());

    let (has_header, has_index) = sniff_header_index(&rows);
    debug!("Header: {}, Index column: {}", has_header, has_index);

    let start_row = usize::from(has_header);
    let start_col = usize::from(has_index);
    let labels: Vec<String> = match (has_header, has_index) {
        (true, _) => rows[0][start_col..].to_vec(),
        (false, true) => rows.iter().map(|r| r[0].clone()).collect(),
        (false, false) => (1..=rows.len()).map(|i| format!("t{}", i)).collect(),
    };

    let n = rows.len() - start_row;
    let m = rows[start_row].len().saturating_sub(start_col);
    ensure!(n == m, "parsed table is not square: rows={}, cols={}", n, m);

    let mut mat = Array2::<f64>::zeros((n, n));
    for (ri, row) in rows[start_row..].iter().enumerate() {
        ensure!(
            row.len() >= start_col + n,
            "row {} has {} columns, expected {}",
            ri + start_row + 1,
            row.len(),
            start_col + n
        );
        for (ci, tok) in row[start_col..start_col + n].iter().enumerate() {
            mat[[ri, ci]] = tok.parse().with_context(|| {
                format!(
                    "parsing number at row {}, col {}",
                    ri + start_row + 1,
                    ci + start_col + 1
                )
            })?;
        }
    }

    let (matrix, symmetry_pairs_fixed) = DistanceMatrix::symmetrized(mat)
        .with_context(|| format!("validating distances in '{}'", path.display()))?;
    if symmetry_pairs_fixed > 0 {
        warn!(
            "Distance matrix not perfectly symmetric; averaged {} off-diagonal pairs",
            symmetry_pairs_fixed
        );
    }

    let labels = if labels.len() == n {
        labels
    } else {
        warn!(
            "Label count ({}) != n ({}). Synthesizing t1..tn labels.",
            labels.len(),
            n
        );
        (1..=n).map(|i| format!("t{}", i)).collect()
    };

    let meta = ParseMeta {
        delimiter: delim,
        has_header,
        has_index,
        symmetry_pairs_fixed,
        load_sec: t_load.elapsed().as_secs_f64(),
    };
    Ok((matrix, labels, meta))
}

/// Pick the delimiter with the most hits among common choices.
fn detect_delim(line: &str) -> char {
    let cands = [',', '\t', ';', '|', ' '];
    let mut best = (0usize, ',');
    for &c in &cands {
        let count = line.matches(c).count();
        if count > best.0 {
            best = (count, c);
        }
    }
    best.1
}

fn sniff_header_index(rows: &[Vec<String>]) -> (bool, bool) {
    let is_num = |s: &str| s.parse::<f64>().is_ok();

    // An index column needs a non-numeric first cell below the first row and
    // at least two such cells among the first few rows.
    let sample_n = rows.len().min(10);
    let mut nonnum_total = 0usize;
    let mut nonnum_after_first = 0usize;
    for (i, r) in rows.iter().take(sample_n).enumerate() {
        if r.first().is_some_and(|c| !is_num(c)) {
            nonnum_total += 1;
            if i > 0 {
                nonnum_after_first += 1;
            }
        }
    }
    let has_index = nonnum_after_first >= 1 && nonnum_total >= 2;

    let skip = usize::from(has_index);
    let tail = |r: &Vec<String>| -> Vec<String> {
        if r.len() > skip { r[skip..].to_vec() } else { Vec::new() }
    };
    let first = tail(&rows[0]);
    let first_num = first.iter().filter(|s| is_num(s)).count();
    let second_num = rows
        .get(1)
        .map(|r| tail(r).iter().filter(|s| is_num(s)).count())
        .unwrap_or(first_num);

    let has_header = first.iter().any(|s| !is_num(s)) || first_num < second_num;
    (has_header, has_index)
}
