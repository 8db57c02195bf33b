//! Sequence files exported from the instrument's acquisition software.
//!
//! The `Comment` column names the acquisition class to run for each row, the
//! `File Name` and `Sample ID` columns override the raw file metadata of that
//! run. Exported files may start with a non-header line, which is skipped.

use std::{fs, path::Path};

use tracing::{error, info};

use crate::{
    algorithm::{AlgorithmDefinition, PlannedStep},
    error::AlgorithmSelectionError,
};

pub const COMMENT_COLUMN: &str = "Comment";
pub const FILE_NAME_COLUMN: &str = "File Name";
pub const SAMPLE_ID_COLUMN: &str = "Sample ID";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceRow {
    pub file_name: String,
    pub sample_id: String,
    pub comment: String,
}

fn is_header(line: &str) -> bool {
    line.split(',')
        .any(|field| field.trim().trim_matches('"') == COMMENT_COLUMN)
}

/// # Errors
/// [`AlgorithmSelectionError::SequenceFile`] if the file cannot be read, is not
/// valid CSV or lacks one of the required columns.
pub fn read_sequence_file(path: &Path) -> Result<Vec<SequenceRow>, AlgorithmSelectionError> {
    let fail = |details: String| AlgorithmSelectionError::SequenceFile {
        path: path.to_path_buf(),
        details,
    };
    let raw = fs::read_to_string(path).map_err(|e| fail(e.to_string()))?;
    let body = match raw.split_once('\n') {
        Some((first, rest)) if !is_header(first) => rest,
        _ => raw.as_str(),
    };

    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(body.as_bytes());
    let headers = reader.headers().map_err(|e| fail(e.to_string()))?.clone();
    let column = |name: &str| {
        headers
            .iter()
            .position(|h| h == name)
            .ok_or_else(|| fail(format!("missing column \"{name}\"")))
    };
    let comment = column(COMMENT_COLUMN)?;
    let file_name = column(FILE_NAME_COLUMN)?;
    let sample_id = column(SAMPLE_ID_COLUMN)?;

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|e| fail(e.to_string()))?;
        let field = |i: usize| record.get(i).unwrap_or_default().to_string();
        rows.push(SequenceRow {
            file_name: field(file_name),
            sample_id: field(sample_id),
            comment: field(comment),
        });
    }
    if rows.is_empty() {
        return Err(fail("no sequence rows".to_string()));
    }
    Ok(rows)
}

fn table<'a>(rows: impl Iterator<Item = (&'a str, &'a str, &'a str)>) -> String {
    let mut out = format!(
        "\t{FILE_NAME_COLUMN:>20}    {SAMPLE_ID_COLUMN:>20}    {COMMENT_COLUMN:>20}"
    );
    for (file, sample, comment) in rows {
        out.push_str(&format!("\n\t{file:>20}    {sample:>20}    {comment:>20}"));
    }
    out
}

/// Turn sequence rows into a run order. Rows may repeat acquisition classes.
///
/// # Errors
/// [`AlgorithmSelectionError::SequenceMismatch`] listing every row whose
/// `Comment` does not name an acquisition class of `algorithm`. No partial
/// order is returned.
pub fn resolve_sequence(
    algorithm: &AlgorithmDefinition,
    rows: &[SequenceRow],
) -> Result<Vec<PlannedStep>, AlgorithmSelectionError> {
    let mut plan = Vec::with_capacity(rows.len());
    let mut unmatched = Vec::new();
    for (number, row) in (1..).zip(rows) {
        if let Some(step_index) = algorithm.find_step(&row.comment) {
            plan.push(PlannedStep {
                step_index,
                raw_file_name: Some(row.file_name.clone()),
                sample_name: Some(row.sample_id.clone()),
            });
        } else {
            error!(
                "could not resolve the following sequence input from user:\n{}",
                table(std::iter::once((
                    row.file_name.as_str(),
                    row.sample_id.as_str(),
                    row.comment.as_str()
                )))
            );
            unmatched.push(number);
        }
    }
    if !unmatched.is_empty() {
        return Err(AlgorithmSelectionError::SequenceMismatch { rows: unmatched });
    }

    info!(
        "dynamic acquisition sequence set by user:\n{}",
        table(
            rows.iter()
                .map(|r| (r.file_name.as_str(), r.sample_id.as_str(), r.comment.as_str()))
        )
    );
    Ok(plan)
}

/// Read and resolve a sequence file in one go.
///
/// # Errors
/// See [`read_sequence_file`] and [`resolve_sequence`].
pub fn load_sequence(
    algorithm: &AlgorithmDefinition,
    path: &Path,
) -> Result<Vec<PlannedStep>, AlgorithmSelectionError> {
    let rows = read_sequence_file(path)?;
    resolve_sequence(algorithm, &rows)
}
