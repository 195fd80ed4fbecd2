//! Batch scoring of uploaded CSV files.
//!
//! The first record is the header. Each following record is scored on its
//! own; a row that fails becomes a [`RowResult::Failed`] entry and the batch
//! carries on. Only an unparseable file or a missing model fails the whole
//! batch.

use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, info};

use crate::detector::{Detector, Prediction};
use crate::error::{PredictError, PredictResult};

// ---------------------------------------------------------------------------
// Parsed input
// ---------------------------------------------------------------------------

/// A parsed CSV upload.
#[derive(Debug, Clone, PartialEq)]
pub struct CsvBatch {
    /// Header columns, as given.
    pub feature_names: Vec<String>,
    pub rows: Vec<Vec<f64>>,
}

impl CsvBatch {
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn feature_count(&self) -> usize {
        self.feature_names.len()
    }
}

/// Non-numeric cells (and NaN) become `0.0`.
fn parse_cell(cell: &str) -> f64 {
    match cell.trim().parse::<f64>() {
        Ok(v) if !v.is_nan() => v,
        _ => 0.0,
    }
}

/// Parse an uploaded file.
///
/// Rows shorter than the header are padded with `0.0`. Rows longer than the
/// header, invalid UTF-8 and empty input are rejected as `InvalidInput`.
pub fn parse_csv(bytes: &[u8]) -> PredictResult<CsvBatch> {
    let text = std::str::from_utf8(bytes)
        .map_err(|e| PredictError::invalid(format!("CSV processing error: {}", e)))?;
    if text.trim().is_empty() {
        return Err(PredictError::invalid("CSV processing error: file is empty"));
    }

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(text.as_bytes());

    let feature_names: Vec<String> = reader
        .headers()
        .map_err(|e| PredictError::invalid(format!("CSV processing error: {}", e)))?
        .iter()
        .map(str::to_string)
        .collect();

    let width = feature_names.len();
    let mut rows = Vec::new();
    for (i, record) in reader.records().enumerate() {
        let record =
            record.map_err(|e| PredictError::invalid(format!("CSV processing error: {}", e)))?;
        if record.len() > width {
            return Err(PredictError::invalid(format!(
                "CSV processing error: row {} has {} fields, header has {}",
                i + 1,
                record.len(),
                width
            )));
        }
        let mut row: Vec<f64> = record.iter().map(parse_cell).collect();
        row.resize(width, 0.0);
        rows.push(row);
    }

    debug!(
        columns = feature_names.len(),
        rows = rows.len(),
        "parsed CSV upload"
    );
    Ok(CsvBatch {
        feature_names,
        rows,
    })
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// Outcome for one CSV row. `row` is 1-based.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum RowResult {
    Scored {
        row: usize,
        #[serde(flatten)]
        prediction: Prediction,
    },
    Failed {
        row: usize,
        error: String,
    },
}

impl RowResult {
    pub fn row(&self) -> usize {
        match self {
            RowResult::Scored { row, .. } | RowResult::Failed { row, .. } => *row,
        }
    }

    #[cfg(test)]
    pub fn is_scored(&self) -> bool {
        matches!(self, RowResult::Scored { .. })
    }
}

/// Aggregate counts over a batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchSummary {
    pub total_rows: usize,
    pub successful_rows: usize,
    pub failed_rows: usize,
    pub benign: usize,
    pub attacks: usize,
    /// attack type → rows
    pub attack_counts: BTreeMap<String, usize>,
}

impl BatchSummary {
    pub fn from_results(results: &[RowResult]) -> Self {
        let mut summary = BatchSummary {
            total_rows: results.len(),
            ..Default::default()
        };
        for result in results {
            match result {
                RowResult::Scored { prediction, .. } => {
                    summary.successful_rows += 1;
                    if prediction.attack.is_vulnerable {
                        summary.attacks += 1;
                    } else {
                        summary.benign += 1;
                    }
                    *summary
                        .attack_counts
                        .entry(prediction.attack.attack_type.clone())
                        .or_default() += 1;
                }
                RowResult::Failed { .. } => summary.failed_rows += 1,
            }
        }
        summary
    }
}

// ---------------------------------------------------------------------------
// Orchestration
// ---------------------------------------------------------------------------

/// Score every row in input order.
pub fn run_batch(detector: &Detector, batch: &CsvBatch) -> PredictResult<Vec<RowResult>> {
    let classifier = detector.classifier()?;

    let results: Vec<RowResult> = batch
        .rows
        .iter()
        .enumerate()
        .map(|(i, values)| {
            let row = i + 1;
            match detector.predict_with(classifier, values) {
                Ok(prediction) => RowResult::Scored { row, prediction },
                Err(e) => {
                    debug!(row, kind = e.kind(), error = %e, "row failed");
                    RowResult::Failed {
                        row,
                        error: e.to_string(),
                    }
                }
            }
        })
        .collect();

    let summary = BatchSummary::from_results(&results);
    info!(
        total = summary.total_rows,
        scored = summary.successful_rows,
        failed = summary.failed_rows,
        attacks = summary.attacks,
        "batch complete"
    );
    Ok(results)
}

/// Plain-text table for the CLI.
pub fn format_summary(results: &[RowResult]) -> String {
    let summary = BatchSummary::from_results(results);
    let mut out = String::new();
    out.push_str(&format!(
        "Rows: {}  scored: {}  failed: {}\n",
        summary.total_rows, summary.successful_rows, summary.failed_rows
    ));
    out.push_str(&format!(
        "Benign: {}  attacks: {}\n\n",
        summary.benign, summary.attacks
    ));
    out.push_str(&format!(
        "{:<6} {:<28} {:<16} {}\n",
        "ROW", "ATTACK TYPE", "STATUS", "TOP FEATURES"
    ));
    out.push_str(&format!("{}\n", "-".repeat(72)));
    for result in results {
        match result {
            RowResult::Scored { row, prediction } => {
                let top: Vec<String> = prediction
                    .top_features_detailed
                    .iter()
                    .map(|c| format!("{}({:+.3})", c.feature_name, c.shap_value))
                    .collect();
                out.push_str(&format!(
                    "{:<6} {:<28} {:<16} {}\n",
                    row,
                    prediction.attack.attack_type,
                    prediction.attack.vulnerability_status,
                    top.join(", ")
                ));
            }
            RowResult::Failed { row, error } => {
                out.push_str(&format!("{:<6} ERROR: {}\n", row, error));
            }
        }
    }
    if !summary.attack_counts.is_empty() {
        out.push_str("\nBy attack type:\n");
        for (name, count) in &summary.attack_counts {
            out.push_str(&format!("  {:<28} {}\n", name, count));
        }
    }
    out
}
