//! JSON output

use std::fs;
use std::path::Path;

use serde::Serialize;

use crate::stats::{AggregateReport, IntervalSample};

pub fn output_json(report: &AggregateReport) -> String {
    to_pretty(report)
}

/// One compact line per sample, for streaming consumers.
pub fn output_interval_json(sample: &IntervalSample) -> String {
    serde_json::to_string(sample).unwrap_or_else(|_| "{}".to_string())
}

pub fn save_json(report: &AggregateReport, path: &Path) -> anyhow::Result<()> {
    fs::write(path, output_json(report))?;
    Ok(())
}

fn to_pretty<T: Serialize>(value: &T) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| "{}".to_string())
}
