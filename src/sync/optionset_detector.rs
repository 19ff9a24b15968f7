//! Option-set detection from formatted-value annotations.
//!
//! Dataverse ships option-set labels as side-channel annotations:
//! `<field>@OData.Community.Display.V1.FormattedValue` next to the raw
//! integer code at `<field>`. Multi-selects carry comma-separated codes
//! and semicolon-separated labels.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::client::{JsonRecord, FORMATTED_VALUE_ANNOTATION};

/// An option set recovered from one API record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectedOptionSet {
    pub field_name: String,
    pub is_multi_select: bool,
    pub codes_and_labels: BTreeMap<i64, String>,
}

/// Scans records for formatted-value annotations.
pub struct OptionSetDetector;

impl OptionSetDetector {
    /// Detect every option set present in a single record. Fields whose
    /// raw value cannot be parsed as integer codes are not option sets
    /// and are skipped.
    pub fn detect_from_record(record: &JsonRecord) -> BTreeMap<String, DetectedOptionSet> {
        let suffix = format!("@{FORMATTED_VALUE_ANNOTATION}");
        let mut detected = BTreeMap::new();

        for key in record.keys() {
            let Some(field_name) = key.strip_suffix(&suffix) else {
                continue;
            };
            if field_name.is_empty() {
                continue;
            }

            let Some(raw_value) = record.get(field_name) else {
                continue;
            };
            let Some(formatted) = record.get(key).and_then(Value::as_str) else {
                continue;
            };

            let is_multi_select = is_multi_select(raw_value, formatted);
            let codes_and_labels = extract_codes_and_labels(raw_value, formatted, is_multi_select);

            if !codes_and_labels.is_empty() {
                detected.insert(
                    field_name.to_string(),
                    DetectedOptionSet {
                        field_name: field_name.to_string(),
                        is_multi_select,
                        codes_and_labels,
                    },
                );
            }
        }

        detected
    }
}

fn is_multi_select(raw_value: &Value, formatted: &str) -> bool {
    if formatted.contains(';') {
        return true;
    }
    matches!(raw_value, Value::String(s) if s.contains(','))
}

fn raw_code(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}

fn extract_codes_and_labels(
    raw_value: &Value,
    formatted: &str,
    is_multi_select: bool,
) -> BTreeMap<i64, String> {
    let mut result = BTreeMap::new();

    if is_multi_select {
        let codes: Vec<i64> = match raw_value {
            Value::String(s) => s
                .split(',')
                .filter_map(|part| {
                    let trimmed = part.trim();
                    (!trimmed.is_empty()).then(|| trimmed.parse::<i64>().ok()).flatten()
                })
                .collect(),
            other => raw_code(other).into_iter().collect(),
        };
        let labels: Vec<&str> = formatted
            .split(';')
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .collect();

        for (code, label) in codes.into_iter().zip(labels) {
            result.insert(code, label.to_string());
        }
    } else if let Some(code) = raw_code(raw_value) {
        result.insert(code, formatted.to_string());
    }

    result
}
