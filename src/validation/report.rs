//! Schema validation reports in JSON and Markdown.

use std::collections::HashMap;
use std::path::Path;

use chrono::Utc;
use serde_json::json;
use tracing::info;

use crate::error::SyncError;
use crate::metadata::{SchemaDifference, Severity, TableSchema};

const MAX_ERRORS_DISPLAYED: usize = 10;

pub struct ReportGenerator;

impl ReportGenerator {
    /// Write the machine-readable report.
    pub fn generate_json_report(
        differences: &[SchemaDifference],
        projected: &HashMap<String, TableSchema>,
        observed: &HashMap<String, TableSchema>,
        output_path: &Path,
    ) -> Result<(), SyncError> {
        let errors = count_by_severity(differences, Severity::Error);
        let warnings = count_by_severity(differences, Severity::Warning);
        let infos = count_by_severity(differences, Severity::Info);

        let projected_keys: std::collections::HashSet<_> = projected.keys().collect();
        let observed_keys: std::collections::HashSet<_> = observed.keys().collect();

        let report = json!({
            "timestamp": Utc::now().to_rfc3339(),
            "summary": {
                "total_entities_checked": projected.len(),
                "total_differences": differences.len(),
                "errors": errors,
                "warnings": warnings,
                "info": infos,
            },
            "differences": differences,
            "statistics": {
                "entities_in_dataverse": projected.len(),
                "entities_in_database": observed.len(),
                "entities_matched": projected_keys.intersection(&observed_keys).count(),
                "entities_missing_in_db": projected_keys.difference(&observed_keys).count(),
                "entities_extra_in_db": observed_keys.difference(&projected_keys).count(),
            },
        });

        std::fs::write(output_path, serde_json::to_string_pretty(&report)?)?;
        info!(path = %output_path.display(), "JSON report saved");
        Ok(())
    }

    /// Write the human-readable report.
    pub fn generate_markdown_report(
        differences: &[SchemaDifference],
        projected: &HashMap<String, TableSchema>,
        observed: &HashMap<String, TableSchema>,
        output_path: &Path,
    ) -> Result<(), SyncError> {
        let errors: Vec<_> = by_severity(differences, Severity::Error);
        let warnings: Vec<_> = by_severity(differences, Severity::Warning);
        let infos: Vec<_> = by_severity(differences, Severity::Info);

        let mut lines = vec![
            "# Schema Validation Report".to_string(),
            String::new(),
            format!("**Generated:** {}", Utc::now().format("%Y-%m-%d %H:%M:%S UTC")),
            String::new(),
            "## Summary".to_string(),
            String::new(),
            format!("- **Total Entities Checked:** {}", projected.len()),
            format!("- **Total Issues Found:** {}", differences.len()),
            format!("  - Errors: {}", errors.len()),
            format!("  - Warnings: {}", warnings.len()),
            format!("  - Info: {}", infos.len()),
            String::new(),
        ];

        let projected_keys: std::collections::HashSet<_> = projected.keys().collect();
        let observed_keys: std::collections::HashSet<_> = observed.keys().collect();
        lines.extend([
            "## Statistics".to_string(),
            String::new(),
            format!("- **Entities in Dataverse:** {}", projected.len()),
            format!("- **Entities in Database:** {}", observed.len()),
            format!(
                "- **Entities Matched:** {}",
                projected_keys.intersection(&observed_keys).count()
            ),
            format!(
                "- **Entities Missing in DB:** {}",
                projected_keys.difference(&observed_keys).count()
            ),
            format!(
                "- **Entities Extra in DB:** {}",
                observed_keys.difference(&projected_keys).count()
            ),
            String::new(),
            "## Validation Result".to_string(),
            String::new(),
        ]);

        if errors.is_empty() {
            lines.push("**PASSED** - No critical errors found".to_string());
        } else {
            lines.push(format!("**FAILED** - {} critical error(s) found", errors.len()));
        }
        lines.push(String::new());

        if !differences.is_empty() {
            lines.push("## Detailed Issues".to_string());
            lines.push(String::new());

            let mut by_entity: HashMap<&str, Vec<&SchemaDifference>> = HashMap::new();
            for diff in differences {
                by_entity.entry(diff.entity.as_str()).or_default().push(diff);
            }
            let mut entities: Vec<_> = by_entity.keys().copied().collect();
            entities.sort_unstable();

            for entity in entities {
                lines.push(format!("### {entity}"));
                lines.push(String::new());
                for diff in &by_entity[entity] {
                    lines.push(format!(
                        "- [{}] **{}**: {}",
                        diff.severity, diff.issue_type, diff.description
                    ));
                    if let Some(details) = diff.details.as_object() {
                        for (key, value) in details {
                            lines.push(format!("  - {key}: `{value}`"));
                        }
                    }
                }
                lines.push(String::new());
            }
        }

        std::fs::write(output_path, lines.join("\n"))?;
        info!(path = %output_path.display(), "Markdown report saved");
        Ok(())
    }

    /// Log a summary and return whether validation passed.
    pub fn print_summary(differences: &[SchemaDifference]) -> bool {
        let errors: Vec<_> = by_severity(differences, Severity::Error);
        let warnings = count_by_severity(differences, Severity::Warning);
        let infos = count_by_severity(differences, Severity::Info);

        info!(
            errors = errors.len(),
            warnings, infos, "schema comparison complete"
        );

        for diff in errors.iter().take(MAX_ERRORS_DISPLAYED) {
            info!(entity = %diff.entity, issue = %diff.issue_type, "{}", diff.description);
        }
        if errors.len() > MAX_ERRORS_DISPLAYED {
            info!("... and {} more error(s)", errors.len() - MAX_ERRORS_DISPLAYED);
        }

        errors.is_empty()
    }
}

fn by_severity(differences: &[SchemaDifference], severity: Severity) -> Vec<&SchemaDifference> {
    differences.iter().filter(|d| d.severity == severity).collect()
}

fn count_by_severity(differences: &[SchemaDifference], severity: Severity) -> usize {
    by_severity(differences, severity).len()
}
