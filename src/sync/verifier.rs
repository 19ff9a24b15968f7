//! Reference integrity verification for synced data.
//!
//! LEFT JOINs each foreign-key column against the referenced table's
//! business key and reports values with no match in any version. Missing
//! referenced tables are skipped: they may simply be outside the
//! configured entity set.

use sqlx::Row;
use tracing::warn;

use crate::error::SyncError;

use super::database::DatabaseManager;
use super::relationship_graph::RelationshipGraph;

/// Sample IDs collected per issue.
const MAX_SAMPLE_IDS: usize = 10;

/// Sample IDs shown in the rendered report.
const MAX_SAMPLE_DISPLAY: usize = 5;

/// One dangling foreign-key finding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationIssue {
    pub table: String,
    pub fk_column: String,
    pub referenced_table: String,
    pub dangling_count: u64,
    pub total_checked: u64,
    pub sample_ids: Vec<String>,
}

/// Aggregate verification result.
#[derive(Debug, Default)]
pub struct VerificationReport {
    pub total_checks: u64,
    pub total_issues: u64,
    pub issues: Vec<VerificationIssue>,
}

impl std::fmt::Display for VerificationReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f)?;
        writeln!(f, "{}", "=".repeat(60))?;
        writeln!(f, "Reference Verification Report")?;
        writeln!(f, "{}", "=".repeat(60))?;
        writeln!(f)?;

        if self.issues.is_empty() {
            writeln!(f, "All references valid!")?;
            writeln!(f)?;
            writeln!(f, "Statistics:")?;
            writeln!(f, "  Total references checked: {}", self.total_checks)?;
            writeln!(f, "  Dangling references: 0")?;
            writeln!(f, "  Tables with issues: 0")?;
        } else {
            writeln!(f, "Found {} reference integrity issue(s):", self.total_issues)?;
            writeln!(f)?;
            for issue in &self.issues {
                writeln!(
                    f,
                    "{}.{} -> {}: {} dangling ({} checked)",
                    issue.table,
                    issue.fk_column,
                    issue.referenced_table,
                    issue.dangling_count,
                    issue.total_checked
                )?;
                if !issue.sample_ids.is_empty() {
                    let mut sample = issue
                        .sample_ids
                        .iter()
                        .take(MAX_SAMPLE_DISPLAY)
                        .map(|id| format!("'{id}'"))
                        .collect::<Vec<_>>()
                        .join(", ");
                    if issue.sample_ids.len() > MAX_SAMPLE_DISPLAY {
                        sample.push_str(&format!(
                            ", ... ({} more)",
                            issue.sample_ids.len() - MAX_SAMPLE_DISPLAY
                        ));
                    }
                    writeln!(f, "  Missing IDs: [{sample}]")?;
                }
            }
            writeln!(f)?;
            writeln!(
                f,
                "Summary: {} table(s) with issues, {} dangling references total",
                self.issues.len(),
                self.total_issues
            )?;
        }

        write!(f, "{}", "=".repeat(60))
    }
}

/// Detects dangling foreign-key values in the local store.
pub struct ReferenceVerifier;

impl ReferenceVerifier {
    /// Check every configured foreign key and collect findings.
    pub async fn verify_references(
        db: &DatabaseManager,
        graph: &RelationshipGraph,
    ) -> Result<VerificationReport, SyncError> {
        let mut report = VerificationReport::default();

        let mut api_names: Vec<&str> = graph.api_names().collect();
        api_names.sort_unstable();

        for api_name in api_names {
            if !db.table_exists(api_name).await? {
                continue;
            }

            for reference in graph.entities_referenced_by(api_name) {
                report.total_checks += 1;

                if !db.table_exists(&reference.table).await? {
                    continue;
                }

                // The referenced column is the business key, so a match
                // against any historical version counts.
                let query = format!(
                    "SELECT t.{fk} AS fk_value, COUNT(*) AS ref_count
                     FROM {table} t
                     LEFT JOIN {referenced} r ON t.{fk} = r.{ref_col}
                     WHERE t.{fk} IS NOT NULL AND r.{ref_col} IS NULL
                     GROUP BY t.{fk}",
                    fk = reference.fk_column,
                    table = api_name,
                    referenced = reference.table,
                    ref_col = reference.referenced_column,
                );

                let rows = match sqlx::query(&query).fetch_all(db.pool()).await {
                    Ok(rows) => rows,
                    Err(e) => {
                        warn!(
                            table = api_name,
                            column = %reference.fk_column,
                            error = %e,
                            "could not verify foreign key"
                        );
                        continue;
                    }
                };

                if rows.is_empty() {
                    continue;
                }

                let dangling_count: u64 = rows
                    .iter()
                    .map(|r| r.get::<i64, _>("ref_count") as u64)
                    .sum();
                let sample_ids: Vec<String> = rows
                    .iter()
                    .take(MAX_SAMPLE_IDS)
                    .map(|r| r.get::<String, _>("fk_value"))
                    .collect();

                let total_checked: i64 = sqlx::query(&format!(
                    "SELECT COUNT(*) AS n FROM {table} WHERE {fk} IS NOT NULL",
                    table = api_name,
                    fk = reference.fk_column,
                ))
                .fetch_one(db.pool())
                .await?
                .get("n");

                report.total_issues += dangling_count;
                report.issues.push(VerificationIssue {
                    table: api_name.to_string(),
                    fk_column: reference.fk_column.clone(),
                    referenced_table: reference.table.clone(),
                    dangling_count,
                    total_checked: total_checked as u64,
                    sample_ids,
                });
            }
        }

        Ok(report)
    }
}
