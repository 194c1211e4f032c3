//! Execution-result comparison between a generated query and a gold query.
//!
//! Rows are classified by distinct value, never by position:
//!
//! * matched: generated rows that also occur in the gold result
//! * false positives: generated rows absent from the gold result
//! * true negatives: gold rows absent from the generated result
//!
//! The verdict is coverage-only. A comparison is equivalent when no gold
//! row is missing, so extra generated rows never flip it and an empty gold
//! result is equivalent to anything. This is deliberate and the tests pin
//! it down.

use crate::error::{Error, QuerySide};
use crate::row::{Row, RowSet};
use crate::state::QueryResult;
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

/// Anything that can run a read-only statement against a database id.
/// `Err` means the source itself is unreachable; a failing statement is
/// `Ok(QueryResult::Error { .. })`.
#[async_trait]
pub trait SqlSource: Send + Sync + 'static {
    async fn execute(&self, sql: &str, database_id: &str) -> anyhow::Result<QueryResult>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComparisonResult {
    pub matched: RowSet,
    pub false_positives: RowSet,
    pub true_negatives: RowSet,
    pub is_equivalent: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowStyle {
    Regular,
    FalsePositive,
    TrueNegative,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HighlightedRow {
    pub row: Row,
    pub style: RowStyle,
}

impl ComparisonResult {
    pub fn partition(generated: &[Row], gold: &[Row]) -> Self {
        let generated = RowSet::from_rows(generated);
        let gold = RowSet::from_rows(gold);

        let mut result = ComparisonResult::default();
        for (key, entry) in generated.entries() {
            if gold.contains_key(key) {
                result.matched.insert_n(entry.row.clone(), entry.count);
            } else {
                result.false_positives.insert_n(entry.row.clone(), entry.count);
            }
        }
        for (key, entry) in gold.entries() {
            if !generated.contains_key(key) {
                result.true_negatives.insert_n(entry.row.clone(), entry.count);
            }
        }
        result.is_equivalent = result.true_negatives.is_empty();
        result
    }

    /// Generated rows in their original order tagged by classification,
    /// followed by every gold row the generated side missed, in gold order.
    pub fn highlight(&self, generated: &[Row], gold: &[Row]) -> Vec<HighlightedRow> {
        let produced = RowSet::from_rows(generated);
        let mut rows: Vec<HighlightedRow> = generated
            .iter()
            .map(|row| HighlightedRow {
                row: row.clone(),
                style: if self.matched.contains(row) {
                    RowStyle::Regular
                } else {
                    RowStyle::FalsePositive
                },
            })
            .collect();
        rows.extend(
            gold.iter()
                .filter(|row| !self.matched.contains(row) && !produced.contains(row))
                .map(|row| HighlightedRow {
                    row: row.clone(),
                    style: RowStyle::TrueNegative,
                }),
        );
        rows
    }

    pub fn summary(&self) -> &'static str {
        if self.is_equivalent {
            "The execution results are the same."
        } else {
            "The execution results are different."
        }
    }
}

/// Both materialized sides of one comparison and their classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Comparison {
    pub gold: Vec<Row>,
    pub generated: Vec<Row>,
    pub result: ComparisonResult,
}

pub struct ResultComparator {
    source: Arc<dyn SqlSource>,
}

impl ResultComparator {
    pub fn new(source: Arc<dyn SqlSource>) -> Self {
        Self { source }
    }

    /// Runs one side of a comparison, turning both unreachable sources and
    /// failing statements into [`Error::Execution`].
    pub async fn execute_side(
        &self,
        which: QuerySide,
        sql: &str,
        database_id: &str,
    ) -> Result<Vec<Row>> {
        if database_id.is_empty() {
            return Err(Error::Configuration(format!(
                "cannot execute {} SQL without a database id",
                which
            )));
        }
        debug!("executing {} SQL on {}: {}", which, database_id, sql);
        let result = self.source.execute(sql, database_id).await.map_err(|e| {
            Error::Execution {
                which,
                message: format!("{:#}", e),
            }
        })?;
        match result {
            QueryResult::Result { rows } => Ok(rows),
            QueryResult::Error { error_message } => {
                warn!("{} SQL failed on {}: {}", which, database_id, error_message);
                Err(Error::Execution {
                    which,
                    message: error_message,
                })
            }
        }
    }

    pub async fn compare(
        &self,
        generated_sql: &str,
        gold_sql: &str,
        database_id: &str,
    ) -> Result<ComparisonResult> {
        self.compare_with(generated_sql, None, gold_sql, database_id)
            .await
            .map(|comparison| comparison.result)
    }

    /// Like [`compare`](Self::compare), reusing `generated_rows` when the
    /// generated side has already been executed. Gold runs first and a gold
    /// failure returns before the generated side is touched.
    pub async fn compare_with(
        &self,
        generated_sql: &str,
        generated_rows: Option<Vec<Row>>,
        gold_sql: &str,
        database_id: &str,
    ) -> Result<Comparison> {
        let gold = self
            .execute_side(QuerySide::Gold, gold_sql, database_id)
            .await?;
        let generated = match generated_rows {
            Some(rows) => rows,
            None => {
                self.execute_side(QuerySide::Generated, generated_sql, database_id)
                    .await?
            }
        };
        let result = ComparisonResult::partition(&generated, &gold);
        Ok(Comparison {
            gold,
            generated,
            result,
        })
    }
}
