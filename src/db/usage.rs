//! Usage ledger for provider calls
//!
//! Append-only. Costs are priced at insert time from the shared
//! [`PriceTable`] unless the caller already knows the exact cost.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::{Duration, Utc};
use rusqlite::params;

use super::DbPool;
use crate::pricing::PriceTable;
use crate::Result;

/// Operation name logged for compaction calls
pub const OP_COMPACTION: &str = "compaction";
/// Operation name logged for assistant replies built on the context
pub const OP_CHAT: &str = "chat";

/// Operations that always appear in a report, in display order
pub const KNOWN_OPERATIONS: &[&str] = &[OP_COMPACTION, OP_CHAT];

/// Width of the recent window in [`UsageReport`]
pub const RECENT_WINDOW_DAYS: i64 = 7;

/// A provider call to record
#[derive(Debug, Clone)]
pub struct UsageEntry<'a> {
    pub conversation_id: &'a str,
    pub community_id: &'a str,
    pub operation: &'a str,
    pub input_tokens: u64,
    pub output_tokens: u64,
    /// Priced from the model when `None`
    pub cost: Option<f64>,
    pub model: &'a str,
}

/// Totals for one operation over one window
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct UsageTotals {
    pub calls: u64,
    pub tokens: u64,
    pub cost: f64,
}

/// Per-operation totals for the recent and all-time windows
#[derive(Debug, Clone, PartialEq)]
pub struct OperationStats {
    pub operation: String,
    pub recent: UsageTotals,
    pub all_time: UsageTotals,
}

/// Usage report for a community or conversation
#[derive(Debug, Clone, PartialEq)]
pub struct UsageReport {
    pub operations: Vec<OperationStats>,
}

impl UsageReport {
    /// Stats for one operation
    #[must_use]
    pub fn operation(&self, name: &str) -> Option<&OperationStats> {
        self.operations.iter().find(|op| op.operation == name)
    }
}

impl fmt::Display for UsageReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{:<12} {:>8} {:>10} {:>10}   {:>8} {:>10} {:>10}",
            "operation", "7d calls", "7d tokens", "7d cost", "calls", "tokens", "cost"
        )?;
        for op in &self.operations {
            writeln!(
                f,
                "{:<12} {:>8} {:>10} {:>10.4}   {:>8} {:>10} {:>10.4}",
                op.operation,
                op.recent.calls,
                op.recent.tokens,
                op.recent.cost,
                op.all_time.calls,
                op.all_time.tokens,
                op.all_time.cost,
            )?;
        }
        Ok(())
    }
}

/// Usage ledger repository
#[derive(Clone)]
pub struct UsageRepo {
    pool: DbPool,
    prices: Arc<PriceTable>,
}

impl UsageRepo {
    /// Create a new usage repository
    #[must_use]
    #[allow(clippy::missing_const_for_fn)]
    pub fn new(pool: DbPool, prices: Arc<PriceTable>) -> Self {
        Self { pool, prices }
    }

    /// Append a usage record, returning the cost stored
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn log_usage(&self, entry: &UsageEntry<'_>) -> Result<f64> {
        let cost = entry.cost.unwrap_or_else(|| {
            self.prices
                .cost(entry.model, entry.input_tokens, entry.output_tokens)
        });

        let conn = super::conn(&self.pool)?;
        conn.execute(
            "INSERT INTO usage_log
                (conversation_id, community_id, operation, input_tokens, output_tokens, cost, model, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                entry.conversation_id,
                entry.community_id,
                entry.operation,
                i64::try_from(entry.input_tokens).unwrap_or(i64::MAX),
                i64::try_from(entry.output_tokens).unwrap_or(i64::MAX),
                cost,
                entry.model,
                super::format_datetime(Utc::now()),
            ],
        )?;

        Ok(cost)
    }

    /// Per-operation totals for the last 7 days and all time
    ///
    /// Every operation in [`KNOWN_OPERATIONS`] is present even with no calls;
    /// other recorded operations follow alphabetically.
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn stats(&self, community_id: &str, conversation_id: Option<&str>) -> Result<UsageReport> {
        let cutoff = super::format_datetime(Utc::now() - Duration::days(RECENT_WINDOW_DAYS));
        let recent = self.totals(community_id, conversation_id, &cutoff)?;
        let all_time = self.totals(community_id, conversation_id, "")?;

        let mut operations: Vec<OperationStats> = KNOWN_OPERATIONS
            .iter()
            .map(|name| OperationStats {
                operation: (*name).to_string(),
                recent: UsageTotals::default(),
                all_time: UsageTotals::default(),
            })
            .collect();

        for (name, totals) in all_time {
            let index = if let Some(index) = operations.iter().position(|op| op.operation == name) {
                index
            } else {
                operations.push(OperationStats {
                    operation: name.clone(),
                    recent: UsageTotals::default(),
                    all_time: UsageTotals::default(),
                });
                operations.len() - 1
            };
            operations[index].all_time = totals;
            operations[index].recent = recent.get(&name).copied().unwrap_or_default();
        }

        Ok(UsageReport { operations })
    }

    fn totals(
        &self,
        community_id: &str,
        conversation_id: Option<&str>,
        since: &str,
    ) -> Result<BTreeMap<String, UsageTotals>> {
        let conn = super::conn(&self.pool)?;

        let mut stmt = conn.prepare(
            "SELECT operation, COUNT(*), COALESCE(SUM(input_tokens + output_tokens), 0), COALESCE(SUM(cost), 0.0)
             FROM usage_log
             WHERE community_id = ?1
               AND (?2 IS NULL OR conversation_id = ?2)
               AND created_at >= ?3
             GROUP BY operation",
        )?;

        let rows = stmt
            .query_map(params![community_id, conversation_id, since], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    UsageTotals {
                        calls: u64::try_from(row.get::<_, i64>(1)?).unwrap_or(0),
                        tokens: u64::try_from(row.get::<_, i64>(2)?).unwrap_or(0),
                        cost: row.get(3)?,
                    },
                ))
            })?
            .collect::<std::result::Result<BTreeMap<_, _>, _>>()?;

        Ok(rows)
    }
}
