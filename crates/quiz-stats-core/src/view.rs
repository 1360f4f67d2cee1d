//! Update protocol for the per-identity aggregate view.
//!
//! The view is an additive summary of the session log. Incremental upserts
//! go through [`merge_delta`]; [`rebuild_rows`] recomputes the whole view from
//! the log and is the reconciliation path when incremental updates were lost
//! or raced.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{AggregateRow, Identity, SessionRecord};

pub const VIEW_CHECK_CONTRACT_VERSION: &str = "view_check.v1";

/// What one appended session contributes to its identity's view row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViewDelta {
    pub is_public: bool,
    pub correct_count: u32,
    pub total_count: u32,
    /// When `None` the upsert time is used.
    pub last_at: Option<i64>,
}

impl ViewDelta {
    #[must_use]
    pub fn from_record(record: &SessionRecord) -> Self {
        Self {
            is_public: record.is_public,
            correct_count: record.correct_count,
            total_count: record.total_count,
            last_at: Some(record.recorded_at),
        }
    }
}

/// Applies `delta` to the existing row for `identity`, or starts a new row.
///
/// Counters are additive; `name`, `is_public` and `last_at` are last-writer
/// values.
#[must_use]
pub fn merge_delta(
    existing: Option<&AggregateRow>,
    identity: &Identity,
    delta: &ViewDelta,
    now_ms: i64,
) -> AggregateRow {
    let correct = u64::from(delta.correct_count);
    let total = u64::from(delta.total_count);
    let last_at = delta.last_at.unwrap_or(now_ms);

    match existing {
        Some(row) => AggregateRow {
            user_key: identity.user_key.clone(),
            name: identity.name.clone(),
            is_public: delta.is_public,
            exp: row.exp.saturating_add(correct),
            total_correct: row.total_correct.saturating_add(correct),
            total_questions: row.total_questions.saturating_add(total),
            sess: row.sess.saturating_add(1),
            last_at,
            updated_at: now_ms,
        },
        None => AggregateRow {
            user_key: identity.user_key.clone(),
            name: identity.name.clone(),
            is_public: delta.is_public,
            exp: correct,
            total_correct: correct,
            total_questions: total,
            sess: 1,
            last_at,
            updated_at: now_ms,
        },
    }
}

struct RebuildAccumulator {
    row: AggregateRow,
    newest: (i64, i64),
}

/// Recomputes every view row from the full session log.
///
/// Display fields come from each identity's newest record by
/// `(recorded_at, seq)`. Rows are ordered by identity.
#[must_use]
pub fn rebuild_rows(records: &[SessionRecord], now_ms: i64) -> Vec<AggregateRow> {
    let mut grouped: BTreeMap<Identity, RebuildAccumulator> = BTreeMap::new();

    for record in records {
        let correct = u64::from(record.correct_count);
        let total = u64::from(record.total_count);
        let order = (record.recorded_at, record.seq);

        match grouped.get_mut(&record.identity) {
            Some(acc) => {
                acc.row.exp = acc.row.exp.saturating_add(correct);
                acc.row.total_correct = acc.row.total_correct.saturating_add(correct);
                acc.row.total_questions = acc.row.total_questions.saturating_add(total);
                acc.row.sess = acc.row.sess.saturating_add(1);
                if order > acc.newest {
                    acc.newest = order;
                    acc.row.is_public = record.is_public;
                    acc.row.last_at = record.recorded_at;
                }
            }
            None => {
                grouped.insert(
                    record.identity.clone(),
                    RebuildAccumulator {
                        row: AggregateRow {
                            user_key: record.identity.user_key.clone(),
                            name: record.identity.name.clone(),
                            is_public: record.is_public,
                            exp: correct,
                            total_correct: correct,
                            total_questions: total,
                            sess: 1,
                            last_at: record.recorded_at,
                            updated_at: now_ms,
                        },
                        newest: order,
                    },
                );
            }
        }
    }

    grouped.into_values().map(|acc| acc.row).collect()
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum DriftKind {
    /// The log has sessions for an identity the view does not know.
    MissingRow,
    /// The view has a row for an identity with no sessions.
    OrphanRow,
    /// Counters differ from the log totals.
    CounterMismatch,
}

impl DriftKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MissingRow => "missing_row",
            Self::OrphanRow => "orphan_row",
            Self::CounterMismatch => "counter_mismatch",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ViewDrift {
    pub user_key: String,
    pub name: String,
    pub kind: DriftKind,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ViewCheck {
    pub contract_version: String,
    pub healthy: bool,
    pub tracked_identities: usize,
    pub view_rows: usize,
    pub drift: Vec<ViewDrift>,
}

/// Compares the stored view with the rows a rebuild would produce.
///
/// Only the additive counters are compared. `is_public` and `last_at` are
/// last-writer values and legitimately differ from a rebuild when sessions
/// arrive out of `recorded_at` order.
#[must_use]
pub fn diff_view(expected: &[AggregateRow], actual: &[AggregateRow]) -> Vec<ViewDrift> {
    let expected_by_id: BTreeMap<Identity, &AggregateRow> =
        expected.iter().map(|row| (row.identity(), row)).collect();
    let actual_by_id: BTreeMap<Identity, &AggregateRow> =
        actual.iter().map(|row| (row.identity(), row)).collect();

    let mut drift = Vec::new();

    for (identity, want) in &expected_by_id {
        match actual_by_id.get(identity) {
            None => drift.push(ViewDrift {
                user_key: identity.user_key.clone(),
                name: identity.name.clone(),
                kind: DriftKind::MissingRow,
                message: format!("no view row for {} logged sessions", want.sess),
            }),
            Some(have) => {
                let want_counters = counters(want);
                let have_counters = counters(have);
                if want_counters != have_counters {
                    drift.push(ViewDrift {
                        user_key: identity.user_key.clone(),
                        name: identity.name.clone(),
                        kind: DriftKind::CounterMismatch,
                        message: format!(
                            "view (exp, total_correct, total_questions, sess)={have_counters:?} \
                             log={want_counters:?}"
                        ),
                    });
                }
            }
        }
    }

    for (identity, have) in &actual_by_id {
        if !expected_by_id.contains_key(identity) {
            drift.push(ViewDrift {
                user_key: identity.user_key.clone(),
                name: identity.name.clone(),
                kind: DriftKind::OrphanRow,
                message: format!("view row with sess={} has no logged sessions", have.sess),
            });
        }
    }

    drift.sort_by(|lhs, rhs| {
        (&lhs.user_key, &lhs.name, lhs.kind).cmp(&(&rhs.user_key, &rhs.name, rhs.kind))
    });
    drift
}

/// Builds a [`ViewCheck`] from the full log and the stored view rows.
#[must_use]
pub fn check_rows(records: &[SessionRecord], actual: &[AggregateRow]) -> ViewCheck {
    let expected = rebuild_rows(records, 0);
    let drift = diff_view(&expected, actual);

    ViewCheck {
        contract_version: VIEW_CHECK_CONTRACT_VERSION.to_string(),
        healthy: drift.is_empty(),
        tracked_identities: expected.len(),
        view_rows: actual.len(),
        drift,
    }
}

fn counters(row: &AggregateRow) -> (u64, u64, u64, u64) {
    (row.exp, row.total_correct, row.total_questions, row.sess)
}
