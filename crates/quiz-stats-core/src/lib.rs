//! Session aggregation engine for quiz results.
//!
//! One quiz-session result per interaction is appended to an append-only
//! session log; each append carries a [`StatsSnapshot`] computed from the
//! identity's prior history, and a per-identity [`AggregateRow`] view is
//! additively maintained next to the log. The view can always be recomputed
//! from the log with [`rebuild_view`].
//!
//! Storage is injected through the [`SessionLog`] and [`AggregateView`]
//! traits. [`InMemoryStore`] implements both for hosts and tests; the SQLite
//! adapter lives in `quiz-stats-store-sqlite`.

#![allow(clippy::missing_errors_doc)]

use serde::{Deserialize, Serialize};
use time::{OffsetDateTime, UtcOffset};

pub mod aggregate;
pub mod identity;
pub mod ingest;
pub mod memory;
pub mod store;
pub mod view;

pub use aggregate::{
    aggregate, first_session, is_perfect, level_for, Aggregation, CurrentSubmission,
    EXP_PER_LEVEL, ROLLING_WINDOW,
};
pub use identity::Identity;
pub use ingest::{
    aggregate_stats, check_view, ingest, rebuild_view, session_log, submit_session,
    IngestReceipt, IngestSettings, RebuildReport, SubmissionPayload, SubmitResponse,
};
pub use memory::InMemoryStore;
pub use store::{AggregateView, SessionLog};
pub use view::{
    check_rows, diff_view, merge_delta, rebuild_rows, DriftKind, ViewCheck, ViewDelta, ViewDrift,
    VIEW_CHECK_CONTRACT_VERSION,
};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum IngestError {
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),
    #[error("write conflict: {0}")]
    WriteConflict(String),
}

/// Failure reported by a storage adapter.
///
/// `Corrupt` means the store was reachable but returned rows that cannot be
/// decoded; the coordinator treats that as unreadable history rather than an
/// outage.
#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum StoreError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("write conflict: {0}")]
    WriteConflict(String),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

impl From<StoreError> for IngestError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::Unavailable(message) | StoreError::Corrupt(message) => {
                Self::StorageUnavailable(message)
            }
            StoreError::WriteConflict(message) => Self::WriteConflict(message),
        }
    }
}

/// Derived statistics embedded in every session record.
///
/// Field names on the wire follow the legacy log columns.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatsSnapshot {
    #[serde(rename = "EXP")]
    pub exp: u64,
    #[serde(rename = "LV")]
    pub level: u64,
    #[serde(rename = "tenAve")]
    pub ten_ave: f64,
    #[serde(rename = "allAve")]
    pub all_ave: f64,
    pub sess: u64,
    pub cst: u32,
    pub mst: u32,
    pub last: String,
}

/// A session record before the log has assigned it a sequence number.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionInput {
    #[serde(flatten)]
    pub identity: Identity,
    pub mode: String,
    #[serde(flatten)]
    pub snapshot: StatsSnapshot,
    pub is_public: bool,
    pub recorded_at: i64,
    pub correct_count: u32,
    pub total_count: u32,
    pub display_timestamp: String,
}

impl SessionInput {
    #[must_use]
    pub fn into_record(self, seq: i64) -> SessionRecord {
        SessionRecord {
            seq,
            identity: self.identity,
            mode: self.mode,
            snapshot: self.snapshot,
            is_public: self.is_public,
            recorded_at: self.recorded_at,
            correct_count: self.correct_count,
            total_count: self.total_count,
            display_timestamp: self.display_timestamp,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub seq: i64,
    #[serde(flatten)]
    pub identity: Identity,
    pub mode: String,
    #[serde(flatten)]
    pub snapshot: StatsSnapshot,
    pub is_public: bool,
    pub recorded_at: i64,
    pub correct_count: u32,
    pub total_count: u32,
    pub display_timestamp: String,
}

/// One row of the per-identity materialized view.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AggregateRow {
    pub user_key: String,
    pub name: String,
    pub is_public: bool,
    pub exp: u64,
    pub total_correct: u64,
    pub total_questions: u64,
    pub sess: u64,
    pub last_at: i64,
    pub updated_at: i64,
}

impl AggregateRow {
    #[must_use]
    pub fn identity(&self) -> Identity {
        Identity::new(&self.user_key, &self.name)
    }
}

/// Milliseconds since the Unix epoch.
#[must_use]
pub fn unix_millis(value: OffsetDateTime) -> i64 {
    i64::try_from(value.unix_timestamp_nanos() / 1_000_000).unwrap_or(i64::MAX)
}

/// Converts epoch milliseconds into a UTC timestamp.
///
/// # Errors
/// Returns [`IngestError::InvalidPayload`] when the value is outside the
/// range `time` can represent.
pub fn datetime_from_millis(millis: i64) -> Result<OffsetDateTime, IngestError> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(millis) * 1_000_000).map_err(|err| {
        IngestError::InvalidPayload(format!("timestamp {millis} is out of range: {err}"))
    })
}

/// Formats `YYYY/MM/DD HH:MM` in the given offset.
#[must_use]
pub fn format_display_timestamp(value: OffsetDateTime, offset: UtcOffset) -> String {
    let local = value.to_offset(offset);
    format!(
        "{} {:02}:{:02}",
        format_day(value, offset),
        local.hour(),
        local.minute()
    )
}

/// Formats the calendar day `YYYY/MM/DD` in the given offset.
#[must_use]
pub fn format_day(value: OffsetDateTime, offset: UtcOffset) -> String {
    let local = value.to_offset(offset);
    format!(
        "{:04}/{:02}/{:02}",
        local.year(),
        u8::from(local.month()),
        local.day()
    )
}
