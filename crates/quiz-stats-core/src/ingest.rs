//! Ingestion coordinator and the logical operations built on it.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::{OffsetDateTime, UtcOffset};

use crate::aggregate::{aggregate, CurrentSubmission};
use crate::store::{AggregateView, SessionLog};
use crate::view::{check_rows, rebuild_rows, ViewCheck, ViewDelta};
use crate::{
    datetime_from_millis, format_day, format_display_timestamp, unix_millis, AggregateRow,
    Identity, IngestError, SessionInput, SessionRecord, StatsSnapshot, StoreError,
};

/// Raw submission as received from a client.
///
/// Identity fields accept any JSON value and are coerced by
/// [`Identity::resolve`]. Everything else is typed; a type mismatch is an
/// invalid payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionPayload {
    #[serde(default)]
    pub display_name: Option<Value>,
    #[serde(default)]
    pub user_key: Option<Value>,
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub correct_count: Option<u32>,
    #[serde(default)]
    pub total_count: Option<u32>,
    #[serde(default)]
    pub is_public: Option<bool>,
    /// Client time in milliseconds since the epoch; defaults to ingest time.
    #[serde(default)]
    pub timestamp: Option<i64>,
    #[serde(default)]
    pub accuracy: Option<f64>,
    #[serde(default)]
    pub date: Option<String>,
}

impl SubmissionPayload {
    pub fn from_json(value: &Value) -> Result<Self, IngestError> {
        serde_json::from_value(value.clone())
            .map_err(|err| IngestError::InvalidPayload(err.to_string()))
    }

    pub fn from_json_str(raw: &str) -> Result<Self, IngestError> {
        serde_json::from_str(raw).map_err(|err| IngestError::InvalidPayload(err.to_string()))
    }

    /// Checks the fields the aggregator relies on and returns
    /// `(correct_count, total_count)`.
    pub fn validate(&self) -> Result<(u32, u32), IngestError> {
        let correct = self
            .correct_count
            .ok_or_else(|| IngestError::InvalidPayload("correctCount is required".to_string()))?;
        let total = self
            .total_count
            .ok_or_else(|| IngestError::InvalidPayload("totalCount is required".to_string()))?;

        if correct > total {
            return Err(IngestError::InvalidPayload(format!(
                "correctCount {correct} exceeds totalCount {total}"
            )));
        }

        if let Some(accuracy) = self.accuracy {
            if !accuracy.is_finite() || !(0.0..=1.0).contains(&accuracy) {
                return Err(IngestError::InvalidPayload(format!(
                    "accuracy must be within [0, 1], got {accuracy}"
                )));
            }
        }

        if let Some(timestamp) = self.timestamp {
            datetime_from_millis(timestamp)?;
        }

        Ok((correct, total))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestSettings {
    /// Offset used for the `last` day and the display timestamp.
    pub display_offset: UtcOffset,
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            display_offset: UtcOffset::UTC,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IngestReceipt {
    pub record: SessionRecord,
    /// History could not be used and the snapshot was computed as a first
    /// session.
    pub degraded: bool,
    /// The view upsert succeeded. When false the view lags the log until the
    /// next rebuild.
    pub view_synced: bool,
}

impl IngestReceipt {
    #[must_use]
    pub fn snapshot(&self) -> &StatsSnapshot {
        &self.record.snapshot
    }
}

/// Ingests one submission: validate, read history, aggregate, append to the
/// log, then upsert the view.
///
/// The log append is the durable step. A failed view upsert is logged and
/// reported through [`IngestReceipt::view_synced`]; it never fails the call or
/// undoes the append.
///
/// # Errors
/// - [`IngestError::InvalidPayload`] before any storage access.
/// - [`IngestError::StorageUnavailable`] when history cannot be read or the
///   log rejects the append.
/// - [`IngestError::WriteConflict`] when the append loses a write race.
pub fn ingest<S>(
    store: &mut S,
    payload: &SubmissionPayload,
    settings: &IngestSettings,
    now: OffsetDateTime,
) -> Result<IngestReceipt, IngestError>
where
    S: SessionLog + AggregateView,
{
    let (correct_count, total_count) = payload.validate()?;
    let recorded_at = payload.timestamp.unwrap_or_else(|| unix_millis(now));
    let recorded = datetime_from_millis(recorded_at)?;
    let identity = Identity::resolve(payload.user_key.as_ref(), payload.display_name.as_ref());

    let (history, history_unreadable) = match store.history_for(&identity) {
        Ok(history) => (history, false),
        Err(StoreError::Corrupt(message)) => {
            tracing::warn!(%identity, %message, "session history unreadable");
            (Vec::new(), true)
        }
        Err(StoreError::Unavailable(message) | StoreError::WriteConflict(message)) => {
            return Err(IngestError::StorageUnavailable(message));
        }
    };

    let current = CurrentSubmission {
        correct_count,
        total_count,
        accuracy: payload.accuracy,
        date: payload.date.clone(),
    };
    let today = format_day(now, settings.display_offset);
    let aggregation = aggregate(&history, &current, &today);
    let degraded = history_unreadable || aggregation.degraded;
    if history_unreadable {
        tracing::warn!(%identity, "aggregation degraded; scoring submission as a first session");
    }

    let input = SessionInput {
        identity,
        mode: payload.mode.clone().unwrap_or_default(),
        snapshot: aggregation.snapshot,
        is_public: payload.is_public.unwrap_or(false),
        recorded_at,
        correct_count,
        total_count,
        display_timestamp: format_display_timestamp(recorded, settings.display_offset),
    };
    let record = store.append(&input)?;

    let view_synced = match store.upsert(
        &record.identity,
        &ViewDelta::from_record(&record),
        unix_millis(now),
    ) {
        Ok(_) => true,
        Err(err) => {
            tracing::error!(
                identity = %record.identity,
                seq = record.seq,
                error = %err,
                "aggregate view upsert failed; session stays logged"
            );
            false
        }
    };

    tracing::info!(
        identity = %record.identity,
        seq = record.seq,
        exp = record.snapshot.exp,
        sess = record.snapshot.sess,
        degraded,
        view_synced,
        "session ingested"
    );

    Ok(IngestReceipt {
        record,
        degraded,
        view_synced,
    })
}

/// Wire response of a submission.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum SubmitResponse {
    Success { success: bool, stats: StatsSnapshot },
    Failure { error: String },
}

impl SubmitResponse {
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

/// [`ingest`] folded into the wire envelope.
pub fn submit_session<S>(
    store: &mut S,
    payload: &SubmissionPayload,
    settings: &IngestSettings,
    now: OffsetDateTime,
) -> SubmitResponse
where
    S: SessionLog + AggregateView,
{
    match ingest(store, payload, settings, now) {
        Ok(receipt) => SubmitResponse::Success {
            success: true,
            stats: receipt.record.snapshot,
        },
        Err(err) => SubmitResponse::Failure {
            error: err.to_string(),
        },
    }
}

/// All aggregate rows ordered by identity. An absent view reads as empty.
pub fn aggregate_stats<S: AggregateView>(store: &S) -> Result<Vec<AggregateRow>, IngestError> {
    Ok(store.rows()?)
}

/// The whole session log in insertion order. An absent log reads as empty.
pub fn session_log<S: SessionLog>(store: &S) -> Result<Vec<SessionRecord>, IngestError> {
    Ok(store.records()?)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RebuildReport {
    pub identities: usize,
    pub processed_records: usize,
}

/// Recomputes the view from the log and replaces it.
pub fn rebuild_view<S>(store: &mut S, now: OffsetDateTime) -> Result<RebuildReport, IngestError>
where
    S: SessionLog + AggregateView,
{
    let records = store.records()?;
    let rows = rebuild_rows(&records, unix_millis(now));
    store.replace_all(&rows)?;

    tracing::info!(
        identities = rows.len(),
        processed_records = records.len(),
        "aggregate view rebuilt"
    );

    Ok(RebuildReport {
        identities: rows.len(),
        processed_records: records.len(),
    })
}

/// Compares the stored view with a rebuild from the log without writing.
pub fn check_view<S>(store: &S) -> Result<ViewCheck, IngestError>
where
    S: SessionLog + AggregateView,
{
    let records = store.records()?;
    let rows = store.rows()?;
    Ok(check_rows(&records, &rows))
}
