use std::iter;

use crate::{Identity, SessionRecord, StatsSnapshot};

/// Number of most recent sessions (including the current one) in `tenAve`.
pub const ROLLING_WINDOW: usize = 10;
pub const EXP_PER_LEVEL: u64 = 100;

/// The fields of a new submission the aggregator needs.
///
/// `accuracy` and `date` only matter on a cold start (no prior history).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CurrentSubmission {
    pub correct_count: u32,
    pub total_count: u32,
    pub accuracy: Option<f64>,
    pub date: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Aggregation {
    pub snapshot: StatsSnapshot,
    /// Set when the history could not be used and the submission was scored
    /// as a first session.
    pub degraded: bool,
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
enum AggregationFault {
    #[error("history mixes identities {expected} and {found}")]
    MixedIdentities { expected: Identity, found: Identity },
    #[error("history record seq={seq} has correct_count > total_count")]
    InconsistentCounts { seq: i64 },
    #[error("counter overflow while summing history")]
    Overflow,
}

#[must_use]
pub fn level_for(exp: u64) -> u64 {
    exp / EXP_PER_LEVEL + 1
}

#[must_use]
pub fn is_perfect(correct_count: u32, total_count: u32) -> bool {
    total_count > 0 && correct_count == total_count
}

/// Computes the stats snapshot for `current` given the identity's prior
/// `history`, in any order.
///
/// Never fails: a history that cannot be aggregated is logged and the
/// submission is scored as the identity's first session instead.
#[must_use]
pub fn aggregate(
    history: &[SessionRecord],
    current: &CurrentSubmission,
    today: &str,
) -> Aggregation {
    match try_aggregate(history, current, today) {
        Ok(snapshot) => Aggregation {
            snapshot,
            degraded: false,
        },
        Err(fault) => {
            tracing::warn!(
                %fault,
                history_len = history.len(),
                "aggregation degraded; scoring submission as a first session"
            );
            Aggregation {
                snapshot: first_session(current, today),
                degraded: true,
            }
        }
    }
}

/// Snapshot for an identity with no usable history.
///
/// A missing `accuracy` is taken as 0 rather than derived from the counts,
/// and only an accuracy of exactly 1.0 opens a streak.
#[must_use]
#[allow(clippy::float_cmp)]
pub fn first_session(current: &CurrentSubmission, today: &str) -> StatsSnapshot {
    let exp = u64::from(current.correct_count);
    let accuracy = current.accuracy.unwrap_or(0.0);
    let streak = u32::from(current.accuracy == Some(1.0));

    StatsSnapshot {
        exp,
        level: level_for(exp),
        ten_ave: accuracy,
        all_ave: accuracy,
        sess: 1,
        cst: streak,
        mst: streak,
        last: last_activity(current, today),
    }
}

fn try_aggregate(
    history: &[SessionRecord],
    current: &CurrentSubmission,
    today: &str,
) -> Result<StatsSnapshot, AggregationFault> {
    let Some(first) = history.first() else {
        return Ok(first_session(current, today));
    };

    for record in history {
        if record.identity != first.identity {
            return Err(AggregationFault::MixedIdentities {
                expected: first.identity.clone(),
                found: record.identity.clone(),
            });
        }
        if record.correct_count > record.total_count {
            return Err(AggregationFault::InconsistentCounts { seq: record.seq });
        }
    }

    let mut ordered: Vec<&SessionRecord> = history.iter().collect();
    ordered.sort_by_key(|record| (record.recorded_at, record.seq));

    let tallies: Vec<(u32, u32)> = ordered
        .iter()
        .map(|record| (record.correct_count, record.total_count))
        .chain(iter::once((current.correct_count, current.total_count)))
        .collect();

    let (total_correct, total_questions) = sum_tallies(&tallies)?;
    let window_start = tallies.len().saturating_sub(ROLLING_WINDOW);
    let (window_correct, window_questions) = sum_tallies(&tallies[window_start..])?;

    let sess = u64::try_from(history.len())
        .ok()
        .and_then(|count| count.checked_add(1))
        .ok_or(AggregationFault::Overflow)?;

    let streaks = scan_streaks(&ordered);
    let (cst, mst) = if is_perfect(current.correct_count, current.total_count) {
        let cst = streaks
            .carried
            .checked_add(1)
            .ok_or(AggregationFault::Overflow)?;
        (cst, streaks.longest.max(cst))
    } else {
        (0, streaks.longest)
    };

    Ok(StatsSnapshot {
        exp: total_correct,
        level: level_for(total_correct),
        ten_ave: ratio(window_correct, window_questions),
        all_ave: ratio(total_correct, total_questions),
        sess,
        cst,
        mst,
        last: last_activity(current, today),
    })
}

struct StreakScan {
    /// Perfect sessions contiguous with the newest one.
    carried: u32,
    longest: u32,
}

fn scan_streaks(ascending: &[&SessionRecord]) -> StreakScan {
    let mut carried = 0_u32;
    let mut carrying = true;
    let mut run = 0_u32;
    let mut longest = 0_u32;

    for record in ascending.iter().rev() {
        if is_perfect(record.correct_count, record.total_count) {
            run = run.saturating_add(1);
            longest = longest.max(run);
            if carrying {
                carried = run;
            }
        } else {
            run = 0;
            carrying = false;
        }
    }

    StreakScan { carried, longest }
}

fn sum_tallies(tallies: &[(u32, u32)]) -> Result<(u64, u64), AggregationFault> {
    tallies
        .iter()
        .try_fold((0_u64, 0_u64), |(correct, total), (c, t)| {
            Some((
                correct.checked_add(u64::from(*c))?,
                total.checked_add(u64::from(*t))?,
            ))
        })
        .ok_or(AggregationFault::Overflow)
}

#[allow(clippy::cast_precision_loss)]
fn ratio(correct: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    correct as f64 / total as f64
}

fn last_activity(current: &CurrentSubmission, today: &str) -> String {
    current
        .date
        .clone()
        .unwrap_or_else(|| today.to_string())
}
