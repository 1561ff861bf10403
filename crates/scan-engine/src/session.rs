//! Scan session bookkeeping.
//!
//! A session is the unit of work the orchestrator executes: an ordered
//! list of scan points plus the per-point records produced while working
//! through them. Finished sessions are retained read-only; starting a new
//! scan supersedes the old session instead of mutating it.

use scan_core::capabilities::{CaptureResult, LightPattern};
use scan_core::events::SessionStatus;
use scan_core::position::Position;

/// One point in a scan sequence: where to move and how to light it.
#[derive(Debug, Clone)]
pub struct ScanPoint {
    /// Target position for all four axes.
    pub position: Position,
    /// Lighting pattern held while both cameras capture.
    pub pattern: LightPattern,
}

impl ScanPoint {
    /// Point with full illumination on the given zones.
    pub fn lit(position: Position, zones: Vec<u8>) -> Self {
        Self {
            position,
            pattern: LightPattern::full("scan", zones),
        }
    }
}

/// How a point ended up.
#[derive(Debug, Clone)]
pub enum PointOutcome {
    /// Both frames acquired.
    Completed {
        /// Whether the point needed its single retry.
        retried: bool,
    },
    /// Failed even after the retry; recorded and skipped.
    Failed {
        /// Error detail from the final attempt.
        error: String,
    },
}

/// Record of one processed scan point.
#[derive(Debug, Clone)]
pub struct PointRecord {
    /// Zero-based index into the session's point list.
    pub index: usize,
    /// Target position of the point.
    pub target: Position,
    /// Frames acquired at the point; empty for failed points.
    pub captures: Vec<CaptureResult>,
    /// Final outcome.
    pub outcome: PointOutcome,
}

impl PointRecord {
    pub fn succeeded(&self) -> bool {
        matches!(self.outcome, PointOutcome::Completed { .. })
    }
}

/// A scan session: the requested points and everything that happened to
/// them, in submission order.
#[derive(Debug, Clone)]
pub struct ScanSession {
    /// Points in the order they are visited.
    pub points: Vec<ScanPoint>,
    /// Final lifecycle status.
    pub status: SessionStatus,
    /// One record per processed point, in order. Shorter than `points`
    /// when the session was aborted or failed early.
    pub records: Vec<PointRecord>,
}

impl ScanSession {
    pub(crate) fn new(points: Vec<ScanPoint>) -> Self {
        Self {
            points,
            status: SessionStatus::Pending,
            records: Vec::new(),
        }
    }

    /// Aggregate counts for progress reporting.
    pub fn summary(&self) -> SessionSummary {
        let completed = self.records.iter().filter(|r| r.succeeded()).count();
        let retried = self
            .records
            .iter()
            .filter(|r| matches!(r.outcome, PointOutcome::Completed { retried: true }))
            .count();
        SessionSummary {
            status: self.status,
            total: self.points.len(),
            completed,
            retried,
            failed: self.records.len() - completed,
        }
    }
}

/// Aggregate view over a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSummary {
    /// Session lifecycle status at the time of the summary.
    pub status: SessionStatus,
    /// Points requested.
    pub total: usize,
    /// Points with both frames acquired.
    pub completed: usize,
    /// Completed points that needed their retry.
    pub retried: usize,
    /// Points that failed after their retry.
    pub failed: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn completed_record(index: usize, retried: bool) -> PointRecord {
        PointRecord {
            index,
            target: Position::origin(),
            captures: Vec::new(),
            outcome: PointOutcome::Completed { retried },
        }
    }

    #[test]
    fn summary_counts_outcomes() {
        let mut session = ScanSession::new(vec![
            ScanPoint::lit(Position::origin(), vec![0]),
            ScanPoint::lit(Position::origin(), vec![0]),
            ScanPoint::lit(Position::origin(), vec![0]),
        ]);
        session.records.push(completed_record(0, false));
        session.records.push(completed_record(1, true));
        session.records.push(PointRecord {
            index: 2,
            target: Position::origin(),
            captures: Vec::new(),
            outcome: PointOutcome::Failed {
                error: "camera gone".into(),
            },
        });
        session.status = SessionStatus::Completed;

        let summary = session.summary();
        assert_eq!(summary.total, 3);
        assert_eq!(summary.completed, 2);
        assert_eq!(summary.retried, 1);
        assert_eq!(summary.failed, 1);
    }
}
