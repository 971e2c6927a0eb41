//! Shared, read-mostly view of the backup job for the status endpoints.

use crate::pipeline::stats::{StatsHandle, StatsSnapshot};
use serde::Serialize;
use std::sync::{Arc, PoisonError, RwLock};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPhase {
    #[default]
    Starting,
    Running,
    Succeeded,
    Failed,
}

/// Outcome of one mirrored pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PairSummary {
    pub name: String,
    pub passes: u32,
    pub uploaded: u64,
    pub skipped: usize,
    pub failed_keys: usize,
    pub success: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CurrentRun {
    pub pair: String,
    pub pass: u32,
    pub stats: StatsSnapshot,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusView {
    pub phase: JobPhase,
    pub current: Option<CurrentRun>,
    pub completed: Vec<PairSummary>,
}

impl StatusView {
    /// Nothing has run yet.
    pub fn is_empty(&self) -> bool {
        self.current.is_none() && self.completed.is_empty()
    }
}

#[derive(Default)]
struct BoardState {
    phase: JobPhase,
    current: Option<(String, u32, StatsHandle)>,
    completed: Vec<PairSummary>,
}

#[derive(Clone, Default)]
pub struct StatusBoard {
    inner: Arc<RwLock<BoardState>>,
}

impl StatusBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_phase(&self, phase: JobPhase) {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .phase = phase;
    }

    pub fn phase(&self) -> JobPhase {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .phase
    }

    pub fn run_started(&self, pair: &str, pass: u32, stats: StatsHandle) {
        let mut state = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        state.phase = JobPhase::Running;
        state.current = Some((pair.to_string(), pass, stats));
    }

    pub fn pair_finished(&self, summary: PairSummary) {
        let mut state = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        state.current = None;
        state.completed.push(summary);
    }

    pub fn view(&self) -> StatusView {
        let state = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        StatusView {
            phase: state.phase,
            current: state.current.as_ref().map(|(pair, pass, stats)| CurrentRun {
                pair: pair.clone(),
                pass: *pass,
                stats: stats.snapshot(),
            }),
            completed: state.completed.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracks_runs_and_pairs() {
        let board = StatusBoard::new();
        assert!(board.view().is_empty());
        assert_eq!(board.phase(), JobPhase::Starting);

        board.run_started("team-a/uploads", 1, StatsHandle::default());
        let view = board.view();
        assert_eq!(view.phase, JobPhase::Running);
        assert_eq!(view.current.unwrap().pair, "team-a/uploads");

        board.pair_finished(PairSummary {
            name: "team-a/uploads".into(),
            passes: 1,
            uploaded: 3,
            skipped: 0,
            failed_keys: 0,
            success: true,
            error: None,
        });
        let view = board.view();
        assert!(view.current.is_none());
        assert_eq!(view.completed.len(), 1);
    }
}
