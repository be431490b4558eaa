//! Playback-oriented download state, derived fresh on every query.

use std::fmt;

use crate::engine::PieceStateRun;

/// Display state of a streaming download.
///
/// Only `Queued`, `Checking`, `Buffering`, `Downloading`, `Finished` and
/// `Seeding` come out of [`derive_state`]; the rest exist for engines that
/// report them directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DownloadState {
    Queued,
    Checking,
    Finding,
    Paused,
    Buffering,
    Downloading,
    Finished,
    Seeding,
    Allocating,
    Stalled,
}

impl DownloadState {
    pub fn as_str(self) -> &'static str {
        match self {
            DownloadState::Queued => "Queued",
            DownloadState::Checking => "Checking",
            DownloadState::Finding => "Finding",
            DownloadState::Paused => "Paused",
            DownloadState::Buffering => "Buffering",
            DownloadState::Downloading => "Downloading",
            DownloadState::Finished => "Finished",
            DownloadState::Seeding => "Seeding",
            DownloadState::Allocating => "Allocating",
            DownloadState::Stalled => "Stalled",
        }
    }
}

impl fmt::Display for DownloadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of everything the state derivation looks at.
#[derive(Debug, Clone, Copy)]
pub struct StateInputs<'a> {
    pub is_buffering: bool,
    pub is_seeding: bool,
    pub runs: &'a [PieceStateRun],
    pub bytes_completed: u64,
    pub total_bytes: u64,
}

/// Completion percentage in `[0, 100]`; zero when there is nothing to fetch.
pub fn progress_percent(bytes_completed: u64, total_bytes: u64) -> f64 {
    if total_bytes == 0 {
        return 0.0;
    }
    (bytes_completed as f64 / total_bytes as f64 * 100.0).clamp(0.0, 100.0)
}

/// Derives the display state.
///
/// Buffering dominates everything because it blocks the user. Checking
/// dominates progress because a resumed download re-verifying pieces shows
/// no progress and must not look stalled.
pub fn derive_state(inputs: &StateInputs<'_>) -> DownloadState {
    if inputs.is_buffering {
        return DownloadState::Buffering;
    }

    if inputs
        .runs
        .iter()
        .any(|run| run.length > 0 && run.state.checking)
    {
        return DownloadState::Checking;
    }

    let progress = progress_percent(inputs.bytes_completed, inputs.total_bytes);
    if progress >= 100.0 {
        return if inputs.is_seeding {
            DownloadState::Seeding
        } else {
            DownloadState::Finished
        };
    }
    if progress > 0.0
        && inputs
            .runs
            .iter()
            .any(|run| run.length > 0 && run.state.partial)
    {
        return DownloadState::Downloading;
    }

    // Zero progress, or progress with no piece currently in flight.
    DownloadState::Queued
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::engine::PieceState;

    fn run(length: u32, complete: bool, partial: bool, checking: bool) -> PieceStateRun {
        PieceStateRun {
            length,
            state: PieceState {
                complete,
                partial,
                checking,
            },
        }
    }

    fn inputs(runs: &[PieceStateRun], completed: u64, total: u64) -> StateInputs<'_> {
        StateInputs {
            is_buffering: false,
            is_seeding: false,
            runs,
            bytes_completed: completed,
            total_bytes: total,
        }
    }

    #[test]
    fn test_buffering_has_highest_precedence() {
        let runs = [run(3, false, false, true)];
        let mut state = inputs(&runs, 100, 100);
        state.is_buffering = true;
        state.is_seeding = true;
        assert_eq!(derive_state(&state), DownloadState::Buffering);
    }

    #[test]
    fn test_checking_beats_progress() {
        let runs = [run(5, true, false, false), run(2, false, false, true)];
        assert_eq!(
            derive_state(&inputs(&runs, 50, 100)),
            DownloadState::Checking
        );
    }

    #[test]
    fn test_empty_checking_run_ignored() {
        let runs = [run(0, false, false, true), run(4, false, false, false)];
        assert_eq!(derive_state(&inputs(&runs, 0, 100)), DownloadState::Queued);
    }

    #[test]
    fn test_downloading_requires_partial_run() {
        let partial = [run(1, true, false, false), run(1, false, true, false)];
        assert_eq!(
            derive_state(&inputs(&partial, 40, 100)),
            DownloadState::Downloading
        );

        let idle = [run(1, true, false, false), run(1, false, false, false)];
        assert_eq!(derive_state(&inputs(&idle, 40, 100)), DownloadState::Queued);
    }

    #[test]
    fn test_complete_is_finished_or_seeding() {
        let runs = [run(4, true, false, false)];
        assert_eq!(
            derive_state(&inputs(&runs, 100, 100)),
            DownloadState::Finished
        );

        let mut seeding = inputs(&runs, 100, 100);
        seeding.is_seeding = true;
        assert_eq!(derive_state(&seeding), DownloadState::Seeding);
    }

    #[test]
    fn test_zero_total_progress_is_zero() {
        assert_eq!(progress_percent(0, 0), 0.0);
        assert_eq!(progress_percent(10, 0), 0.0);
        assert_eq!(derive_state(&inputs(&[], 0, 0)), DownloadState::Queued);
    }

    proptest! {
        #[test]
        fn prop_progress_in_bounds(completed in any::<u64>(), total in any::<u64>()) {
            let progress = progress_percent(completed, total);
            prop_assert!((0.0..=100.0).contains(&progress));
        }

        #[test]
        fn prop_buffering_always_wins(checking in any::<bool>(), seeding in any::<bool>(), completed in 0u64..200) {
            let runs = [run(2, false, false, checking)];
            let state = StateInputs {
                is_buffering: true,
                is_seeding: seeding,
                runs: &runs,
                bytes_completed: completed,
                total_bytes: 100,
            };
            prop_assert_eq!(derive_state(&state), DownloadState::Buffering);
        }
    }
}
