//! Watch-time bookkeeping for one playback session.

use std::time::Duration;

use super::ui::PlaybackStatus;

/// Position drift, in seconds, beyond which a jump counts as a seek.
const SEEK_TOLERANCE: f64 = 3.0;

/// Player transition detected between two polls.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WatchTransition {
    Seeked { from: f64, to: f64 },
    Paused { position: f64 },
    Resumed { position: f64 },
}

/// Playback counters owned by one session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WatchState {
    started: bool,
    paused: bool,
    /// Last reported position, the seek baseline
    position: f64,
    watched_time: f64,
    duration: f64,
}

impl WatchState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds one player poll into the counters.
    ///
    /// `elapsed` is the wall time since the previous poll. Polls taken while
    /// the player is not playing are ignored.
    pub fn observe(&mut self, status: &PlaybackStatus, elapsed: Duration) -> Vec<WatchTransition> {
        let mut transitions = Vec::new();
        if !status.is_playing {
            return transitions;
        }
        if status.duration > 0.0 {
            self.duration = status.duration;
        }

        if !self.started {
            self.started = true;
            self.paused = status.is_paused;
            self.position = status.position;
            self.watched_time = status.position;
            return transitions;
        }

        if status.is_paused != self.paused {
            self.paused = status.is_paused;
            transitions.push(if status.is_paused {
                WatchTransition::Paused {
                    position: status.position,
                }
            } else {
                WatchTransition::Resumed {
                    position: status.position,
                }
            });
        }

        let advance = if status.is_paused {
            0.0
        } else {
            elapsed.as_secs_f64()
        };
        let expected = self.position + advance;
        if (status.position - expected).abs() > SEEK_TOLERANCE + advance {
            transitions.push(WatchTransition::Seeked {
                from: self.position,
                to: status.position,
            });
        }

        self.position = status.position;
        self.watched_time = status.position;
        transitions
    }

    /// Whether more than `ratio` of the content has been watched.
    pub fn is_watched(&self, ratio: f64) -> bool {
        self.duration > 0.0 && self.watched_time / self.duration > ratio
    }

    pub fn watched_time(&self) -> f64 {
        self.watched_time
    }

    pub fn duration(&self) -> f64 {
        self.duration
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn playing(position: f64, paused: bool) -> PlaybackStatus {
        PlaybackStatus {
            is_playing: true,
            is_paused: paused,
            position,
            duration: 100.0,
        }
    }

    const TICK: Duration = Duration::from_secs(1);

    #[test]
    fn test_steady_playback_has_no_transitions() {
        let mut state = WatchState::new();
        for second in 0..10 {
            assert!(state.observe(&playing(second as f64, false), TICK).is_empty());
        }
        assert_eq!(state.watched_time(), 9.0);
        assert_eq!(state.duration(), 100.0);
    }

    #[test]
    fn test_pause_resume_and_seek() {
        let mut state = WatchState::new();
        state.observe(&playing(10.0, false), TICK);

        assert_eq!(
            state.observe(&playing(11.0, true), TICK),
            vec![WatchTransition::Paused { position: 11.0 }]
        );
        assert!(state.observe(&playing(11.0, true), TICK).is_empty());
        assert_eq!(
            state.observe(&playing(11.0, false), TICK),
            vec![WatchTransition::Resumed { position: 11.0 }]
        );
        assert_eq!(
            state.observe(&playing(60.0, false), TICK),
            vec![WatchTransition::Seeked {
                from: 11.0,
                to: 60.0
            }]
        );
        // Baseline moved with the seek.
        assert!(state.observe(&playing(61.0, false), TICK).is_empty());
    }

    #[test]
    fn test_watched_ratio_is_strict() {
        let mut state = WatchState::new();
        state.observe(&playing(90.0, false), TICK);
        assert!(!state.is_watched(0.90));
        state.observe(&playing(91.0, false), TICK);
        assert!(state.is_watched(0.90));
    }

    #[test]
    fn test_stopped_polls_are_ignored() {
        let mut state = WatchState::new();
        state.observe(&playing(50.0, false), TICK);
        let stopped = PlaybackStatus::default();
        assert!(state.observe(&stopped, TICK).is_empty());
        assert_eq!(state.watched_time(), 50.0);
    }
}
