//! Engine-wide playback state and its transition table.

use std::fmt;

/// Playback state of the engine. Exactly one is active at any instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlaybackState {
    #[default]
    Idle,
    Loading,
    Playing,
    Paused,
    /// Playing while the mixer blends two decks.
    Crossfading,
    Stopped,
    Error,
}

/// Events that drive [`PlaybackState`] transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// A track is being opened on the active deck.
    Load,
    /// The active deck finished priming. `play_pending` resumes playback.
    Primed { play_pending: bool },
    /// Opening failed. `track_loaded` tells whether another track remains cued.
    LoadFailed { track_loaded: bool },
    Play,
    Pause,
    Stop,
    /// The last track ended with nothing queued.
    Finished,
    /// Unrecoverable failure (device loss, persistent underruns).
    Fault,
    Unload,
}

impl PlaybackState {
    /// Apply a transition. Returns `None` when the event is not valid in this
    /// state, in which case the state must be left unchanged.
    ///
    /// `Crossfading` behaves like `Playing`; the mixer decides which of the two
    /// is reported.
    pub const fn apply(self, transition: Transition) -> Option<Self> {
        use PlaybackState as S;
        use Transition as T;

        let state = match self {
            S::Crossfading => S::Playing,
            other => other,
        };

        match (state, transition) {
            (_, T::Fault) => Some(S::Error),

            (S::Idle | S::Stopped | S::Paused | S::Playing | S::Error, T::Load) => {
                Some(S::Loading)
            }
            (S::Loading, T::Primed { play_pending: true }) => Some(S::Playing),
            (S::Loading, T::Primed { play_pending: false }) => Some(S::Stopped),
            (S::Loading, T::LoadFailed { track_loaded: true }) => Some(S::Stopped),
            (S::Loading, T::LoadFailed { track_loaded: false }) => Some(S::Idle),

            (S::Loading, T::Play) => Some(S::Loading),
            (S::Stopped | S::Paused, T::Play) => Some(S::Playing),
            (S::Playing, T::Play) => Some(S::Playing),

            (S::Playing | S::Paused, T::Pause) => Some(S::Paused),

            (S::Loading | S::Playing | S::Paused | S::Stopped | S::Error, T::Stop) => {
                Some(S::Stopped)
            }
            (S::Playing, T::Finished) => Some(S::Stopped),

            (S::Stopped | S::Error | S::Paused, T::Unload) => Some(S::Idle),

            _ => None,
        }
    }

    /// True while audio is being produced.
    pub const fn is_audible(self) -> bool {
        matches!(self, Self::Playing | Self::Crossfading)
    }

    /// Compact encoding for lock-free publication.
    pub const fn as_u8(self) -> u8 {
        match self {
            Self::Idle => 0,
            Self::Loading => 1,
            Self::Playing => 2,
            Self::Paused => 3,
            Self::Crossfading => 4,
            Self::Stopped => 5,
            Self::Error => 6,
        }
    }

    /// Inverse of [`PlaybackState::as_u8`]; unknown values decode as `Error`.
    pub const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Idle,
            1 => Self::Loading,
            2 => Self::Playing,
            3 => Self::Paused,
            4 => Self::Crossfading,
            5 => Self::Stopped,
            _ => Self::Error,
        }
    }
}

impl fmt::Display for PlaybackState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Loading => "loading",
            Self::Playing => "playing",
            Self::Paused => "paused",
            Self::Crossfading => "crossfading",
            Self::Stopped => "stopped",
            Self::Error => "error",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const ALL_STATES: [PlaybackState; 7] = [
        PlaybackState::Idle,
        PlaybackState::Loading,
        PlaybackState::Playing,
        PlaybackState::Paused,
        PlaybackState::Crossfading,
        PlaybackState::Stopped,
        PlaybackState::Error,
    ];

    #[test]
    fn test_default_is_idle() {
        assert_eq!(PlaybackState::default(), PlaybackState::Idle);
    }

    #[test]
    fn test_load_play_pause_cycle() {
        let state = PlaybackState::Idle;
        let state = state.apply(Transition::Load).unwrap_or(state);
        assert_eq!(state, PlaybackState::Loading);
        let state = state
            .apply(Transition::Primed {
                play_pending: false,
            })
            .unwrap_or(state);
        assert_eq!(state, PlaybackState::Stopped);
        let state = state.apply(Transition::Play).unwrap_or(state);
        assert_eq!(state, PlaybackState::Playing);
        let state = state.apply(Transition::Pause).unwrap_or(state);
        assert_eq!(state, PlaybackState::Paused);
        let state = state.apply(Transition::Play).unwrap_or(state);
        assert_eq!(state, PlaybackState::Playing);
    }

    #[test]
    fn test_pause_is_idempotent() {
        assert_eq!(
            PlaybackState::Paused.apply(Transition::Pause),
            Some(PlaybackState::Paused)
        );
    }

    #[test]
    fn test_illegal_transitions_rejected() {
        assert_eq!(PlaybackState::Idle.apply(Transition::Play), None);
        assert_eq!(PlaybackState::Idle.apply(Transition::Pause), None);
        assert_eq!(PlaybackState::Stopped.apply(Transition::Pause), None);
        assert_eq!(PlaybackState::Playing.apply(Transition::Unload), None);
        assert_eq!(PlaybackState::Idle.apply(Transition::Unload), None);
        assert_eq!(
            PlaybackState::Playing.apply(Transition::Primed { play_pending: true }),
            None
        );
    }

    #[test]
    fn test_crossfading_acts_like_playing() {
        assert_eq!(
            PlaybackState::Crossfading.apply(Transition::Pause),
            Some(PlaybackState::Paused)
        );
        assert_eq!(
            PlaybackState::Crossfading.apply(Transition::Finished),
            Some(PlaybackState::Stopped)
        );
    }

    #[test]
    fn test_load_failure_fallbacks() {
        assert_eq!(
            PlaybackState::Loading.apply(Transition::LoadFailed {
                track_loaded: false
            }),
            Some(PlaybackState::Idle)
        );
        assert_eq!(
            PlaybackState::Loading.apply(Transition::LoadFailed { track_loaded: true }),
            Some(PlaybackState::Stopped)
        );
    }

    #[test]
    fn test_u8_roundtrip_covers_all_states() {
        for state in ALL_STATES {
            assert_eq!(PlaybackState::from_u8(state.as_u8()), state);
        }
    }

    proptest! {
        #[test]
        fn fault_always_reaches_error(index in 0usize..7) {
            let state = ALL_STATES[index];
            prop_assert_eq!(state.apply(Transition::Fault), Some(PlaybackState::Error));
        }

        #[test]
        fn transitions_never_produce_crossfading(index in 0usize..7, event in 0usize..9) {
            let events = [
                Transition::Load,
                Transition::Primed { play_pending: true },
                Transition::LoadFailed { track_loaded: false },
                Transition::Play,
                Transition::Pause,
                Transition::Stop,
                Transition::Finished,
                Transition::Fault,
                Transition::Unload,
            ];
            let next = ALL_STATES[index].apply(events[event]);
            prop_assert_ne!(next, Some(PlaybackState::Crossfading));
        }
    }
}
