use std::fmt;

/// How a test talks to the services it exercises.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordingMode {
    /// Live traffic, captured by the proxy.
    Record,
    /// Responses served by the proxy from an earlier recording.
    Playback,
    /// Live traffic that bypasses the proxy entirely.
    LiveUnrecorded,
}

impl RecordingMode {
    pub fn from_flags(live: bool, skip_recording: bool) -> Self {
        match (live, skip_recording) {
            (false, _) => Self::Playback,
            (true, false) => Self::Record,
            (true, true) => Self::LiveUnrecorded,
        }
    }

    pub fn is_live(self) -> bool {
        matches!(self, Self::Record | Self::LiveUnrecorded)
    }

    pub fn is_live_and_not_recording(self) -> bool {
        self == Self::LiveUnrecorded
    }

    /// Value of the `x-recording-mode` header; `None` when the proxy is bypassed.
    pub fn header_value(self) -> Option<&'static str> {
        match self {
            Self::Record => Some("record"),
            Self::Playback => Some("playback"),
            Self::LiveUnrecorded => None,
        }
    }
}

impl fmt::Display for RecordingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Record => "record",
            Self::Playback => "playback",
            Self::LiveUnrecorded => "live",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::RecordingMode;

    #[test]
    fn flags_resolve_to_modes() {
        assert_eq!(RecordingMode::from_flags(false, false), RecordingMode::Playback);
        assert_eq!(RecordingMode::from_flags(false, true), RecordingMode::Playback);
        assert_eq!(RecordingMode::from_flags(true, false), RecordingMode::Record);
        assert_eq!(RecordingMode::from_flags(true, true), RecordingMode::LiveUnrecorded);
    }

    #[test]
    fn oracle_answers_match_mode() {
        assert!(RecordingMode::Record.is_live());
        assert!(!RecordingMode::Record.is_live_and_not_recording());
        assert!(!RecordingMode::Playback.is_live());
        assert!(RecordingMode::LiveUnrecorded.is_live_and_not_recording());
        assert_eq!(RecordingMode::Playback.header_value(), Some("playback"));
        assert_eq!(RecordingMode::LiveUnrecorded.header_value(), None);
    }
}
