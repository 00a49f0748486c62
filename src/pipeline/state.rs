use std::fmt;

use crate::error::{Result, ZslError};

/// Lifecycle of a ZSL capture session.
///
/// ```text
/// INVALID -> CONFIGURED -> IDLE <-> CAPTURING
///    ^__________________________________|  release()
/// ```
///
/// Frames and metadata are only accepted while `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CaptureState {
    #[default]
    Invalid,
    Configured,
    Idle,
    Capturing,
}

impl CaptureState {
    pub fn accepts_frames(self) -> bool {
        self == CaptureState::Idle
    }

    /// Guard for public capture operations: idle, or re-entry while already capturing.
    pub fn ensure_capturable(self) -> Result<()> {
        match self {
            CaptureState::Idle | CaptureState::Capturing => Ok(()),
            CaptureState::Invalid => Err(ZslError::Uninitialized),
            CaptureState::Configured => Err(ZslError::InternalState(
                "stream configured but not started".into(),
            )),
        }
    }

    pub fn on_setup(self) -> Result<Self> {
        match self {
            CaptureState::Invalid | CaptureState::Configured => Ok(CaptureState::Configured),
            other => Err(ZslError::InternalState(format!(
                "cannot reconfigure while {other}"
            ))),
        }
    }

    pub fn on_start(self) -> Result<Self> {
        match self {
            CaptureState::Configured => Ok(CaptureState::Idle),
            CaptureState::Invalid => Err(ZslError::Uninitialized),
            other => Err(ZslError::InternalState(format!("already started ({other})"))),
        }
    }

    /// A frame was dispatched or the pipeline was explicitly suspended.
    pub fn on_capture(self) -> Result<Self> {
        self.ensure_capturable()?;
        Ok(CaptureState::Capturing)
    }

    pub fn on_flush(self) -> Result<Self> {
        match self {
            CaptureState::Invalid => Err(ZslError::Uninitialized),
            CaptureState::Configured => Ok(CaptureState::Configured),
            CaptureState::Idle | CaptureState::Capturing => Ok(CaptureState::Idle),
        }
    }
}

impl fmt::Display for CaptureState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CaptureState::Invalid => "INVALID",
            CaptureState::Configured => "CONFIGURED",
            CaptureState::Idle => "IDLE",
            CaptureState::Capturing => "CAPTURING",
        };
        f.write_str(name)
    }
}
