use std::time::Duration;

/// Capture-side failure taxonomy. None of these are fatal to the session:
/// the scheduler logs and carries on with the next tick.
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("another capture is already mid-flight")]
    CameraBusy,

    #[error("detection cycle did not drain within {0:?}")]
    DrainTimeout(Duration),

    #[error("unknown track id {0}")]
    UnknownTrack(u64),

    #[error("camera failure")]
    Camera(#[source] anyhow::Error),

    #[error("crop failure")]
    Crop(#[source] anyhow::Error),
}
