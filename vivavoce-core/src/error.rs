use thiserror::Error;

/// All errors produced by vivavoce-core.
#[derive(Debug, Error)]
pub enum VivavoceError {
    #[error("audio device error: {0}")]
    CaptureDevice(String),

    #[error("audio stream error: {0}")]
    CaptureStream(String),

    #[error("no default input device found")]
    NoDefaultInputDevice,

    #[error("detector is already listening")]
    AlreadyListening,

    #[error("calibration collected {collected} samples, need at least {required}")]
    InsufficientCalibrationSamples { collected: usize, required: usize },

    #[error("calibration cancelled")]
    CalibrationCancelled,

    #[error(
        "trim window out of range: start={start_secs:.3}s duration={duration_secs:.3}s \
         source={available_secs:.3}s"
    )]
    TrimWindow {
        start_secs: f64,
        duration_secs: f64,
        available_secs: f64,
    },

    #[error("audio container error: {0}")]
    Container(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, VivavoceError>;
