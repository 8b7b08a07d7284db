use thiserror::Error;

#[derive(Error, Debug)]
pub enum RhdError {
    #[error("No acquisition board found: {0}")]
    DeviceNotFound(String),

    #[error("Bitstream upload failed: {0}")]
    UploadFailed(String),

    #[error("Register write failed at endpoint {addr:#04x}: {msg}")]
    RegisterWriteFailed { addr: u8, msg: String },

    #[error("Device unreachable: {0}")]
    DeviceUnreachable(String),

    #[error("Acquisition not ready: {0}")]
    NotReady(String),

    #[error("Impedance test frequency {0} Hz is not achievable at the current sample rate")]
    InvalidFrequency(f64),

    #[error("Impedance test invalidated by a configuration change")]
    ImpedanceInvalidated,

    #[error("Impedance measurement of chip channel {channel} got {loaded} of {expected} data blocks")]
    ImpedanceUnderrun { channel: usize, loaded: usize, expected: usize },

    #[error("Corrupt data block: {0}")]
    CorruptBlock(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Channel not found: {0}")]
    ChannelNotFound(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Config error: {0}")]
    ConfigError(#[from] serde_json::Error),
}

impl RhdError {
    /// Fatal errors end this component instance and must be surfaced to the host.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RhdError::DeviceNotFound(_) | RhdError::UploadFailed(_) | RhdError::DeviceUnreachable(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, RhdError>;
