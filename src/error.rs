use common::ivc::{
    STATUS_INVALID_ARGS, STATUS_INVALID_CMD, STATUS_INVALID_KEY, STATUS_OK, STATUS_OP_ERROR,
};
use thiserror::Error;

pub const EPERM: i32 = 1;
pub const EIO: i32 = 5;
pub const E2BIG: i32 = 7;
pub const EAGAIN: i32 = 11;
pub const ENOMEM: i32 = 12;
pub const EBUSY: i32 = 16;
pub const ENODEV: i32 = 19;
pub const EINVAL: i32 = 22;
pub const ENOSPC: i32 = 28;
pub const ETIMEDOUT: i32 = 110;
pub const EINPROGRESS: i32 = 115;
pub const EREMOTEIO: i32 = 121;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum VseError {
    #[error("invalid argument")]
    InvalidArgument,
    #[error("request context not initialized")]
    NotInitialized,
    #[error("unsupported digest size {0}")]
    UnsupportedDigest(usize),
    #[error("keyslot {0} out of range")]
    InvalidKeyslot(i64),
    #[error("batch mixes engine {first} and engine {other}")]
    EngineMismatch { first: u32, other: u32 },
    #[error("no key installed")]
    KeyNotSet,
    #[error("out of DMA memory")]
    NoMemory,
    #[error("too many segments: {0} descriptors, limit {1}")]
    TooManySegments(usize, usize),
    #[error("no free pending-operation slot")]
    NoPendingSlot,
    #[error("engine suspended")]
    Suspended,
    #[error("engine not present")]
    NoDevice,
    #[error("timed out waiting for completion")]
    TimedOut,
    #[error("message of {0} bytes exceeds the channel frame")]
    MessageTooLarge(usize),
    #[error("channel did not become ready")]
    ChannelTimeout,
    #[error("channel error {0}")]
    Transport(i32),
    #[error("crypto queue full")]
    QueueFull,
    #[error("engine reported status {0}")]
    Hardware(u32),
}

impl VseError {
    /// The negative errno surfaced to callers.
    pub fn errno(&self) -> i32 {
        match self {
            Self::InvalidArgument
            | Self::NotInitialized
            | Self::UnsupportedDigest(_)
            | Self::InvalidKeyslot(_)
            | Self::EngineMismatch { .. }
            | Self::KeyNotSet => -EINVAL,
            Self::NoMemory | Self::TooManySegments(..) | Self::NoPendingSlot => -ENOMEM,
            Self::Suspended | Self::NoDevice => -ENODEV,
            Self::TimedOut => -ETIMEDOUT,
            Self::MessageTooLarge(_) => -E2BIG,
            Self::ChannelTimeout => -EIO,
            Self::Transport(code) => *code,
            Self::QueueFull => -ENOSPC,
            Self::Hardware(status) => status_to_errno(*status),
        }
    }
}

/// Maps an engine status word to a negative errno.
pub fn status_to_errno(status: u32) -> i32 {
    match status {
        STATUS_OK => 0,
        STATUS_INVALID_CMD | STATUS_INVALID_KEY => -EPERM,
        STATUS_OP_ERROR => -EREMOTEIO,
        STATUS_INVALID_ARGS => -EINVAL,
        _ => -EIO,
    }
}

/// Turns an engine status word into a result.
pub fn check_status(status: u32) -> Result<(), VseError> {
    match status {
        STATUS_OK => Ok(()),
        other => Err(VseError::Hardware(other)),
    }
}
