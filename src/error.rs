//! Structured error kinds per the error handling design (spec §7).
//!
//! `anyhow` is used internally by stage/pipeline plumbing (mirroring the
//! teacher's `Processor`/`Stage` traits, which return `anyhow::Result`), but
//! the errors a library consumer is expected to match on are the concrete
//! `thiserror` enums below.

use thiserror::Error;

/// Synchronous, fatal configuration errors raised from `add_stage`/`start`.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("stage input type `{expected}` does not match previous stage output type `{actual}`")]
    TypeMismatch {
        expected: &'static str,
        actual: &'static str,
    },

    #[error("final stage of pipeline `{pipeline}` must not have an output resource queue")]
    TerminalStageHasResourceQueue { pipeline: String },

    #[error("device id {0} is not in the visible device set")]
    InvalidDeviceId(u32),

    #[error("no devices available to build a pipeline pool")]
    NoDevicesAvailable,

    #[error("input queue can only be replaced before any stage is added")]
    InputQueueAlreadyWired,
}

/// Errors surfaced from the (external) Device Runtime, or from a DeviceContext
/// operation that depends on it. Per spec §7 these are pipeline-fatal: the
/// owning pipeline's `done` flag is raised and its resources released, but
/// sibling pipelines in the same pool continue.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("failed to request device {device_id}")]
    DeviceRequestFailed { device_id: u32 },

    #[error("failed to load model from `{path}`")]
    ModelLoadFailed { path: String },

    #[error("device memory allocation of {bytes} bytes failed")]
    AllocFailed { bytes: usize },

    #[error("deallocation requested for an allocation record that does not exist")]
    UnknownAllocation,

    #[error("tensor launch failed on network `{network}`")]
    LaunchFailed { network: String },

    #[error("unsupported dtype value: {0}")]
    UnsupportedDtype(u32),
}

/// A user pre/post callback returned `false` (failed) or panicked. Recorded as
/// `status.valid = false` rather than aborting the whole request; a panic is
/// escalated like `DeviceError` (pipeline-fatal).
#[derive(Debug, Error)]
pub enum UserError {
    #[error("user callback for stage `{stage}` reported failure")]
    CallbackFailed { stage: String },

    #[error("user callback for stage `{stage}` panicked: {message}")]
    CallbackPanicked { stage: String, message: String },
}

/// Top-level error type composing the three kinds above plus escape hatches
/// for anything else a stage closure raises via `anyhow`.
#[derive(Debug, Error)]
pub enum BmError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    User(#[from] UserError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
