//! Error types for VdForge.

use thiserror::Error;

/// Main error type for VdForge operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VdForgeError {
    /// A feature adapter the packet cannot run without was not registered.
    #[error("Required feature adapter is missing: {0}")]
    MissingFeature(&'static str),

    /// A buffer handle that must be patched into a command is not valid.
    #[error("Invalid resource handle: {0}")]
    InvalidResource(String),

    /// A tile was assigned no slices.
    #[error("Tile (row {row}, column {column}) has no slices")]
    EmptyTile { row: u32, column: u32 },

    /// Scalable mode only supports 1, 2 or 4 pipes.
    #[error("Unsupported pipe count: {0}")]
    UnsupportedPipeCount(u32),

    /// Invalid input (geometry, slice table, pass or pipe ordinals, etc.).
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// A command did not fit in the remaining space of a buffer.
    #[error("Buffer overflow: need {needed} bytes, {available} available")]
    BatchOverflow { needed: u32, available: u32 },

    /// A batch buffer was used in the wrong open/closed state.
    #[error("Batch buffer state error: {0}")]
    BatchState(String),

    /// The command emitter rejected a command.
    #[error("Command emitter error: {0}")]
    Emitter(String),

    /// The resource provider failed to allocate a buffer.
    #[error("Allocation failed: {0}")]
    Allocation(String),

    /// `submit` was called before `prepare` for the frame.
    #[error("Packet has not been prepared for a frame")]
    NotPrepared,
}

/// Result type for VdForge operations.
pub type Result<T> = std::result::Result<T, VdForgeError>;
