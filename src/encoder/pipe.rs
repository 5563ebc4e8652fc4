//! Pipe identity and the pipe-mode state machine.
//!
//! Everything here is derived from `(pipe count, ordinal)`. Roles and engine
//! modes are computed, never stored independently.

use crate::error::{Result, VdForgeError};

/// Role of a pipe among its siblings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeRole {
    /// The only pipe.
    Single,
    /// First of several pipes.
    First,
    /// Neither first nor last.
    Middle,
    /// Last of several pipes.
    Last,
}

/// Multi-engine mode written into the HCP pipe-mode-select.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MultiEngineMode {
    FeLegacy,
    Left,
    Middle,
    Right,
}

/// Pipe work mode written into the HCP pipe-mode-select.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeWorkMode {
    Legacy,
    CodecBe,
}

/// Pipe count programmed into the VDEnc walker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkerPipes {
    Single,
    Two,
    Four,
}

impl WalkerPipes {
    pub fn count(&self) -> u32 {
        match self {
            WalkerPipes::Single => 1,
            WalkerPipes::Two => 2,
            WalkerPipes::Four => 4,
        }
    }
}

/// This pipe's position among `count` parallel pipes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipeDescriptor {
    ordinal: u8,
    count: u8,
}

impl PipeDescriptor {
    /// Pipe `ordinal` of `count`. Only 1, 2 and 4 pipes are supported.
    pub fn new(ordinal: u8, count: u8) -> Result<Self> {
        if !matches!(count, 1 | 2 | 4) {
            return Err(VdForgeError::UnsupportedPipeCount(count as u32));
        }
        if ordinal >= count {
            return Err(VdForgeError::InvalidInput(format!(
                "pipe {ordinal} is out of range for {count} pipes"
            )));
        }
        Ok(Self { ordinal, count })
    }

    /// The only pipe of a single-pipe encode.
    pub fn single() -> Self {
        Self {
            ordinal: 0,
            count: 1,
        }
    }

    /// Every pipe of a `count`-pipe encode, in ordinal order.
    pub fn all(count: u8) -> Result<Vec<Self>> {
        (0..count).map(|ordinal| Self::new(ordinal, count)).collect()
    }

    pub fn ordinal(&self) -> u8 {
        self.ordinal
    }

    pub fn count(&self) -> u8 {
        self.count
    }

    pub fn is_multi_pipe(&self) -> bool {
        self.count > 1
    }

    pub fn is_first(&self) -> bool {
        self.ordinal == 0
    }

    pub fn is_last(&self) -> bool {
        self.ordinal + 1 == self.count
    }

    pub fn role(&self) -> PipeRole {
        if !self.is_multi_pipe() {
            PipeRole::Single
        } else if self.is_first() {
            PipeRole::First
        } else if self.is_last() {
            PipeRole::Last
        } else {
            PipeRole::Middle
        }
    }

    pub fn multi_engine_mode(&self) -> MultiEngineMode {
        match self.role() {
            PipeRole::Single => MultiEngineMode::FeLegacy,
            PipeRole::First => MultiEngineMode::Left,
            PipeRole::Middle => MultiEngineMode::Middle,
            PipeRole::Last => MultiEngineMode::Right,
        }
    }

    pub fn pipe_work_mode(&self) -> PipeWorkMode {
        if self.is_multi_pipe() {
            PipeWorkMode::CodecBe
        } else {
            PipeWorkMode::Legacy
        }
    }

    pub fn walker_pipes(&self) -> WalkerPipes {
        match self.count {
            2 => WalkerPipes::Two,
            4 => WalkerPipes::Four,
            _ => WalkerPipes::Single,
        }
    }
}

/// Pipe-mode state for one picture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipeModeState {
    pub multi_engine_mode: MultiEngineMode,
    pub pipe_work_mode: PipeWorkMode,
    /// Tile bitstreams are not contiguous in the output buffer.
    pub tile_based_replay: bool,
}

impl PipeModeState {
    /// Resolve the state at the start of picture-level processing.
    pub fn resolve(pipe: &PipeDescriptor, tiles_enabled: bool, tile_replay_enabled: bool) -> Self {
        Self {
            multi_engine_mode: pipe.multi_engine_mode(),
            pipe_work_mode: pipe.pipe_work_mode(),
            tile_based_replay: tiles_enabled && tile_replay_enabled,
        }
    }
}
