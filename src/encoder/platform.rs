//! Execution-environment hook around a submission.

use crate::encoder::FrameSurfaces;
use crate::error::Result;

/// Called before and after the builder writes a frame's commands.
///
/// Some environments serialize GPU access to the bitstream and reconstructed
/// surfaces around the encoder's use of them.
pub trait PlatformHook {
    fn pre_submit(&self, _surfaces: &FrameSurfaces) -> Result<()> {
        Ok(())
    }

    fn post_submit(&self, _surfaces: &FrameSurfaces) -> Result<()> {
        Ok(())
    }
}

/// Hook that does nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHook;

impl PlatformHook for NoopHook {}
