use super::HevcVdencPacket;

use crate::encoder::batch::BatchBuffer;
use crate::encoder::commands::{CommandEmitter, Opcode};
use crate::encoder::features::FeatureSet;
use crate::encoder::resources::{FrameResources, ResourceHandle, ResourceProvider};
use crate::encoder::status::StatusReportHandle;
use crate::encoder::PacketConfig;
use crate::error::{Result, VdForgeError};

/// Every picture-level command a submission can write to the primary buffer.
const PICTURE_LEVEL_COMMANDS: [Opcode; 26] = [
    Opcode::WatchdogThreshold,
    Opcode::PerfTag,
    Opcode::StoreDataImm,
    // Start barrier, waiting side.
    Opcode::SemaphoreWait,
    Opcode::StoreDataImm,
    Opcode::ForceWakeup,
    Opcode::Prolog,
    Opcode::StoreDataImm,
    Opcode::VdencControlState,
    Opcode::VdControlState,
    Opcode::PipeModeSelect,
    Opcode::SurfaceState,
    Opcode::SurfaceState,
    Opcode::SurfaceState,
    Opcode::PipeBufAddrState,
    Opcode::IndObjBaseAddrState,
    Opcode::QmState,
    Opcode::VdencPipeModeSelect,
    Opcode::VdencSurfaceState,
    Opcode::VdencSurfaceState,
    Opcode::VdencPipeBufAddrState,
    Opcode::BatchBufferStart,
    Opcode::VdencCostState,
    Opcode::PictureState,
    Opcode::VdencImageState,
    Opcode::RdoqState,
];

/// Upper bound on the picture-level commands of one submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PictureStateSize {
    /// Bytes of commands.
    pub command_bytes: u32,
    /// Relocation entries for the resource addresses those commands carry.
    pub patch_entries: u32,
}

impl<E, R> HevcVdencPacket<E, R>
where
    E: CommandEmitter,
    R: ResourceProvider,
{
    /// Size the outer pipeline reserves in the primary buffer for
    /// picture-level commands.
    pub fn picture_state_command_size(&self) -> PictureStateSize {
        PICTURE_LEVEL_COMMANDS.iter().fold(
            PictureStateSize {
                command_bytes: 0,
                patch_entries: 0,
            },
            |mut size, opcode| {
                size.command_bytes += self.emitter.command_size(*opcode);
                if opcode.carries_address() {
                    size.patch_entries += 1;
                }
                size
            },
        )
    }

    /// Status record of the prepared frame.
    pub fn status_report(&self) -> Result<StatusReportHandle> {
        let state = self.frame.as_ref().ok_or(VdForgeError::NotPrepared)?;
        Ok(self.status.handle(state.frame_number))
    }

    /// Recycled PAK-slice batch the next frame writes into.
    pub fn current_pak_slice_index(&self) -> u8 {
        self.curr_pak_slice_idx
    }

    /// PAK object offsets of the prepared frame's slices, once a pass has
    /// computed them.
    pub fn slice_cmd_offsets(&self) -> Option<&[u32]> {
        self.frame
            .as_ref()
            .map(|state| state.slice_cmd_offsets.as_slice())
            .filter(|offsets| !offsets.is_empty())
    }

    /// Engine buffers of the prepared frame.
    pub fn frame_resources(&self) -> Option<&FrameResources> {
        self.frame.as_ref().map(|state| &state.resources)
    }

    /// Semaphore buffer shared by every frame.
    pub fn semaphore_buffer(&self) -> ResourceHandle {
        self.sync.semaphore()
    }

    /// Batch backed by `resource`, for inspecting what a batch-buffer-start
    /// points at.
    pub fn batch(&self, resource: ResourceHandle) -> Option<&BatchBuffer> {
        self.frame_batches
            .find(resource)
            .or_else(|| self.pak_slice_batches.find(resource))
    }

    pub fn config(&self) -> &PacketConfig {
        &self.config
    }

    pub fn features(&self) -> &FeatureSet {
        &self.features
    }

    pub fn emitter(&self) -> &E {
        &self.emitter
    }

    pub fn provider(&self) -> &R {
        &self.provider
    }
}
