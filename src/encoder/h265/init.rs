use super::{FrameGeometry, FrameState, HevcVdencPacket, MAX_PIPES};

use crate::encoder::batch::{BatchArena, BatchId, BatchLevel};
use crate::encoder::commands::{CommandEmitter, Opcode};
use crate::encoder::features::FeatureSet;
use crate::encoder::platform::{NoopHook, PlatformHook};
use crate::encoder::resources::{
    allocate_frame_resources, AllocationRequest, ResourceProvider,
};
use crate::encoder::status::{StatusReport, StatusReportHandle};
use crate::encoder::sync::{PipeSync, SEMAPHORE_BUFFER_SIZE};
use crate::encoder::{FrameDescriptor, PacketConfig};
use crate::error::Result;
use tracing::{debug, info, trace};

/// Commands every slice may write, in the order they are written.
const SLICE_COMMANDS: [Opcode; 6] = [
    Opcode::RefIdxState,
    Opcode::RefIdxState,
    Opcode::SliceState,
    Opcode::BatchBufferStart,
    Opcode::VdencWalkerState,
    Opcode::VdPipelineFlush,
];

/// Per-tile commands outside the slices, including the terminator.
const TILE_COMMANDS: [Opcode; 11] = [
    Opcode::VdControlState,
    Opcode::VdencPipeModeSelect,
    Opcode::PipeModeSelect,
    Opcode::BatchBufferStart,
    Opcode::RdoqState,
    Opcode::TileCoding,
    Opcode::VdControlState,
    Opcode::VdPipelineFlush,
    Opcode::FlushDw,
    Opcode::BatchBufferEnd,
    // Slack for one extra flush.
    Opcode::VdPipelineFlush,
];

/// Contents of the pass-invariant picture state batch.
const THIRD_LEVEL_COMMANDS: [Opcode; 4] = [
    Opcode::VdencCostState,
    Opcode::PictureState,
    Opcode::VdencImageState,
    Opcode::BatchBufferEnd,
];

impl<E, R> HevcVdencPacket<E, R>
where
    E: CommandEmitter,
    R: ResourceProvider,
{
    /// Create a packet builder.
    ///
    /// Allocates the status report and semaphore buffers; everything
    /// frame-sized is allocated by [`prepare`](Self::prepare).
    pub fn new(emitter: E, mut provider: R, features: FeatureSet, config: PacketConfig) -> Result<Self> {
        config.validate()?;

        info!(
            "Creating HEVC VDEnc packet: max_passes={}, pak_slice_batches={}, tile_replay_passes={}, features={:?}",
            config.max_num_passes,
            if config.use_batch_buffer_for_pak_slices {
                config.num_pak_slice_batch_buffers
            } else {
                0
            },
            config.num_passes_for_tile_replay,
            features
        );

        let status_buffer = provider.allocate(&AllocationRequest::linear(
            "EncodeStatusReportBuffer",
            StatusReport::BUFFER_SIZE,
        ))?;
        let status = StatusReport::new(status_buffer)?;
        let semaphore = provider.allocate(&AllocationRequest::linear(
            "PipeSemaphoreBuffer",
            SEMAPHORE_BUFFER_SIZE,
        ))?;
        let sync = PipeSync::new(semaphore)?;

        Ok(Self {
            emitter,
            provider,
            features,
            hook: Box::new(NoopHook),
            config,
            status,
            sync,
            frame_batches: BatchArena::new(),
            pak_slice_batches: BatchArena::new(),
            pak_slice_ids: Vec::new(),
            pak_slice_region_size: 0,
            curr_pak_slice_idx: 0,
            frame: None,
            frames_prepared: 0,
        })
    }

    /// Install a hook that runs around every submission.
    pub fn with_platform_hook(mut self, hook: impl PlatformHook + 'static) -> Self {
        self.hook = Box::new(hook);
        self
    }

    /// Allocate everything `frame` needs and start a new status record.
    ///
    /// Called once per frame, before the first pass is submitted on any pipe.
    /// Buffers of the previous frame are reused when the geometry is
    /// unchanged and released otherwise.
    pub fn prepare(&mut self, frame: &FrameDescriptor) -> Result<StatusReportHandle> {
        frame.validate()?;
        let tiles_enabled = self.features.tiles_enabled(frame)?;
        let geometry = FrameGeometry::of(frame);
        if self.config.use_batch_buffer_for_pak_slices {
            self.ensure_pak_slice_batches(frame)?;
        }

        let previous = self.frame.take();
        let perf_buffer_base = match &previous {
            Some(previous) if self.config.single_task_phase_supported => previous
                .perf_buffer_base
                .wrapping_add(self.config.max_num_passes as u16),
            _ => 0,
        };

        let state = match previous {
            Some(previous) if previous.geometry == geometry => {
                trace!("Reusing buffers of frame {}", previous.frame_number);
                self.frame_batches.reset();
                FrameState {
                    third_level: vec![None; previous.third_level_batches.len()],
                    slice_cmd_offsets: Vec::new(),
                    ..previous
                }
            }
            previous => {
                if let Some(previous) = previous {
                    self.release_frame_buffers(&previous);
                }
                self.allocate_frame_state(frame, geometry, tiles_enabled)?
            }
        };

        let frame_number = self.frames_prepared;
        self.frames_prepared = self.frames_prepared.wrapping_add(1);
        self.frame = Some(FrameState {
            frame_number,
            perf_buffer_base,
            pak_slice_idx: self.curr_pak_slice_idx,
            ..state
        });

        debug!(
            "Prepared frame {}: {}x{}, {} slices, tiles={} ({} tile batches)",
            frame_number,
            frame.dimensions.width,
            frame.dimensions.height,
            frame.slices.len(),
            tiles_enabled,
            self.frame.as_ref().map_or(0, |state| state.num_tiles)
        );

        Ok(self.status.handle(frame_number))
    }

    /// Allocate engine buffers and tile batches for a frame of new geometry.
    fn allocate_frame_state(
        &mut self,
        frame: &FrameDescriptor,
        geometry: FrameGeometry,
        tiles_enabled: bool,
    ) -> Result<FrameState> {
        // Left over when an earlier prepare failed part way.
        self.release_frame_batches();
        let resources = allocate_frame_resources(&self.emitter, &mut self.provider, frame)?;

        let mut tile_batches = Vec::new();
        let mut third_level_batches = Vec::new();
        let mut num_tiles = 0;
        let tile_region_size = self.tile_region_size(frame);
        if tiles_enabled {
            let (rows, columns) = self.features.require_tile()?.tile_rows_columns(frame);
            num_tiles = rows * columns;

            let size = tile_region_size * self.config.max_num_passes as u32;
            for _ in 0..self.config.num_passes_for_tile_replay as u32 * num_tiles {
                tile_batches.push(allocate_batch(
                    &mut self.provider,
                    &mut self.frame_batches,
                    "TileLevelBatchBuffer",
                    BatchLevel::Second,
                    size,
                )?);
            }

            let size = self.sum_of_sizes(&THIRD_LEVEL_COMMANDS);
            for _ in 0..MAX_PIPES {
                third_level_batches.push(allocate_batch(
                    &mut self.provider,
                    &mut self.frame_batches,
                    "ThirdLevelBatchBuffer",
                    BatchLevel::Third,
                    size,
                )?);
            }
        }

        Ok(FrameState {
            frame_number: 0,
            geometry,
            resources,
            perf_buffer_base: 0,
            pak_slice_idx: 0,
            slice_cmd_offsets: Vec::new(),
            tile_batches,
            tile_region_size,
            num_tiles,
            third_level: vec![None; third_level_batches.len()],
            third_level_batches,
        })
    }

    /// Hand the buffers of `state` back to the provider.
    fn release_frame_buffers(&mut self, state: &FrameState) {
        for handle in state.resources.handles() {
            self.provider.release(handle);
        }
        self.release_frame_batches();
        debug!("Released buffers of frame {}", state.frame_number);
    }

    fn release_frame_batches(&mut self) {
        for handle in self.frame_batches.resources() {
            self.provider.release(handle);
        }
        self.frame_batches.clear();
    }

    /// (Re)allocate the recycled PAK-slice batches when they are missing or
    /// too small for `frame`.
    fn ensure_pak_slice_batches(&mut self, frame: &FrameDescriptor) -> Result<()> {
        let region_size = self.pak_slice_region_size(frame);
        self.pak_slice_region_size = region_size;
        let size = region_size * self.config.max_num_passes as u32;
        let fits = !self.pak_slice_ids.is_empty()
            && self.pak_slice_ids.iter().all(|id| {
                self.pak_slice_batches
                    .get(*id)
                    .map_or(false, |batch| batch.capacity() >= size)
            });
        if fits {
            return Ok(());
        }

        for handle in self.pak_slice_batches.resources() {
            self.provider.release(handle);
        }
        self.pak_slice_batches.clear();
        self.pak_slice_ids.clear();
        for _ in 0..self.config.num_pak_slice_batch_buffers {
            let id = allocate_batch(
                &mut self.provider,
                &mut self.pak_slice_batches,
                "BatchBufferForPakSlices",
                BatchLevel::Second,
                size,
            )?;
            self.pak_slice_ids.push(id);
        }
        self.curr_pak_slice_idx %= self.config.num_pak_slice_batch_buffers;

        debug!(
            "Allocated {} PAK-slice batches of {} bytes",
            self.pak_slice_ids.len(),
            size
        );
        Ok(())
    }

    fn sum_of_sizes(&self, opcodes: &[Opcode]) -> u32 {
        opcodes
            .iter()
            .map(|opcode| self.emitter.command_size(*opcode))
            .sum()
    }

    /// Slice commands of every slice plus the terminator. Batches hold one
    /// such region per pass.
    fn pak_slice_region_size(&self, frame: &FrameDescriptor) -> u32 {
        self.sum_of_sizes(&SLICE_COMMANDS) * frame.slices.len() as u32
            + self.emitter.command_size(Opcode::BatchBufferEnd)
    }

    /// A tile holds at most every slice of the frame. Batches hold one such
    /// region per pass.
    fn tile_region_size(&self, frame: &FrameDescriptor) -> u32 {
        self.sum_of_sizes(&TILE_COMMANDS)
            + self.sum_of_sizes(&SLICE_COMMANDS) * frame.slices.len() as u32
    }
}

fn allocate_batch<R>(
    provider: &mut R,
    arena: &mut BatchArena,
    name: &'static str,
    level: BatchLevel,
    size: u32,
) -> Result<BatchId>
where
    R: ResourceProvider + ?Sized,
{
    let resource = provider.allocate(&AllocationRequest::batch(name, size))?;
    arena.create(name, resource, level, size)
}
