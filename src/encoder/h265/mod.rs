//! HEVC VDEnc command-program builder.
//!
//! [`HevcVdencPacket`] turns one frame's descriptors into the hardware
//! command program for one rate-control pass on one pipe. Picture-level
//! commands go to the caller's primary buffer; tile and PAK-slice commands go
//! into 2nd level batches and pass-invariant picture state into a 3rd level
//! batch, all owned by the packet.

mod api;
mod encode;
mod init;

pub use api::PictureStateSize;

use crate::encoder::batch::{BatchArena, BatchId, BatchRef};
use crate::encoder::commands::CommandEmitter;
use crate::encoder::features::FeatureSet;
use crate::encoder::platform::PlatformHook;
use crate::encoder::resources::{FrameResources, ResourceProvider};
use crate::encoder::status::StatusReport;
use crate::encoder::sync::PipeSync;
use crate::encoder::{BitDepth, ChromaFormat, Dimensions, FrameDescriptor, PacketConfig, TileGrid};

/// Performance tag call type for the PAK engine.
const PERF_TAG_CALL_PAK_ENGINE: u16 = 0x0010;

/// Performance tag mode for HEVC encode.
const PERF_TAG_MODE_HEVC: u16 = 0x0022;

/// Highest pipe count a frame can be split across.
const MAX_PIPES: u8 = 4;

/// Geometry a frame was prepared for; later submissions must match it.
///
/// Everything that sizes a frame buffer is part of it, so a frame with the
/// same geometry reuses the previous frame's buffers.
#[derive(Debug, Clone, PartialEq, Eq)]
struct FrameGeometry {
    dimensions: Dimensions,
    max_lcu_size: u32,
    bit_depth: BitDepth,
    chroma_format: ChromaFormat,
    num_slices: usize,
    tile_grid: Option<TileGrid>,
}

impl FrameGeometry {
    fn of(frame: &FrameDescriptor) -> Self {
        Self {
            dimensions: frame.dimensions,
            max_lcu_size: frame.max_lcu_size,
            bit_depth: frame.bit_depth,
            chroma_format: frame.chroma_format,
            num_slices: frame.slices.len(),
            tile_grid: frame.tile_grid.clone(),
        }
    }
}

/// Everything `prepare` sets up for one frame.
#[derive(Debug)]
struct FrameState {
    frame_number: u32,
    geometry: FrameGeometry,
    resources: FrameResources,
    /// Performance tag buffer id of the first pass; pass `n` uses `base + n`.
    perf_buffer_base: u16,
    /// Recycled PAK-slice batch this frame writes into.
    pak_slice_idx: u8,
    /// Byte offset of each slice's PAK objects; filled on the first pass.
    slice_cmd_offsets: Vec<u32>,
    /// One batch per (replay pass, tile), indexed `replay * tiles + tile_index`.
    tile_batches: Vec<BatchId>,
    /// Bytes one pass writes into a tile batch.
    tile_region_size: u32,
    num_tiles: u32,
    /// One 3rd level batch per pipe ordinal.
    third_level_batches: Vec<BatchId>,
    third_level: Vec<Option<BatchRef>>,
}

/// HEVC VDEnc packet builder.
///
/// Drives an external [`CommandEmitter`] to write commands and a
/// [`ResourceProvider`] to allocate the buffers those commands reference.
pub struct HevcVdencPacket<E, R> {
    emitter: E,
    provider: R,
    features: FeatureSet,
    hook: Box<dyn PlatformHook>,
    config: PacketConfig,
    status: StatusReport,
    /// Barrier counters, allocated once; every wait leaves its counter at 0.
    sync: PipeSync,

    /// Tile and 3rd level batches, kept while the frame geometry is unchanged.
    frame_batches: BatchArena,
    /// Recycled PAK-slice batches, kept across frames.
    pak_slice_batches: BatchArena,
    pak_slice_ids: Vec<BatchId>,
    /// Bytes one pass writes into a PAK-slice batch.
    pak_slice_region_size: u32,
    curr_pak_slice_idx: u8,

    frame: Option<FrameState>,
    frames_prepared: u32,
}

impl<E, R> std::fmt::Debug for HevcVdencPacket<E, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HevcVdencPacket")
            .field("features", &self.features)
            .field("config", &self.config)
            .field("frame", &self.frame.as_ref().map(|s| s.frame_number))
            .field("curr_pak_slice_idx", &self.curr_pak_slice_idx)
            .finish()
    }
}

impl<E, R> HevcVdencPacket<E, R>
where
    E: CommandEmitter,
    R: ResourceProvider,
{
    /// Point the next frame at the PAK-slice batch after `frame_idx`.
    ///
    /// Runs after the last pass on the last pipe unless the outer pipeline
    /// tracks frames itself. Derived from the frame's own index, so running
    /// the last pass again does not advance it twice.
    fn update_parameters(&mut self, frame_idx: u8) {
        if self.config.use_batch_buffer_for_pak_slices {
            self.curr_pak_slice_idx = (frame_idx + 1) % self.config.num_pak_slice_batch_buffers;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::batch::{BatchLevel, CommandBuffer, SecondLevelLayout};
    use crate::encoder::commands::{Command, CommandSink, InternalBufferKind, Opcode};
    use crate::encoder::emitter::{decode_stream, DecodedCommand, ReferenceEmitter};
    use crate::encoder::features::{GridTiling, StaticRateControl};
    use crate::encoder::pipe::PipeDescriptor;
    use crate::encoder::resources::{HcpBufferSizeParams, HeapProvider, ResourceHandle};
    use crate::encoder::{
        CodingType, FrameSurfaces, PassDescriptor, SliceDescriptor, SliceType, SubmitContext,
    };
    use crate::error::{Result, VdForgeError};

    type Packet = HevcVdencPacket<ReferenceEmitter, HeapProvider>;
    type BatchTarget = (ResourceHandle, u32, BatchLevel);

    fn surfaces() -> FrameSurfaces {
        FrameSurfaces {
            source: ResourceHandle::new(0x10),
            recon: ResourceHandle::new(0x11),
            bitstream: ResourceHandle::new(0x12),
            mb_code: ResourceHandle::new(0x13),
        }
    }

    fn packet(features: FeatureSet, config: PacketConfig) -> Packet {
        HevcVdencPacket::new(ReferenceEmitter::new(), HeapProvider::new(), features, config)
            .unwrap()
    }

    /// 1080p, one I slice covering all 510 LCUs.
    fn i_frame() -> FrameDescriptor {
        FrameDescriptor::new(1920, 1080).with_surfaces(surfaces())
    }

    /// 1080p split into two P slices.
    fn two_slice_p_frame() -> FrameDescriptor {
        i_frame().with_coding_type(CodingType::P).with_slices(vec![
            SliceDescriptor::new(0, 255, SliceType::P).with_references(&[0], &[]),
            SliceDescriptor::new(255, 255, SliceType::P).with_references(&[0], &[]),
        ])
    }

    /// 4x2 LCUs in two tile columns of 2x2 LCUs, one slice per tile.
    fn two_column_frame() -> FrameDescriptor {
        FrameDescriptor::new(256, 128)
            .with_surfaces(surfaces())
            .with_tile_grid(TileGrid {
                column_widths: vec![2, 2],
                row_heights: vec![2],
            })
            .with_slices(vec![
                SliceDescriptor::new(0, 4, SliceType::I),
                SliceDescriptor::new(2, 4, SliceType::I),
            ])
    }

    fn submit(
        packet: &mut Packet,
        frame: &FrameDescriptor,
        ctx: &SubmitContext,
    ) -> Vec<DecodedCommand> {
        let mut cmd = CommandBuffer::new(64 * 1024);
        packet.submit(&mut cmd, frame, ctx).unwrap();
        decode_stream(cmd.as_bytes()).unwrap()
    }

    fn count(commands: &[DecodedCommand], opcode: Opcode) -> usize {
        commands.iter().filter(|c| c.opcode == opcode).count()
    }

    fn position(commands: &[DecodedCommand], opcode: Opcode) -> usize {
        commands.iter().position(|c| c.opcode == opcode).unwrap()
    }

    fn batch_targets(commands: &[DecodedCommand]) -> Vec<BatchTarget> {
        commands.iter().filter_map(|c| c.batch_target()).collect()
    }

    /// Commands of the batch region a batch-buffer-start points at.
    fn batch_commands(packet: &Packet, target: BatchTarget) -> Vec<DecodedCommand> {
        let batch = packet.batch(target.0).unwrap();
        let commands = decode_stream(batch.bytes_from(target.1).unwrap()).unwrap();
        let end = position(&commands, Opcode::BatchBufferEnd);
        commands[..=end].to_vec()
    }

    fn single_pass_contexts(pipes: u8) -> Vec<SubmitContext> {
        PipeDescriptor::all(pipes)
            .unwrap()
            .into_iter()
            .map(|pipe| SubmitContext::new(PassDescriptor::single(), pipe))
            .collect()
    }

    /// Delegates to the reference emitter but refuses one opcode.
    struct FailingEmitter {
        inner: ReferenceEmitter,
        fail_on: Opcode,
    }

    impl CommandEmitter for FailingEmitter {
        fn emit(&self, sink: &mut dyn CommandSink, command: &Command) -> Result<()> {
            if command.opcode() == self.fail_on {
                return Err(VdForgeError::Emitter(format!("{:?} refused", self.fail_on)));
            }
            self.inner.emit(sink, command)
        }

        fn command_size(&self, opcode: Opcode) -> u32 {
            self.inner.command_size(opcode)
        }

        fn pak_object_size(&self) -> u32 {
            self.inner.pak_object_size()
        }

        fn hevc_buffer_size(
            &self,
            kind: InternalBufferKind,
            params: &HcpBufferSizeParams,
        ) -> Result<u32> {
            self.inner.hevc_buffer_size(kind, params)
        }
    }

    mod scenario_tests {
        use super::*;

        #[test]
        fn test_single_pipe_i_frame_without_tiles() {
            let mut packet = packet(FeatureSet::standard(), PacketConfig::new());
            let frame = i_frame().with_last_picture(true, false);
            packet.prepare(&frame).unwrap();

            let commands = submit(&mut packet, &frame, &SubmitContext::single());

            assert_eq!(count(&commands, Opcode::PipeModeSelect), 1);
            assert_eq!(count(&commands, Opcode::VdencPipeModeSelect), 1);
            assert_eq!(count(&commands, Opcode::PictureState), 1);
            assert_eq!(count(&commands, Opcode::VdencImageState), 1);
            assert_eq!(count(&commands, Opcode::SliceState), 1);
            assert_eq!(count(&commands, Opcode::RefIdxState), 0);
            assert_eq!(count(&commands, Opcode::PakInsertObject), 1);
            assert_eq!(count(&commands, Opcode::BatchBufferStart), 0);

            // The slice is followed by its completion wait.
            let walker = position(&commands, Opcode::VdencWalkerState);
            assert_eq!(commands[walker + 1].opcode, Opcode::VdPipelineFlush);

            // One flush, then the end barrier; the other wait is the start
            // barrier.
            assert_eq!(count(&commands, Opcode::FlushDw), 1);
            assert_eq!(count(&commands, Opcode::SemaphoreWait), 2);
            let tail: Vec<Opcode> = commands[commands.len() - 2..]
                .iter()
                .map(|c| c.opcode)
                .collect();
            assert_eq!(tail, vec![Opcode::SemaphoreWait, Opcode::StoreDataImm]);

            assert_eq!(commands[0].opcode, Opcode::WatchdogThreshold);
            assert_eq!(commands[0].payload[0], 50);
        }

        #[test]
        fn test_two_pipes_build_their_own_tile_column() {
            let mut packet = packet(FeatureSet::standard(), PacketConfig::new());
            let frame = two_column_frame();
            packet.prepare(&frame).unwrap();

            let mut third_level = Vec::new();
            for ctx in single_pass_contexts(2) {
                let ordinal = ctx.pipe.ordinal() as u32;
                let commands = submit(&mut packet, &frame, &ctx);

                // Left pipe, then right pipe, both in codec back-end mode.
                let pms = &commands[position(&commands, Opcode::PipeModeSelect)];
                assert_eq!(pms.payload[0], 1 + ordinal);
                assert_eq!(pms.payload[1], 2);

                let targets = batch_targets(&commands);
                assert_eq!(targets.len(), 1);
                let tile = batch_commands(&packet, targets[0]);

                let coding = &tile[position(&tile, Opcode::TileCoding)];
                assert_eq!(coding.payload[0], 2 * ordinal);
                assert_eq!(coding.payload[5], 2);

                // Pipe lock first, unlock after the slices.
                assert_eq!(tile[0].opcode, Opcode::VdControlState);
                assert_eq!(tile[0].payload[0], 0b0100);
                assert_eq!(count(&tile, Opcode::SliceState), 1);
                let slice = &tile[position(&tile, Opcode::SliceState)];
                assert_eq!(slice.payload[0], ordinal);

                let chained: Vec<BatchTarget> = batch_targets(&tile);
                assert_eq!(chained.len(), 1);
                assert_eq!(chained[0].2, BatchLevel::Third);
                third_level.push(chained[0].0);

                // Pipe 1 signals pipe 0 at the start; at the end each signals
                // its sibling, then waits for it.
                let (increments, waits) = if ordinal == 0 { (1, 2) } else { (2, 1) };
                assert_eq!(count(&commands, Opcode::AtomicIncrement), increments);
                assert_eq!(count(&commands, Opcode::SemaphoreWait), waits);
                assert_eq!(commands.last().unwrap().opcode, Opcode::StoreDataImm);
            }
            assert_ne!(third_level[0], third_level[1]);
        }

        #[test]
        fn test_rate_control_batch_replaces_inline_picture_state() {
            let brc = BatchRef::prebuilt(ResourceHandle::new(0x900), 0, BatchLevel::Second);
            let layout = SecondLevelLayout {
                first_group_size: 128,
                second_group_size: 64,
                per_slice_const_size: 32,
                per_slice_var_sizes: vec![8, 8],
            };
            let features = FeatureSet::new()
                .with_tile(GridTiling)
                .with_rate_control(StaticRateControl::new().with_brc_batches(vec![brc], layout));
            let mut packet = packet(features, PacketConfig::new());
            let frame = two_slice_p_frame();
            packet.prepare(&frame).unwrap();

            let commands = submit(&mut packet, &frame, &SubmitContext::single());

            assert_eq!(count(&commands, Opcode::VdencCostState), 0);
            assert_eq!(count(&commands, Opcode::PictureState), 0);
            assert_eq!(count(&commands, Opcode::VdencImageState), 0);
            assert_eq!(
                batch_targets(&commands),
                vec![
                    (ResourceHandle::new(0x900), 0, BatchLevel::Second),
                    (ResourceHandle::new(0x900), 192, BatchLevel::Second),
                    (ResourceHandle::new(0x900), 232, BatchLevel::Second),
                ]
            );
            assert_eq!(count(&commands, Opcode::RefIdxState), 2);

            let pms = &commands[position(&commands, Opcode::PipeModeSelect)];
            assert_ne!(pms.payload[2] & 0b1000, 0);
        }
    }

    mod construction_tests {
        use super::*;

        #[test]
        fn test_no_tile_path_is_deterministic() {
            let mut packet = packet(FeatureSet::standard(), PacketConfig::new());
            let frame = two_slice_p_frame();
            packet.prepare(&frame).unwrap();

            let mut first = CommandBuffer::new(64 * 1024);
            let mut second = CommandBuffer::new(64 * 1024);
            packet
                .submit(&mut first, &frame, &SubmitContext::single())
                .unwrap();
            packet
                .submit(&mut second, &frame, &SubmitContext::single())
                .unwrap();

            assert!(!first.is_empty());
            assert_eq!(first.as_bytes(), second.as_bytes());
        }

        #[test]
        fn test_picture_state_size_bounds_picture_level_commands() {
            let mut packet = packet(FeatureSet::standard(), PacketConfig::new());
            let frame = two_slice_p_frame();
            packet.prepare(&frame).unwrap();

            let commands = submit(&mut packet, &frame, &SubmitContext::single());
            let picture_level = commands[position(&commands, Opcode::RefIdxState)].offset;
            let size = packet.picture_state_command_size();

            assert!(size.command_bytes >= picture_level);
            let patched = commands
                .iter()
                .take_while(|c| c.opcode != Opcode::RefIdxState)
                .filter(|c| c.opcode.carries_address())
                .count() as u32;
            assert!(size.patch_entries >= patched);
        }

        #[test]
        fn test_slice_cmd_offsets_are_fixed_by_first_pass() {
            let mut packet = packet(FeatureSet::standard(), PacketConfig::new());
            let frame = two_slice_p_frame();
            packet.prepare(&frame).unwrap();
            assert_eq!(packet.slice_cmd_offsets(), None);

            let first = SubmitContext::new(PassDescriptor::new(0, 2).unwrap(), PipeDescriptor::single());
            let commands = submit(&mut packet, &frame, &first);
            assert_eq!(count(&commands, Opcode::ForceWakeup), 1);
            assert_eq!(packet.slice_cmd_offsets(), Some(&[0, 255 * 5 * 4][..]));

            let second = SubmitContext::new(PassDescriptor::new(1, 2).unwrap(), PipeDescriptor::single());
            let commands = submit(&mut packet, &frame, &second);
            assert_eq!(count(&commands, Opcode::ForceWakeup), 0);

            let slices: Vec<&DecodedCommand> = commands
                .iter()
                .filter(|c| c.opcode == Opcode::SliceState)
                .collect();
            assert_eq!(slices[1].payload[5], 255 * 5 * 4);
            // PAK-only pass disables intra reference fetch.
            assert_ne!(slices[0].payload[6] & 0b100, 0);
        }

        #[test]
        fn test_pak_slice_batches_rotate_between_frames() {
            let mut packet = packet(
                FeatureSet::standard(),
                PacketConfig::new().with_pak_slice_batches(3),
            );
            let frame = i_frame();

            let mut used = Vec::new();
            for _ in 0..4 {
                packet.prepare(&frame).unwrap();
                let commands = submit(&mut packet, &frame, &SubmitContext::single());
                let targets = batch_targets(&commands);
                assert_eq!(targets.len(), 1);
                assert_eq!(count(&commands, Opcode::SliceState), 0);
                assert_eq!(count(&batch_commands(&packet, targets[0]), Opcode::SliceState), 1);
                used.push(targets[0].0);
            }

            assert_eq!(used[0], used[3]);
            assert_ne!(used[0], used[1]);
            assert_ne!(used[1], used[2]);
            assert_eq!(packet.current_pak_slice_index(), 1);
        }

        #[test]
        fn test_frame_tracking_keeps_pak_slice_index() {
            let mut packet = packet(
                FeatureSet::standard(),
                PacketConfig::new()
                    .with_pak_slice_batches(2)
                    .with_frame_tracking(true),
            );
            let frame = i_frame();
            packet.prepare(&frame).unwrap();
            submit(&mut packet, &frame, &SubmitContext::single());

            assert_eq!(packet.current_pak_slice_index(), 0);
        }

        #[test]
        fn test_pak_slice_passes_use_separate_regions() {
            let mut packet = packet(
                FeatureSet::standard(),
                PacketConfig::new().with_pak_slice_batches(2),
            );
            let frame = i_frame();
            packet.prepare(&frame).unwrap();

            let mut targets = Vec::new();
            for ordinal in 0..2 {
                let ctx = SubmitContext::new(
                    PassDescriptor::new(ordinal, 2).unwrap(),
                    PipeDescriptor::single(),
                );
                targets.extend(batch_targets(&submit(&mut packet, &frame, &ctx)));
            }

            assert_eq!(targets[0].0, targets[1].0);
            assert_eq!(targets[0].1, 0);
            assert_eq!(targets[1].1, packet.pak_slice_region_size);
        }

        #[test]
        fn test_rerunning_a_later_pass_is_deterministic() {
            let mut packet = packet(
                FeatureSet::standard(),
                PacketConfig::new()
                    .with_max_passes(2)
                    .with_pak_slice_batches(2),
            );
            let frame = two_slice_p_frame();
            packet.prepare(&frame).unwrap();

            let mut runs = Vec::new();
            for ordinal in [0, 1, 1] {
                let ctx = SubmitContext::new(
                    PassDescriptor::new(ordinal, 2).unwrap(),
                    PipeDescriptor::single(),
                );
                let commands = submit(&mut packet, &frame, &ctx);
                let target = batch_targets(&commands)[0];
                let region = batch_commands(&packet, target);
                runs.push((commands, target, region));
            }

            assert_eq!(runs[1], runs[2]);
            assert_ne!(runs[0].1, runs[1].1);
            // The first pass's region is left alone by the re-run.
            assert_eq!(batch_commands(&packet, runs[0].1), runs[0].2);
            assert_eq!(packet.current_pak_slice_index(), 1);
        }

        #[test]
        fn test_perf_buffer_id_follows_pass() {
            let perf_ids = |config: PacketConfig| -> Vec<u32> {
                let mut packet = packet(FeatureSet::standard(), config.with_max_passes(2));
                let frame = i_frame();
                let mut ids = Vec::new();
                for _ in 0..2 {
                    packet.prepare(&frame).unwrap();
                    for ordinal in [0, 1, 1] {
                        let ctx = SubmitContext::new(
                            PassDescriptor::new(ordinal, 2).unwrap(),
                            PipeDescriptor::single(),
                        );
                        let commands = submit(&mut packet, &frame, &ctx);
                        ids.push(commands[position(&commands, Opcode::PerfTag)].payload[2]);
                    }
                }
                ids
            };

            assert_eq!(perf_ids(PacketConfig::new()), vec![0, 1, 1, 0, 1, 1]);
            assert_eq!(
                perf_ids(PacketConfig::new().with_single_task_phase(true)),
                vec![0, 1, 1, 2, 3, 3]
            );
        }

        #[test]
        fn test_same_geometry_reuses_buffers() {
            let mut packet = packet(
                FeatureSet::standard(),
                PacketConfig::new().with_pak_slice_batches(2),
            );
            let frame = two_column_frame();
            packet.prepare(&frame).unwrap();
            let live = packet.provider().allocations().len();
            let resources = *packet.frame_resources().unwrap();

            for _ in 0..3 {
                packet.prepare(&frame).unwrap();
                submit(&mut packet, &frame, &SubmitContext::single());
            }
            assert_eq!(packet.provider().allocations().len(), live);
            assert_eq!(*packet.frame_resources().unwrap(), resources);

            // A new geometry hands the old buffers back.
            packet.prepare(&i_frame()).unwrap();
            let allocations = packet.provider().allocations();
            assert!(allocations.iter().all(|(handle, _)| *handle != resources.pak_stream_out));
            assert!(allocations
                .iter()
                .all(|(_, request)| request.name != "TileLevelBatchBuffer"));

            packet.prepare(&frame).unwrap();
            assert_eq!(packet.provider().allocations().len(), live);
        }

        #[test]
        fn test_prepare_numbers_frames() {
            let mut packet = packet(FeatureSet::standard(), PacketConfig::new());
            let frame = i_frame();

            let first = packet.prepare(&frame).unwrap();
            let second = packet.prepare(&frame).unwrap();

            assert_eq!(first.frame_number() + 1, second.frame_number());
            assert_ne!(first.offset(), second.offset());
            assert_eq!(packet.status_report().unwrap(), second);
        }
    }

    mod tile_tests {
        use super::*;

        #[test]
        fn test_third_level_batch_is_shared_by_passes() {
            let mut packet = packet(FeatureSet::standard(), PacketConfig::new());
            let frame = two_column_frame();
            packet.prepare(&frame).unwrap();

            let mut third_level = Vec::new();
            let mut tile_offsets = Vec::new();
            let mut snapshots = Vec::new();
            for ordinal in 0..2 {
                let ctx = SubmitContext::new(
                    PassDescriptor::new(ordinal, 2).unwrap(),
                    PipeDescriptor::single(),
                );
                let commands = submit(&mut packet, &frame, &ctx);
                let targets = batch_targets(&commands);
                assert_eq!(targets.len(), 2);
                tile_offsets.push(targets[0].1);

                let chained = batch_targets(&batch_commands(&packet, targets[0]));
                third_level.push(chained[0]);
                snapshots.push(packet.batch(chained[0].0).unwrap().as_bytes().to_vec());
            }

            assert_eq!(third_level[0], third_level[1]);
            assert_eq!(snapshots[0], snapshots[1]);
            assert!(tile_offsets[1] > tile_offsets[0]);

            let picture_state = decode_stream(&snapshots[0]).unwrap();
            let opcodes: Vec<Opcode> = picture_state.iter().map(|c| c.opcode).collect();
            assert_eq!(
                opcodes,
                vec![
                    Opcode::VdencCostState,
                    Opcode::PictureState,
                    Opcode::VdencImageState,
                    Opcode::BatchBufferEnd,
                ]
            );
        }

        #[test]
        fn test_rerunning_a_tile_pass_is_deterministic() {
            let mut packet = packet(FeatureSet::standard(), PacketConfig::new().with_max_passes(2));
            let frame = two_column_frame();
            packet.prepare(&frame).unwrap();

            let mut runs = Vec::new();
            for ordinal in [0, 1, 1] {
                let ctx = SubmitContext::new(
                    PassDescriptor::new(ordinal, 2).unwrap(),
                    PipeDescriptor::single(),
                );
                let commands = submit(&mut packet, &frame, &ctx);
                let tiles: Vec<Vec<DecodedCommand>> = batch_targets(&commands)
                    .into_iter()
                    .map(|target| batch_commands(&packet, target))
                    .collect();
                runs.push((commands, tiles));
            }

            assert_eq!(runs[1], runs[2]);
            assert_ne!(runs[0].0, runs[1].0);
        }

        #[test]
        fn test_tile_batches_use_light_flush_per_slice() {
            let mut packet = packet(FeatureSet::standard(), PacketConfig::new());
            let frame = two_column_frame();
            packet.prepare(&frame).unwrap();

            let commands = submit(&mut packet, &frame, &SubmitContext::single());
            assert_eq!(count(&commands, Opcode::SliceState), 0);
            assert_eq!(count(&commands, Opcode::PictureState), 0);

            let tile = batch_commands(&packet, batch_targets(&commands)[0]);
            let walker = position(&tile, Opcode::VdencWalkerState);
            assert_eq!(tile[walker + 1].opcode, Opcode::VdPipelineFlush);
            // No parser wait inside a tile.
            assert_eq!(tile[walker + 1].payload[0] & 0b1_0000, 0);
            assert_eq!(tile[walker].payload[5], 2);
            // Single pipe: no lock around the tile.
            assert_eq!(tile[0].opcode, Opcode::VdencPipeModeSelect);
        }

        #[test]
        fn test_replay_passes_use_separate_batches() {
            let mut packet = packet(
                FeatureSet::standard(),
                PacketConfig::new().with_tile_replay(2),
            );
            let frame = two_column_frame();
            packet.prepare(&frame).unwrap();

            let commands = submit(&mut packet, &frame, &SubmitContext::single());
            let mut resources: Vec<ResourceHandle> =
                batch_targets(&commands).iter().map(|t| t.0).collect();
            assert_eq!(resources.len(), 4);
            resources.sort_unstable();
            resources.dedup();
            assert_eq!(resources.len(), 4);

            let pms = &commands[position(&commands, Opcode::PipeModeSelect)];
            assert_ne!(pms.payload[2] & 0b1, 0);
        }

        #[test]
        fn test_tile_without_slices_is_rejected() {
            let mut packet = packet(FeatureSet::standard(), PacketConfig::new());
            // One slice starting in the left column covers the whole frame.
            let frame = two_column_frame().with_slices(vec![SliceDescriptor::new(0, 8, SliceType::I)]);
            packet.prepare(&frame).unwrap();

            let mut cmd = CommandBuffer::new(64 * 1024);
            assert_eq!(
                packet.submit(&mut cmd, &frame, &SubmitContext::single()),
                Err(VdForgeError::EmptyTile { row: 0, column: 1 })
            );
        }
    }

    mod barrier_tests {
        use super::*;
        use crate::encoder::sync::BarrierKind;

        fn touches(command: &DecodedCommand, semaphore: ResourceHandle, offset: u32) -> bool {
            command.handle_at(0) == Some(semaphore) && command.payload[2] == offset
        }

        #[test]
        fn test_end_counter_is_cleared_before_the_start_barrier() {
            let mut packet = packet(FeatureSet::standard(), PacketConfig::new());
            let frame = two_column_frame();
            packet.prepare(&frame).unwrap();
            let semaphore = packet.semaphore_buffer();
            let start_slot = PipeSync::slot_offset(BarrierKind::OnePipeWaitOthers, 0);

            for ctx in single_pass_contexts(2) {
                let commands = submit(&mut packet, &frame, &ctx);
                let end_slot = PipeSync::slot_offset(BarrierKind::AllPipes, ctx.pipe.ordinal());

                let clear = commands
                    .iter()
                    .position(|c| {
                        c.opcode == Opcode::StoreDataImm
                            && touches(c, semaphore, end_slot)
                            && c.payload[3] == 0
                    })
                    .unwrap();
                let start_barrier = commands
                    .iter()
                    .position(|c| {
                        matches!(c.opcode, Opcode::SemaphoreWait | Opcode::AtomicIncrement)
                    })
                    .unwrap();
                assert!(clear < start_barrier);
                assert!(touches(&commands[start_barrier], semaphore, start_slot));

                // The end wait is on the cleared counter and clears it again.
                let end_wait = commands
                    .iter()
                    .rposition(|c| c.opcode == Opcode::SemaphoreWait)
                    .unwrap();
                assert!(end_wait > start_barrier);
                assert!(touches(&commands[end_wait], semaphore, end_slot));
                assert_eq!(commands[end_wait + 1].opcode, Opcode::StoreDataImm);
                assert!(touches(&commands[end_wait + 1], semaphore, end_slot));
            }
        }

        #[test]
        fn test_semaphore_is_allocated_once() {
            let mut packet = packet(FeatureSet::standard(), PacketConfig::new());
            let semaphore = packet.semaphore_buffer();

            for frame in [i_frame(), two_column_frame(), i_frame()] {
                packet.prepare(&frame).unwrap();
                let commands = submit(&mut packet, &frame, &SubmitContext::single());
                let wait = commands
                    .iter()
                    .rfind(|c| c.opcode == Opcode::SemaphoreWait)
                    .unwrap();
                assert_eq!(wait.handle_at(0), Some(semaphore));
            }

            let semaphores = packet
                .provider()
                .allocations()
                .iter()
                .filter(|(_, request)| request.name == "PipeSemaphoreBuffer")
                .count();
            assert_eq!(semaphores, 1);
        }
    }

    mod error_tests {
        use super::*;
        use std::cell::Cell;
        use std::rc::Rc;

        #[test]
        fn test_submit_before_prepare() {
            let mut packet = packet(FeatureSet::standard(), PacketConfig::new());
            let mut cmd = CommandBuffer::new(1024);

            assert_eq!(
                packet.submit(&mut cmd, &i_frame(), &SubmitContext::single()),
                Err(VdForgeError::NotPrepared)
            );
            assert_eq!(packet.status_report(), Err(VdForgeError::NotPrepared));
        }

        #[test]
        fn test_missing_rate_control() {
            let mut packet = packet(FeatureSet::new().with_tile(GridTiling), PacketConfig::new());
            let frame = i_frame();
            packet.prepare(&frame).unwrap();

            let mut cmd = CommandBuffer::new(64 * 1024);
            assert_eq!(
                packet.submit(&mut cmd, &frame, &SubmitContext::single()),
                Err(VdForgeError::MissingFeature("rate control"))
            );
            assert!(cmd.is_empty());
        }

        #[test]
        fn test_multi_pipe_needs_matching_tile_columns() {
            let mut packet = packet(FeatureSet::standard(), PacketConfig::new());
            let mut cmd = CommandBuffer::new(64 * 1024);

            let frame = i_frame();
            packet.prepare(&frame).unwrap();
            let ctx = single_pass_contexts(2)[0];
            assert!(matches!(
                packet.submit(&mut cmd, &frame, &ctx),
                Err(VdForgeError::InvalidInput(_))
            ));

            let frame = two_column_frame();
            packet.prepare(&frame).unwrap();
            let ctx = single_pass_contexts(4)[0];
            assert!(matches!(
                packet.submit(&mut cmd, &frame, &ctx),
                Err(VdForgeError::InvalidInput(_))
            ));
        }

        #[test]
        fn test_prepare_rejects_overlapping_tiled_slices() {
            let mut packet = packet(FeatureSet::standard(), PacketConfig::new());
            for slices in [
                vec![
                    SliceDescriptor::new(0, 4, SliceType::I),
                    SliceDescriptor::new(1, 2, SliceType::I),
                    SliceDescriptor::new(2, 2, SliceType::I),
                ],
                vec![
                    SliceDescriptor::new(0, u32::MAX, SliceType::I),
                    SliceDescriptor::new(1, 9, SliceType::I),
                ],
            ] {
                let frame = two_column_frame().with_slices(slices);
                assert!(matches!(
                    packet.prepare(&frame),
                    Err(VdForgeError::InvalidInput(_))
                ));
            }
            assert_eq!(packet.status_report(), Err(VdForgeError::NotPrepared));
        }

        #[test]
        fn test_frame_must_match_prepared_frame() {
            let mut packet = packet(FeatureSet::standard(), PacketConfig::new());
            packet.prepare(&i_frame()).unwrap();

            let other = FrameDescriptor::new(1280, 720).with_surfaces(surfaces());
            let mut cmd = CommandBuffer::new(64 * 1024);
            assert!(matches!(
                packet.submit(&mut cmd, &other, &SubmitContext::single()),
                Err(VdForgeError::InvalidInput(_))
            ));
        }

        #[test]
        fn test_pass_count_above_configured_maximum() {
            let mut packet = packet(FeatureSet::standard(), PacketConfig::new().with_max_passes(1));
            let frame = i_frame();
            packet.prepare(&frame).unwrap();

            let ctx = SubmitContext::new(PassDescriptor::new(0, 2).unwrap(), PipeDescriptor::single());
            let mut cmd = CommandBuffer::new(64 * 1024);
            assert!(matches!(
                packet.submit(&mut cmd, &frame, &ctx),
                Err(VdForgeError::InvalidInput(_))
            ));
        }

        #[test]
        fn test_emitter_failure_propagates() {
            for (frame, fail_on) in [
                (i_frame(), Opcode::SliceState),
                (two_column_frame(), Opcode::TileCoding),
            ] {
                let emitter = FailingEmitter {
                    inner: ReferenceEmitter::new(),
                    fail_on,
                };
                let mut packet = HevcVdencPacket::new(
                    emitter,
                    HeapProvider::new(),
                    FeatureSet::standard(),
                    PacketConfig::new(),
                )
                .unwrap();
                packet.prepare(&frame).unwrap();

                let mut cmd = CommandBuffer::new(64 * 1024);
                assert!(matches!(
                    packet.submit(&mut cmd, &frame, &SubmitContext::single()),
                    Err(VdForgeError::Emitter(_))
                ));
            }
        }

        #[test]
        fn test_small_primary_buffer_overflows() {
            let mut packet = packet(FeatureSet::standard(), PacketConfig::new());
            let frame = i_frame();
            packet.prepare(&frame).unwrap();

            let mut cmd = CommandBuffer::new(64);
            assert!(matches!(
                packet.submit(&mut cmd, &frame, &SubmitContext::single()),
                Err(VdForgeError::BatchOverflow { .. })
            ));
        }

        struct CountingHook {
            calls: Rc<Cell<u32>>,
            fail: bool,
        }

        impl PlatformHook for CountingHook {
            fn pre_submit(&self, _surfaces: &FrameSurfaces) -> Result<()> {
                self.calls.set(self.calls.get() + 1);
                if self.fail {
                    return Err(VdForgeError::InvalidResource("surfaces are busy".to_string()));
                }
                Ok(())
            }

            fn post_submit(&self, _surfaces: &FrameSurfaces) -> Result<()> {
                self.calls.set(self.calls.get() + 10);
                Ok(())
            }
        }

        #[test]
        fn test_platform_hook_runs_around_submission() {
            let calls = Rc::new(Cell::new(0));
            let frame = i_frame();

            let mut packet = packet(FeatureSet::standard(), PacketConfig::new()).with_platform_hook(
                CountingHook {
                    calls: Rc::clone(&calls),
                    fail: false,
                },
            );
            packet.prepare(&frame).unwrap();
            submit(&mut packet, &frame, &SubmitContext::single());
            assert_eq!(calls.get(), 11);

            let mut packet = packet_with_failing_hook(Rc::clone(&calls));
            packet.prepare(&frame).unwrap();
            let mut cmd = CommandBuffer::new(64 * 1024);
            assert!(packet
                .submit(&mut cmd, &frame, &SubmitContext::single())
                .is_err());
            assert!(cmd.is_empty());
            assert_eq!(calls.get(), 12);
        }

        #[test]
        fn test_platform_hook_is_released_when_build_fails() {
            let calls = Rc::new(Cell::new(0));
            let frame = i_frame();
            let mut packet = packet(FeatureSet::standard(), PacketConfig::new()).with_platform_hook(
                CountingHook {
                    calls: Rc::clone(&calls),
                    fail: false,
                },
            );
            packet.prepare(&frame).unwrap();

            let mut cmd = CommandBuffer::new(64);
            assert!(matches!(
                packet.submit(&mut cmd, &frame, &SubmitContext::single()),
                Err(VdForgeError::BatchOverflow { .. })
            ));
            assert_eq!(calls.get(), 11);
        }

        fn packet_with_failing_hook(calls: Rc<Cell<u32>>) -> Packet {
            packet(FeatureSet::standard(), PacketConfig::new())
                .with_platform_hook(CountingHook { calls, fail: true })
        }
    }
}
