use super::{HevcVdencPacket, PERF_TAG_CALL_PAK_ENGINE, PERF_TAG_MODE_HEVC};

use crate::encoder::batch::{BatchArena, BatchId, BatchRef, CommandBuffer, OpenMode};
use crate::encoder::commands::{
    Command, CommandEmitter, CommandSink, CostStateParams, ImageStateParams, IndObjBaseAddrParams,
    PakInsertParams, PerfTagParams, PictureStateParams, PipeBufAddrParams, PipeModeSelectParams,
    PipelineFlushParams, QmStateParams, RdoqStateParams, RefIdxParams, RefList, SliceStateParams,
    SurfaceId, SurfaceStateParams, TileCodingParams, VdControlStateParams,
    VdencPipeModeSelectParams, WalkerStateParams,
};
use crate::encoder::features::{FeatureSet, RateControlFeature, TileData, TileFeature};
use crate::encoder::pipe::PipeModeState;
use crate::encoder::resources::{watchdog_threshold_ms, FrameResources, ResourceHandle, ResourceProvider};
use crate::encoder::status::StatusReport;
use crate::encoder::sync::{BarrierKind, PipeSync};
use crate::encoder::{
    CodingType, FrameDescriptor, PacketConfig, PassDescriptor, SubmitContext, MIN_CU_SIZE,
};
use crate::error::{Result, VdForgeError};
use tracing::{debug, trace};

/// IBC control with low-bandwidth references only.
const IBC_CONTROL_LBC_ONLY: u8 = 1;

/// IBC control with low-bandwidth references and write-back.
const IBC_CONTROL_LBC_AND_WRITE_BACK: u8 = 3;

impl<E, R> HevcVdencPacket<E, R>
where
    E: CommandEmitter,
    R: ResourceProvider,
{
    /// Write the command program for one pass of the prepared frame on one pipe.
    ///
    /// Picture-level commands are appended to `cmd`. Tile and PAK-slice
    /// commands go into batches owned by the packet, each closed before
    /// `cmd` references it.
    pub fn submit(
        &mut self,
        cmd: &mut CommandBuffer,
        frame: &FrameDescriptor,
        ctx: &SubmitContext,
    ) -> Result<()> {
        let tiles = self.check_submission(frame, ctx)?;
        self.hook.pre_submit(&frame.surfaces)?;

        // Once acquired, the surfaces are released whether or not the build
        // succeeds; the build error wins.
        let built = self.build(cmd, frame, ctx, tiles);
        let released = self.hook.post_submit(&frame.surfaces);
        built.and(released)
    }

    fn build(
        &mut self,
        cmd: &mut CommandBuffer,
        frame: &FrameDescriptor,
        ctx: &SubmitContext,
        tiles: bool,
    ) -> Result<()> {
        let state = self.frame.as_mut().ok_or(VdForgeError::NotPrepared)?;
        if ctx.pass.is_first() || state.slice_cmd_offsets.is_empty() {
            state.slice_cmd_offsets = slice_cmd_offsets(frame, self.emitter.pak_object_size());
        }
        let perf_buffer_id = state
            .perf_buffer_base
            .wrapping_add(ctx.pass.ordinal() as u16);

        debug!(
            "Building frame {} pass {}/{} on pipe {}/{}: tiles={}, pak_only={}",
            state.frame_number,
            ctx.pass.ordinal() + 1,
            ctx.pass.count(),
            ctx.pipe.ordinal() + 1,
            ctx.pipe.count(),
            tiles,
            ctx.pass.is_pak_only()
        );

        let writer = PacketWriter {
            emitter: &self.emitter,
            features: &self.features,
            rate_control: self.features.require_rate_control()?,
            config: &self.config,
            frame,
            ctx,
            resources: &state.resources,
            sync: &self.sync,
            slice_cmd_offsets: &state.slice_cmd_offsets,
            tiles,
        };

        writer.picture_level_commands(cmd, &self.status, state.frame_number, perf_buffer_id)?;

        if tiles {
            let ordinal = ctx.pipe.ordinal() as usize;
            let third_level_id = state
                .third_level_batches
                .get(ordinal)
                .copied()
                .ok_or_else(|| unallocated("3rd level batch"))?;
            let slot = state
                .third_level
                .get_mut(ordinal)
                .ok_or_else(|| unallocated("3rd level batch"))?;
            let third_level =
                writer.third_level_batch(&mut self.frame_batches, third_level_id, slot)?;
            writer.tile_level_commands(
                cmd,
                &mut self.frame_batches,
                &state.tile_batches,
                state.num_tiles,
                third_level,
                pass_region(&ctx.pass, state.tile_region_size),
            )?;
            writer.end_of_frame_commands(cmd)?;
        } else {
            if self.config.use_batch_buffer_for_pak_slices {
                let id = self
                    .pak_slice_ids
                    .get(state.pak_slice_idx as usize)
                    .copied()
                    .ok_or_else(|| unallocated("PAK-slice batch"))?;
                self.pak_slice_batches
                    .open(id, pass_region(&ctx.pass, self.pak_slice_region_size))?;
                writer.slice_level_commands(self.pak_slice_batches.sink(id)?)?;
                let batch = self.pak_slice_batches.close(id, &self.emitter)?;
                writer.emit(cmd, Command::BatchBufferStart(batch))?;
            } else {
                writer.slice_level_commands(cmd)?;
            }
            writer.end_of_frame_commands(cmd)?;

            self.status
                .read_sse_statistics(&self.emitter, cmd, state.frame_number)?;
            self.status
                .read_slice_size(&self.emitter, cmd, state.frame_number)?;
            self.status.end(&self.emitter, cmd, state.frame_number)?;
            if ctx.pass.is_last() && ctx.pipe.is_first() {
                self.status.update_global_count(&self.emitter, cmd)?;
            }
        }

        writer.sync_all_pipes(cmd)?;

        if !tiles
            && !self.config.frame_tracking_enabled
            && ctx.pass.is_last()
            && ctx.pipe.is_last()
        {
            let pak_slice_idx = state.pak_slice_idx;
            self.update_parameters(pak_slice_idx);
        }
        Ok(())
    }

    /// Check `frame` and `ctx` against the prepared frame and return whether
    /// the frame takes the tiled path.
    fn check_submission(&self, frame: &FrameDescriptor, ctx: &SubmitContext) -> Result<bool> {
        let state = self.frame.as_ref().ok_or(VdForgeError::NotPrepared)?;
        if state.geometry != super::FrameGeometry::of(frame) {
            return Err(VdForgeError::InvalidInput(format!(
                "frame {}x{} with {} slices does not match the prepared frame {}",
                frame.dimensions.width,
                frame.dimensions.height,
                frame.slices.len(),
                state.frame_number
            )));
        }
        if ctx.pass.count() > self.config.max_num_passes {
            return Err(VdForgeError::InvalidInput(format!(
                "{} passes exceed the configured maximum of {}",
                ctx.pass.count(),
                self.config.max_num_passes
            )));
        }
        self.features.require_rate_control()?;

        let tiles = self.features.tiles_enabled(frame)?;
        if ctx.pipe.is_multi_pipe() {
            if !tiles {
                return Err(VdForgeError::InvalidInput(format!(
                    "{} pipes need a tiled frame",
                    ctx.pipe.count()
                )));
            }
            let (_, columns) = self.features.require_tile()?.tile_rows_columns(frame);
            if columns != ctx.pipe.count() as u32 {
                return Err(VdForgeError::InvalidInput(format!(
                    "{} pipes need exactly one tile column each, frame has {columns}",
                    ctx.pipe.count()
                )));
            }
        }
        Ok(tiles)
    }
}

/// Byte offset of each slice's PAK objects, one object per LCU in coding order.
fn slice_cmd_offsets(frame: &FrameDescriptor, pak_object_dwords: u32) -> Vec<u32> {
    let mut start_lcu = 0;
    frame
        .slices
        .iter()
        .map(|slice| {
            let offset = start_lcu * pak_object_dwords * 4;
            start_lcu += slice.num_lcus;
            offset
        })
        .collect()
}

/// Each pass owns a fixed region of a batch, so running a pass again
/// rewrites the same bytes.
fn pass_region(pass: &PassDescriptor, region_size: u32) -> OpenMode {
    OpenMode::Region(pass.ordinal() as u32 * region_size)
}

fn unallocated(what: &str) -> VdForgeError {
    VdForgeError::BatchState(format!("{what} was not allocated by prepare"))
}

/// Borrowed view of everything one submission writes from.
struct PacketWriter<'a, E> {
    emitter: &'a E,
    features: &'a FeatureSet,
    rate_control: &'a dyn RateControlFeature,
    config: &'a PacketConfig,
    frame: &'a FrameDescriptor,
    ctx: &'a SubmitContext,
    resources: &'a FrameResources,
    sync: &'a PipeSync,
    slice_cmd_offsets: &'a [u32],
    tiles: bool,
}

impl<E> PacketWriter<'_, E>
where
    E: CommandEmitter,
{
    fn emit(&self, sink: &mut dyn CommandSink, command: Command) -> Result<()> {
        self.emitter.emit(sink, &command)
    }

    fn picture_level_commands(
        &self,
        cmd: &mut CommandBuffer,
        status: &StatusReport,
        frame_number: u32,
        perf_buffer_id: u16,
    ) -> Result<()> {
        let frame = self.frame;
        let ctx = self.ctx;
        let surfaces = &frame.surfaces;

        self.emit(
            cmd,
            Command::WatchdogThreshold {
                threshold_ms: watchdog_threshold_ms(&frame.dimensions),
            },
        )?;
        self.emit(
            cmd,
            Command::PerfTag(PerfTagParams {
                call_type: PERF_TAG_CALL_PAK_ENGINE,
                mode: PERF_TAG_MODE_HEVC,
                coding_type: frame.coding_type,
                buffer_id: perf_buffer_id,
            }),
        )?;
        // Clear this pipe's end-of-frame counter, then hold the first pipe
        // until every sibling has done the same.
        self.sync
            .reset_semaphore(self.emitter, cmd, BarrierKind::AllPipes, 0, &ctx.pipe)?;
        self.sync
            .sync_pipe(self.emitter, cmd, BarrierKind::OnePipeWaitOthers, 0, &ctx.pipe)?;

        if ctx.pass.is_first() && !self.rate_control.is_acqp_enabled() {
            self.emit(cmd, Command::ForceWakeup)?;
            self.emit(cmd, Command::Prolog)?;
        }
        if ctx.pipe.is_first() {
            status.start(self.emitter, cmd, frame_number)?;
        }

        // HCP picture setup.
        self.emit(cmd, Command::VdencControlState { initialization: true })?;
        self.emit(
            cmd,
            Command::VdControlState(VdControlStateParams {
                initialization: true,
                ..Default::default()
            }),
        )?;
        self.emit(cmd, Command::PipeModeSelect(self.pipe_mode_select_params()))?;
        self.emit(
            cmd,
            Command::SurfaceState(self.surface_params(SurfaceId::Source, surfaces.source)),
        )?;
        self.emit(
            cmd,
            Command::SurfaceState(self.surface_params(SurfaceId::Recon, surfaces.recon)),
        )?;
        self.emit(
            cmd,
            Command::SurfaceState(self.surface_params(SurfaceId::Reference, surfaces.recon)),
        )?;
        let buf_addr = self.pipe_buf_addr_params();
        self.emit(cmd, Command::PipeBufAddrState(buf_addr))?;
        self.emit(
            cmd,
            Command::IndObjBaseAddrState(IndObjBaseAddrParams {
                mb_code: surfaces.mb_code,
                bitstream: surfaces.bitstream,
            }),
        )?;
        self.emit(
            cmd,
            Command::QmState(QmStateParams {
                flat_scaling: true,
                bit_depth: frame.bit_depth,
            }),
        )?;

        // VDEnc picture setup.
        self.emit(
            cmd,
            Command::VdencPipeModeSelect(self.vdenc_pipe_mode_select_params()),
        )?;
        self.emit(
            cmd,
            Command::VdencSurfaceState(self.surface_params(SurfaceId::Source, surfaces.source)),
        )?;
        self.emit(
            cmd,
            Command::VdencSurfaceState(self.surface_params(SurfaceId::Reference, surfaces.recon)),
        )?;
        self.emit(cmd, Command::VdencPipeBufAddrState(buf_addr))?;

        if !self.tiles {
            self.picture_state_without_tiles(cmd)?;
        }
        Ok(())
    }

    fn picture_state_without_tiles(&self, sink: &mut dyn CommandSink) -> Result<()> {
        if self.rate_control.is_brc_update_required(&self.ctx.pass) {
            self.emit(sink, Command::BatchBufferStart(self.rate_control_batch()?))?;
        } else {
            self.emit(sink, Command::VdencCostState(self.cost_state_params()))?;
            self.emit(sink, Command::PictureState(self.picture_state_params()))?;
            self.emit(
                sink,
                Command::VdencImageState(self.image_state_params(&self.ctx.pass)),
            )?;
        }
        self.emit(sink, Command::RdoqState(self.rdoq_params()))
    }

    fn picture_state_with_tile(&self, sink: &mut dyn CommandSink, third_level: BatchRef) -> Result<()> {
        let batch = if self.rate_control.is_brc_update_required(&self.ctx.pass) {
            self.rate_control_batch()?
        } else {
            third_level
        };
        self.emit(sink, Command::BatchBufferStart(batch))?;
        self.emit(sink, Command::RdoqState(self.rdoq_params()))
    }

    /// Picture state shared by every pass and tile of the frame.
    fn third_level_commands(&self, sink: &mut dyn CommandSink) -> Result<()> {
        // Built from the frame's first pass; pass-specific fields live in
        // the tile and slice commands.
        let first_pass = PassDescriptor::new(0, self.ctx.pass.count())?;
        self.emit(sink, Command::VdencCostState(self.cost_state_params()))?;
        self.emit(sink, Command::PictureState(self.picture_state_params()))?;
        self.emit(sink, Command::VdencImageState(self.image_state_params(&first_pass)))
    }

    fn slice_level_commands(&self, sink: &mut dyn CommandSink) -> Result<()> {
        let second_level = self.second_level_slice_batches();
        for index in 0..self.frame.slices.len() {
            let params = self.slice_state_params(index)?;
            self.slice_commands(sink, index, params, second_level[index], None)?;
            self.emit(sink, Command::VdPipelineFlush(PipelineFlushParams::vdenc_done()))?;
        }
        Ok(())
    }

    /// The pipe's 3rd level batch, built on the first pass that needs it.
    fn third_level_batch(
        &self,
        arena: &mut BatchArena,
        id: BatchId,
        slot: &mut Option<BatchRef>,
    ) -> Result<BatchRef> {
        if let Some(batch) = *slot {
            return Ok(batch);
        }
        arena.open(id, OpenMode::Reset)?;
        self.third_level_commands(arena.sink(id)?)?;
        let batch = arena.close(id, self.emitter)?;
        *slot = Some(batch);
        Ok(batch)
    }

    fn tile_level_commands(
        &self,
        cmd: &mut CommandBuffer,
        arena: &mut BatchArena,
        tile_batches: &[BatchId],
        num_tiles: u32,
        third_level: BatchRef,
        mode: OpenMode,
    ) -> Result<()> {
        let tile_feature = self.features.require_tile()?;

        let (rows, columns) = tile_feature.tile_rows_columns(self.frame);
        let second_level = self.second_level_slice_batches();

        for row in 0..rows {
            for replay in 0..self.config.num_passes_for_tile_replay as u32 {
                for column in 0..columns {
                    if self.ctx.pipe.is_multi_pipe() && column != self.ctx.pipe.ordinal() as u32 {
                        trace!(
                            "Pipe {} skips tile ({}, {})",
                            self.ctx.pipe.ordinal(),
                            row,
                            column
                        );
                        continue;
                    }

                    let tile = tile_feature.tile_data(self.frame, row, column)?;
                    let id = tile_batches
                        .get((replay * num_tiles + tile.tile_index) as usize)
                        .copied()
                        .ok_or_else(|| unallocated("tile batch"))?;

                    arena.open(id, mode)?;
                    self.one_tile_commands(
                        arena.sink(id)?,
                        tile_feature,
                        &tile,
                        third_level,
                        &second_level,
                    )?;
                    let batch = arena.close(id, self.emitter)?;
                    self.emit(cmd, Command::BatchBufferStart(batch))?;
                }
            }
        }
        Ok(())
    }

    fn one_tile_commands(
        &self,
        sink: &mut dyn CommandSink,
        tile_feature: &dyn TileFeature,
        tile: &TileData,
        third_level: BatchRef,
        second_level: &[Option<BatchRef>],
    ) -> Result<()> {
        let multi_pipe = self.ctx.pipe.is_multi_pipe();

        if multi_pipe {
            self.emit(
                sink,
                Command::VdControlState(VdControlStateParams {
                    pipe_lock: true,
                    ..Default::default()
                }),
            )?;
        }
        self.emit(
            sink,
            Command::VdencPipeModeSelect(self.vdenc_pipe_mode_select_params()),
        )?;
        self.emit(sink, Command::PipeModeSelect(self.pipe_mode_select_params()))?;
        self.picture_state_with_tile(sink, third_level)?;

        let mut coding = TileCodingParams::default();
        tile_feature.set_tile_coding_params(self.frame, tile, self.ctx.pipe.count(), &mut coding);
        self.emit(sink, Command::TileCoding(coding))?;

        let mut slices_in_tile = 0;
        for index in 0..self.frame.slices.len() {
            let membership = tile_feature.is_slice_in_tile(self.frame, index, tile);
            if !membership.in_tile {
                continue;
            }
            let mut params = self.slice_state_params(index)?;
            tile_feature.set_slice_state_params(membership, &mut params);
            self.slice_commands(
                sink,
                index,
                params,
                second_level.get(index).copied().flatten(),
                Some((tile_feature, tile)),
            )?;
            self.emit(
                sink,
                Command::VdPipelineFlush(PipelineFlushParams::hevc_vdenc_flush()),
            )?;
            slices_in_tile += 1;
        }
        if slices_in_tile == 0 {
            return Err(VdForgeError::EmptyTile {
                row: tile.row,
                column: tile.column,
            });
        }

        if multi_pipe {
            self.emit(
                sink,
                Command::VdControlState(VdControlStateParams {
                    pipe_unlock: true,
                    ..Default::default()
                }),
            )?;
        }
        self.emit(sink, Command::VdPipelineFlush(PipelineFlushParams::hevc_done()))?;
        self.emit(
            sink,
            Command::FlushDw {
                video_pipeline_cache_invalidate: true,
            },
        )
    }

    fn slice_commands(
        &self,
        sink: &mut dyn CommandSink,
        index: usize,
        params: SliceStateParams,
        second_level: Option<BatchRef>,
        tile: Option<(&dyn TileFeature, &TileData)>,
    ) -> Result<()> {
        let slice = &self.frame.slices[index];

        if slice.slice_type.uses_list0() {
            self.emit(
                sink,
                Command::RefIdxState(RefIdxParams {
                    list: RefList::L0,
                    num_refs: slice.num_ref_idx_l0_active,
                    ref_pic_list: slice.ref_pic_list[0],
                    poc_curr_pic: self.frame.pic_order_cnt,
                }),
            )?;
        }
        if slice.slice_type.uses_list1() {
            self.emit(
                sink,
                Command::RefIdxState(RefIdxParams {
                    list: RefList::L1,
                    num_refs: slice.num_ref_idx_l1_active,
                    ref_pic_list: slice.ref_pic_list[1],
                    poc_curr_pic: self.frame.pic_order_cnt,
                }),
            )?;
        }

        self.emit(sink, Command::SliceState(params))?;
        if let Some(batch) = second_level {
            self.emit(sink, Command::BatchBufferStart(batch))?;
        }

        let mut walker = WalkerStateParams {
            num_pipes: self.ctx.pipe.walker_pipes(),
            slice_start_lcu: slice.start_lcu,
            num_lcus: slice.num_lcus,
            tile_start_lcu_x: 0,
            tile_start_lcu_y: 0,
            tile_width_in_lcus: self.frame.width_in_lcus(),
            tile_height_in_lcus: self.frame.height_in_lcus(),
        };
        if let Some((tile_feature, tile)) = tile {
            tile_feature.set_walker_state_params(tile, &mut walker);
        }
        self.emit(sink, Command::VdencWalkerState(walker))
    }

    /// Closing commands of the frame, before the barrier.
    fn end_of_frame_commands(&self, cmd: &mut CommandBuffer) -> Result<()> {
        let frame = self.frame;
        if (frame.last_pic_in_seq || frame.last_pic_in_stream) && self.ctx.pipe.is_last() {
            self.emit(
                cmd,
                Command::PakInsertObject(PakInsertParams {
                    last_pic_in_seq: frame.last_pic_in_seq,
                    last_pic_in_stream: frame.last_pic_in_stream,
                }),
            )?;
        }
        self.emit(
            cmd,
            Command::VdControlState(VdControlStateParams {
                memory_implicit_flush: true,
                ..Default::default()
            }),
        )?;
        self.emit(cmd, Command::VdPipelineFlush(PipelineFlushParams::hevc_done()))?;
        self.emit(
            cmd,
            Command::FlushDw {
                video_pipeline_cache_invalidate: true,
            },
        )
    }

    fn sync_all_pipes(&self, cmd: &mut CommandBuffer) -> Result<()> {
        self.sync
            .sync_pipe(self.emitter, cmd, BarrierKind::AllPipes, 0, &self.ctx.pipe)
    }

    fn rate_control_batch(&self) -> Result<BatchRef> {
        self.rate_control
            .vdenc_second_level_batch(self.ctx.recycled_buf_idx)
            .ok_or_else(|| {
                VdForgeError::InvalidResource(format!(
                    "rate control needs a picture-state batch for buffer set {} but has none",
                    self.ctx.recycled_buf_idx
                ))
            })
    }

    /// Where each slice's region of the rate-control batch starts, if slices use it.
    fn second_level_slice_batches(&self) -> Vec<Option<BatchRef>> {
        let num_slices = self.frame.slices.len();
        let advance = self.rate_control.is_acqp_enabled() || self.rate_control.is_brc_enabled();
        let batch = match self
            .rate_control
            .vdenc_second_level_batch(self.ctx.recycled_buf_idx)
        {
            Some(batch) if advance => batch,
            _ => return vec![None; num_slices],
        };
        self.rate_control
            .second_level_layout(self.frame)
            .slice_offsets(num_slices, advance)
            .into_iter()
            .map(|offset| Some(batch.at_offset(offset)))
            .collect()
    }

    fn pipe_mode_select_params(&self) -> PipeModeSelectParams {
        let state = PipeModeState::resolve(&self.ctx.pipe, self.tiles, self.config.tile_replay_enabled);
        let mut params = PipeModeSelectParams {
            multi_engine_mode: state.multi_engine_mode,
            pipe_work_mode: state.pipe_work_mode,
            tile_based_replay: state.tile_based_replay,
            streaming_buffer_enabled: self.config.streaming_buffer,
            vdenc_enabled: true,
            brc_enabled: false,
            pak_only_pass: self.ctx.pass.is_pak_only(),
        };
        if self.tiles {
            self.features
                .run_tile(|tile| tile.set_pipe_mode_select_params(self.frame, &mut params));
        }
        self.rate_control.set_pipe_mode_select_params(&mut params);
        params
    }

    fn vdenc_pipe_mode_select_params(&self) -> VdencPipeModeSelectParams {
        VdencPipeModeSelectParams {
            bit_depth: self.frame.bit_depth,
            chroma_format: self.frame.chroma_format,
            random_access: !self.frame.low_delay,
            rgb_encoding: self.config.rgb_encoding,
            wireless_encode: self.config.capture_mode,
            stream_in_enabled: self.config.stream_in_enabled,
            pak_obj_cmd_stream_out: true,
        }
    }

    fn surface_params(&self, surface_id: SurfaceId, resource: ResourceHandle) -> SurfaceStateParams {
        SurfaceStateParams {
            surface_id,
            resource,
            width: self.frame.dimensions.width,
            height: self.frame.dimensions.height,
            bit_depth: self.frame.bit_depth,
            chroma_format: self.frame.chroma_format,
        }
    }

    fn pipe_buf_addr_params(&self) -> PipeBufAddrParams {
        let resources = self.resources;
        let mut params = PipeBufAddrParams {
            recon: self.frame.surfaces.recon,
            pak_stream_out: resources.pak_stream_out,
            metadata_line: resources.metadata_line,
            metadata_tile_line: resources.metadata_tile_line,
            metadata_tile_column: resources.metadata_tile_column,
            lcu_ildb_stream_out: resources.lcu_ildb_stream_out,
            sse_src_pixel_row_store: resources.sse_src_pixel_row_store,
            pak_cu_level_stream_out: resources.pak_cu_level_stream_out,
            stream_out_offset: 0,
        };
        if self.ctx.pipe.is_multi_pipe() {
            self.features.run_tile(|tile| {
                tile.set_pipe_buf_addr_params(self.frame, &self.ctx.pipe, &mut params)
            });
        }
        params
    }

    fn cost_state_params(&self) -> CostStateParams {
        CostStateParams {
            coding_type: self.frame.coding_type,
            low_delay_b: self.is_low_delay_b(),
        }
    }

    fn picture_state_params(&self) -> PictureStateParams {
        let frame = self.frame;
        PictureStateParams {
            width_in_min_cb: frame.dimensions.width_in_blocks(MIN_CU_SIZE),
            height_in_min_cb: frame.dimensions.height_in_blocks(MIN_CU_SIZE),
            lcu_size: frame.max_lcu_size,
            bit_depth: frame.bit_depth,
            chroma_format: frame.chroma_format,
            coding_type: frame.coding_type,
            rec_not_filtered_id: 0,
            ibc_control: if self.config.lbc_only {
                IBC_CONTROL_LBC_ONLY
            } else {
                IBC_CONTROL_LBC_AND_WRITE_BACK
            },
            partial_frame_update: self.config.partial_frame_update
                && frame.coding_type != CodingType::I,
        }
    }

    fn image_state_params(&self, pass: &PassDescriptor) -> ImageStateParams {
        let mut params = ImageStateParams {
            coding_type: self.frame.coding_type,
            rounding_enabled: true,
            pak_only_multipass: pass.is_pak_only(),
            use_default_qp_deltas: false,
            panic_enabled: false,
            stream_in_enabled: self.config.stream_in_enabled,
            tile_replay_enabled: self.config.tile_replay_enabled && self.tiles,
            low_delay_b: self.is_low_delay_b(),
            capture_mode: self.config.capture_mode,
            roi_enabled: false,
            num_roi: 0,
        };
        self.rate_control.set_image_state_params(pass, &mut params);
        self.features
            .run_roi(|roi| roi.set_image_state_params(&mut params));
        params
    }

    fn rdoq_params(&self) -> RdoqStateParams {
        RdoqStateParams {
            bit_depth: self.frame.bit_depth,
            coding_type: self.frame.coding_type,
        }
    }

    fn slice_state_params(&self, index: usize) -> Result<SliceStateParams> {
        let slice = &self.frame.slices[index];
        let cmd_offset = self.slice_cmd_offsets.get(index).copied().ok_or_else(|| {
            VdForgeError::InvalidInput(format!("slice {index} has no PAK object offset"))
        })?;
        let last_slice_in_pic = index + 1 == self.frame.slices.len();

        let mut params = SliceStateParams {
            slice_index: index as u32,
            slice_start_lcu: slice.start_lcu,
            num_lcus: slice.num_lcus,
            slice_type: slice.slice_type,
            slice_qp_delta: slice.slice_qp_delta,
            cmd_offset,
            last_slice_in_pic,
            // Without tiles the frame is one tile.
            last_slice_in_tile: last_slice_in_pic,
            intra_ref_fetch_disable: self.ctx.pass.is_pak_only(),
            low_delay: self.frame.low_delay,
            rounding_intra: self.config.rounding_intra,
            rounding_inter: self.config.rounding_inter,
            vdenc_in_use: true,
        };
        self.rate_control
            .set_slice_state_params(self.ctx.recycled_buf_idx, &mut params);
        Ok(params)
    }

    fn is_low_delay_b(&self) -> bool {
        self.frame.low_delay && self.frame.coding_type == CodingType::B
    }
}
