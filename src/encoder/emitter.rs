//! Generation-neutral reference encoding of [`Command`]s.
//!
//! Every command is a header dword `opcode << 16 | payload_dwords` followed by
//! a fixed-size payload of little-endian dwords. Resource handles take two
//! dwords (low, high). This is the encoding used by tests, the demo, and any
//! tooling that wants to inspect a built program; hardware generations plug in
//! their own [`CommandEmitter`].

use crate::encoder::batch::BatchLevel;
use crate::encoder::commands::{
    Command, CommandEmitter, CommandSink, CompareOp, InternalBufferKind, MmioRegister, Opcode,
    PipeBufAddrParams, SurfaceStateParams,
};
use crate::encoder::pipe::{MultiEngineMode, PipeWorkMode};
use crate::encoder::resources::{HcpBufferSizeParams, ResourceHandle};
use crate::encoder::{align_up, BitDepth, CodingType, SliceType, CACHELINE_SIZE};
use crate::error::{Result, VdForgeError};

/// Dwords in one PAK object.
const PAK_OBJECT_DWORDS: u32 = 5;

/// Payload dwords of each opcode.
fn payload_dwords(opcode: Opcode) -> u32 {
    match opcode {
        Opcode::WatchdogThreshold => 1,
        Opcode::PerfTag => 3,
        Opcode::ForceWakeup | Opcode::Prolog | Opcode::BatchBufferEnd => 0,
        Opcode::StoreDataImm => 4,
        Opcode::AtomicIncrement => 3,
        Opcode::SemaphoreWait => 5,
        Opcode::StoreRegisterMem => 4,
        Opcode::FlushDw => 1,
        Opcode::BatchBufferStart => 4,
        Opcode::VdControlState | Opcode::VdPipelineFlush | Opcode::VdencControlState => 1,
        Opcode::VdencPipeModeSelect => 3,
        Opcode::VdencSurfaceState | Opcode::SurfaceState => 6,
        Opcode::VdencPipeBufAddrState | Opcode::PipeBufAddrState => 17,
        Opcode::IndObjBaseAddrState => 4,
        Opcode::QmState | Opcode::VdencCostState | Opcode::RdoqState => 2,
        Opcode::PictureState => 9,
        Opcode::VdencImageState => 3,
        Opcode::TileCoding => 9,
        Opcode::RefIdxState => 7,
        Opcode::SliceState => 8,
        Opcode::VdencWalkerState => 7,
        Opcode::PipeModeSelect => 3,
        Opcode::PakInsertObject => 1,
    }
}

fn flags(bits: &[bool]) -> u32 {
    bits.iter()
        .enumerate()
        .fold(0, |acc, (i, set)| acc | ((*set as u32) << i))
}

fn coding_type_code(coding_type: CodingType) -> u32 {
    match coding_type {
        CodingType::I => 1,
        CodingType::P => 2,
        CodingType::B => 3,
    }
}

fn slice_type_code(slice_type: SliceType) -> u32 {
    // HEVC slice_type: 0 = B, 1 = P, 2 = I.
    match slice_type {
        SliceType::B => 0,
        SliceType::P => 1,
        SliceType::I => 2,
    }
}

fn bit_depth_code(bit_depth: BitDepth) -> u32 {
    bit_depth.bits() as u32 - 8
}

fn multi_engine_code(mode: MultiEngineMode) -> u32 {
    match mode {
        MultiEngineMode::FeLegacy => 0,
        MultiEngineMode::Left => 1,
        MultiEngineMode::Right => 2,
        MultiEngineMode::Middle => 3,
    }
}

fn pipe_work_code(mode: PipeWorkMode) -> u32 {
    match mode {
        PipeWorkMode::Legacy => 0,
        PipeWorkMode::CodecBe => 2,
    }
}

fn register_code(register: MmioRegister) -> u32 {
    match register {
        MmioRegister::BitstreamByteCount => 0x1_C8A0,
        MmioRegister::SliceByteCount => 0x1_C8A4,
        MmioRegister::SseLuma => 0x1_C8B0,
        MmioRegister::SseChroma => 0x1_C8B4,
        MmioRegister::ImageStatusControl => 0x1_C8B8,
    }
}

/// Dword payload under construction.
#[derive(Default)]
struct Payload(Vec<u32>);

impl Payload {
    fn dword(&mut self, value: u32) -> &mut Self {
        self.0.push(value);
        self
    }

    fn handle(&mut self, handle: ResourceHandle) -> &mut Self {
        self.0.push(handle.raw() as u32);
        self.0.push((handle.raw() >> 32) as u32);
        self
    }

    fn surface(&mut self, params: &SurfaceStateParams) -> &mut Self {
        self.dword(params.surface_id as u32)
            .handle(params.resource)
            .dword(params.width)
            .dword(params.height)
            .dword(bit_depth_code(params.bit_depth) << 8 | params.chroma_format.idc() as u32)
    }

    fn pipe_buf_addr(&mut self, params: &PipeBufAddrParams) -> &mut Self {
        self.handle(params.recon)
            .handle(params.pak_stream_out)
            .handle(params.metadata_line)
            .handle(params.metadata_tile_line)
            .handle(params.metadata_tile_column)
            .handle(params.lcu_ildb_stream_out)
            .handle(params.sse_src_pixel_row_store)
            .handle(params.pak_cu_level_stream_out)
            .dword(params.stream_out_offset)
    }
}

/// Reference [`CommandEmitter`] producing the dword encoding described above.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReferenceEmitter;

impl ReferenceEmitter {
    pub fn new() -> Self {
        Self
    }

    fn encode(&self, command: &Command) -> Payload {
        let mut p = Payload::default();
        match command {
            Command::WatchdogThreshold { threshold_ms } => {
                p.dword(*threshold_ms);
            }
            Command::PerfTag(tag) => {
                p.dword((tag.call_type as u32) << 16 | tag.mode as u32)
                    .dword(coding_type_code(tag.coding_type))
                    .dword(tag.buffer_id as u32);
            }
            Command::ForceWakeup | Command::Prolog | Command::BatchBufferEnd => {}
            Command::StoreDataImm {
                resource,
                offset,
                value,
            } => {
                p.handle(*resource).dword(*offset).dword(*value);
            }
            Command::AtomicIncrement { resource, offset } => {
                p.handle(*resource).dword(*offset);
            }
            Command::SemaphoreWait {
                resource,
                offset,
                value,
                compare,
            } => {
                let compare = match compare {
                    CompareOp::GreaterOrEqual => 0,
                    CompareOp::Equal => 1,
                };
                p.handle(*resource).dword(*offset).dword(*value).dword(compare);
            }
            Command::StoreRegisterMem {
                register,
                resource,
                offset,
            } => {
                p.dword(register_code(*register))
                    .handle(*resource)
                    .dword(*offset);
            }
            Command::FlushDw {
                video_pipeline_cache_invalidate,
            } => {
                p.dword(*video_pipeline_cache_invalidate as u32);
            }
            Command::BatchBufferStart(batch) => {
                p.handle(batch.resource())
                    .dword(batch.offset())
                    .dword(batch.level().as_u32());
            }
            Command::VdControlState(s) => {
                p.dword(flags(&[
                    s.initialization,
                    s.memory_implicit_flush,
                    s.pipe_lock,
                    s.pipe_unlock,
                ]));
            }
            Command::VdPipelineFlush(s) => {
                p.dword(flags(&[
                    s.wait_done_hevc,
                    s.wait_done_vdenc,
                    s.flush_hevc,
                    s.flush_vdenc,
                    s.wait_done_vd_command_message_parser,
                ]));
            }
            Command::VdencControlState { initialization } => {
                p.dword(*initialization as u32);
            }
            Command::VdencPipeModeSelect(s) => {
                p.dword(bit_depth_code(s.bit_depth))
                    .dword(s.chroma_format.idc() as u32)
                    .dword(flags(&[
                        s.random_access,
                        s.rgb_encoding,
                        s.wireless_encode,
                        s.stream_in_enabled,
                        s.pak_obj_cmd_stream_out,
                    ]));
            }
            Command::VdencSurfaceState(s) | Command::SurfaceState(s) => {
                p.surface(s);
            }
            Command::VdencPipeBufAddrState(s) | Command::PipeBufAddrState(s) => {
                p.pipe_buf_addr(s);
            }
            Command::IndObjBaseAddrState(s) => {
                p.handle(s.mb_code).handle(s.bitstream);
            }
            Command::QmState(s) => {
                p.dword(s.flat_scaling as u32).dword(bit_depth_code(s.bit_depth));
            }
            Command::VdencCostState(s) => {
                p.dword(coding_type_code(s.coding_type))
                    .dword(s.low_delay_b as u32);
            }
            Command::PictureState(s) => {
                p.dword(s.width_in_min_cb)
                    .dword(s.height_in_min_cb)
                    .dword(s.lcu_size)
                    .dword(bit_depth_code(s.bit_depth))
                    .dword(s.chroma_format.idc() as u32)
                    .dword(coding_type_code(s.coding_type))
                    .dword(s.rec_not_filtered_id as u32)
                    .dword(s.ibc_control as u32)
                    .dword(s.partial_frame_update as u32);
            }
            Command::VdencImageState(s) => {
                p.dword(coding_type_code(s.coding_type))
                    .dword(flags(&[
                        s.rounding_enabled,
                        s.pak_only_multipass,
                        s.use_default_qp_deltas,
                        s.panic_enabled,
                        s.stream_in_enabled,
                        s.tile_replay_enabled,
                        s.low_delay_b,
                        s.capture_mode,
                        s.roi_enabled,
                    ]))
                    .dword(s.num_roi as u32);
            }
            Command::RdoqState(s) => {
                p.dword(bit_depth_code(s.bit_depth))
                    .dword(coding_type_code(s.coding_type));
            }
            Command::TileCoding(s) => {
                p.dword(s.tile_start_lcu_x)
                    .dword(s.tile_start_lcu_y)
                    .dword(s.tile_width_in_lcus)
                    .dword(s.tile_height_in_lcus)
                    .dword(flags(&[s.is_last_tile_of_row, s.is_last_tile_of_column]))
                    .dword(s.num_pipes as u32)
                    .dword(s.lcu_offset)
                    .dword(s.cu_record_offset)
                    .dword(0);
            }
            Command::RefIdxState(s) => {
                p.dword(s.list as u32)
                    .dword(s.num_refs as u32)
                    .dword(s.poc_curr_pic as u32);
                for chunk in s.ref_pic_list.chunks(4) {
                    let mut bytes = [0xFFu8; 4];
                    bytes[..chunk.len()].copy_from_slice(chunk);
                    p.dword(u32::from_le_bytes(bytes));
                }
            }
            Command::SliceState(s) => {
                p.dword(s.slice_index)
                    .dword(s.slice_start_lcu)
                    .dword(s.num_lcus)
                    .dword(slice_type_code(s.slice_type))
                    .dword(s.slice_qp_delta as i32 as u32)
                    .dword(s.cmd_offset)
                    .dword(flags(&[
                        s.last_slice_in_pic,
                        s.last_slice_in_tile,
                        s.intra_ref_fetch_disable,
                        s.low_delay,
                        s.vdenc_in_use,
                    ]))
                    .dword((s.rounding_intra as u32) << 8 | s.rounding_inter as u32);
            }
            Command::VdencWalkerState(s) => {
                p.dword(s.num_pipes.count())
                    .dword(s.slice_start_lcu)
                    .dword(s.num_lcus)
                    .dword(s.tile_start_lcu_x)
                    .dword(s.tile_start_lcu_y)
                    .dword(s.tile_width_in_lcus)
                    .dword(s.tile_height_in_lcus);
            }
            Command::PipeModeSelect(s) => {
                p.dword(multi_engine_code(s.multi_engine_mode))
                    .dword(pipe_work_code(s.pipe_work_mode))
                    .dword(flags(&[
                        s.tile_based_replay,
                        s.streaming_buffer_enabled,
                        s.vdenc_enabled,
                        s.brc_enabled,
                        s.pak_only_pass,
                    ]));
            }
            Command::PakInsertObject(s) => {
                p.dword(flags(&[s.last_pic_in_seq, s.last_pic_in_stream]));
            }
        }
        p
    }
}

impl CommandEmitter for ReferenceEmitter {
    fn emit(&self, sink: &mut dyn CommandSink, command: &Command) -> Result<()> {
        let opcode = command.opcode();
        let expected = payload_dwords(opcode);
        let Payload(mut payload) = self.encode(command);
        if payload.len() as u32 > expected {
            return Err(VdForgeError::Emitter(format!(
                "{opcode:?} payload has {} dwords, layout allows {expected}",
                payload.len()
            )));
        }
        payload.resize(expected as usize, 0);

        let mut bytes = Vec::with_capacity(4 * (1 + payload.len()));
        bytes.extend_from_slice(&((opcode as u32) << 16 | expected).to_le_bytes());
        for dword in payload {
            bytes.extend_from_slice(&dword.to_le_bytes());
        }
        sink.append(&bytes)
    }

    fn command_size(&self, opcode: Opcode) -> u32 {
        4 * (1 + payload_dwords(opcode))
    }

    fn pak_object_size(&self) -> u32 {
        PAK_OBJECT_DWORDS
    }

    fn hevc_buffer_size(
        &self,
        kind: InternalBufferKind,
        params: &HcpBufferSizeParams,
    ) -> Result<u32> {
        if !(4..=6).contains(&params.ctb_log2_size) {
            return Err(VdForgeError::InvalidInput(format!(
                "CTB log2 size {} is out of range",
                params.ctb_log2_size
            )));
        }
        if params.pic_width == 0 || params.pic_height == 0 {
            return Err(VdForgeError::InvalidInput(
                "buffer sizing needs a non-empty picture".to_string(),
            ));
        }

        let ctb_size = 1u32 << params.ctb_log2_size;
        let width_in_ctbs = params.pic_width.div_ceil(ctb_size);
        let height_in_ctbs = params.pic_height.div_ceil(ctb_size);
        let depth_factor = match params.max_bit_depth {
            BitDepth::Eight => 2,
            BitDepth::Ten => 3,
        };
        let cachelines = match kind {
            InternalBufferKind::MetadataLine => width_in_ctbs * depth_factor + 4,
            InternalBufferKind::MetadataTileLine => width_in_ctbs * depth_factor * 2 + 4,
            InternalBufferKind::MetadataTileColumn => height_in_ctbs * depth_factor * 2 + 4,
        };
        Ok(align_up(cachelines * CACHELINE_SIZE, CACHELINE_SIZE))
    }
}

/// One command read back from an encoded stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedCommand {
    /// Byte offset of the header dword.
    pub offset: u32,
    pub opcode: Opcode,
    pub payload: Vec<u32>,
}

impl DecodedCommand {
    /// Read a resource handle starting at payload dword `index`.
    pub fn handle_at(&self, index: usize) -> Option<ResourceHandle> {
        let lo = *self.payload.get(index)? as u64;
        let hi = *self.payload.get(index + 1)? as u64;
        Some(ResourceHandle::new(hi << 32 | lo))
    }

    /// Target of a batch-buffer-start: resource, byte offset and level.
    pub fn batch_target(&self) -> Option<(ResourceHandle, u32, BatchLevel)> {
        if self.opcode != Opcode::BatchBufferStart {
            return None;
        }
        let level = BatchLevel::from_u32(*self.payload.get(3)?)?;
        Some((self.handle_at(0)?, self.payload[2], level))
    }
}

/// Split a reference-encoded byte stream into commands.
pub fn decode_stream(bytes: &[u8]) -> Result<Vec<DecodedCommand>> {
    if bytes.len() % 4 != 0 {
        return Err(VdForgeError::Emitter(format!(
            "stream length {} is not dword aligned",
            bytes.len()
        )));
    }
    let dwords: Vec<u32> = bytes
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();

    let mut commands = Vec::new();
    let mut index = 0usize;
    while index < dwords.len() {
        let header = dwords[index];
        let opcode = Opcode::from_u16((header >> 16) as u16).ok_or_else(|| {
            VdForgeError::Emitter(format!("unknown opcode in header {header:#010x}"))
        })?;
        let length = (header & 0xFFFF) as usize;
        let end = index + 1 + length;
        if end > dwords.len() {
            return Err(VdForgeError::Emitter(format!(
                "{opcode:?} at byte {} runs past the end of the stream",
                index * 4
            )));
        }
        commands.push(DecodedCommand {
            offset: (index * 4) as u32,
            opcode,
            payload: dwords[index + 1..end].to_vec(),
        });
        index = end;
    }
    Ok(commands)
}
