//! Typed hardware command parameters and the emitter interface.
//!
//! The builder never produces raw bytes. It fills one of the parameter structs
//! below, wraps it in a [`Command`], and hands it to a [`CommandEmitter`] that
//! knows the generation-specific wire format.

use crate::encoder::batch::BatchRef;
use crate::encoder::pipe::{MultiEngineMode, PipeWorkMode, WalkerPipes};
use crate::encoder::resources::{HcpBufferSizeParams, ResourceHandle};
use crate::encoder::{BitDepth, ChromaFormat, CodingType, SliceType, MAX_NUM_REF_FRAMES};
use crate::error::Result;

/// Destination of emitted command bytes.
pub trait CommandSink {
    /// Append `bytes` at the current write offset.
    fn append(&mut self, bytes: &[u8]) -> Result<()>;

    /// Current write offset in bytes.
    fn offset(&self) -> u32;

    /// Bytes left before the end of the region.
    fn remaining(&self) -> u32;
}

/// Serializes typed commands into a sink.
pub trait CommandEmitter {
    /// Append the encoding of `command` to `sink`.
    fn emit(&self, sink: &mut dyn CommandSink, command: &Command) -> Result<()>;

    /// Largest encoded size of a command with `opcode`, in bytes.
    fn command_size(&self, opcode: Opcode) -> u32;

    /// Size of one PAK object (per-LCU bitstream object command) in dwords.
    fn pak_object_size(&self) -> u32;

    /// Size of an internal HCP buffer for the given geometry.
    fn hevc_buffer_size(&self, kind: InternalBufferKind, params: &HcpBufferSizeParams)
        -> Result<u32>;
}

/// Internal HCP buffers whose size depends on the generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InternalBufferKind {
    MetadataLine,
    MetadataTileLine,
    MetadataTileColumn,
}

/// Command opcodes, one per [`Command`] variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Opcode {
    WatchdogThreshold = 0x01,
    PerfTag = 0x02,
    ForceWakeup = 0x03,
    Prolog = 0x04,
    StoreDataImm = 0x10,
    AtomicIncrement = 0x11,
    SemaphoreWait = 0x12,
    StoreRegisterMem = 0x13,
    FlushDw = 0x14,
    BatchBufferStart = 0x18,
    BatchBufferEnd = 0x19,
    VdControlState = 0x20,
    VdPipelineFlush = 0x21,
    VdencControlState = 0x30,
    VdencPipeModeSelect = 0x31,
    VdencSurfaceState = 0x32,
    VdencPipeBufAddrState = 0x33,
    VdencCostState = 0x34,
    VdencImageState = 0x35,
    VdencWalkerState = 0x36,
    PipeModeSelect = 0x40,
    SurfaceState = 0x41,
    PipeBufAddrState = 0x42,
    IndObjBaseAddrState = 0x43,
    QmState = 0x44,
    PictureState = 0x45,
    RdoqState = 0x46,
    TileCoding = 0x47,
    RefIdxState = 0x48,
    SliceState = 0x49,
    PakInsertObject = 0x4A,
}

impl Opcode {
    /// Every opcode, in numeric order.
    pub const ALL: [Opcode; 31] = [
        Opcode::WatchdogThreshold,
        Opcode::PerfTag,
        Opcode::ForceWakeup,
        Opcode::Prolog,
        Opcode::StoreDataImm,
        Opcode::AtomicIncrement,
        Opcode::SemaphoreWait,
        Opcode::StoreRegisterMem,
        Opcode::FlushDw,
        Opcode::BatchBufferStart,
        Opcode::BatchBufferEnd,
        Opcode::VdControlState,
        Opcode::VdPipelineFlush,
        Opcode::VdencControlState,
        Opcode::VdencPipeModeSelect,
        Opcode::VdencSurfaceState,
        Opcode::VdencPipeBufAddrState,
        Opcode::VdencCostState,
        Opcode::VdencImageState,
        Opcode::VdencWalkerState,
        Opcode::PipeModeSelect,
        Opcode::SurfaceState,
        Opcode::PipeBufAddrState,
        Opcode::IndObjBaseAddrState,
        Opcode::QmState,
        Opcode::PictureState,
        Opcode::RdoqState,
        Opcode::TileCoding,
        Opcode::RefIdxState,
        Opcode::SliceState,
        Opcode::PakInsertObject,
    ];

    /// Look up an opcode from its numeric value.
    pub fn from_u16(value: u16) -> Option<Opcode> {
        Self::ALL.iter().copied().find(|op| *op as u16 == value)
    }

    /// Whether the command carries a graphics address that needs patching.
    pub fn carries_address(&self) -> bool {
        matches!(
            self,
            Opcode::StoreDataImm
                | Opcode::AtomicIncrement
                | Opcode::SemaphoreWait
                | Opcode::StoreRegisterMem
                | Opcode::BatchBufferStart
                | Opcode::VdencSurfaceState
                | Opcode::VdencPipeBufAddrState
                | Opcode::SurfaceState
                | Opcode::PipeBufAddrState
                | Opcode::IndObjBaseAddrState
        )
    }
}

/// Semaphore comparison used by [`Command::SemaphoreWait`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    GreaterOrEqual,
    Equal,
}

/// Engine registers read back into the status report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MmioRegister {
    /// Bitstream bytes written for the frame.
    BitstreamByteCount,
    /// Bitstream bytes written for the last slice.
    SliceByteCount,
    /// Sum of squared errors for luma.
    SseLuma,
    /// Sum of squared errors for chroma.
    SseChroma,
    /// Image status control.
    ImageStatusControl,
}

/// Performance tag attached to the submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PerfTagParams {
    pub call_type: u16,
    pub mode: u16,
    pub coding_type: CodingType,
    /// Per-submission buffer id, reset between frames unless all passes share one task phase.
    pub buffer_id: u16,
}

/// VD_CONTROL_STATE fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VdControlStateParams {
    pub initialization: bool,
    pub memory_implicit_flush: bool,
    pub pipe_lock: bool,
    pub pipe_unlock: bool,
}

/// HCP pipe-mode-select fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipeModeSelectParams {
    pub multi_engine_mode: MultiEngineMode,
    pub pipe_work_mode: PipeWorkMode,
    pub tile_based_replay: bool,
    pub streaming_buffer_enabled: bool,
    pub vdenc_enabled: bool,
    pub brc_enabled: bool,
    pub pak_only_pass: bool,
}

/// VDEnc pipe-mode-select fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VdencPipeModeSelectParams {
    pub bit_depth: BitDepth,
    pub chroma_format: ChromaFormat,
    pub random_access: bool,
    pub rgb_encoding: bool,
    pub wireless_encode: bool,
    pub stream_in_enabled: bool,
    pub pak_obj_cmd_stream_out: bool,
}

/// Surface role in surface-state commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SurfaceId {
    Source = 1,
    Recon = 2,
    Reference = 3,
}

/// Surface-state fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SurfaceStateParams {
    pub surface_id: SurfaceId,
    pub resource: ResourceHandle,
    pub width: u32,
    pub height: u32,
    pub bit_depth: BitDepth,
    pub chroma_format: ChromaFormat,
}

/// Pipe buffer address fields shared by HCP and VDEnc.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipeBufAddrParams {
    pub recon: ResourceHandle,
    pub pak_stream_out: ResourceHandle,
    pub metadata_line: ResourceHandle,
    pub metadata_tile_line: ResourceHandle,
    pub metadata_tile_column: ResourceHandle,
    pub lcu_ildb_stream_out: ResourceHandle,
    pub sse_src_pixel_row_store: ResourceHandle,
    pub pak_cu_level_stream_out: ResourceHandle,
    /// Byte offset of this pipe's region in shared stream-out buffers.
    pub stream_out_offset: u32,
}

/// Indirect object base addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndObjBaseAddrParams {
    pub mb_code: ResourceHandle,
    pub bitstream: ResourceHandle,
}

/// Quantization matrix state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QmStateParams {
    pub flat_scaling: bool,
    pub bit_depth: BitDepth,
}

/// VDEnc cost state (image state #1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CostStateParams {
    pub coding_type: CodingType,
    pub low_delay_b: bool,
}

/// HCP picture state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PictureStateParams {
    pub width_in_min_cb: u32,
    pub height_in_min_cb: u32,
    pub lcu_size: u32,
    pub bit_depth: BitDepth,
    pub chroma_format: ChromaFormat,
    pub coding_type: CodingType,
    pub rec_not_filtered_id: u8,
    pub ibc_control: u8,
    pub partial_frame_update: bool,
}

/// VDEnc image state (image state #2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageStateParams {
    pub coding_type: CodingType,
    pub rounding_enabled: bool,
    pub pak_only_multipass: bool,
    pub use_default_qp_deltas: bool,
    pub panic_enabled: bool,
    pub stream_in_enabled: bool,
    pub tile_replay_enabled: bool,
    pub low_delay_b: bool,
    pub capture_mode: bool,
    pub roi_enabled: bool,
    pub num_roi: u8,
}

/// RDOQ state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RdoqStateParams {
    pub bit_depth: BitDepth,
    pub coding_type: CodingType,
}

/// Tile coding location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TileCodingParams {
    pub tile_start_lcu_x: u32,
    pub tile_start_lcu_y: u32,
    pub tile_width_in_lcus: u32,
    pub tile_height_in_lcus: u32,
    pub is_last_tile_of_row: bool,
    pub is_last_tile_of_column: bool,
    pub num_pipes: u8,
    /// Tile-scan address of the tile's first LCU.
    pub lcu_offset: u32,
    /// Offset of the tile's CU records in the CU-level stream-out, in cachelines.
    pub cu_record_offset: u32,
}

/// Reference list selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RefList {
    L0 = 0,
    L1 = 1,
}

/// Reference index state for one list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefIdxParams {
    pub list: RefList,
    pub num_refs: u8,
    pub ref_pic_list: [u8; MAX_NUM_REF_FRAMES],
    pub poc_curr_pic: i32,
}

/// HCP slice state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SliceStateParams {
    pub slice_index: u32,
    pub slice_start_lcu: u32,
    pub num_lcus: u32,
    pub slice_type: SliceType,
    pub slice_qp_delta: i8,
    /// Byte offset of the slice's PAK objects in the bitstream object stream.
    pub cmd_offset: u32,
    pub last_slice_in_pic: bool,
    pub last_slice_in_tile: bool,
    pub intra_ref_fetch_disable: bool,
    pub low_delay: bool,
    pub rounding_intra: u8,
    pub rounding_inter: u8,
    pub vdenc_in_use: bool,
}

/// VDEnc walker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalkerStateParams {
    pub num_pipes: WalkerPipes,
    pub slice_start_lcu: u32,
    pub num_lcus: u32,
    pub tile_start_lcu_x: u32,
    pub tile_start_lcu_y: u32,
    pub tile_width_in_lcus: u32,
    pub tile_height_in_lcus: u32,
}

/// VD_PIPELINE_FLUSH fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PipelineFlushParams {
    pub wait_done_hevc: bool,
    pub wait_done_vdenc: bool,
    pub flush_hevc: bool,
    pub flush_vdenc: bool,
    pub wait_done_vd_command_message_parser: bool,
}

impl PipelineFlushParams {
    /// Wait for both engines and flush them (used after a slice without tiles).
    pub fn vdenc_done() -> Self {
        Self {
            wait_done_hevc: true,
            wait_done_vdenc: true,
            flush_hevc: true,
            flush_vdenc: true,
            wait_done_vd_command_message_parser: true,
        }
    }

    /// Wait for the bitstream engine only.
    pub fn hevc_done() -> Self {
        Self {
            wait_done_hevc: true,
            flush_hevc: true,
            wait_done_vd_command_message_parser: true,
            ..Self::default()
        }
    }

    /// Lightweight flush of both engines without the parser wait (per slice within a tile).
    pub fn hevc_vdenc_flush() -> Self {
        Self {
            wait_done_hevc: true,
            wait_done_vdenc: true,
            flush_hevc: true,
            flush_vdenc: true,
            wait_done_vd_command_message_parser: false,
        }
    }
}

/// PAK insert object used for end-of-sequence / end-of-stream NAL units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PakInsertParams {
    pub last_pic_in_seq: bool,
    pub last_pic_in_stream: bool,
}

/// One hardware instruction with its typed parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    WatchdogThreshold { threshold_ms: u32 },
    PerfTag(PerfTagParams),
    ForceWakeup,
    Prolog,
    StoreDataImm {
        resource: ResourceHandle,
        offset: u32,
        value: u32,
    },
    AtomicIncrement {
        resource: ResourceHandle,
        offset: u32,
    },
    SemaphoreWait {
        resource: ResourceHandle,
        offset: u32,
        value: u32,
        compare: CompareOp,
    },
    StoreRegisterMem {
        register: MmioRegister,
        resource: ResourceHandle,
        offset: u32,
    },
    FlushDw { video_pipeline_cache_invalidate: bool },
    BatchBufferStart(BatchRef),
    BatchBufferEnd,
    VdControlState(VdControlStateParams),
    VdPipelineFlush(PipelineFlushParams),
    VdencControlState { initialization: bool },
    VdencPipeModeSelect(VdencPipeModeSelectParams),
    VdencSurfaceState(SurfaceStateParams),
    VdencPipeBufAddrState(PipeBufAddrParams),
    VdencCostState(CostStateParams),
    VdencImageState(ImageStateParams),
    VdencWalkerState(WalkerStateParams),
    PipeModeSelect(PipeModeSelectParams),
    SurfaceState(SurfaceStateParams),
    PipeBufAddrState(PipeBufAddrParams),
    IndObjBaseAddrState(IndObjBaseAddrParams),
    QmState(QmStateParams),
    PictureState(PictureStateParams),
    RdoqState(RdoqStateParams),
    TileCoding(TileCodingParams),
    RefIdxState(RefIdxParams),
    SliceState(SliceStateParams),
    PakInsertObject(PakInsertParams),
}

impl Command {
    /// Opcode of this command.
    pub fn opcode(&self) -> Opcode {
        match self {
            Command::WatchdogThreshold { .. } => Opcode::WatchdogThreshold,
            Command::PerfTag(_) => Opcode::PerfTag,
            Command::ForceWakeup => Opcode::ForceWakeup,
            Command::Prolog => Opcode::Prolog,
            Command::StoreDataImm { .. } => Opcode::StoreDataImm,
            Command::AtomicIncrement { .. } => Opcode::AtomicIncrement,
            Command::SemaphoreWait { .. } => Opcode::SemaphoreWait,
            Command::StoreRegisterMem { .. } => Opcode::StoreRegisterMem,
            Command::FlushDw { .. } => Opcode::FlushDw,
            Command::BatchBufferStart(_) => Opcode::BatchBufferStart,
            Command::BatchBufferEnd => Opcode::BatchBufferEnd,
            Command::VdControlState(_) => Opcode::VdControlState,
            Command::VdPipelineFlush(_) => Opcode::VdPipelineFlush,
            Command::VdencControlState { .. } => Opcode::VdencControlState,
            Command::VdencPipeModeSelect(_) => Opcode::VdencPipeModeSelect,
            Command::VdencSurfaceState(_) => Opcode::VdencSurfaceState,
            Command::VdencPipeBufAddrState(_) => Opcode::VdencPipeBufAddrState,
            Command::VdencCostState(_) => Opcode::VdencCostState,
            Command::VdencImageState(_) => Opcode::VdencImageState,
            Command::VdencWalkerState(_) => Opcode::VdencWalkerState,
            Command::PipeModeSelect(_) => Opcode::PipeModeSelect,
            Command::SurfaceState(_) => Opcode::SurfaceState,
            Command::PipeBufAddrState(_) => Opcode::PipeBufAddrState,
            Command::IndObjBaseAddrState(_) => Opcode::IndObjBaseAddrState,
            Command::QmState(_) => Opcode::QmState,
            Command::PictureState(_) => Opcode::PictureState,
            Command::RdoqState(_) => Opcode::RdoqState,
            Command::TileCoding(_) => Opcode::TileCoding,
            Command::RefIdxState(_) => Opcode::RefIdxState,
            Command::SliceState(_) => Opcode::SliceState,
            Command::PakInsertObject(_) => Opcode::PakInsertObject,
        }
    }
}
