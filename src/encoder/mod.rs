//! Encoder types, configuration, and shared utilities.
//!
//! This module provides:
//! - Frame, slice and tile descriptors consumed by the command builder.
//! - Packet configuration (`PacketConfig`) and per-submission context (`SubmitContext`).
//! - The collaborator interfaces (`commands`, `resources`, `features`, `platform`).
//! - The batch-buffer hierarchy (`batch`), pipe state (`pipe`) and barriers (`sync`).
//! - The HEVC VDEnc command builder (`h265`).

pub mod batch;
pub mod commands;
pub mod emitter;
pub mod features;
pub mod h265;
pub mod pipe;
pub mod platform;
pub mod resources;
pub mod status;
pub mod sync;

use crate::encoder::pipe::PipeDescriptor;
use crate::encoder::resources::ResourceHandle;
use crate::error::{Result, VdForgeError};

// Default packet configuration constants.

/// Default maximum number of rate-control passes per frame.
pub const DEFAULT_MAX_NUM_PASSES: u8 = 4;

/// Default number of recycled PAK-slice batch buffers.
pub const DEFAULT_NUM_PAK_SLICE_BATCH_BUFFERS: u8 = 3;

/// Default number of tile-replay passes per tile row.
pub const DEFAULT_NUM_PASSES_FOR_TILE_REPLAY: u8 = 1;

/// Default intra rounding value for slice state.
pub const DEFAULT_ROUNDING_INTRA: u8 = 10;

/// Default inter rounding value for slice state.
pub const DEFAULT_ROUNDING_INTER: u8 = 4;

/// Default largest coding unit size in pixels.
pub const DEFAULT_MAX_LCU_SIZE: u32 = 64;

/// Minimum coding unit size in pixels.
pub const MIN_CU_SIZE: u32 = 8;

/// GPU cacheline size in bytes.
pub const CACHELINE_SIZE: u32 = 64;

/// Maximum number of active references per list.
pub const MAX_NUM_REF_FRAMES: usize = 15;

/// Round `value` up to a multiple of `alignment` (which must be non-zero).
pub(crate) fn align_up(value: u32, alignment: u32) -> u32 {
    value.div_ceil(alignment) * alignment
}

/// Chroma subsampling of the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChromaFormat {
    /// YUV 4:2:0 (half horizontal and vertical chroma resolution).
    #[default]
    Yuv420,
    /// YUV 4:2:2 (half horizontal chroma resolution).
    Yuv422,
    /// YUV 4:4:4 (full chroma resolution).
    Yuv444,
}

impl ChromaFormat {
    /// HEVC `chroma_format_idc` value.
    pub fn idc(&self) -> u8 {
        match self {
            ChromaFormat::Yuv420 => 1,
            ChromaFormat::Yuv422 => 2,
            ChromaFormat::Yuv444 => 3,
        }
    }
}

/// Bit depth per component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BitDepth {
    /// 8-bit per component (Main profile).
    #[default]
    Eight,
    /// 10-bit per component (Main10 profile).
    Ten,
}

impl BitDepth {
    /// Number of bits per component.
    pub fn bits(&self) -> u8 {
        match self {
            BitDepth::Eight => 8,
            BitDepth::Ten => 10,
        }
    }
}

/// Picture coding type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CodingType {
    /// Intra-coded picture.
    #[default]
    I,
    /// Predicted picture.
    P,
    /// Bi-predicted picture.
    B,
}

/// Slice coding type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SliceType {
    #[default]
    I,
    P,
    B,
}

impl SliceType {
    /// Whether the slice references list 0.
    pub fn uses_list0(&self) -> bool {
        matches!(self, Self::P | Self::B)
    }

    /// Whether the slice references list 1.
    pub fn uses_list1(&self) -> bool {
        matches!(self, Self::B)
    }
}

/// Frame dimensions in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

impl Dimensions {
    /// Width in blocks of `block_size` pixels, rounded up.
    pub fn width_in_blocks(&self, block_size: u32) -> u32 {
        self.width.div_ceil(block_size)
    }

    /// Height in blocks of `block_size` pixels, rounded up.
    pub fn height_in_blocks(&self, block_size: u32) -> u32 {
        self.height.div_ceil(block_size)
    }

    /// Number of pixels.
    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

/// Frame-owned surfaces referenced by picture-level commands.
///
/// These are owned by the outer pipeline; the packet only patches their
/// addresses into commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameSurfaces {
    /// Raw source picture.
    pub source: ResourceHandle,
    /// Reconstructed picture.
    pub recon: ResourceHandle,
    /// Output bitstream buffer.
    pub bitstream: ResourceHandle,
    /// PAK object (bitstream object) command stream.
    pub mb_code: ResourceHandle,
}

impl FrameSurfaces {
    fn validate(&self) -> Result<()> {
        let named = [
            ("source", self.source),
            ("recon", self.recon),
            ("bitstream", self.bitstream),
            ("mb_code", self.mb_code),
        ];
        for (name, handle) in named {
            if !handle.is_valid() {
                return Err(VdForgeError::InvalidResource(format!(
                    "frame surface '{name}' is not set"
                )));
            }
        }
        Ok(())
    }
}

/// One slice of the frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SliceDescriptor {
    /// Raster address of the first LCU (`slice_segment_address`).
    pub start_lcu: u32,
    /// Number of LCUs in the slice.
    pub num_lcus: u32,
    /// Slice coding type.
    pub slice_type: SliceType,
    /// Active references in list 0.
    pub num_ref_idx_l0_active: u8,
    /// Active references in list 1.
    pub num_ref_idx_l1_active: u8,
    /// Reference picture lists, as indices into the frame's reference table.
    pub ref_pic_list: [[u8; MAX_NUM_REF_FRAMES]; 2],
    /// Slice QP delta.
    pub slice_qp_delta: i8,
}

impl SliceDescriptor {
    /// Create a slice with no references.
    pub fn new(start_lcu: u32, num_lcus: u32, slice_type: SliceType) -> Self {
        Self {
            start_lcu,
            num_lcus,
            slice_type,
            num_ref_idx_l0_active: 0,
            num_ref_idx_l1_active: 0,
            ref_pic_list: [[0xFF; MAX_NUM_REF_FRAMES]; 2],
            slice_qp_delta: 0,
        }
    }

    /// Set the reference lists (truncated to `MAX_NUM_REF_FRAMES` entries).
    pub fn with_references(mut self, list0: &[u8], list1: &[u8]) -> Self {
        for (list, refs) in [list0, list1].into_iter().enumerate() {
            let count = refs.len().min(MAX_NUM_REF_FRAMES);
            self.ref_pic_list[list][..count].copy_from_slice(&refs[..count]);
            if list == 0 {
                self.num_ref_idx_l0_active = count as u8;
            } else {
                self.num_ref_idx_l1_active = count as u8;
            }
        }
        self
    }

    /// Set the slice QP delta.
    pub fn with_qp_delta(mut self, delta: i8) -> Self {
        self.slice_qp_delta = delta;
        self
    }
}

/// Tile grid in LCU units.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileGrid {
    /// Width of each tile column in LCUs.
    pub column_widths: Vec<u32>,
    /// Height of each tile row in LCUs.
    pub row_heights: Vec<u32>,
}

impl TileGrid {
    /// Split `width_in_lcus` x `height_in_lcus` into an even grid, the way
    /// HEVC `uniform_spacing_flag` does.
    pub fn uniform(width_in_lcus: u32, height_in_lcus: u32, columns: u32, rows: u32) -> Self {
        let split = |total: u32, parts: u32| -> Vec<u32> {
            (0..parts)
                .map(|i| ((i + 1) * total) / parts - (i * total) / parts)
                .collect()
        };
        Self {
            column_widths: split(width_in_lcus, columns.max(1)),
            row_heights: split(height_in_lcus, rows.max(1)),
        }
    }

    pub fn num_columns(&self) -> u32 {
        self.column_widths.len() as u32
    }

    pub fn num_rows(&self) -> u32 {
        self.row_heights.len() as u32
    }

    /// First LCU column of tile column `column`.
    pub fn column_start(&self, column: u32) -> u32 {
        self.column_widths[..column as usize].iter().sum()
    }

    /// First LCU row of tile row `row`.
    pub fn row_start(&self, row: u32) -> u32 {
        self.row_heights[..row as usize].iter().sum()
    }

    /// Position of raster LCU address `raster` in tile scan order.
    ///
    /// The grid must cover a frame `width_in_lcus` wide. Addresses past the
    /// grid map to the end of the scan.
    pub fn tile_scan_address(&self, raster: u32, width_in_lcus: u32) -> u32 {
        let x = raster % width_in_lcus;
        let y = raster / width_in_lcus;
        let mut address = 0;
        let mut row_start = 0;
        for &height in &self.row_heights {
            if y < row_start + height {
                let mut column_start = 0;
                for &width in &self.column_widths {
                    if x < column_start + width {
                        return address
                            + (y - row_start) * width
                            + (x - column_start);
                    }
                    address += width * height;
                    column_start += width;
                }
                return address;
            }
            address += width_in_lcus * height;
            row_start += height;
        }
        address
    }
}

/// Immutable per-frame coding parameters.
#[derive(Debug, Clone)]
#[must_use]
pub struct FrameDescriptor {
    /// Frame size in pixels.
    pub dimensions: Dimensions,
    /// Largest coding unit size in pixels (16, 32 or 64).
    pub max_lcu_size: u32,
    /// Bit depth per component.
    pub bit_depth: BitDepth,
    /// Chroma subsampling.
    pub chroma_format: ChromaFormat,
    /// Picture coding type.
    pub coding_type: CodingType,
    /// Low-delay (no backward references) vs. random access.
    pub low_delay: bool,
    /// Last picture of the sequence.
    pub last_pic_in_seq: bool,
    /// Last picture of the stream.
    pub last_pic_in_stream: bool,
    /// Picture order count of the current picture.
    pub pic_order_cnt: i32,
    /// Slices in coding order.
    pub slices: Vec<SliceDescriptor>,
    /// Tile grid, when tiling is enabled.
    pub tile_grid: Option<TileGrid>,
    /// Frame-owned surfaces.
    pub surfaces: FrameSurfaces,
}

impl FrameDescriptor {
    /// Create an I-frame descriptor with a single slice covering the frame.
    pub fn new(width: u32, height: u32) -> Self {
        let dimensions = Dimensions { width, height };
        let total = dimensions.width_in_blocks(DEFAULT_MAX_LCU_SIZE)
            * dimensions.height_in_blocks(DEFAULT_MAX_LCU_SIZE);
        Self {
            dimensions,
            max_lcu_size: DEFAULT_MAX_LCU_SIZE,
            bit_depth: BitDepth::Eight,
            chroma_format: ChromaFormat::Yuv420,
            coding_type: CodingType::I,
            low_delay: true,
            last_pic_in_seq: false,
            last_pic_in_stream: false,
            pic_order_cnt: 0,
            slices: vec![SliceDescriptor::new(0, total, SliceType::I)],
            tile_grid: None,
            surfaces: FrameSurfaces::default(),
        }
    }

    /// Set the largest coding unit size.
    pub fn with_max_lcu_size(mut self, size: u32) -> Self {
        self.max_lcu_size = size;
        self
    }

    /// Set the bit depth.
    pub fn with_bit_depth(mut self, depth: BitDepth) -> Self {
        self.bit_depth = depth;
        self
    }

    /// Set the chroma format.
    pub fn with_chroma_format(mut self, format: ChromaFormat) -> Self {
        self.chroma_format = format;
        self
    }

    /// Set the coding type.
    pub fn with_coding_type(mut self, coding_type: CodingType) -> Self {
        self.coding_type = coding_type;
        self
    }

    /// Set the low-delay flag.
    pub fn with_low_delay(mut self, low_delay: bool) -> Self {
        self.low_delay = low_delay;
        self
    }

    /// Mark the frame as last in sequence and/or stream.
    pub fn with_last_picture(mut self, in_seq: bool, in_stream: bool) -> Self {
        self.last_pic_in_seq = in_seq;
        self.last_pic_in_stream = in_stream;
        self
    }

    /// Set the picture order count.
    pub fn with_pic_order_cnt(mut self, poc: i32) -> Self {
        self.pic_order_cnt = poc;
        self
    }

    /// Replace the slice table.
    pub fn with_slices(mut self, slices: Vec<SliceDescriptor>) -> Self {
        self.slices = slices;
        self
    }

    /// Enable tiling with the given grid.
    pub fn with_tile_grid(mut self, grid: TileGrid) -> Self {
        self.tile_grid = Some(grid);
        self
    }

    /// Set the frame surfaces.
    pub fn with_surfaces(mut self, surfaces: FrameSurfaces) -> Self {
        self.surfaces = surfaces;
        self
    }

    /// Width in LCUs.
    pub fn width_in_lcus(&self) -> u32 {
        self.dimensions.width_in_blocks(self.max_lcu_size)
    }

    /// Height in LCUs.
    pub fn height_in_lcus(&self) -> u32 {
        self.dimensions.height_in_blocks(self.max_lcu_size)
    }

    /// Total LCUs in the frame.
    pub fn total_lcus(&self) -> u32 {
        self.width_in_lcus() * self.height_in_lcus()
    }

    /// Whether tiling is enabled for this frame.
    pub fn tiles_enabled(&self) -> bool {
        self.tile_grid.is_some()
    }

    /// Check geometry, slice table, tile grid and surfaces.
    pub fn validate(&self) -> Result<()> {
        if self.dimensions.width == 0 || self.dimensions.height == 0 {
            return Err(VdForgeError::InvalidInput(format!(
                "frame dimensions must be non-zero, got {}x{}",
                self.dimensions.width, self.dimensions.height
            )));
        }
        if !matches!(self.max_lcu_size, 16 | 32 | 64) {
            return Err(VdForgeError::InvalidInput(format!(
                "unsupported LCU size {}",
                self.max_lcu_size
            )));
        }
        if self.slices.is_empty() {
            return Err(VdForgeError::InvalidInput("frame has no slices".to_string()));
        }

        if let Some(grid) = &self.tile_grid {
            if grid.column_widths.is_empty() || grid.row_heights.is_empty() {
                return Err(VdForgeError::InvalidInput("tile grid is empty".to_string()));
            }
            let width: u32 = grid.column_widths.iter().sum();
            let height: u32 = grid.row_heights.iter().sum();
            if width != self.width_in_lcus() || height != self.height_in_lcus() {
                return Err(VdForgeError::InvalidInput(format!(
                    "tile grid covers {width}x{height} LCUs, frame is {}x{}",
                    self.width_in_lcus(),
                    self.height_in_lcus()
                )));
            }
        }

        let total = self.total_lcus();
        let width_in_lcus = self.width_in_lcus();
        let mut covered = 0u32;
        for (index, slice) in self.slices.iter().enumerate() {
            if slice.num_lcus == 0 {
                return Err(VdForgeError::InvalidInput(format!("slice {index} is empty")));
            }
            if slice.start_lcu >= total {
                return Err(VdForgeError::InvalidInput(format!(
                    "slice {index} starts at LCU {} outside the frame ({total} LCUs)",
                    slice.start_lcu
                )));
            }
            // Slices follow each other in coding order: raster order without
            // tiles, tile scan order with them.
            let coded_start = match &self.tile_grid {
                Some(grid) => grid.tile_scan_address(slice.start_lcu, width_in_lcus),
                None => slice.start_lcu,
            };
            if coded_start != covered {
                return Err(VdForgeError::InvalidInput(format!(
                    "slice {index} starts at LCU {} but the previous slice ended at {covered} in coding order",
                    slice.start_lcu
                )));
            }
            covered = covered.checked_add(slice.num_lcus).ok_or_else(|| {
                VdForgeError::InvalidInput(format!(
                    "slice {index} with {} LCUs overflows the LCU count",
                    slice.num_lcus
                ))
            })?;
        }
        if covered != total {
            return Err(VdForgeError::InvalidInput(format!(
                "slices cover {covered} LCUs, frame has {total}"
            )));
        }

        self.surfaces.validate()
    }
}

/// Session-level packet configuration.
#[derive(Debug, Clone)]
#[must_use]
pub struct PacketConfig {
    /// Maximum number of rate-control passes per frame.
    pub max_num_passes: u8,
    /// Number of recycled PAK-slice batch buffers.
    pub num_pak_slice_batch_buffers: u8,
    /// Write slice-level commands into a PAK-slice batch instead of the primary buffer.
    pub use_batch_buffer_for_pak_slices: bool,
    /// The outer pipeline tracks frames itself (disables round-robin updates here).
    pub frame_tracking_enabled: bool,
    /// All passes are submitted as a single task phase.
    pub single_task_phase_supported: bool,
    /// Tile-based replay of tile rows.
    pub tile_replay_enabled: bool,
    /// Number of replay passes per tile row.
    pub num_passes_for_tile_replay: u8,
    /// Slice-state intra rounding.
    pub rounding_intra: u8,
    /// Slice-state inter rounding.
    pub rounding_inter: u8,
    /// Stream-in of per-LCU hints.
    pub stream_in_enabled: bool,
    /// RGB input encoding.
    pub rgb_encoding: bool,
    /// Capture (wireless display) mode.
    pub capture_mode: bool,
    /// Streaming buffer output (LLC or DDR).
    pub streaming_buffer: bool,
    /// Partial frame update for inter pictures.
    pub partial_frame_update: bool,
    /// Low-bandwidth IBC control.
    pub lbc_only: bool,
}

impl Default for PacketConfig {
    fn default() -> Self {
        Self {
            max_num_passes: DEFAULT_MAX_NUM_PASSES,
            num_pak_slice_batch_buffers: DEFAULT_NUM_PAK_SLICE_BATCH_BUFFERS,
            use_batch_buffer_for_pak_slices: false,
            frame_tracking_enabled: false,
            single_task_phase_supported: false,
            tile_replay_enabled: false,
            num_passes_for_tile_replay: DEFAULT_NUM_PASSES_FOR_TILE_REPLAY,
            rounding_intra: DEFAULT_ROUNDING_INTRA,
            rounding_inter: DEFAULT_ROUNDING_INTER,
            stream_in_enabled: false,
            rgb_encoding: false,
            capture_mode: false,
            streaming_buffer: false,
            partial_frame_update: false,
            lbc_only: false,
        }
    }
}

impl PacketConfig {
    /// Create a configuration with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum number of rate-control passes.
    pub fn with_max_passes(mut self, passes: u8) -> Self {
        self.max_num_passes = passes;
        self
    }

    /// Route slice-level commands through recycled PAK-slice batches.
    pub fn with_pak_slice_batches(mut self, count: u8) -> Self {
        self.use_batch_buffer_for_pak_slices = true;
        self.num_pak_slice_batch_buffers = count;
        self
    }

    /// Enable or disable outer-pipeline frame tracking.
    pub fn with_frame_tracking(mut self, enabled: bool) -> Self {
        self.frame_tracking_enabled = enabled;
        self
    }

    /// Enable or disable single task phase submission.
    pub fn with_single_task_phase(mut self, enabled: bool) -> Self {
        self.single_task_phase_supported = enabled;
        self
    }

    /// Enable tile replay with the given number of passes per tile row.
    pub fn with_tile_replay(mut self, passes: u8) -> Self {
        self.tile_replay_enabled = true;
        self.num_passes_for_tile_replay = passes;
        self
    }

    /// Set the slice-state rounding values.
    pub fn with_rounding(mut self, intra: u8, inter: u8) -> Self {
        self.rounding_intra = intra;
        self.rounding_inter = inter;
        self
    }

    /// Enable or disable stream-in.
    pub fn with_stream_in(mut self, enabled: bool) -> Self {
        self.stream_in_enabled = enabled;
        self
    }

    /// Enable or disable RGB encoding.
    pub fn with_rgb_encoding(mut self, enabled: bool) -> Self {
        self.rgb_encoding = enabled;
        self
    }

    /// Enable or disable capture mode.
    pub fn with_capture_mode(mut self, enabled: bool) -> Self {
        self.capture_mode = enabled;
        self
    }

    /// Enable or disable streaming buffer output.
    pub fn with_streaming_buffer(mut self, enabled: bool) -> Self {
        self.streaming_buffer = enabled;
        self
    }

    /// Enable or disable partial frame update on inter pictures.
    pub fn with_partial_frame_update(mut self, enabled: bool) -> Self {
        self.partial_frame_update = enabled;
        self
    }

    /// Restrict intra block copy to the low-bandwidth mode.
    pub fn with_lbc_only(mut self, enabled: bool) -> Self {
        self.lbc_only = enabled;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.max_num_passes == 0 {
            return Err(VdForgeError::InvalidInput(
                "max_num_passes must be at least 1".to_string(),
            ));
        }
        if self.num_pak_slice_batch_buffers == 0 {
            return Err(VdForgeError::InvalidInput(
                "num_pak_slice_batch_buffers must be at least 1".to_string(),
            ));
        }
        if self.num_passes_for_tile_replay == 0 {
            return Err(VdForgeError::InvalidInput(
                "num_passes_for_tile_replay must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Which rate-control pass is executing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PassDescriptor {
    ordinal: u8,
    count: u8,
    pak_only: bool,
}

impl PassDescriptor {
    /// Pass `ordinal` of `count`. Passes after the first are PAK-only by default.
    pub fn new(ordinal: u8, count: u8) -> Result<Self> {
        if count == 0 || ordinal >= count {
            return Err(VdForgeError::InvalidInput(format!(
                "pass {ordinal} is out of range for {count} passes"
            )));
        }
        Ok(Self {
            ordinal,
            count,
            pak_only: ordinal > 0,
        })
    }

    /// The only pass of a single-pass frame.
    pub fn single() -> Self {
        Self {
            ordinal: 0,
            count: 1,
            pak_only: false,
        }
    }

    /// Override whether this pass re-runs only the PAK engine.
    pub fn with_pak_only(mut self, pak_only: bool) -> Self {
        self.pak_only = pak_only;
        self
    }

    pub fn ordinal(&self) -> u8 {
        self.ordinal
    }

    pub fn count(&self) -> u8 {
        self.count
    }

    pub fn is_first(&self) -> bool {
        self.ordinal == 0
    }

    pub fn is_last(&self) -> bool {
        self.ordinal + 1 == self.count
    }

    pub fn is_pak_only(&self) -> bool {
        self.pak_only
    }
}

/// Per-submission state passed explicitly into `submit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmitContext {
    /// Rate-control pass being built.
    pub pass: PassDescriptor,
    /// Pipe this command buffer executes on.
    pub pipe: PipeDescriptor,
    /// Index of the recycled rate-control buffer set for this frame.
    pub recycled_buf_idx: u8,
}

impl SubmitContext {
    pub fn new(pass: PassDescriptor, pipe: PipeDescriptor) -> Self {
        Self {
            pass,
            pipe,
            recycled_buf_idx: 0,
        }
    }

    /// Single pass on a single pipe.
    pub fn single() -> Self {
        Self::new(PassDescriptor::single(), PipeDescriptor::single())
    }

    /// Select the recycled rate-control buffer set.
    pub fn with_recycled_buf_idx(mut self, index: u8) -> Self {
        self.recycled_buf_idx = index;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn surfaces() -> FrameSurfaces {
        FrameSurfaces {
            source: ResourceHandle::new(1),
            recon: ResourceHandle::new(2),
            bitstream: ResourceHandle::new(3),
            mb_code: ResourceHandle::new(4),
        }
    }

    mod frame_descriptor_tests {
        use super::*;

        #[test]
        fn test_defaults_cover_frame_with_one_slice() {
            let frame = FrameDescriptor::new(1920, 1080);

            assert_eq!(frame.width_in_lcus(), 30);
            assert_eq!(frame.height_in_lcus(), 17);
            assert_eq!(frame.slices.len(), 1);
            assert_eq!(frame.slices[0].num_lcus, 30 * 17);
            assert!(!frame.tiles_enabled());
        }

        #[test]
        fn test_validate_requires_surfaces() {
            let frame = FrameDescriptor::new(320, 240);
            assert!(matches!(
                frame.validate(),
                Err(VdForgeError::InvalidResource(_))
            ));
            assert!(frame.with_surfaces(surfaces()).validate().is_ok());
        }

        #[test]
        fn test_validate_rejects_gap_between_slices() {
            // 320x240 at 64px LCUs is 5x4 = 20 LCUs.
            let frame = FrameDescriptor::new(320, 240)
                .with_surfaces(surfaces())
                .with_slices(vec![
                    SliceDescriptor::new(0, 10, SliceType::I),
                    SliceDescriptor::new(11, 10, SliceType::I),
                ]);
            assert!(matches!(frame.validate(), Err(VdForgeError::InvalidInput(_))));
        }

        #[test]
        fn test_validate_rejects_partial_coverage() {
            let frame = FrameDescriptor::new(320, 240)
                .with_surfaces(surfaces())
                .with_slices(vec![SliceDescriptor::new(0, 19, SliceType::I)]);
            assert!(matches!(frame.validate(), Err(VdForgeError::InvalidInput(_))));
        }

        #[test]
        fn test_validate_rejects_mismatched_tile_grid() {
            let frame = FrameDescriptor::new(320, 240)
                .with_surfaces(surfaces())
                .with_tile_grid(TileGrid {
                    column_widths: vec![2, 2],
                    row_heights: vec![4],
                });
            assert!(matches!(frame.validate(), Err(VdForgeError::InvalidInput(_))));
        }

        /// 256x128 at 64px LCUs in two 2x2 tile columns.
        fn two_column_frame(slices: Vec<SliceDescriptor>) -> FrameDescriptor {
            FrameDescriptor::new(256, 128)
                .with_surfaces(surfaces())
                .with_tile_grid(TileGrid {
                    column_widths: vec![2, 2],
                    row_heights: vec![2],
                })
                .with_slices(slices)
        }

        #[test]
        fn test_validate_follows_tile_scan_order() {
            let frame = two_column_frame(vec![
                SliceDescriptor::new(0, 4, SliceType::I),
                SliceDescriptor::new(2, 4, SliceType::I),
            ]);
            assert!(frame.validate().is_ok());

            // Raster-contiguous slices are not contiguous in tile scan order.
            let frame = two_column_frame(vec![
                SliceDescriptor::new(0, 4, SliceType::I),
                SliceDescriptor::new(4, 4, SliceType::I),
            ]);
            assert!(matches!(frame.validate(), Err(VdForgeError::InvalidInput(_))));
        }

        #[test]
        fn test_validate_rejects_overlapping_tiled_slices() {
            let frame = two_column_frame(vec![
                SliceDescriptor::new(0, 4, SliceType::I),
                SliceDescriptor::new(1, 2, SliceType::I),
                SliceDescriptor::new(2, 2, SliceType::I),
            ]);
            assert!(matches!(frame.validate(), Err(VdForgeError::InvalidInput(_))));
        }

        #[test]
        fn test_validate_rejects_lcu_count_overflow() {
            let frame = two_column_frame(vec![
                SliceDescriptor::new(0, u32::MAX, SliceType::I),
                SliceDescriptor::new(1, 9, SliceType::I),
            ]);
            assert!(matches!(frame.validate(), Err(VdForgeError::InvalidInput(_))));

            let frame = FrameDescriptor::new(320, 240)
                .with_surfaces(surfaces())
                .with_slices(vec![
                    SliceDescriptor::new(0, 10, SliceType::I),
                    SliceDescriptor::new(10, u32::MAX - 5, SliceType::I),
                ]);
            assert!(matches!(frame.validate(), Err(VdForgeError::InvalidInput(_))));
        }

        #[test]
        fn test_validate_rejects_bad_lcu_size() {
            let frame = FrameDescriptor::new(320, 240)
                .with_surfaces(surfaces())
                .with_max_lcu_size(48);
            assert!(frame.validate().is_err());
        }
    }

    mod tile_grid_tests {
        use super::*;

        #[test]
        fn test_uniform_split_sums_to_total() {
            let grid = TileGrid::uniform(30, 17, 4, 3);

            assert_eq!(grid.column_widths, vec![7, 8, 7, 8]);
            assert_eq!(grid.row_heights, vec![5, 6, 6]);
            assert_eq!(grid.column_start(2), 15);
            assert_eq!(grid.row_start(1), 5);
        }

        #[test]
        fn test_tile_scan_address() {
            // 4x3 LCUs, columns of 1 and 3, rows of 1 and 2.
            let grid = TileGrid {
                column_widths: vec![1, 3],
                row_heights: vec![1, 2],
            };

            assert_eq!(grid.tile_scan_address(0, 4), 0);
            assert_eq!(grid.tile_scan_address(3, 4), 3);
            assert_eq!(grid.tile_scan_address(4, 4), 4);
            assert_eq!(grid.tile_scan_address(8, 4), 5);
            assert_eq!(grid.tile_scan_address(5, 4), 6);
            assert_eq!(grid.tile_scan_address(11, 4), 11);
        }
    }

    mod slice_tests {
        use super::*;

        #[test]
        fn test_with_references_sets_counts() {
            let slice = SliceDescriptor::new(0, 4, SliceType::B).with_references(&[0, 1], &[2]);

            assert_eq!(slice.num_ref_idx_l0_active, 2);
            assert_eq!(slice.num_ref_idx_l1_active, 1);
            assert_eq!(slice.ref_pic_list[0][..2], [0, 1]);
            assert_eq!(slice.ref_pic_list[1][0], 2);
            assert_eq!(slice.ref_pic_list[1][1], 0xFF);
        }

        #[test]
        fn test_slice_type_lists() {
            assert!(!SliceType::I.uses_list0());
            assert!(SliceType::P.uses_list0());
            assert!(!SliceType::P.uses_list1());
            assert!(SliceType::B.uses_list1());
        }
    }

    mod pass_tests {
        use super::*;

        #[test]
        fn test_first_and_last() {
            let first = PassDescriptor::new(0, 3).unwrap();
            let last = PassDescriptor::new(2, 3).unwrap();

            assert!(first.is_first() && !first.is_last() && !first.is_pak_only());
            assert!(!last.is_first() && last.is_last() && last.is_pak_only());
            assert!(PassDescriptor::single().is_first() && PassDescriptor::single().is_last());
        }

        #[test]
        fn test_out_of_range() {
            assert!(PassDescriptor::new(3, 3).is_err());
            assert!(PassDescriptor::new(0, 0).is_err());
        }
    }

    mod config_tests {
        use super::*;

        #[test]
        fn test_defaults() {
            let config = PacketConfig::default();

            assert_eq!(config.max_num_passes, DEFAULT_MAX_NUM_PASSES);
            assert_eq!(config.num_pak_slice_batch_buffers, 3);
            assert!(!config.use_batch_buffer_for_pak_slices);
            assert!(config.validate().is_ok());
        }

        #[test]
        fn test_builder_chaining() {
            let config = PacketConfig::new()
                .with_max_passes(2)
                .with_pak_slice_batches(2)
                .with_tile_replay(2)
                .with_rounding(6, 2);

            assert_eq!(config.max_num_passes, 2);
            assert!(config.use_batch_buffer_for_pak_slices);
            assert_eq!(config.num_pak_slice_batch_buffers, 2);
            assert!(config.tile_replay_enabled);
            assert_eq!(config.num_passes_for_tile_replay, 2);
            assert_eq!(config.rounding_intra, 6);
        }

        #[test]
        fn test_zero_passes_rejected() {
            assert!(PacketConfig::new().with_max_passes(0).validate().is_err());
        }
    }

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 64), 0);
        assert_eq!(align_up(1, 64), 64);
        assert_eq!(align_up(128, 64), 128);
    }
}
