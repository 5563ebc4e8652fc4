//! Feature adapters consulted by the command builder.
//!
//! Each concern (tiling, rate control, region of interest) is a small trait.
//! Adapters are registered in a [`FeatureSet`] at construction; the builder
//! either runs an adapter if it is present or requires it and fails with
//! [`VdForgeError::MissingFeature`].
//!
//! Adapters are stateless with respect to the frame being built. Anything
//! that used to be "current" state, such as the current tile, is passed in.

use crate::encoder::batch::{BatchRef, SecondLevelLayout};
use crate::encoder::commands::{
    ImageStateParams, PipeBufAddrParams, PipeModeSelectParams, SliceStateParams,
    TileCodingParams, WalkerStateParams,
};
use crate::encoder::pipe::PipeDescriptor;
use crate::encoder::{FrameDescriptor, PassDescriptor, CACHELINE_SIZE, MIN_CU_SIZE};
use crate::error::{Result, VdForgeError};

/// Bytes of CU-level stream-out per minimum CU.
const CU_RECORD_SIZE: u32 = 16;

/// Geometry of one tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileData {
    pub row: u32,
    pub column: u32,
    /// Index in tile-scan order.
    pub tile_index: u32,
    pub start_lcu_x: u32,
    pub start_lcu_y: u32,
    pub width_in_lcus: u32,
    pub height_in_lcus: u32,
    /// Tile-scan address of the tile's first LCU.
    pub lcu_offset: u32,
    pub is_last_in_row: bool,
    pub is_last_in_column: bool,
}

impl TileData {
    /// Whether the raster LCU address falls inside the tile.
    pub fn contains_lcu(&self, lcu: u32, frame_width_in_lcus: u32) -> bool {
        if frame_width_in_lcus == 0 {
            return false;
        }
        let y = lcu / frame_width_in_lcus;
        if y < self.start_lcu_y || y >= self.start_lcu_y + self.height_in_lcus {
            return false;
        }
        let x = lcu % frame_width_in_lcus;
        x >= self.start_lcu_x && x < self.start_lcu_x + self.width_in_lcus
    }
}

/// Result of a slice-to-tile membership test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SliceInTile {
    pub in_tile: bool,
    /// The slice is the last one of the tile.
    pub last_in_tile: bool,
}

/// Tile partitioning.
pub trait TileFeature {
    /// Whether tiling is active for `frame`.
    fn is_enabled(&self, frame: &FrameDescriptor) -> bool;

    /// Tile rows and columns.
    fn tile_rows_columns(&self, frame: &FrameDescriptor) -> (u32, u32);

    /// Geometry of tile (`row`, `column`).
    fn tile_data(&self, frame: &FrameDescriptor, row: u32, column: u32) -> Result<TileData>;

    /// Whether slice `slice_index` belongs to `tile`.
    fn is_slice_in_tile(
        &self,
        frame: &FrameDescriptor,
        slice_index: usize,
        tile: &TileData,
    ) -> SliceInTile;

    /// Fill the tile coding location command.
    fn set_tile_coding_params(
        &self,
        frame: &FrameDescriptor,
        tile: &TileData,
        num_pipes: u8,
        params: &mut TileCodingParams,
    );

    /// Restrict the walker to `tile`.
    fn set_walker_state_params(&self, tile: &TileData, params: &mut WalkerStateParams) {
        params.tile_start_lcu_x = tile.start_lcu_x;
        params.tile_start_lcu_y = tile.start_lcu_y;
        params.tile_width_in_lcus = tile.width_in_lcus;
        params.tile_height_in_lcus = tile.height_in_lcus;
    }

    fn set_slice_state_params(&self, membership: SliceInTile, params: &mut SliceStateParams) {
        params.last_slice_in_tile = membership.last_in_tile;
    }

    fn set_pipe_mode_select_params(
        &self,
        _frame: &FrameDescriptor,
        _params: &mut PipeModeSelectParams,
    ) {
    }

    /// Point shared stream-out buffers at this pipe's region.
    fn set_pipe_buf_addr_params(
        &self,
        _frame: &FrameDescriptor,
        _pipe: &PipeDescriptor,
        _params: &mut PipeBufAddrParams,
    ) {
    }
}

/// Rate-control state.
pub trait RateControlFeature {
    fn is_acqp_enabled(&self) -> bool;

    fn is_brc_enabled(&self) -> bool;

    /// Whether the rate-control batch carries this pass's picture state.
    fn is_brc_update_required(&self, pass: &PassDescriptor) -> bool;

    /// The rate-control-owned 2nd level batch for a recycled buffer set.
    fn vdenc_second_level_batch(&self, recycled_buf_idx: u8) -> Option<BatchRef>;

    /// Layout of that batch.
    fn second_level_layout(&self, frame: &FrameDescriptor) -> SecondLevelLayout;

    fn set_pipe_mode_select_params(&self, params: &mut PipeModeSelectParams) {
        params.brc_enabled = self.is_brc_enabled();
    }

    fn set_slice_state_params(&self, _recycled_buf_idx: u8, _params: &mut SliceStateParams) {}

    /// Panic mode, rounding and QP-delta selection for image state #2.
    fn set_image_state_params(&self, _pass: &PassDescriptor, _params: &mut ImageStateParams) {}
}

/// Region-of-interest state.
pub trait RoiFeature {
    fn set_image_state_params(&self, params: &mut ImageStateParams);
}

/// Registered adapters.
#[derive(Default)]
pub struct FeatureSet {
    tile: Option<Box<dyn TileFeature>>,
    rate_control: Option<Box<dyn RateControlFeature>>,
    roi: Option<Box<dyn RoiFeature>>,
}

impl std::fmt::Debug for FeatureSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeatureSet")
            .field("tile", &self.tile.is_some())
            .field("rate_control", &self.rate_control.is_some())
            .field("roi", &self.roi.is_some())
            .finish()
    }
}

impl FeatureSet {
    /// Empty set; no adapter registered.
    pub fn new() -> Self {
        Self::default()
    }

    /// Grid tiling and constant-QP rate control.
    pub fn standard() -> Self {
        Self::new()
            .with_tile(GridTiling)
            .with_rate_control(StaticRateControl::default())
    }

    pub fn with_tile(mut self, feature: impl TileFeature + 'static) -> Self {
        self.tile = Some(Box::new(feature));
        self
    }

    pub fn with_rate_control(mut self, feature: impl RateControlFeature + 'static) -> Self {
        self.rate_control = Some(Box::new(feature));
        self
    }

    pub fn with_roi(mut self, feature: impl RoiFeature + 'static) -> Self {
        self.roi = Some(Box::new(feature));
        self
    }

    pub fn tile(&self) -> Option<&dyn TileFeature> {
        self.tile.as_deref()
    }

    pub fn rate_control(&self) -> Option<&dyn RateControlFeature> {
        self.rate_control.as_deref()
    }

    pub fn roi(&self) -> Option<&dyn RoiFeature> {
        self.roi.as_deref()
    }

    pub fn require_tile(&self) -> Result<&dyn TileFeature> {
        self.tile().ok_or(VdForgeError::MissingFeature("tile"))
    }

    pub fn require_rate_control(&self) -> Result<&dyn RateControlFeature> {
        self.rate_control()
            .ok_or(VdForgeError::MissingFeature("rate control"))
    }

    /// Run `f` with the tile adapter if one is registered.
    pub fn run_tile<F>(&self, f: F)
    where
        F: FnOnce(&dyn TileFeature),
    {
        if let Some(feature) = self.tile() {
            f(feature);
        }
    }

    /// Run `f` with the ROI adapter if one is registered.
    pub fn run_roi<F>(&self, f: F)
    where
        F: FnOnce(&dyn RoiFeature),
    {
        if let Some(feature) = self.roi() {
            f(feature);
        }
    }

    /// Whether `frame` takes the tiled path.
    ///
    /// A frame that declares a tile grid without a tile adapter is a
    /// configuration error.
    pub fn tiles_enabled(&self, frame: &FrameDescriptor) -> Result<bool> {
        if !frame.tiles_enabled() {
            return Ok(false);
        }
        Ok(self.require_tile()?.is_enabled(frame))
    }
}

/// Tiling driven by the frame's [`TileGrid`](crate::encoder::TileGrid).
#[derive(Debug, Clone, Copy, Default)]
pub struct GridTiling;

impl TileFeature for GridTiling {
    fn is_enabled(&self, frame: &FrameDescriptor) -> bool {
        frame.tile_grid.is_some()
    }

    fn tile_rows_columns(&self, frame: &FrameDescriptor) -> (u32, u32) {
        frame
            .tile_grid
            .as_ref()
            .map_or((1, 1), |grid| (grid.num_rows(), grid.num_columns()))
    }

    fn tile_data(&self, frame: &FrameDescriptor, row: u32, column: u32) -> Result<TileData> {
        let grid = frame
            .tile_grid
            .as_ref()
            .ok_or_else(|| VdForgeError::InvalidInput("frame has no tile grid".to_string()))?;
        if row >= grid.num_rows() || column >= grid.num_columns() {
            return Err(VdForgeError::InvalidInput(format!(
                "tile ({row}, {column}) is outside a {}x{} grid",
                grid.num_rows(),
                grid.num_columns()
            )));
        }

        let width_in_lcus = grid.column_widths[column as usize];
        let height_in_lcus = grid.row_heights[row as usize];
        let start_lcu_y = grid.row_start(row);
        // Full tile rows above, then the tiles to the left in this row.
        let lcu_offset = start_lcu_y * frame.width_in_lcus()
            + grid.column_start(column) * height_in_lcus;

        Ok(TileData {
            row,
            column,
            tile_index: row * grid.num_columns() + column,
            start_lcu_x: grid.column_start(column),
            start_lcu_y,
            width_in_lcus,
            height_in_lcus,
            lcu_offset,
            is_last_in_row: column + 1 == grid.num_columns(),
            is_last_in_column: row + 1 == grid.num_rows(),
        })
    }

    fn is_slice_in_tile(
        &self,
        frame: &FrameDescriptor,
        slice_index: usize,
        tile: &TileData,
    ) -> SliceInTile {
        let width = frame.width_in_lcus();
        let Some(slice) = frame.slices.get(slice_index) else {
            return SliceInTile::default();
        };
        if !tile.contains_lcu(slice.start_lcu, width) {
            return SliceInTile::default();
        }
        let last_in_tile = frame
            .slices
            .get(slice_index + 1)
            .map_or(true, |next| !tile.contains_lcu(next.start_lcu, width));
        SliceInTile {
            in_tile: true,
            last_in_tile,
        }
    }

    fn set_tile_coding_params(
        &self,
        frame: &FrameDescriptor,
        tile: &TileData,
        num_pipes: u8,
        params: &mut TileCodingParams,
    ) {
        let cus_per_lcu = (frame.max_lcu_size / MIN_CU_SIZE).pow(2);
        *params = TileCodingParams {
            tile_start_lcu_x: tile.start_lcu_x,
            tile_start_lcu_y: tile.start_lcu_y,
            tile_width_in_lcus: tile.width_in_lcus,
            tile_height_in_lcus: tile.height_in_lcus,
            is_last_tile_of_row: tile.is_last_in_row,
            is_last_tile_of_column: tile.is_last_in_column,
            num_pipes,
            lcu_offset: tile.lcu_offset,
            cu_record_offset: (tile.lcu_offset * cus_per_lcu * CU_RECORD_SIZE)
                .div_ceil(CACHELINE_SIZE),
        };
    }

    fn set_pipe_buf_addr_params(
        &self,
        frame: &FrameDescriptor,
        pipe: &PipeDescriptor,
        params: &mut PipeBufAddrParams,
    ) {
        let Some(grid) = frame.tile_grid.as_ref() else {
            return;
        };
        if !pipe.is_multi_pipe() || pipe.ordinal() as u32 >= grid.num_columns() {
            return;
        }
        // One cacheline of stream-out per LCU; each pipe owns one tile column.
        params.stream_out_offset =
            grid.column_start(pipe.ordinal() as u32) * frame.height_in_lcus() * CACHELINE_SIZE;
    }
}

/// Constant-QP, adaptive-QP or externally driven BRC policy.
///
/// BRC mode only references batches built elsewhere; this adapter never
/// computes rate-control decisions.
#[derive(Debug, Clone)]
pub struct StaticRateControl {
    acqp: bool,
    brc_batches: Vec<BatchRef>,
    layout: SecondLevelLayout,
    panic_enabled: bool,
    rounding_enabled: bool,
    use_default_qp_deltas: bool,
}

impl Default for StaticRateControl {
    fn default() -> Self {
        Self {
            acqp: false,
            brc_batches: Vec::new(),
            layout: SecondLevelLayout::default(),
            panic_enabled: false,
            rounding_enabled: true,
            use_default_qp_deltas: false,
        }
    }
}

impl StaticRateControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adaptive constant QP.
    pub fn acqp() -> Self {
        Self {
            acqp: true,
            ..Self::default()
        }
    }

    /// BRC with one pre-built 2nd level batch per recycled buffer set.
    pub fn with_brc_batches(mut self, batches: Vec<BatchRef>, layout: SecondLevelLayout) -> Self {
        self.brc_batches = batches;
        self.layout = layout;
        self
    }

    pub fn with_panic(mut self, enabled: bool) -> Self {
        self.panic_enabled = enabled;
        self
    }

    pub fn with_rounding(mut self, enabled: bool) -> Self {
        self.rounding_enabled = enabled;
        self
    }

    pub fn with_default_qp_deltas(mut self, enabled: bool) -> Self {
        self.use_default_qp_deltas = enabled;
        self
    }
}

impl RateControlFeature for StaticRateControl {
    fn is_acqp_enabled(&self) -> bool {
        self.acqp
    }

    fn is_brc_enabled(&self) -> bool {
        !self.brc_batches.is_empty()
    }

    fn is_brc_update_required(&self, _pass: &PassDescriptor) -> bool {
        self.is_brc_enabled()
    }

    fn vdenc_second_level_batch(&self, recycled_buf_idx: u8) -> Option<BatchRef> {
        if self.brc_batches.is_empty() {
            return None;
        }
        self.brc_batches
            .get(recycled_buf_idx as usize % self.brc_batches.len())
            .copied()
    }

    fn second_level_layout(&self, _frame: &FrameDescriptor) -> SecondLevelLayout {
        self.layout.clone()
    }

    fn set_image_state_params(&self, pass: &PassDescriptor, params: &mut ImageStateParams) {
        params.rounding_enabled = self.rounding_enabled;
        params.use_default_qp_deltas = self.use_default_qp_deltas;
        // Panic mode only applies to the second, full (VDEnc + PAK) pass under BRC.
        params.panic_enabled = self.panic_enabled
            && self.is_brc_enabled()
            && pass.ordinal() == 1
            && !pass.is_pak_only();
    }
}
