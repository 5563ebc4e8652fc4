//! Buffer requests and per-frame buffer sizing.
//!
//! Allocation policy belongs to the [`ResourceProvider`]; this module only
//! decides what to ask for and how large each buffer must be for a frame.

use tracing::debug;

use crate::encoder::commands::{CommandEmitter, InternalBufferKind};
use crate::encoder::{
    align_up, BitDepth, ChromaFormat, Dimensions, FrameDescriptor, CACHELINE_SIZE, MIN_CU_SIZE,
};
use crate::error::{Result, VdForgeError};

/// PAK stream-out buffer size, enough for 4Kx4K with all 8x8 CUs.
pub const PAK_STREAMOUT_SIZE: u32 = 0x50_0000;

/// Minimum HEVC tile width in pixels.
pub const MIN_TILE_SIZE: u32 = 128;

/// SSE source pixel row store bytes per LCU.
pub const SSE_SRC_PIXEL_ROW_STORE_PER_LCU: u32 = (CACHELINE_SIZE * (4 + 4)) << 1;

/// Bytes of PAK CU-level stream-out data per CU.
const CU_STREAMOUT_RECORD_SIZE: u32 = 16;

/// Opaque GPU-addressable buffer handle.
///
/// Handle `0` is reserved as "not set".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct ResourceHandle(u64);

impl ResourceHandle {
    /// The unset handle.
    pub const NULL: ResourceHandle = ResourceHandle(0);

    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }

    pub fn is_valid(&self) -> bool {
        self.0 != 0
    }
}

/// What kind of memory a buffer needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferKind {
    /// Linear data buffer written by the engines.
    Linear,
    /// Batch buffer holding commands.
    Batch,
}

/// Named size request passed to the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationRequest {
    /// Debug name of the buffer.
    pub name: &'static str,
    /// Size in bytes.
    pub size: u32,
    /// Buffer kind.
    pub kind: BufferKind,
}

impl AllocationRequest {
    pub fn linear(name: &'static str, size: u32) -> Self {
        Self {
            name,
            size,
            kind: BufferKind::Linear,
        }
    }

    pub fn batch(name: &'static str, size: u32) -> Self {
        Self {
            name,
            size,
            kind: BufferKind::Batch,
        }
    }
}

/// Supplies GPU-addressable buffers and owns their lifetime.
pub trait ResourceProvider {
    /// Allocate a buffer for `request`.
    fn allocate(&mut self, request: &AllocationRequest) -> Result<ResourceHandle>;

    /// Return a buffer the packet no longer references.
    fn release(&mut self, _handle: ResourceHandle) {}
}

/// Provider that hands out sequential handles and records every request.
///
/// Used by tests and tooling that only need stable handles, not GPU memory.
#[derive(Debug, Default)]
pub struct HeapProvider {
    next: u64,
    allocations: Vec<(ResourceHandle, AllocationRequest)>,
}

impl HeapProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Live allocations, in the order they were served.
    pub fn allocations(&self) -> &[(ResourceHandle, AllocationRequest)] {
        &self.allocations
    }

    /// Total bytes requested.
    pub fn total_bytes(&self) -> u64 {
        self.allocations.iter().map(|(_, r)| r.size as u64).sum()
    }

    /// Find the most recent allocation with `name`.
    pub fn find(&self, name: &str) -> Option<(ResourceHandle, &AllocationRequest)> {
        self.allocations
            .iter()
            .rev()
            .find(|(_, request)| request.name == name)
            .map(|(handle, request)| (*handle, request))
    }
}

impl ResourceProvider for HeapProvider {
    fn allocate(&mut self, request: &AllocationRequest) -> Result<ResourceHandle> {
        if request.size == 0 {
            return Err(VdForgeError::Allocation(format!(
                "zero-sized request for '{}'",
                request.name
            )));
        }
        // Handles start at a high base so they never collide with frame surfaces
        // picked by hand in tests.
        self.next += 1;
        let handle = ResourceHandle::new(0x1000 + self.next);
        self.allocations.push((handle, request.clone()));
        Ok(handle)
    }

    fn release(&mut self, handle: ResourceHandle) {
        self.allocations.retain(|(live, _)| *live != handle);
    }
}

/// Geometry passed to the emitter when it sizes internal HCP buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HcpBufferSizeParams {
    pub max_bit_depth: BitDepth,
    pub chroma_format: ChromaFormat,
    pub ctb_log2_size: u32,
    pub pic_width: u32,
    pub pic_height: u32,
}

impl HcpBufferSizeParams {
    /// Size parameters for `frame`, assuming the largest CTB so buffers can be
    /// allocated once regardless of the per-picture LCU size.
    pub fn for_frame(frame: &FrameDescriptor) -> Self {
        Self {
            max_bit_depth: frame.bit_depth,
            chroma_format: frame.chroma_format,
            ctb_log2_size: 6,
            pic_width: align_up(frame.dimensions.width, frame.max_lcu_size),
            pic_height: align_up(frame.dimensions.height, frame.max_lcu_size),
        }
    }
}

/// Per-frame engine buffers patched into picture-level commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameResources {
    pub pak_stream_out: ResourceHandle,
    pub metadata_line: ResourceHandle,
    pub metadata_tile_line: ResourceHandle,
    pub metadata_tile_column: ResourceHandle,
    pub lcu_ildb_stream_out: ResourceHandle,
    pub sse_src_pixel_row_store: ResourceHandle,
    pub pak_cu_level_stream_out: ResourceHandle,
}

impl FrameResources {
    /// Every buffer, for handing back to the provider.
    pub fn handles(&self) -> [ResourceHandle; 7] {
        [
            self.pak_stream_out,
            self.metadata_line,
            self.metadata_tile_line,
            self.metadata_tile_column,
            self.lcu_ildb_stream_out,
            self.sse_src_pixel_row_store,
            self.pak_cu_level_stream_out,
        ]
    }
}

/// Bytes for the SSE source pixel row store.
pub fn sse_src_pixel_row_store_size(frame: &FrameDescriptor) -> u32 {
    let max_tile_columns = frame.dimensions.width.div_ceil(MIN_TILE_SIZE);
    let width_in_lcus = frame.width_in_lcus();
    2 * SSE_SRC_PIXEL_ROW_STORE_PER_LCU * (width_in_lcus + 3 * max_tile_columns)
}

/// Bytes for the PAK CU-level stream-out, one 16-byte record per minimum CU.
pub fn pak_cu_level_stream_out_size(frame: &FrameDescriptor) -> u32 {
    let width_in_cus = frame.dimensions.width_in_blocks(MIN_CU_SIZE);
    let height_in_cus = frame.dimensions.height_in_blocks(MIN_CU_SIZE);
    align_up(
        width_in_cus * height_in_cus * CU_STREAMOUT_RECORD_SIZE,
        CACHELINE_SIZE,
    )
}

/// Allocate every engine buffer the picture-level commands reference.
pub fn allocate_frame_resources<E, R>(
    emitter: &E,
    provider: &mut R,
    frame: &FrameDescriptor,
) -> Result<FrameResources>
where
    E: CommandEmitter + ?Sized,
    R: ResourceProvider + ?Sized,
{
    let size_params = HcpBufferSizeParams::for_frame(frame);

    let pak_stream_out =
        provider.allocate(&AllocationRequest::linear("PakStreamOutBuffer", PAK_STREAMOUT_SIZE))?;

    let mut internal = |kind: InternalBufferKind, name: &'static str| -> Result<ResourceHandle> {
        let size = emitter.hevc_buffer_size(kind, &size_params)?;
        provider.allocate(&AllocationRequest::linear(name, size))
    };
    let metadata_line = internal(InternalBufferKind::MetadataLine, "MetadataLineBuffer")?;
    let metadata_tile_line = internal(InternalBufferKind::MetadataTileLine, "MetadataTileLineBuffer")?;
    let metadata_tile_column =
        internal(InternalBufferKind::MetadataTileColumn, "MetadataTileColumnBuffer")?;

    let lcu_ildb_stream_out =
        provider.allocate(&AllocationRequest::linear("LcuIldbStreamOutBuffer", CACHELINE_SIZE))?;
    let sse_src_pixel_row_store = provider.allocate(&AllocationRequest::linear(
        "SseSrcPixelRowStoreBuffer",
        sse_src_pixel_row_store_size(frame),
    ))?;
    let pak_cu_level_stream_out = provider.allocate(&AllocationRequest::linear(
        "PakCuLevelStreamOutData",
        pak_cu_level_stream_out_size(frame),
    ))?;

    debug!(
        width = frame.dimensions.width,
        height = frame.dimensions.height,
        "Allocated frame engine buffers"
    );

    Ok(FrameResources {
        pak_stream_out,
        metadata_line,
        metadata_tile_line,
        metadata_tile_column,
        lcu_ildb_stream_out,
        sse_src_pixel_row_store,
        pak_cu_level_stream_out,
    })
}

/// Watchdog threshold in milliseconds for an encode of `dimensions`.
pub fn watchdog_threshold_ms(dimensions: &Dimensions) -> u32 {
    let area = dimensions.area();
    if area <= 1920 * 1080 {
        50
    } else if area <= 3840 * 2160 {
        100
    } else if area <= 7680 * 4320 {
        500
    } else {
        2000
    }
}
