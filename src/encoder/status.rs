//! Status report records written by the engines.
//!
//! The status buffer holds a ring of fixed-size records followed by a global
//! completion counter. The builder emits the commands that fill a record; the
//! outer pipeline polls it through a [`StatusReportHandle`].

use crate::encoder::commands::{Command, CommandEmitter, CommandSink, MmioRegister};
use crate::encoder::resources::ResourceHandle;
use crate::encoder::CACHELINE_SIZE;
use crate::error::{Result, VdForgeError};

/// Records in the ring.
pub const STATUS_REPORT_RECORDS: u32 = 64;

/// Bytes per record.
pub const STATUS_RECORD_SIZE: u32 = CACHELINE_SIZE;

/// Value stored when the engines start a frame.
pub const STATUS_QUERY_START: u32 = 1;

/// Value stored when the engines finish a frame.
pub const STATUS_QUERY_END: u32 = 2;

// Field offsets inside a record.
const STATUS_FIELD: u32 = 0;
const BITSTREAM_BYTE_COUNT_FIELD: u32 = 4;
const IMAGE_STATUS_CONTROL_FIELD: u32 = 8;
const SSE_LUMA_FIELD: u32 = 12;
const SSE_CHROMA_FIELD: u32 = 16;
const SLICE_BYTE_COUNT_FIELD: u32 = 20;

/// Where one frame's status lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusReportHandle {
    buffer: ResourceHandle,
    offset: u32,
    frame_number: u32,
}

/// Decoded contents of a status record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatusRecord {
    pub status: u32,
    pub bitstream_byte_count: u32,
    pub image_status_control: u32,
    pub sse_luma: u32,
    pub sse_chroma: u32,
    pub slice_byte_count: u32,
}

impl StatusReportHandle {
    pub fn buffer(&self) -> ResourceHandle {
        self.buffer
    }

    /// Byte offset of the record in the status buffer.
    pub fn offset(&self) -> u32 {
        self.offset
    }

    pub fn frame_number(&self) -> u32 {
        self.frame_number
    }

    /// Read the record from a CPU view of the status buffer.
    pub fn read(&self, status_buffer: &[u8]) -> Result<StatusRecord> {
        let field = |offset: u32| -> Result<u32> {
            let start = (self.offset + offset) as usize;
            let bytes = status_buffer.get(start..start + 4).ok_or_else(|| {
                VdForgeError::InvalidInput(format!(
                    "status buffer view of {} bytes is too small for frame {}",
                    status_buffer.len(),
                    self.frame_number
                ))
            })?;
            Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
        };
        Ok(StatusRecord {
            status: field(STATUS_FIELD)?,
            bitstream_byte_count: field(BITSTREAM_BYTE_COUNT_FIELD)?,
            image_status_control: field(IMAGE_STATUS_CONTROL_FIELD)?,
            sse_luma: field(SSE_LUMA_FIELD)?,
            sse_chroma: field(SSE_CHROMA_FIELD)?,
            slice_byte_count: field(SLICE_BYTE_COUNT_FIELD)?,
        })
    }

    /// Whether the engines finished the frame.
    pub fn is_complete(&self, status_buffer: &[u8]) -> Result<bool> {
        Ok(self.read(status_buffer)?.status == STATUS_QUERY_END)
    }
}

/// Emits the commands that fill status records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusReport {
    buffer: ResourceHandle,
}

impl StatusReport {
    /// Bytes needed for the ring plus the global counter.
    pub const BUFFER_SIZE: u32 = STATUS_REPORT_RECORDS * STATUS_RECORD_SIZE + CACHELINE_SIZE;

    pub fn new(buffer: ResourceHandle) -> Result<Self> {
        if !buffer.is_valid() {
            return Err(VdForgeError::InvalidResource(
                "status report buffer is not set".to_string(),
            ));
        }
        Ok(Self { buffer })
    }

    pub fn handle(&self, frame_number: u32) -> StatusReportHandle {
        StatusReportHandle {
            buffer: self.buffer,
            offset: (frame_number % STATUS_REPORT_RECORDS) * STATUS_RECORD_SIZE,
            frame_number,
        }
    }

    /// Byte offset of the global completion counter.
    pub fn global_count_offset(&self) -> u32 {
        STATUS_REPORT_RECORDS * STATUS_RECORD_SIZE
    }

    pub fn start<E>(&self, emitter: &E, sink: &mut dyn CommandSink, frame_number: u32) -> Result<()>
    where
        E: CommandEmitter + ?Sized,
    {
        let record = self.handle(frame_number);
        self.store(emitter, sink, record.offset + STATUS_FIELD, STATUS_QUERY_START)
    }

    pub fn read_sse_statistics<E>(
        &self,
        emitter: &E,
        sink: &mut dyn CommandSink,
        frame_number: u32,
    ) -> Result<()>
    where
        E: CommandEmitter + ?Sized,
    {
        let record = self.handle(frame_number);
        self.read_register(emitter, sink, MmioRegister::SseLuma, record.offset + SSE_LUMA_FIELD)?;
        self.read_register(
            emitter,
            sink,
            MmioRegister::SseChroma,
            record.offset + SSE_CHROMA_FIELD,
        )
    }

    pub fn read_slice_size<E>(
        &self,
        emitter: &E,
        sink: &mut dyn CommandSink,
        frame_number: u32,
    ) -> Result<()>
    where
        E: CommandEmitter + ?Sized,
    {
        let record = self.handle(frame_number);
        self.read_register(
            emitter,
            sink,
            MmioRegister::SliceByteCount,
            record.offset + SLICE_BYTE_COUNT_FIELD,
        )
    }

    /// Capture the byte count and image status, then mark the record complete.
    pub fn end<E>(&self, emitter: &E, sink: &mut dyn CommandSink, frame_number: u32) -> Result<()>
    where
        E: CommandEmitter + ?Sized,
    {
        let record = self.handle(frame_number);
        self.read_register(
            emitter,
            sink,
            MmioRegister::BitstreamByteCount,
            record.offset + BITSTREAM_BYTE_COUNT_FIELD,
        )?;
        self.read_register(
            emitter,
            sink,
            MmioRegister::ImageStatusControl,
            record.offset + IMAGE_STATUS_CONTROL_FIELD,
        )?;
        self.store(emitter, sink, record.offset + STATUS_FIELD, STATUS_QUERY_END)
    }

    /// Bump the global completion counter.
    pub fn update_global_count<E>(&self, emitter: &E, sink: &mut dyn CommandSink) -> Result<()>
    where
        E: CommandEmitter + ?Sized,
    {
        emitter.emit(
            sink,
            &Command::AtomicIncrement {
                resource: self.buffer,
                offset: self.global_count_offset(),
            },
        )
    }

    fn store<E>(&self, emitter: &E, sink: &mut dyn CommandSink, offset: u32, value: u32) -> Result<()>
    where
        E: CommandEmitter + ?Sized,
    {
        emitter.emit(
            sink,
            &Command::StoreDataImm {
                resource: self.buffer,
                offset,
                value,
            },
        )
    }

    fn read_register<E>(
        &self,
        emitter: &E,
        sink: &mut dyn CommandSink,
        register: MmioRegister,
        offset: u32,
    ) -> Result<()>
    where
        E: CommandEmitter + ?Sized,
    {
        emitter.emit(
            sink,
            &Command::StoreRegisterMem {
                register,
                resource: self.buffer,
                offset,
            },
        )
    }
}
