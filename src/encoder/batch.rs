//! Batch-buffer hierarchy.
//!
//! The primary [`CommandBuffer`] is the 1st level. Tile and PAK-slice batches
//! are 2nd level and the pass-invariant picture state batch is 3rd level; all
//! of those live in a [`BatchArena`] and are addressed by [`BatchId`].
//!
//! A batch can only be referenced from a higher level through a [`BatchRef`],
//! and the arena only hands one out when the batch is closed with a
//! terminating instruction.

use tracing::trace;

use crate::encoder::commands::{Command, CommandEmitter, CommandSink};
use crate::encoder::resources::ResourceHandle;
use crate::error::{Result, VdForgeError};

/// Nesting level of a batch referenced by a batch-buffer-start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BatchLevel {
    Second,
    Third,
}

impl BatchLevel {
    pub fn as_u32(&self) -> u32 {
        match self {
            BatchLevel::Second => 2,
            BatchLevel::Third => 3,
        }
    }

    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            2 => Some(BatchLevel::Second),
            3 => Some(BatchLevel::Third),
            _ => None,
        }
    }
}

/// Start address of a closed batch region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchRef {
    resource: ResourceHandle,
    offset: u32,
    level: BatchLevel,
}

impl BatchRef {
    /// Reference a batch whose contents are owned and terminated elsewhere,
    /// such as the rate-control batch.
    pub fn prebuilt(resource: ResourceHandle, offset: u32, level: BatchLevel) -> Self {
        Self {
            resource,
            offset,
            level,
        }
    }

    /// Same batch, starting at `offset`.
    pub fn at_offset(self, offset: u32) -> Self {
        Self { offset, ..self }
    }

    pub fn resource(&self) -> ResourceHandle {
        self.resource
    }

    pub fn offset(&self) -> u32 {
        self.offset
    }

    pub fn level(&self) -> BatchLevel {
        self.level
    }
}

/// Primary (1st level) command buffer supplied by the caller.
#[derive(Debug, Clone)]
pub struct CommandBuffer {
    data: Vec<u8>,
    capacity: u32,
}

impl CommandBuffer {
    /// Create an empty buffer that holds at most `capacity` bytes.
    pub fn new(capacity: u32) -> Self {
        Self {
            data: Vec::with_capacity(capacity as usize),
            capacity,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> u32 {
        self.data.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Drop everything written so far.
    pub fn clear(&mut self) {
        self.data.clear();
    }
}

impl CommandSink for CommandBuffer {
    fn append(&mut self, bytes: &[u8]) -> Result<()> {
        let available = self.remaining();
        if bytes.len() as u64 > available as u64 {
            return Err(VdForgeError::BatchOverflow {
                needed: bytes.len() as u32,
                available,
            });
        }
        self.data.extend_from_slice(bytes);
        Ok(())
    }

    fn offset(&self) -> u32 {
        self.len()
    }

    fn remaining(&self) -> u32 {
        self.capacity - self.len()
    }
}

/// Index of a batch in a [`BatchArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BatchId(usize);

/// Where an opened batch starts writing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Discard earlier contents and write from offset 0.
    Reset,
    /// Write from a fixed byte offset. Bytes past it are discarded and a gap
    /// before it is zero filled, so reopening the same region rewrites it.
    Region(u32),
}

/// Fixed-capacity 2nd or 3rd level batch.
#[derive(Debug, Clone)]
pub struct BatchBuffer {
    name: &'static str,
    resource: ResourceHandle,
    level: BatchLevel,
    capacity: u32,
    data: Vec<u8>,
    region_start: u32,
    open: bool,
}

impl BatchBuffer {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn resource(&self) -> ResourceHandle {
        self.resource
    }

    pub fn level(&self) -> BatchLevel {
        self.level
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Every byte written since the last reset.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Bytes from `offset` to the current cursor.
    pub fn bytes_from(&self, offset: u32) -> Option<&[u8]> {
        self.data.get(offset as usize..)
    }
}

impl CommandSink for BatchBuffer {
    fn append(&mut self, bytes: &[u8]) -> Result<()> {
        if !self.open {
            return Err(VdForgeError::BatchState(format!(
                "write to closed batch '{}'",
                self.name
            )));
        }
        let available = self.remaining();
        if bytes.len() as u64 > available as u64 {
            return Err(VdForgeError::BatchOverflow {
                needed: bytes.len() as u32,
                available,
            });
        }
        self.data.extend_from_slice(bytes);
        Ok(())
    }

    fn offset(&self) -> u32 {
        self.data.len() as u32
    }

    fn remaining(&self) -> u32 {
        self.capacity - self.data.len() as u32
    }
}

/// Owner of every 2nd and 3rd level batch of a packet.
#[derive(Debug, Default)]
pub struct BatchArena {
    buffers: Vec<BatchBuffer>,
}

impl BatchArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a batch backed by `resource`.
    pub fn create(
        &mut self,
        name: &'static str,
        resource: ResourceHandle,
        level: BatchLevel,
        capacity: u32,
    ) -> Result<BatchId> {
        if !resource.is_valid() {
            return Err(VdForgeError::InvalidResource(format!(
                "batch '{name}' has no backing resource"
            )));
        }
        self.buffers.push(BatchBuffer {
            name,
            resource,
            level,
            capacity,
            data: Vec::new(),
            region_start: 0,
            open: false,
        });
        Ok(BatchId(self.buffers.len() - 1))
    }

    /// Drop every batch.
    pub fn clear(&mut self) {
        self.buffers.clear();
    }

    /// Empty and close every batch, keeping the registrations.
    pub fn reset(&mut self) {
        for batch in &mut self.buffers {
            batch.data.clear();
            batch.region_start = 0;
            batch.open = false;
        }
    }

    /// Backing resources of every registered batch.
    pub fn resources(&self) -> impl Iterator<Item = ResourceHandle> + '_ {
        self.buffers.iter().map(|b| b.resource)
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn get(&self, id: BatchId) -> Result<&BatchBuffer> {
        self.buffers
            .get(id.0)
            .ok_or_else(|| VdForgeError::BatchState(format!("unknown batch {}", id.0)))
    }

    /// Writable access to an open batch.
    pub fn sink(&mut self, id: BatchId) -> Result<&mut BatchBuffer> {
        let batch = self
            .buffers
            .get_mut(id.0)
            .ok_or_else(|| VdForgeError::BatchState(format!("unknown batch {}", id.0)))?;
        if !batch.open {
            return Err(VdForgeError::BatchState(format!(
                "batch '{}' is not open",
                batch.name
            )));
        }
        Ok(batch)
    }

    /// Find the batch backed by `resource`.
    pub fn find(&self, resource: ResourceHandle) -> Option<&BatchBuffer> {
        self.buffers.iter().find(|b| b.resource == resource)
    }

    /// Open a batch for writing and return the offset the new region starts at.
    pub fn open(&mut self, id: BatchId, mode: OpenMode) -> Result<u32> {
        let batch = self
            .buffers
            .get_mut(id.0)
            .ok_or_else(|| VdForgeError::BatchState(format!("unknown batch {}", id.0)))?;
        if batch.open {
            return Err(VdForgeError::BatchState(format!(
                "batch '{}' is already open",
                batch.name
            )));
        }
        let start = match mode {
            OpenMode::Reset => 0,
            OpenMode::Region(offset) => offset,
        };
        if start > batch.capacity {
            return Err(VdForgeError::BatchOverflow {
                needed: start,
                available: batch.capacity,
            });
        }
        batch.data.resize(start as usize, 0);
        batch.region_start = start;
        batch.open = true;
        trace!(batch = batch.name, offset = batch.region_start, ?mode, "Opened batch");
        Ok(batch.region_start)
    }

    /// Terminate the region opened last and return a reference to its start.
    pub fn close<E>(&mut self, id: BatchId, emitter: &E) -> Result<BatchRef>
    where
        E: CommandEmitter + ?Sized,
    {
        let batch = self.sink(id)?;
        emitter.emit(batch, &Command::BatchBufferEnd)?;
        batch.open = false;
        trace!(
            batch = batch.name,
            start = batch.region_start,
            end = batch.data.len(),
            "Closed batch"
        );
        Ok(BatchRef {
            resource: batch.resource,
            offset: batch.region_start,
            level: batch.level,
        })
    }
}

/// Per-slice layout of the rate-control-owned 2nd level batch.
///
/// The batch starts with two picture-level groups, followed by one region per
/// slice made of a constant part and a slice-specific variable part.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SecondLevelLayout {
    pub first_group_size: u32,
    pub second_group_size: u32,
    pub per_slice_const_size: u32,
    pub per_slice_var_sizes: Vec<u32>,
}

impl SecondLevelLayout {
    /// Offset of the first slice region.
    pub fn slice_base(&self) -> u32 {
        self.first_group_size + self.second_group_size
    }

    /// Start offset of each slice's region.
    ///
    /// When `advance` is false every slice reuses the base offset, which is
    /// how the batch is laid out when neither ACQP nor BRC fills per-slice
    /// regions.
    pub fn slice_offsets(&self, num_slices: usize, advance: bool) -> Vec<u32> {
        let mut offset = self.slice_base();
        let mut offsets = Vec::with_capacity(num_slices);
        for index in 0..num_slices {
            offsets.push(offset);
            if advance {
                let var = self.per_slice_var_sizes.get(index).copied().unwrap_or(0);
                offset += self.per_slice_const_size + var;
            }
        }
        offsets
    }
}
