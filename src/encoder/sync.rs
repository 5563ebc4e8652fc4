//! Cross-pipe barriers.
//!
//! Each pipe owns one dword counter per barrier kind in a shared semaphore
//! buffer. Barriers are realised entirely with commands (store, atomic
//! increment, semaphore wait); the host never blocks.

use tracing::trace;

use crate::encoder::commands::{Command, CommandEmitter, CommandSink, CompareOp};
use crate::encoder::pipe::PipeDescriptor;
use crate::encoder::resources::ResourceHandle;
use crate::encoder::CACHELINE_SIZE;
use crate::error::{Result, VdForgeError};

/// Bytes between two pipes' counters.
const SLOT_STRIDE: u32 = 4;

/// Bytes reserved for the counters of one barrier kind.
const KIND_STRIDE: u32 = SLOT_STRIDE * 4;

/// Size of the semaphore buffer.
pub const SEMAPHORE_BUFFER_SIZE: u32 = CACHELINE_SIZE;

/// Barrier pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierKind {
    /// One pipe waits until every other pipe has signalled it.
    OnePipeWaitOthers,
    /// Every pipe waits until all siblings reach the same point.
    AllPipes,
}

impl BarrierKind {
    fn base(&self) -> u32 {
        match self {
            BarrierKind::OnePipeWaitOthers => 0,
            BarrierKind::AllPipes => KIND_STRIDE,
        }
    }
}

/// Emits barrier commands against one semaphore buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipeSync {
    semaphore: ResourceHandle,
}

impl PipeSync {
    pub fn new(semaphore: ResourceHandle) -> Result<Self> {
        if !semaphore.is_valid() {
            return Err(VdForgeError::InvalidResource(
                "semaphore buffer is not set".to_string(),
            ));
        }
        Ok(Self { semaphore })
    }

    pub fn semaphore(&self) -> ResourceHandle {
        self.semaphore
    }

    /// Byte offset of `pipe_ordinal`'s counter for `kind`.
    pub fn slot_offset(kind: BarrierKind, pipe_ordinal: u8) -> u32 {
        kind.base() + pipe_ordinal as u32 * SLOT_STRIDE
    }

    /// Clear counters at picture start.
    ///
    /// For [`BarrierKind::OnePipeWaitOthers`] only the waiting pipe clears its
    /// counter; for [`BarrierKind::AllPipes`] every pipe clears its own. The
    /// clear has to be ordered ahead of the siblings' increments by a barrier
    /// of the other kind.
    pub fn reset_semaphore<E>(
        &self,
        emitter: &E,
        sink: &mut dyn CommandSink,
        kind: BarrierKind,
        waiter: u8,
        pipe: &PipeDescriptor,
    ) -> Result<()>
    where
        E: CommandEmitter + ?Sized,
    {
        self.check_waiter(waiter, pipe)?;
        if kind == BarrierKind::OnePipeWaitOthers && pipe.ordinal() != waiter {
            return Ok(());
        }
        trace!(?kind, pipe = pipe.ordinal(), "Reset semaphore");
        emitter.emit(
            sink,
            &Command::StoreDataImm {
                resource: self.semaphore,
                offset: Self::slot_offset(kind, pipe.ordinal()),
                value: 0,
            },
        )
    }

    /// Emit this pipe's side of a barrier.
    pub fn sync_pipe<E>(
        &self,
        emitter: &E,
        sink: &mut dyn CommandSink,
        kind: BarrierKind,
        waiter: u8,
        pipe: &PipeDescriptor,
    ) -> Result<()>
    where
        E: CommandEmitter + ?Sized,
    {
        self.check_waiter(waiter, pipe)?;
        let others = pipe.count() as u32 - 1;
        trace!(?kind, pipe = pipe.ordinal(), others, "Sync pipe");

        match kind {
            BarrierKind::OnePipeWaitOthers => {
                if pipe.ordinal() == waiter {
                    self.wait_and_clear(emitter, sink, kind, pipe.ordinal(), others)
                } else {
                    emitter.emit(
                        sink,
                        &Command::AtomicIncrement {
                            resource: self.semaphore,
                            offset: Self::slot_offset(kind, waiter),
                        },
                    )
                }
            }
            BarrierKind::AllPipes => {
                for other in (0..pipe.count()).filter(|o| *o != pipe.ordinal()) {
                    emitter.emit(
                        sink,
                        &Command::AtomicIncrement {
                            resource: self.semaphore,
                            offset: Self::slot_offset(kind, other),
                        },
                    )?;
                }
                self.wait_and_clear(emitter, sink, kind, pipe.ordinal(), others)
            }
        }
    }

    fn wait_and_clear<E>(
        &self,
        emitter: &E,
        sink: &mut dyn CommandSink,
        kind: BarrierKind,
        ordinal: u8,
        expected: u32,
    ) -> Result<()>
    where
        E: CommandEmitter + ?Sized,
    {
        let offset = Self::slot_offset(kind, ordinal);
        emitter.emit(
            sink,
            &Command::SemaphoreWait {
                resource: self.semaphore,
                offset,
                value: expected,
                compare: CompareOp::GreaterOrEqual,
            },
        )?;
        // Leave the counter clean for the next frame.
        emitter.emit(
            sink,
            &Command::StoreDataImm {
                resource: self.semaphore,
                offset,
                value: 0,
            },
        )
    }

    fn check_waiter(&self, waiter: u8, pipe: &PipeDescriptor) -> Result<()> {
        if waiter >= pipe.count() {
            return Err(VdForgeError::InvalidInput(format!(
                "barrier waiter {waiter} is out of range for {} pipes",
                pipe.count()
            )));
        }
        Ok(())
    }
}
