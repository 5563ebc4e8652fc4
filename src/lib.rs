//! VdForge - command program construction for fixed-function HEVC encode engines.
//!
//! Given a frame's coding parameters and a target pipe layout, VdForge emits an
//! ordered, synchronized sequence of hardware commands that drives the
//! bitstream engine (HCP) and the mode-decision engine (VDEnc) through one or
//! more rate-control passes, optionally split across parallel pipes and tiles.
//!
//! The binary encoding of individual commands is delegated to a
//! [`CommandEmitter`]; buffer allocation is delegated to a [`ResourceProvider`];
//! tiling and rate-control policy come from feature adapters in a [`FeatureSet`].

pub mod encoder;
pub mod error;

pub use encoder::batch::{BatchArena, BatchId, BatchLevel, BatchRef, CommandBuffer};
pub use encoder::commands::{Command, CommandEmitter, CommandSink, Opcode};
pub use encoder::emitter::{decode_stream, DecodedCommand, ReferenceEmitter};
pub use encoder::features::{
    FeatureSet, GridTiling, RateControlFeature, RoiFeature, StaticRateControl, TileFeature,
};
pub use encoder::h265::{HevcVdencPacket, PictureStateSize};
pub use encoder::pipe::{MultiEngineMode, PipeDescriptor, PipeRole, PipeWorkMode};
pub use encoder::platform::{NoopHook, PlatformHook};
pub use encoder::resources::{AllocationRequest, HeapProvider, ResourceHandle, ResourceProvider};
pub use encoder::status::StatusReportHandle;
pub use encoder::sync::{BarrierKind, PipeSync};
pub use encoder::{
    BitDepth, ChromaFormat, CodingType, Dimensions, FrameDescriptor, FrameSurfaces,
    PacketConfig, PassDescriptor, SliceDescriptor, SliceType, SubmitContext, TileGrid,
};
pub use error::{Result, VdForgeError};
