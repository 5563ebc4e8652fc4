//! Example: HEVC VDEnc command program
//!
//! Builds the command program for a short sequence of 1080p frames: two
//! frames on a single pipe without tiles, then one frame split across two
//! pipes with one tile column each. Commands are written with the reference
//! emitter and decoded back for display.

use std::collections::BTreeMap;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};
use vdforge::{
    decode_stream, AllocationRequest, CodingType, CommandBuffer, FeatureSet, FrameDescriptor,
    FrameSurfaces, HeapProvider, HevcVdencPacket, Opcode, PacketConfig, PassDescriptor,
    PipeDescriptor, ReferenceEmitter, ResourceProvider, SliceDescriptor, SliceType,
    SubmitContext, TileGrid,
};

const WIDTH: u32 = 1920;
const HEIGHT: u32 = 1080;
const NUM_PASSES: u8 = 2;
const PRIMARY_BUFFER_SIZE: u32 = 64 * 1024;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing.
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_filter(tracing_subscriber::filter::LevelFilter::INFO),
        )
        .init();

    println!("VdForge HEVC VDEnc Example\n");

    // Frame surfaces are owned by the caller.
    let mut provider = HeapProvider::new();
    let surfaces = FrameSurfaces {
        source: provider.allocate(&AllocationRequest::linear("SourceSurface", WIDTH * HEIGHT * 3 / 2))?,
        recon: provider.allocate(&AllocationRequest::linear("ReconSurface", WIDTH * HEIGHT * 3 / 2))?,
        bitstream: provider.allocate(&AllocationRequest::linear("Bitstream", WIDTH * HEIGHT))?,
        mb_code: provider.allocate(&AllocationRequest::linear("PakObjects", 1024 * 1024))?,
    };

    let config = PacketConfig::new()
        .with_max_passes(NUM_PASSES)
        .with_pak_slice_batches(3);
    let mut packet = HevcVdencPacket::new(
        ReferenceEmitter::new(),
        provider,
        FeatureSet::standard(),
        config,
    )?;

    let size = packet.picture_state_command_size();
    println!(
        "Picture state: {} bytes, {} patch entries\n",
        size.command_bytes, size.patch_entries
    );

    // Single pipe, two passes per frame.
    let frames = [
        FrameDescriptor::new(WIDTH, HEIGHT).with_surfaces(surfaces),
        FrameDescriptor::new(WIDTH, HEIGHT)
            .with_surfaces(surfaces)
            .with_coding_type(CodingType::P)
            .with_pic_order_cnt(2)
            .with_slices(vec![
                SliceDescriptor::new(0, 255, SliceType::P).with_references(&[0], &[]),
                SliceDescriptor::new(255, 255, SliceType::P).with_references(&[0], &[]),
            ]),
    ];
    for frame in &frames {
        let status = packet.prepare(frame)?;
        for ordinal in 0..NUM_PASSES {
            let ctx = SubmitContext::new(
                PassDescriptor::new(ordinal, NUM_PASSES)?,
                PipeDescriptor::single(),
            );
            let mut cmd = CommandBuffer::new(PRIMARY_BUFFER_SIZE);
            packet.submit(&mut cmd, frame, &ctx)?;
            print_summary(
                &format!("frame {} pass {}", status.frame_number(), ordinal),
                &cmd,
            )?;
        }
    }

    // Two pipes, one tile column each.
    let width_in_lcus = WIDTH.div_ceil(64);
    let height_in_lcus = HEIGHT.div_ceil(64);
    let grid = TileGrid::uniform(width_in_lcus, height_in_lcus, 2, 1);
    let right_start = grid.column_start(1);
    let frame = FrameDescriptor::new(WIDTH, HEIGHT)
        .with_surfaces(surfaces)
        .with_tile_grid(grid.clone())
        .with_slices(vec![
            SliceDescriptor::new(0, grid.column_widths[0] * height_in_lcus, SliceType::I),
            SliceDescriptor::new(right_start, grid.column_widths[1] * height_in_lcus, SliceType::I),
        ])
        .with_last_picture(true, true);

    let status = packet.prepare(&frame)?;
    for pipe in PipeDescriptor::all(2)? {
        let ctx = SubmitContext::new(PassDescriptor::single(), pipe);
        let mut cmd = CommandBuffer::new(PRIMARY_BUFFER_SIZE);
        packet.submit(&mut cmd, &frame, &ctx)?;
        print_summary(
            &format!("frame {} pipe {}", status.frame_number(), pipe.ordinal()),
            &cmd,
        )?;

        for command in decode_stream(cmd.as_bytes())? {
            if let Some((resource, offset, level)) = command.batch_target() {
                let Some(batch) = packet.batch(resource) else {
                    continue;
                };
                println!(
                    "    -> {} ({:?}) at offset {}, {} bytes written",
                    batch.name(),
                    level,
                    offset,
                    batch.as_bytes().len()
                );
            }
        }
    }

    println!("\nDone");
    Ok(())
}

fn print_summary(label: &str, cmd: &CommandBuffer) -> Result<(), Box<dyn std::error::Error>> {
    let commands = decode_stream(cmd.as_bytes())?;
    let mut counts: BTreeMap<String, usize> = BTreeMap::new();
    for command in &commands {
        *counts.entry(format!("{:?}", command.opcode)).or_default() += 1;
    }

    println!(
        "{label}: {} commands, {} bytes, {} batch starts",
        commands.len(),
        cmd.len(),
        commands
            .iter()
            .filter(|c| c.opcode == Opcode::BatchBufferStart)
            .count()
    );
    for (opcode, count) in counts {
        println!("    {opcode:<24} x{count}");
    }
    Ok(())
}
