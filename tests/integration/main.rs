//! reconstream integration test harness.
//!
//! Tests here drive whole pipelines the way the daemon does: client bytes go
//! through the acquisition reader, the configured stages and the wire
//! writers, and the resulting byte stream is parsed back.
//!
//!   cargo test --test integration

use anyhow::{bail, Context, Result};
use zerocopy::FromZeroes;

use recon_core::config::{PipelineConfig, ReconConfig};
use recon_core::wire::{
    AcquisitionHeader, ImageMessage, ACQ_FIRST_IN_SLICE, ACQ_LAST_IN_SLICE, MSG_CLOSE,
};
use recon_core::Complex32;
use recon_pipeline::inbound::encode_acquisition;
use recon_pipeline::{
    AcquisitionReader, Pipeline, PipelineEvent, PipelineReport, StageRegistry, WriterRegistry,
};

mod failures;
mod reconstruction;

// ── Harness ───────────────────────────────────────────────────────────────────

/// Shape of a synthetic acquisition.
#[derive(Debug, Clone, Copy)]
pub struct Scan {
    pub samples: u16,
    pub lines: u16,
    pub channels: u16,
    pub slices: u16,
}

/// One readout with a point at the k-space centre for the middle line and
/// flat low-level signal elsewhere.
pub fn readout(scan: Scan, line: u16, slice: u16) -> (AcquisitionHeader, Vec<Complex32>) {
    let mut acq = AcquisitionHeader::new_zeroed();
    acq.version = 1;
    acq.number_of_samples = scan.samples;
    acq.active_channels = scan.channels;
    acq.available_channels = scan.channels;
    acq.center_sample = scan.samples / 2;
    let mut idx = acq.idx;
    idx.kspace_encode_step_1 = line;
    idx.slice = slice;
    acq.idx = idx;
    if line == 0 {
        acq.set_flag(ACQ_FIRST_IN_SLICE);
    }
    if line + 1 == scan.lines {
        acq.set_flag(ACQ_LAST_IN_SLICE);
    }

    let samples = usize::from(scan.samples);
    let mut data = Vec::with_capacity(samples * usize::from(scan.channels));
    for channel in 0..scan.channels {
        for s in 0..samples {
            let peak = line == scan.lines / 2 && s == samples / 2;
            let value = if peak { 100.0 } else { 0.1 };
            data.push(Complex32::new(value * f32::from(channel + 1), 0.0));
        }
    }
    (acq, data)
}

/// Client byte stream for a whole scan, terminated by CLOSE.
pub fn client_stream(scan: Scan) -> Vec<u8> {
    let mut out = Vec::new();
    for slice in 0..scan.slices {
        for line in 0..scan.lines {
            let (acq, data) = readout(scan, line, slice);
            out.extend(encode_acquisition(&acq, &[], &data));
        }
    }
    out.extend_from_slice(&MSG_CLOSE.to_ne_bytes());
    out
}

pub fn config_from_toml(text: &str) -> Result<PipelineConfig> {
    let config: ReconConfig = toml::from_str(text).context("test config does not parse")?;
    Ok(config.pipeline)
}

/// Everything a session produced.
pub struct RunOutcome {
    pub report: PipelineReport,
    pub images: Vec<ImageMessage>,
    pub events: Vec<PipelineEvent>,
}

/// Feed `input` through a pipeline built from `config`, the way a session
/// does, and parse what reaches the sink.
pub fn run_pipeline(config: &PipelineConfig, input: &[u8]) -> Result<RunOutcome> {
    let pipeline = Pipeline::build(
        config,
        &StageRegistry::with_builtin(),
        WriterRegistry::with_image_writers(),
    )?;
    let running = pipeline.start(Vec::new())?;
    let events = running.events();

    let mut reader = AcquisitionReader::new(input);
    while let Some(chain) = reader.next_chain()? {
        if running.submit(chain).is_err() {
            break;
        }
    }
    let (report, sink) = running.finish();
    let sink = sink.context("writer did not return its sink")?;

    Ok(RunOutcome {
        report,
        images: read_images(&sink)?,
        events: events.try_iter().collect(),
    })
}

pub fn read_images(mut bytes: &[u8]) -> Result<Vec<ImageMessage>> {
    let mut images = Vec::new();
    while !bytes.is_empty() {
        let image = ImageMessage::read_from(&mut bytes).context("sink holds a partial message")?;
        images.push(image);
    }
    Ok(images)
}

pub fn matrix(image: &ImageMessage) -> [u16; 3] {
    image.header.matrix_size
}

pub fn expect_single<T>(items: Vec<T>) -> Result<T> {
    let count = items.len();
    let mut items = items.into_iter();
    match (items.next(), items.next()) {
        (Some(item), None) => Ok(item),
        _ => bail!("expected exactly one item, got {count}"),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[test]
fn test_harness_stream_parses_back() -> Result<()> {
    let scan = Scan {
        samples: 8,
        lines: 2,
        channels: 1,
        slices: 1,
    };
    let bytes = client_stream(scan);
    let mut reader = AcquisitionReader::new(&bytes[..]);
    let mut count = 0;
    while reader.next_chain()?.is_some() {
        count += 1;
    }
    assert_eq!(count, 2);
    Ok(())
}
