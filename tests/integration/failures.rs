use anyhow::Result;

use recon_core::config::{ConfigError, StageSpec};
use recon_pipeline::{StageError, WriteError};

use crate::*;

// ══════════════════════════════════════════════════════════════════════════════
//  Configuration, malformed input and stage failures
// ══════════════════════════════════════════════════════════════════════════════

const SCAN: Scan = Scan {
    samples: 16,
    lines: 4,
    channels: 1,
    slices: 1,
};

fn image_chain() -> PipelineConfig {
    PipelineConfig {
        queue_capacity: 2,
        stages: vec![
            StageSpec::new("accumulate_image").param("encoding_lines", 4i64),
            StageSpec::new("image_fft"),
            StageSpec::new("coil_combine"),
            StageSpec::new("extract"),
        ],
    }
}

#[test]
fn test_unknown_stage_prevents_startup() -> Result<()> {
    let config = config_from_toml(
        r#"
        [[pipeline.stages]]
        kind = "accumulate_image"
        params = { encoding_lines = 4 }

        [[pipeline.stages]]
        kind = "grappa"
        "#,
    )?;
    let err = match Pipeline::build(
        &config,
        &StageRegistry::with_builtin(),
        WriterRegistry::with_image_writers(),
    ) {
        Ok(_) => panic!("pipeline with unknown stage must not build"),
        Err(e) => e,
    };
    assert!(matches!(err, ConfigError::UnknownStage(ref kind) if kind == "grappa"));
    Ok(())
}

#[test]
fn test_invalid_parameters_prevent_startup() -> Result<()> {
    let cases = [
        StageSpec::new("autoscale").param("max_value", 0i64),
        StageSpec::new("accumulate_image"),
        StageSpec::new("extract").param("mode", "sepia"),
        StageSpec::new("remove_ro_oversampling")
            .param("oversampling_factor", 2i64)
            .param("encoded_samples", 256i64)
            .param("recon_samples", 256i64),
    ];
    for spec in cases {
        let config = PipelineConfig {
            queue_capacity: 1,
            stages: vec![spec.clone()],
        };
        let built = Pipeline::build(
            &config,
            &StageRegistry::with_builtin(),
            WriterRegistry::with_image_writers(),
        );
        assert!(built.is_err(), "{spec:?} should be rejected");
    }
    Ok(())
}

/// A line outside the encoding matrix is dropped; the image still completes.
#[test]
fn test_malformed_line_is_dropped() -> Result<()> {
    let mut bytes = Vec::new();
    for line in 0..SCAN.lines {
        let (mut acq, data) = readout(SCAN, line, 0);
        if line == 1 {
            let mut idx = acq.idx;
            idx.kspace_encode_step_1 = 9;
            acq.idx = idx;
        }
        bytes.extend(encode_acquisition(&acq, &[], &data));
    }

    let outcome = run_pipeline(&image_chain(), &bytes)?;
    assert!(outcome.report.failure.is_none());
    assert_eq!(outcome.images.len(), 1);

    let stats = outcome.report.stage("accumulate_image").expect("stage listed");
    assert_eq!(stats.dropped, 1);
    let dropped = outcome
        .events
        .iter()
        .filter(|e| {
            matches!(
                e,
                PipelineEvent::ChainDropped {
                    error: StageError::Malformed(_),
                    ..
                }
            )
        })
        .count();
    assert_eq!(dropped, 1);
    Ok(())
}

/// Readouts without any channel carry no samples; every one is dropped and
/// no image is made up from the empty buffer.
#[test]
fn test_channelless_readouts_produce_no_image() -> Result<()> {
    let bytes = client_stream(Scan {
        channels: 0,
        ..SCAN
    });

    let outcome = run_pipeline(&image_chain(), &bytes)?;
    assert!(outcome.report.failure.is_none());
    assert!(outcome.images.is_empty());
    assert_eq!(outcome.report.writer.written, 0);

    let stats = outcome.report.stage("accumulate_image").expect("stage listed");
    assert_eq!(stats.received, u64::from(SCAN.lines));
    assert_eq!(stats.dropped, u64::from(SCAN.lines));
    assert_eq!(stats.emitted, 0);
    Ok(())
}

/// A readout that changes length mid-image is fatal: the pipeline drains and
/// no image is produced.
#[test]
fn test_shape_change_drains_pipeline() -> Result<()> {
    let mut bytes = Vec::new();
    for line in 0..SCAN.lines {
        let scan = if line == 2 {
            Scan { samples: 8, ..SCAN }
        } else {
            SCAN
        };
        let (acq, data) = readout(scan, line, 0);
        bytes.extend(encode_acquisition(&acq, &[], &data));
    }

    let outcome = run_pipeline(&image_chain(), &bytes)?;
    let failure = outcome.report.failure.expect("fatal error reported");
    assert!(failure.starts_with("accumulate_image"), "{failure}");
    assert!(outcome.images.is_empty());
    assert!(outcome.events.iter().any(|e| matches!(
        e,
        PipelineEvent::StageFailed { stage, .. } if stage == "accumulate_image"
    )));
    Ok(())
}

/// Uncombined multi-channel images carry more elements than their header's
/// matrix declares; the writer refuses them and the stream carries on.
#[test]
fn test_uncombined_image_is_refused() -> Result<()> {
    let config = PipelineConfig {
        queue_capacity: 2,
        stages: vec![
            StageSpec::new("accumulate_image").param("encoding_lines", 4i64),
            StageSpec::new("image_fft"),
        ],
    };
    let mut bytes = client_stream(Scan {
        channels: 2,
        slices: 2,
        ..SCAN
    });
    // Drop the trailing CLOSE and append a single-coil slice.
    bytes.truncate(bytes.len() - 2);
    for line in 0..SCAN.lines {
        let (acq, data) = readout(SCAN, line, 5);
        bytes.extend(encode_acquisition(&acq, &[], &data));
    }

    let outcome = run_pipeline(&config, &bytes)?;
    assert!(outcome.report.failure.is_none());
    assert_eq!(outcome.report.writer.refused, 2);
    assert_eq!(outcome.report.writer.written, 1);

    let image = expect_single(outcome.images)?;
    let slice = image.header.slice;
    assert_eq!(slice, 5);

    let refusals: Vec<&WriteError> = outcome
        .events
        .iter()
        .filter_map(|e| match e {
            PipelineEvent::WriteRefused { error } => Some(error),
            _ => None,
        })
        .collect();
    assert_eq!(refusals.len(), 2);
    assert!(refusals.iter().all(|e| matches!(
        e,
        WriteError::DimensionMismatch {
            declared: 64,
            actual: 128,
            ..
        }
    )));
    Ok(())
}

#[test]
fn test_unknown_inbound_message_is_rejected() {
    let mut bytes = client_stream(SCAN);
    bytes.truncate(bytes.len() - 2);
    bytes.extend_from_slice(&1234u16.to_ne_bytes());
    assert!(run_pipeline(&image_chain(), &bytes).is_err());
}
