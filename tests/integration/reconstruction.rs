use anyhow::Result;

use recon_core::config::{default_stages, PipelineConfig, StageSpec};
use recon_core::wire::{
    DATA_FLOAT, DATA_USHORT, IMTYPE_MAGNITUDE, IMTYPE_REAL, MSG_IMAGE_CPLX_FLOAT,
    MSG_IMAGE_REAL_FLOAT, MSG_IMAGE_REAL_USHORT,
};
use recon_core::Complex32;

use crate::*;

// ══════════════════════════════════════════════════════════════════════════════
//  End-to-end reconstruction
// ══════════════════════════════════════════════════════════════════════════════

const SMALL: Scan = Scan {
    samples: 32,
    lines: 8,
    channels: 2,
    slices: 1,
};

fn standard_chain(lines: i64) -> PipelineConfig {
    let mut stages = default_stages();
    stages[1] = StageSpec::new("accumulate_image").param("encoding_lines", lines);
    PipelineConfig {
        queue_capacity: 4,
        stages,
    }
}

/// The default stage list (with a small matrix) yields one scaled ushort
/// magnitude image per slice.
#[test]
fn test_default_chain_produces_magnitude_image() -> Result<()> {
    let outcome = run_pipeline(&standard_chain(8), &client_stream(SMALL))?;
    assert!(outcome.report.is_clean(), "{:?}", outcome.report);

    let image = expect_single(outcome.images)?;
    assert_eq!(image.identifier, MSG_IMAGE_REAL_USHORT);
    // Readout halved by oversampling removal.
    assert_eq!(matrix(&image), [16, 8, 1]);
    let (data_type, image_type, channels) = (
        image.header.image_data_type,
        image.header.image_type,
        image.header.channels,
    );
    assert_eq!(data_type, DATA_USHORT);
    assert_eq!(image_type, IMTYPE_MAGNITUDE);
    assert_eq!(channels, 1);
    assert_eq!(image.payload.len(), 16 * 8 * 2);

    let pixels = image.to_array::<u16>()?;
    assert_eq!(pixels.data().iter().copied().max(), Some(2048));
    Ok(())
}

#[test]
fn test_each_slice_is_its_own_image() -> Result<()> {
    let scan = Scan { slices: 3, ..SMALL };
    let outcome = run_pipeline(&standard_chain(8), &client_stream(scan))?;
    assert!(outcome.report.is_clean(), "{:?}", outcome.report);
    assert_eq!(outcome.images.len(), 3);

    let indices: Vec<(u16, u16)> = outcome
        .images
        .iter()
        .map(|i| (i.header.slice, i.header.image_index))
        .collect();
    assert_eq!(indices, vec![(0, 1), (1, 2), (2, 3)]);

    let stats = outcome.report.stage("accumulate_image").expect("stage listed");
    assert_eq!(stats.received, 24);
    assert_eq!(stats.emitted, 3);
    Ok(())
}

/// Stopping the chain early picks the identifier by element width.
#[test]
fn test_identifier_follows_last_stage_output() -> Result<()> {
    let complex = config_from_toml(
        r#"
        [pipeline]
        queue_capacity = 2

        [[pipeline.stages]]
        kind = "accumulate_image"
        params = { encoding_lines = 8 }

        [[pipeline.stages]]
        kind = "image_fft"
        "#,
    )?;
    let single_coil = Scan {
        channels: 1,
        ..SMALL
    };
    let outcome = run_pipeline(&complex, &client_stream(single_coil))?;
    let image = expect_single(outcome.images)?;
    assert_eq!(image.identifier, MSG_IMAGE_CPLX_FLOAT);
    assert_eq!(matrix(&image), [32, 8, 1]);
    assert_eq!(image.payload.len(), 32 * 8 * 8);

    let real = config_from_toml(
        r#"
        [[pipeline.stages]]
        kind = "accumulate_image"
        params = { encoding_lines = 8 }

        [[pipeline.stages]]
        kind = "image_fft"

        [[pipeline.stages]]
        kind = "coil_combine"

        [[pipeline.stages]]
        kind = "extract"
        name = "real-part"
        params = { mode = "real" }
        "#,
    )?;
    let outcome = run_pipeline(&real, &client_stream(SMALL))?;
    assert!(outcome.report.stage("real-part").is_some());
    let image = expect_single(outcome.images)?;
    assert_eq!(image.identifier, MSG_IMAGE_REAL_FLOAT);
    let (data_type, image_type) = (image.header.image_data_type, image.header.image_type);
    assert_eq!(data_type, DATA_FLOAT);
    assert_eq!(image_type, IMTYPE_REAL);
    assert_eq!(image.payload.len(), 32 * 8 * 4);
    Ok(())
}

/// A centred k-space point reconstructs to a flat image.
#[test]
fn test_point_in_kspace_gives_flat_magnitude() -> Result<()> {
    let config = config_from_toml(
        r#"
        [[pipeline.stages]]
        kind = "accumulate_image"
        params = { encoding_lines = 4 }

        [[pipeline.stages]]
        kind = "image_fft"

        [[pipeline.stages]]
        kind = "coil_combine"

        [[pipeline.stages]]
        kind = "extract"
        "#,
    )?;

    let scan = Scan {
        samples: 8,
        lines: 4,
        channels: 1,
        slices: 1,
    };
    let mut bytes = Vec::new();
    for line in 0..scan.lines {
        let (acq, mut data) = readout(scan, line, 0);
        for c in data.iter_mut() {
            *c = Complex32::default();
        }
        if line == 2 {
            data[4] = Complex32::new(32.0, 0.0);
        }
        bytes.extend(encode_acquisition(&acq, &[], &data));
    }

    let outcome = run_pipeline(&config, &bytes)?;
    let image = expect_single(outcome.images)?;
    let pixels = image.to_array::<f32>()?;
    // Unitary 2-D transform over 32 pixels: 32 / sqrt(32).
    let expected = 32f32.sqrt();
    for p in pixels.data() {
        assert!((p - expected).abs() < 1e-3, "pixel {p}");
    }
    Ok(())
}
