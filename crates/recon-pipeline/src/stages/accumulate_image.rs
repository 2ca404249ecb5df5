//! Collects readouts into a k-space buffer and emits one image per slice.

use serde::Deserialize;

use recon_core::config::{ConfigError, StageSpec};
use recon_core::wire::{
    AcquisitionHeader, ImageHeader, ACQ_IS_NOISE_MEASUREMENT, ACQ_LAST_IN_SLICE,
    DATA_COMPLEX_FLOAT, IMTYPE_COMPLEX,
};
use recon_core::{Complex32, MessageChain, NdArray, Payload, PayloadKind};
use zerocopy::FromZeroes;

use crate::stage::{Stage, StageError, StageResult};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct Params {
    encoding_lines: u16,
    #[serde(default)]
    field_of_view: [f32; 3],
    #[serde(default)]
    image_series_index: u16,
}

/// k-space being filled for the current slice.
struct Buffer {
    readout: usize,
    channels: usize,
    data: Vec<Complex32>,
}

pub struct AccumulateImage {
    lines: u16,
    field_of_view: [f32; 3],
    series: u16,
    next_index: u16,
    buffer: Option<Buffer>,
}

impl AccumulateImage {
    fn image_header(&self, acq: &AcquisitionHeader, readout: u16, channels: u16) -> ImageHeader {
        let idx = acq.idx;
        let mut h = ImageHeader::new_zeroed();
        h.version = acq.version;
        h.flags = 0;
        h.measurement_uid = acq.measurement_uid;
        h.matrix_size = [readout, self.lines, 1];
        h.field_of_view = self.field_of_view;
        h.channels = channels;
        h.position = acq.position;
        h.read_dir = acq.read_dir;
        h.phase_dir = acq.phase_dir;
        h.slice_dir = acq.slice_dir;
        h.patient_table_position = acq.patient_table_position;
        h.average = idx.average;
        h.slice = idx.slice;
        h.contrast = idx.contrast;
        h.phase = idx.phase;
        h.repetition = idx.repetition;
        h.set = idx.set;
        h.acquisition_time_stamp = acq.acquisition_time_stamp;
        h.physiology_time_stamp = acq.physiology_time_stamp;
        h.image_data_type = DATA_COMPLEX_FLOAT;
        h.image_type = IMTYPE_COMPLEX;
        h.image_index = self.next_index;
        h.image_series_index = self.series;
        h
    }
}

impl Stage for AccumulateImage {
    fn configure(spec: &StageSpec) -> Result<Self, ConfigError> {
        let params: Params = spec.params()?;
        if params.encoding_lines == 0 {
            return Err(spec.invalid("encoding_lines must be at least 1"));
        }
        Ok(Self {
            lines: params.encoding_lines,
            field_of_view: params.field_of_view,
            series: params.image_series_index,
            next_index: 1,
            buffer: None,
        })
    }

    fn accepts(&self) -> (PayloadKind, PayloadKind) {
        (AcquisitionHeader::KIND, NdArray::<Complex32>::KIND)
    }

    fn process(&mut self, chain: MessageChain) -> StageResult {
        let (acq, data) = chain.into_pair::<AcquisitionHeader, NdArray<Complex32>>()?;
        if acq.is_flag_set(ACQ_IS_NOISE_MEASUREMENT) {
            return Ok(Vec::new());
        }

        let readout = data.size(0);
        let channels = data.size(1);
        if readout == 0 || channels == 0 || readout * channels != data.element_count() {
            return Err(StageError::malformed(format!(
                "readout array {:?} is not [samples, channels]",
                data.dims()
            )));
        }
        let (Ok(matrix_readout), Ok(coils)) = (u16::try_from(readout), u16::try_from(channels))
        else {
            return Err(StageError::malformed(format!(
                "readout of {readout} samples x {channels} channels does not fit an image header"
            )));
        };

        let lines = usize::from(self.lines);
        let line = usize::from(acq.idx.kspace_encode_step_1);
        if line >= lines {
            return Err(StageError::malformed(format!(
                "encode step {line} outside {lines} encoding lines"
            )));
        }

        let buffer = self.buffer.get_or_insert_with(|| Buffer {
            readout,
            channels,
            data: vec![Complex32::default(); readout * lines * channels],
        });
        if buffer.readout != readout || buffer.channels != channels {
            return Err(StageError::fatal(format!(
                "readout shape changed mid-image: buffering {}x{}, got {readout}x{channels}",
                buffer.readout, buffer.channels
            )));
        }

        let plane = readout * lines;
        for (c, samples) in data.data().chunks_exact(readout).enumerate() {
            let start = c * plane + line * readout;
            buffer.data[start..start + readout].copy_from_slice(samples);
        }

        if !acq.is_flag_set(ACQ_LAST_IN_SLICE) {
            return Ok(Vec::new());
        }

        let Some(filled) = self.buffer.take() else {
            return Ok(Vec::new());
        };
        let header = self.image_header(&acq, matrix_readout, coils);
        let image_index = self.next_index;
        self.next_index = self.next_index.wrapping_add(1);

        let image = NdArray::new(vec![readout, lines, 1, channels], filled.data)
            .map_err(|e| StageError::fatal(e.to_string()))?;
        tracing::debug!(
            image_index,
            readout,
            lines,
            channels,
            "image assembled"
        );
        Ok(vec![MessageChain::pair(header, image)])
    }
}
