//! Readout oversampling removal.
//!
//! Scanners usually sample the readout at twice the needed rate. This stage
//! transforms each channel's readout, keeps the central `1/factor` of the
//! field of view and transforms back, shortening every readout by `factor`.

use serde::Deserialize;

use recon_core::config::{ConfigError, StageSpec};
use recon_core::wire::AcquisitionHeader;
use recon_core::{Complex32, MessageChain, NdArray, Payload, PayloadKind};

use super::fft::Transforms;
use crate::stage::{Stage, StageError, StageResult};

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct Params {
    oversampling_factor: u32,
    constant_noise_variance: bool,
    encoded_samples: Option<u32>,
    recon_samples: Option<u32>,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            oversampling_factor: 2,
            constant_noise_variance: false,
            encoded_samples: None,
            recon_samples: None,
        }
    }
}

pub struct RemoveOversampling {
    factor: u16,
    constant_noise_variance: bool,
    transforms: Transforms,
}

impl RemoveOversampling {
    fn shorten(&mut self, mut header: AcquisitionHeader, data: NdArray<Complex32>) -> StageResult {
        let factor = usize::from(self.factor);
        let samples = data.size(0);
        let channels = data.element_count().checked_div(samples).unwrap_or(0);
        if samples % factor != 0 {
            return Err(StageError::malformed(format!(
                "readout of {samples} samples is not divisible by oversampling factor {factor}"
            )));
        }
        let kept = samples / factor;
        let Ok(kept_samples) = u16::try_from(kept) else {
            return Err(StageError::malformed(format!(
                "shortened readout of {kept} samples does not fit the acquisition header"
            )));
        };

        // Unitary transforms of unequal length raise signal by sqrt(factor)
        // and leave noise variance alone.
        let gain = if self.constant_noise_variance {
            1.0
        } else {
            1.0 / f32::from(self.factor).sqrt()
        };

        let mut out = Vec::with_capacity(kept * channels);
        let mut line = vec![Complex32::default(); kept];
        for block in data.data().chunks_exact(samples) {
            let mut spectrum = block.to_vec();
            self.transforms.forward(&mut spectrum);

            let low = kept.div_ceil(2);
            let high = kept / 2;
            line[..low].copy_from_slice(&spectrum[..low]);
            line[low..].copy_from_slice(&spectrum[samples - high..]);

            self.transforms.inverse(&mut line);
            out.extend(line.iter().map(|c| *c * gain));
        }

        let mut dims = data.dims().to_vec();
        dims[0] = kept;
        let array = NdArray::new(dims, out).map_err(|e| StageError::fatal(e.to_string()))?;

        let f = self.factor;
        header.number_of_samples = kept_samples;
        header.center_sample = header.center_sample / f;
        header.discard_pre = header.discard_pre / f;
        header.discard_post = header.discard_post / f;

        Ok(vec![MessageChain::pair(header, array)])
    }
}

impl Stage for RemoveOversampling {
    fn configure(spec: &StageSpec) -> Result<Self, ConfigError> {
        let params: Params = spec.params()?;
        if params.oversampling_factor == 0 {
            return Err(spec.invalid("oversampling_factor must be at least 1"));
        }
        // Readout lengths are u16 on the wire.
        let Ok(factor) = u16::try_from(params.oversampling_factor) else {
            return Err(spec.invalid(format!(
                "oversampling_factor {} exceeds the longest possible readout",
                params.oversampling_factor
            )));
        };
        if let (Some(encoded), Some(recon)) = (params.encoded_samples, params.recon_samples) {
            if u64::from(encoded) != u64::from(recon) * u64::from(params.oversampling_factor) {
                return Err(spec.invalid(format!(
                    "encoded_samples {encoded} is not recon_samples {recon} x oversampling_factor {}",
                    params.oversampling_factor
                )));
            }
        }
        Ok(Self {
            factor,
            constant_noise_variance: params.constant_noise_variance,
            transforms: Transforms::new(),
        })
    }

    fn accepts(&self) -> (PayloadKind, PayloadKind) {
        (AcquisitionHeader::KIND, NdArray::<Complex32>::KIND)
    }

    fn process(&mut self, chain: MessageChain) -> StageResult {
        let (header, data) = chain.into_pair::<AcquisitionHeader, NdArray<Complex32>>()?;
        if self.factor == 1 || data.element_count() == 0 {
            return Ok(vec![MessageChain::pair(header, data)]);
        }
        self.shorten(header, data)
    }
}
