//! Float image to unsigned short, scaled so the brightest pixel lands on
//! `max_value`.

use serde::Deserialize;

use recon_core::config::{ConfigError, StageSpec};
use recon_core::wire::{ImageHeader, DATA_USHORT};
use recon_core::{MessageChain, NdArray, Payload, PayloadKind};

use crate::stage::{Stage, StageError, StageResult};

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct Params {
    max_value: u16,
}

impl Default for Params {
    fn default() -> Self {
        Self { max_value: 2048 }
    }
}

pub struct AutoScale {
    max_value: u16,
}

impl Stage for AutoScale {
    fn configure(spec: &StageSpec) -> Result<Self, ConfigError> {
        let params: Params = spec.params()?;
        if params.max_value == 0 {
            return Err(spec.invalid("max_value must be greater than 0"));
        }
        Ok(Self {
            max_value: params.max_value,
        })
    }

    fn accepts(&self) -> (PayloadKind, PayloadKind) {
        (ImageHeader::KIND, NdArray::<f32>::KIND)
    }

    fn process(&mut self, chain: MessageChain) -> StageResult {
        let (mut header, image) = chain.into_pair::<ImageHeader, NdArray<f32>>()?;
        let peak = image
            .data()
            .iter()
            .copied()
            .filter(|v| v.is_finite())
            .fold(0f32, f32::max);

        let top = f32::from(self.max_value);
        let scale = if peak > 0.0 { top / peak } else { 0.0 };
        let dims = image.dims().to_vec();
        let pixels = image
            .data()
            .iter()
            .map(|v| {
                let v = if v.is_finite() { *v } else { 0.0 };
                (v * scale).round().clamp(0.0, top) as u16
            })
            .collect();

        header.image_data_type = DATA_USHORT;
        let out = NdArray::new(dims, pixels).map_err(|e| StageError::fatal(e.to_string()))?;
        Ok(vec![MessageChain::pair(header, out)])
    }
}
