//! k-space to image space.

use serde::Deserialize;

use recon_core::config::{ConfigError, StageSpec};
use recon_core::wire::ImageHeader;
use recon_core::{Complex32, MessageChain, NdArray, Payload, PayloadKind};

use super::fft::Transforms;
use crate::stage::{Stage, StageResult};

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct Params {}

/// Centred 2-D inverse FFT over the first two dimensions of every slice and
/// channel.
pub struct ImageFft {
    transforms: Transforms,
}

impl Stage for ImageFft {
    fn configure(spec: &StageSpec) -> Result<Self, ConfigError> {
        let Params {} = spec.params()?;
        Ok(Self {
            transforms: Transforms::new(),
        })
    }

    fn accepts(&self) -> (PayloadKind, PayloadKind) {
        (ImageHeader::KIND, NdArray::<Complex32>::KIND)
    }

    fn process(&mut self, mut chain: MessageChain) -> StageResult {
        let image = chain.unwrap_mut::<NdArray<Complex32>>(1)?;
        let (nx, ny) = (image.size(0), image.size(1));
        self.transforms
            .inverse_centered_2d(image.data_mut(), nx, ny);
        Ok(vec![chain])
    }
}
