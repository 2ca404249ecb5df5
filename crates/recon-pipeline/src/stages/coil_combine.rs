//! Root-sum-of-squares channel combination.

use serde::Deserialize;

use recon_core::config::{ConfigError, StageSpec};
use recon_core::wire::ImageHeader;
use recon_core::{Complex32, MessageChain, NdArray, Payload, PayloadKind};

use crate::stage::{Stage, StageError, StageResult};

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct Params {}

pub struct CoilCombine;

impl Stage for CoilCombine {
    fn configure(spec: &StageSpec) -> Result<Self, ConfigError> {
        let Params {} = spec.params()?;
        Ok(Self)
    }

    fn accepts(&self) -> (PayloadKind, PayloadKind) {
        (ImageHeader::KIND, NdArray::<Complex32>::KIND)
    }

    fn process(&mut self, chain: MessageChain) -> StageResult {
        let (mut header, image) = chain.into_pair::<ImageHeader, NdArray<Complex32>>()?;
        let (nx, ny, nz) = (image.size(0), image.size(1), image.size(2));
        let voxels = nx * ny * nz;
        let count = image.element_count();
        if voxels == 0 || count == 0 || count % voxels != 0 {
            return Err(StageError::malformed(format!(
                "image {:?} has no whole channels",
                image.dims()
            )));
        }

        let mut energy = vec![0f32; voxels];
        for channel in image.data().chunks_exact(voxels) {
            for (sum, c) in energy.iter_mut().zip(channel) {
                *sum += c.norm_sqr();
            }
        }
        let combined = energy
            .into_iter()
            .map(|e| Complex32::new(e.sqrt(), 0.0))
            .collect();

        header.channels = 1;
        let out = NdArray::new(vec![nx, ny, nz], combined)
            .map_err(|e| StageError::fatal(e.to_string()))?;
        Ok(vec![MessageChain::pair(header, out)])
    }
}
