//! Complex to real conversion.

use serde::Deserialize;

use recon_core::config::{ConfigError, StageSpec};
use recon_core::wire::{
    ImageHeader, DATA_FLOAT, IMTYPE_IMAG, IMTYPE_MAGNITUDE, IMTYPE_PHASE, IMTYPE_REAL,
};
use recon_core::{Complex32, MessageChain, NdArray, Payload, PayloadKind};

use crate::stage::{Stage, StageError, StageResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum Mode {
    Magnitude,
    Real,
    Imag,
    Phase,
}

impl Mode {
    fn apply(self, c: Complex32) -> f32 {
        match self {
            Mode::Magnitude => c.norm(),
            Mode::Real => c.re,
            Mode::Imag => c.im,
            Mode::Phase => c.arg(),
        }
    }

    fn image_type(self) -> u16 {
        match self {
            Mode::Magnitude => IMTYPE_MAGNITUDE,
            Mode::Real => IMTYPE_REAL,
            Mode::Imag => IMTYPE_IMAG,
            Mode::Phase => IMTYPE_PHASE,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct Params {
    #[serde(default = "default_mode")]
    mode: Mode,
}

fn default_mode() -> Mode {
    Mode::Magnitude
}

pub struct Extract {
    mode: Mode,
}

impl Stage for Extract {
    fn configure(spec: &StageSpec) -> Result<Self, ConfigError> {
        let params: Params = spec.params()?;
        Ok(Self { mode: params.mode })
    }

    fn accepts(&self) -> (PayloadKind, PayloadKind) {
        (ImageHeader::KIND, NdArray::<Complex32>::KIND)
    }

    fn process(&mut self, chain: MessageChain) -> StageResult {
        let (mut header, image) = chain.into_pair::<ImageHeader, NdArray<Complex32>>()?;
        let dims = image.dims().to_vec();
        let values = image.data().iter().map(|c| self.mode.apply(*c)).collect();

        header.image_type = self.mode.image_type();
        header.image_data_type = DATA_FLOAT;
        let out = NdArray::new(dims, values).map_err(|e| StageError::fatal(e.to_string()))?;
        Ok(vec![MessageChain::pair(header, out)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zerocopy::FromZeroes;

    fn run(mode: &str) -> (ImageHeader, Vec<f32>) {
        let mut stage = Extract::configure(&StageSpec::new("extract").param("mode", mode)).unwrap();
        let data = vec![Complex32::new(3.0, 4.0), Complex32::new(0.0, -1.0)];
        let chain = MessageChain::pair(ImageHeader::new_zeroed(), NdArray::new(vec![2], data).unwrap());
        let out = stage.process(chain).unwrap();
        let (header, image) = out
            .into_iter()
            .next()
            .unwrap()
            .into_pair::<ImageHeader, NdArray<f32>>()
            .unwrap();
        (header, image.into_data())
    }

    #[test]
    fn magnitude() {
        let (header, values) = run("magnitude");
        let (ty, data_ty) = (header.image_type, header.image_data_type);
        assert_eq!(values, vec![5.0, 1.0]);
        assert_eq!(ty, IMTYPE_MAGNITUDE);
        assert_eq!(data_ty, DATA_FLOAT);
    }

    #[test]
    fn real_imag_phase() {
        assert_eq!(run("real").1, vec![3.0, 0.0]);
        assert_eq!(run("imag").1, vec![4.0, -1.0]);
        let phase = run("phase").1;
        assert!((phase[1] + std::f32::consts::FRAC_PI_2).abs() < 1e-6);
    }

    #[test]
    fn unknown_mode_is_config_error() {
        let spec = StageSpec::new("extract").param("mode", "angle");
        assert!(matches!(
            Extract::configure(&spec).err().unwrap(),
            ConfigError::InvalidParams { .. }
        ));
    }
}
