//! Built-in stages, registered by `StageRegistry::with_builtin`.

mod accumulate_image;
mod autoscale;
mod coil_combine;
mod extract;
pub mod fft;
mod image_fft;
mod remove_ro_oversampling;

pub use accumulate_image::AccumulateImage;
pub use autoscale::AutoScale;
pub use coil_combine::CoilCombine;
pub use extract::Extract;
pub use image_fft::ImageFft;
pub use remove_ro_oversampling::RemoveOversampling;

pub const REMOVE_RO_OVERSAMPLING: &str = "remove_ro_oversampling";
pub const ACCUMULATE_IMAGE: &str = "accumulate_image";
pub const IMAGE_FFT: &str = "image_fft";
pub const COIL_COMBINE: &str = "coil_combine";
pub const EXTRACT: &str = "extract";
pub const AUTOSCALE: &str = "autoscale";
