//! FFT helpers shared by the built-in stages.
//!
//! All transforms are unitary (scaled by 1/sqrt(n)) so that white noise keeps
//! its variance across a round trip.

use rustfft::FftPlanner;

use recon_core::Complex32;

/// Planner plus the scaling conventions used by the stages.
pub struct Transforms {
    planner: FftPlanner<f32>,
}

impl Transforms {
    pub fn new() -> Self {
        Self {
            planner: FftPlanner::new(),
        }
    }

    /// Unitary forward transform of `buf`, in place.
    pub fn forward(&mut self, buf: &mut [Complex32]) {
        if buf.is_empty() {
            return;
        }
        self.planner.plan_fft_forward(buf.len()).process(buf);
        normalize(buf);
    }

    /// Unitary inverse transform of `buf`, in place.
    pub fn inverse(&mut self, buf: &mut [Complex32]) {
        if buf.is_empty() {
            return;
        }
        self.planner.plan_fft_inverse(buf.len()).process(buf);
        normalize(buf);
    }

    /// Inverse transform with the zero frequency at the centre of both the
    /// input and the output.
    pub fn inverse_centered(&mut self, buf: &mut [Complex32]) {
        ifftshift(buf);
        self.inverse(buf);
        fftshift(buf);
    }

    /// Centred 2-D inverse transform of every `nx × ny` slab in `data`.
    ///
    /// `data` is row-major with `nx` fastest; its length must be a multiple
    /// of `nx * ny`.
    pub fn inverse_centered_2d(&mut self, data: &mut [Complex32], nx: usize, ny: usize) {
        if nx == 0 || ny == 0 {
            return;
        }
        let mut column = vec![Complex32::default(); ny];
        for slab in data.chunks_exact_mut(nx * ny) {
            for row in slab.chunks_exact_mut(nx) {
                self.inverse_centered(row);
            }
            for x in 0..nx {
                for (y, c) in column.iter_mut().enumerate() {
                    *c = slab[y * nx + x];
                }
                self.inverse_centered(&mut column);
                for (y, c) in column.iter().enumerate() {
                    slab[y * nx + x] = *c;
                }
            }
        }
    }
}

impl Default for Transforms {
    fn default() -> Self {
        Self::new()
    }
}

fn normalize(buf: &mut [Complex32]) {
    let scale = 1.0 / (buf.len() as f32).sqrt();
    for c in buf.iter_mut() {
        *c = *c * scale;
    }
}

/// Move the zero-frequency bin to the centre.
pub fn fftshift<T>(buf: &mut [T]) {
    let n = buf.len();
    buf.rotate_right(n / 2);
}

/// Inverse of `fftshift`.
pub fn ifftshift<T>(buf: &mut [T]) {
    let n = buf.len();
    buf.rotate_left(n / 2);
}
