//! recon-core — payload types, message chains, wire format, and configuration.
//! All other reconstream crates depend on this one.

pub mod chain;
pub mod config;
pub mod payload;
pub mod wire;

pub use chain::{ChainError, MessageChain};
pub use payload::{
    Element, ElementKind, NdArray, Payload, PayloadError, PayloadKind, TypeMismatch, TypedPayload,
};
pub use rustfft::num_complex::Complex32;
