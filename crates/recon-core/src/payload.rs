//! Typed payloads — the unit of data carried through a pipeline.
//!
//! A `TypedPayload` owns exactly one value (a header record or an
//! `NdArray`) together with a `PayloadKind` descriptor. The descriptor is
//! fixed when the payload is created and is the only thing consulted when a
//! consumer asks for the value back. A request for the wrong type fails with
//! `TypeMismatch`; bytes are never reinterpreted.

use std::any::Any;
use std::borrow::Cow;
use std::fmt;

use rustfft::num_complex::Complex32;
use zerocopy::AsBytes;

use crate::wire::{AcquisitionHeader, ImageHeader};

// ── Descriptors ──────────────────────────────────────────────────────────────

/// Element type of a numeric array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementKind {
    U16,
    F32,
    Complex32,
}

impl ElementKind {
    /// Size of one element in bytes.
    ///
    /// This is also the wire discriminator for image messages, see
    /// `wire::image_identifier_for_width`.
    pub const fn width(self) -> usize {
        match self {
            ElementKind::U16 => 2,
            ElementKind::F32 => 4,
            ElementKind::Complex32 => 8,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ElementKind::U16 => "u16",
            ElementKind::F32 => "f32",
            ElementKind::Complex32 => "complex32",
        }
    }
}

impl fmt::Display for ElementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Runtime type descriptor stored next to every payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PayloadKind {
    AcquisitionHeader,
    ImageHeader,
    Array(ElementKind),
}

impl fmt::Display for PayloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PayloadKind::AcquisitionHeader => f.write_str("acquisition-header"),
            PayloadKind::ImageHeader => f.write_str("image-header"),
            PayloadKind::Array(element) => write!(f, "array<{element}>"),
        }
    }
}

// ── Elements ─────────────────────────────────────────────────────────────────

/// A numeric type that can be stored in an `NdArray` and put on the wire.
pub trait Element: Copy + Default + Send + Sync + 'static {
    const KIND: ElementKind;

    /// Native-order bytes of `data`. Borrowed whenever the in-memory layout
    /// already is the wire layout.
    fn encode(data: &[Self]) -> Cow<'_, [u8]>;

    /// Decode one element from exactly `KIND.width()` native-order bytes.
    fn decode(bytes: &[u8]) -> Self;
}

impl Element for u16 {
    const KIND: ElementKind = ElementKind::U16;

    fn encode(data: &[Self]) -> Cow<'_, [u8]> {
        Cow::Borrowed(data.as_bytes())
    }

    fn decode(bytes: &[u8]) -> Self {
        u16::from_ne_bytes([bytes[0], bytes[1]])
    }
}

impl Element for f32 {
    const KIND: ElementKind = ElementKind::F32;

    fn encode(data: &[Self]) -> Cow<'_, [u8]> {
        Cow::Borrowed(data.as_bytes())
    }

    fn decode(bytes: &[u8]) -> Self {
        f32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
    }
}

impl Element for Complex32 {
    const KIND: ElementKind = ElementKind::Complex32;

    fn encode(data: &[Self]) -> Cow<'_, [u8]> {
        let mut out = Vec::with_capacity(data.len() * Self::KIND.width());
        for c in data {
            out.extend_from_slice(&c.re.to_ne_bytes());
            out.extend_from_slice(&c.im.to_ne_bytes());
        }
        Cow::Owned(out)
    }

    fn decode(bytes: &[u8]) -> Self {
        Complex32::new(f32::decode(&bytes[0..4]), f32::decode(&bytes[4..8]))
    }
}

// ── Arrays ───────────────────────────────────────────────────────────────────

/// Owned, row-major multi-dimensional array.
///
/// `dims[0]` is the fastest-varying dimension (readout for k-space data).
#[derive(Debug, Clone, PartialEq)]
pub struct NdArray<T: Element> {
    dims: Vec<usize>,
    data: Vec<T>,
}

impl<T: Element> NdArray<T> {
    /// Wrap `data` with the given shape. Fails if the element count does not
    /// match the product of `dims`.
    pub fn new(dims: Vec<usize>, data: Vec<T>) -> Result<Self, PayloadError> {
        let expected: usize = dims.iter().product();
        if expected != data.len() {
            return Err(PayloadError::ShapeMismatch {
                dims,
                actual: data.len(),
            });
        }
        Ok(Self { dims, data })
    }

    pub fn zeros(dims: Vec<usize>) -> Self {
        let n = dims.iter().product();
        Self {
            dims,
            data: vec![T::default(); n],
        }
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    /// Size of dimension `i`, 1 for dimensions beyond the rank.
    pub fn size(&self, i: usize) -> usize {
        self.dims.get(i).copied().unwrap_or(1)
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn element_count(&self) -> usize {
        self.data.len()
    }

    pub fn data(&self) -> &[T] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [T] {
        &mut self.data
    }

    pub fn into_data(self) -> Vec<T> {
        self.data
    }

    /// Wire bytes of the array contents.
    pub fn encode(&self) -> Cow<'_, [u8]> {
        T::encode(&self.data)
    }
}

// ── Payloads ─────────────────────────────────────────────────────────────────

/// A type that can travel inside a `TypedPayload`.
pub trait Payload: Any + Send {
    const KIND: PayloadKind;
}

impl Payload for AcquisitionHeader {
    const KIND: PayloadKind = PayloadKind::AcquisitionHeader;
}

impl Payload for ImageHeader {
    const KIND: PayloadKind = PayloadKind::ImageHeader;
}

impl<T: Element> Payload for NdArray<T> {
    const KIND: PayloadKind = PayloadKind::Array(T::KIND);
}

/// One node of a message chain: an owned value plus its type descriptor.
pub struct TypedPayload {
    kind: PayloadKind,
    value: Box<dyn Any + Send>,
}

impl TypedPayload {
    /// Take ownership of `value`. The descriptor comes from `T`.
    pub fn new<T: Payload>(value: T) -> Self {
        Self {
            kind: T::KIND,
            value: Box::new(value),
        }
    }

    pub fn kind(&self) -> PayloadKind {
        self.kind
    }

    pub fn is<T: Payload>(&self) -> bool {
        self.kind == T::KIND
    }

    /// Checked downcast. The stored descriptor is compared first; the `Any`
    /// downcast only runs once the descriptor agrees.
    pub fn get<T: Payload>(&self) -> Result<&T, TypeMismatch> {
        self.check::<T>()?;
        self.value.downcast_ref::<T>().ok_or(self.mismatch::<T>())
    }

    pub fn get_mut<T: Payload>(&mut self) -> Result<&mut T, TypeMismatch> {
        self.check::<T>()?;
        let err = self.mismatch::<T>();
        self.value.downcast_mut::<T>().ok_or(err)
    }

    /// Consume the payload and return the owned value.
    pub fn into_inner<T: Payload>(self) -> Result<T, TypeMismatch> {
        self.check::<T>()?;
        let err = self.mismatch::<T>();
        self.value.downcast::<T>().map(|b| *b).map_err(|_| err)
    }

    fn check<T: Payload>(&self) -> Result<(), TypeMismatch> {
        if self.kind == T::KIND {
            Ok(())
        } else {
            Err(self.mismatch::<T>())
        }
    }

    fn mismatch<T: Payload>(&self) -> TypeMismatch {
        TypeMismatch {
            expected: T::KIND,
            found: self.kind,
        }
    }
}

impl fmt::Debug for TypedPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypedPayload")
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// A payload was asked for as a type it does not hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("type mismatch: expected {expected}, found {found}")]
pub struct TypeMismatch {
    pub expected: PayloadKind,
    pub found: PayloadKind,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PayloadError {
    #[error("array shape {dims:?} does not match {actual} elements")]
    ShapeMismatch { dims: Vec<usize>, actual: usize },
}

// ── Tests ─────────────────────────────────────────────────────────────────────
