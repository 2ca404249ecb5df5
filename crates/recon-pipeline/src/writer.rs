//! Wire writers — serialize finished chains onto the output connection.
//!
//! An image message is three segments, always in this order:
//!   1. message identifier (selected by element byte width)
//!   2. image header record
//!   3. pixel data, `element width × element count` bytes
//!
//! The header's matrix size is checked against the array before anything is
//! sent, so a refused chain leaves the sink untouched. Each segment is sent
//! with a single all-or-nothing write; there is no retry at this layer.

use std::collections::HashMap;
use std::fmt;
use std::io::Write;
use std::marker::PhantomData;

use zerocopy::AsBytes;

use recon_core::wire::{image_identifier_for_width, ImageHeader, MessageIdentifier};
use recon_core::{ChainError, Complex32, Element, MessageChain, NdArray, PayloadKind};

/// Serializes one shape of chain.
pub trait WireWriter: Send + Sync {
    /// Kind of the data node (chain index 1) this writer handles.
    fn payload_kind(&self) -> PayloadKind;

    /// Validate and send `chain`. On any validation error nothing is written.
    fn write(&self, chain: &MessageChain, sink: &mut dyn Write) -> Result<(), WriteError>;
}

/// Writer for (ImageHeader, NdArray<T>) chains.
pub struct ImageWriter<T: Element> {
    _element: PhantomData<fn() -> T>,
}

impl<T: Element> ImageWriter<T> {
    pub fn new() -> Self {
        Self {
            _element: PhantomData,
        }
    }
}

impl<T: Element> Default for ImageWriter<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Element> WireWriter for ImageWriter<T> {
    fn payload_kind(&self) -> PayloadKind {
        PayloadKind::Array(T::KIND)
    }

    fn write(&self, chain: &MessageChain, sink: &mut dyn Write) -> Result<(), WriteError> {
        let (header, data) = chain.as_pair::<ImageHeader, NdArray<T>>()?;

        let declared = header.element_count();
        let actual = data.element_count() as u64;
        if declared != actual {
            return Err(WriteError::DimensionMismatch {
                matrix_size: header.matrix_size,
                declared,
                actual,
            });
        }

        let id = image_identifier_for_width(T::KIND.width())
            .ok_or(WriteError::UnsupportedType(self.payload_kind()))?;
        let id = MessageIdentifier::new(id);
        let payload = data.encode();

        send_all(sink, Segment::Identifier, id.as_bytes())?;
        send_all(sink, Segment::Header, header.as_bytes())?;
        send_all(sink, Segment::Payload, &payload)?;
        Ok(())
    }
}

fn send_all(sink: &mut dyn Write, segment: Segment, bytes: &[u8]) -> Result<(), WriteError> {
    sink.write_all(bytes)
        .map_err(|source| WriteError::Io { segment, source })
}

// ── Registry ──────────────────────────────────────────────────────────────────

/// Maps data-node kinds to the writer that serializes them.
#[derive(Default)]
pub struct WriterRegistry {
    writers: HashMap<PayloadKind, Box<dyn WireWriter>>,
}

impl WriterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the three image writers (u16, f32, complex f32).
    pub fn with_image_writers() -> Self {
        let mut registry = Self::new();
        registry.register(ImageWriter::<u16>::new());
        registry.register(ImageWriter::<f32>::new());
        registry.register(ImageWriter::<Complex32>::new());
        registry
    }

    /// Register `writer` for its payload kind, replacing any previous one.
    pub fn register<W: WireWriter + 'static>(&mut self, writer: W) {
        self.writers.insert(writer.payload_kind(), Box::new(writer));
    }

    pub fn select_writer(&self, kind: PayloadKind) -> Result<&dyn WireWriter, WriteError> {
        self.writers
            .get(&kind)
            .map(|w| w.as_ref())
            .ok_or(WriteError::UnsupportedType(kind))
    }

    /// Pick the writer for the chain's data node and write the chain.
    pub fn write(&self, chain: &MessageChain, sink: &mut dyn Write) -> Result<(), WriteError> {
        let kind = chain
            .get(1)
            .map(|node| node.kind())
            .ok_or(ChainError::MissingNode { index: 1 })?;
        self.select_writer(kind)?.write(chain, sink)
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Which part of a message a failed write was sending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Segment {
    Identifier,
    Header,
    Payload,
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Segment::Identifier => "message identifier",
            Segment::Header => "image header",
            Segment::Payload => "image data",
        };
        f.write_str(s)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    #[error("no writer registered for {0}")]
    UnsupportedType(PayloadKind),

    #[error("chain cannot be written: {0}")]
    Chain(#[from] ChainError),

    #[error("header matrix {matrix_size:?} declares {declared} elements, array holds {actual}")]
    DimensionMismatch {
        matrix_size: [u16; 3],
        declared: u64,
        actual: u64,
    },

    #[error("failed to send {segment}: {source}")]
    Io {
        segment: Segment,
        source: std::io::Error,
    },
}

impl WriteError {
    /// Only a failed send leaves the connection in an unknown state; every
    /// other error refuses a single chain before any byte goes out.
    pub fn is_fatal(&self) -> bool {
        matches!(self, WriteError::Io { .. })
    }
}
