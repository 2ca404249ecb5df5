//! Inbound message reader — turns the client's byte stream into chains.
//!
//! Framing: a u16 identifier, then a body determined by it.
//!
//! | identifier    | body                                                    |
//! |---------------|---------------------------------------------------------|
//! | `ACQUISITION` | header (340 B), trajectory `dims × samples` f32,        |
//! |               | samples `samples × channels` complex f32, channel-major |
//! | `CLOSE`       | none; end of stream                                     |
//!
//! The trajectory block is read and discarded. End of file on a message
//! boundary is treated like `CLOSE`. A sample block larger than the reader's
//! limit is refused before anything is allocated for it.

use std::io::{self, Read};

use zerocopy::{AsBytes, FromZeroes};

use recon_core::wire::{AcquisitionHeader, MessageIdentifier, MSG_ACQUISITION, MSG_CLOSE};
use recon_core::{Complex32, Element, MessageChain, NdArray, PayloadError};

/// Default cap on the sample block of one acquisition.
pub const DEFAULT_MAX_READOUT_BYTES: usize = 64 * 1024 * 1024;

/// Reads acquisition chains from a byte stream.
pub struct AcquisitionReader<R> {
    reader: R,
    received: u64,
    max_readout_bytes: usize,
}

impl<R: Read> AcquisitionReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            received: 0,
            max_readout_bytes: DEFAULT_MAX_READOUT_BYTES,
        }
    }

    /// Refuse acquisitions whose sample block exceeds `limit` bytes.
    pub fn with_max_readout_bytes(mut self, limit: usize) -> Self {
        self.max_readout_bytes = limit;
        self
    }

    /// Acquisitions read so far.
    pub fn received(&self) -> u64 {
        self.received
    }

    /// Next (AcquisitionHeader, Array<Complex32>) chain, or `None` at the end
    /// of the stream.
    pub fn next_chain(&mut self) -> Result<Option<MessageChain>, InboundError> {
        let Some(identifier) = self.read_identifier()? else {
            return Ok(None);
        };
        match identifier {
            MSG_CLOSE => Ok(None),
            MSG_ACQUISITION => {
                let chain = self.read_acquisition()?;
                self.received += 1;
                Ok(Some(chain))
            }
            other => Err(InboundError::UnknownIdentifier(other)),
        }
    }

    pub fn into_inner(self) -> R {
        self.reader
    }

    /// `None` on a clean end of file before the first byte.
    fn read_identifier(&mut self) -> Result<Option<u16>, InboundError> {
        let mut id = MessageIdentifier::new_zeroed();
        let buf = id.as_bytes_mut();
        let mut filled = 0;
        while filled < buf.len() {
            match self.reader.read(&mut buf[filled..]) {
                Ok(0) if filled == 0 => return Ok(None),
                Ok(0) => return Err(InboundError::Truncated(io::ErrorKind::UnexpectedEof.into())),
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(InboundError::Io(e)),
            }
        }
        Ok(Some(id.id))
    }

    fn read_acquisition(&mut self) -> Result<MessageChain, InboundError> {
        let mut header = AcquisitionHeader::new_zeroed();
        self.reader
            .read_exact(header.as_bytes_mut())
            .map_err(InboundError::Truncated)?;

        let samples = usize::from(header.number_of_samples);
        let channels = usize::from(header.active_channels);
        let width = Complex32::KIND.width();
        let block = samples * channels * width;
        if block > self.max_readout_bytes {
            return Err(InboundError::ReadoutTooLarge {
                bytes: block,
                limit: self.max_readout_bytes,
            });
        }
        let trajectory = usize::from(header.trajectory_dimensions) * samples;

        let skip = (trajectory * f32::KIND.width()) as u64;
        let skipped = io::copy(&mut (&mut self.reader).take(skip), &mut io::sink())
            .map_err(InboundError::Io)?;
        if skipped != skip {
            return Err(InboundError::Truncated(io::ErrorKind::UnexpectedEof.into()));
        }

        let mut bytes = vec![0u8; block];
        self.reader
            .read_exact(&mut bytes)
            .map_err(InboundError::Truncated)?;
        let data = bytes.chunks_exact(width).map(Complex32::decode).collect();

        let array = NdArray::new(vec![samples, channels], data)?;
        Ok(MessageChain::pair(header, array))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum InboundError {
    #[error("unexpected message identifier: {0}")]
    UnknownIdentifier(u16),

    #[error("connection ended inside a message: {0}")]
    Truncated(io::Error),

    #[error("readout of {bytes} bytes exceeds the {limit} byte limit")]
    ReadoutTooLarge { bytes: usize, limit: usize },

    #[error(transparent)]
    Shape(#[from] PayloadError),

    #[error("read failed: {0}")]
    Io(io::Error),
}

/// Encode one acquisition message the way a client sends it.
pub fn encode_acquisition(header: &AcquisitionHeader, trajectory: &[f32], data: &[Complex32]) -> Vec<u8> {
    let mut out = MessageIdentifier::new(MSG_ACQUISITION).as_bytes().to_vec();
    out.extend_from_slice(header.as_bytes());
    out.extend_from_slice(&f32::encode(trajectory));
    out.extend_from_slice(&Complex32::encode(data));
    out
}
