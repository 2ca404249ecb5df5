//! Reconstruction wire format — on-wire types for the streaming protocol.
//!
//! These types ARE the protocol. Clients read the exact bytes produced here;
//! every field, every size and every identifier value is part of the wire
//! format. Integers and floats travel in native byte order.
//!
//! All record types are #[repr(C, packed)] for deterministic layout and use
//! zerocopy derives for safe, allocation-free serialization. There is no
//! unsafe code in this module.

use std::io::Read;

use static_assertions::assert_eq_size;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::payload::{Element, ElementKind, NdArray, PayloadError};

// ── Message identifiers ──────────────────────────────────────────────────────

/// Leading record of every message on the connection.
///
/// Wire size: 2 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct MessageIdentifier {
    pub id: u16,
}

assert_eq_size!(MessageIdentifier, [u8; 2]);

impl MessageIdentifier {
    pub fn new(id: u16) -> Self {
        Self { id }
    }
}

/// End of stream, sent by either side.
pub const MSG_CLOSE: u16 = 4;
/// Raw acquisition: acquisition header, trajectory, complex samples.
pub const MSG_ACQUISITION: u16 = 1008;
/// Image with 8-byte (complex float) elements.
pub const MSG_IMAGE_CPLX_FLOAT: u16 = 1009;
/// Image with 4-byte (float) elements.
pub const MSG_IMAGE_REAL_FLOAT: u16 = 1010;
/// Image with 2-byte (unsigned short) elements.
pub const MSG_IMAGE_REAL_USHORT: u16 = 1011;

/// Image message identifier for an element byte width.
///
/// This is a legacy discriminator: it looks only at the width, so two
/// element types of equal width map to the same identifier. Clients rely on
/// exactly this mapping.
pub const fn image_identifier_for_width(width: usize) -> Option<u16> {
    match width {
        2 => Some(MSG_IMAGE_REAL_USHORT),
        4 => Some(MSG_IMAGE_REAL_FLOAT),
        8 => Some(MSG_IMAGE_CPLX_FLOAT),
        _ => None,
    }
}

/// Inverse of `image_identifier_for_width`.
pub const fn element_width_for_identifier(id: u16) -> Option<usize> {
    match id {
        MSG_IMAGE_REAL_USHORT => Some(2),
        MSG_IMAGE_REAL_FLOAT => Some(4),
        MSG_IMAGE_CPLX_FLOAT => Some(8),
        _ => None,
    }
}

// ── Acquisition header ───────────────────────────────────────────────────────

/// Loop counters of one readout.
///
/// Wire size: 34 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct EncodingCounters {
    /// Phase encoding line.
    pub kspace_encode_step_1: u16,
    /// Partition encoding line.
    pub kspace_encode_step_2: u16,
    pub average: u16,
    pub slice: u16,
    pub contrast: u16,
    pub phase: u16,
    pub repetition: u16,
    pub set: u16,
    pub segment: u16,
    pub user: [u16; 8],
}

assert_eq_size!(EncodingCounters, [u8; 34]);

/// Header preceding every readout sent by the scanner.
///
/// Data following it on the wire: `trajectory_dimensions * number_of_samples`
/// f32 trajectory values, then `number_of_samples * active_channels` complex
/// samples, channel-major.
///
/// Wire size: 340 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct AcquisitionHeader {
    pub version: u16,
    /// Bit set of `ACQ_*` flags.
    pub flags: u64,
    pub measurement_uid: u32,
    pub scan_counter: u32,
    pub acquisition_time_stamp: u32,
    pub physiology_time_stamp: [u32; 3],
    pub number_of_samples: u16,
    pub available_channels: u16,
    pub active_channels: u16,
    pub channel_mask: [u64; 16],
    pub discard_pre: u16,
    pub discard_post: u16,
    pub center_sample: u16,
    pub encoding_space_ref: u16,
    pub trajectory_dimensions: u16,
    pub sample_time_us: f32,
    pub position: [f32; 3],
    pub read_dir: [f32; 3],
    pub phase_dir: [f32; 3],
    pub slice_dir: [f32; 3],
    pub patient_table_position: [f32; 3],
    pub idx: EncodingCounters,
    pub user_int: [i32; 8],
    pub user_float: [f32; 8],
}

assert_eq_size!(AcquisitionHeader, [u8; 340]);

impl AcquisitionHeader {
    pub fn is_flag_set(&self, flag: u64) -> bool {
        let flags = self.flags;
        flags & flag != 0
    }

    pub fn set_flag(&mut self, flag: u64) {
        self.flags = self.flags | flag;
    }
}

pub const ACQ_FIRST_IN_ENCODE_STEP1: u64 = 1 << 0;
pub const ACQ_LAST_IN_ENCODE_STEP1: u64 = 1 << 1;
pub const ACQ_FIRST_IN_SLICE: u64 = 1 << 6;
pub const ACQ_LAST_IN_SLICE: u64 = 1 << 7;
pub const ACQ_IS_NOISE_MEASUREMENT: u64 = 1 << 18;

// ── Image header ─────────────────────────────────────────────────────────────

/// Header record of an image message.
///
/// `matrix_size` declares the logical shape of the pixel block that follows;
/// its product must equal the number of elements sent.
///
/// Wire size: 194 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct ImageHeader {
    pub version: u16,
    pub flags: u64,
    pub measurement_uid: u32,
    pub matrix_size: [u16; 3],
    pub field_of_view: [f32; 3],
    pub channels: u16,
    pub position: [f32; 3],
    pub read_dir: [f32; 3],
    pub phase_dir: [f32; 3],
    pub slice_dir: [f32; 3],
    pub patient_table_position: [f32; 3],
    pub average: u16,
    pub slice: u16,
    pub contrast: u16,
    pub phase: u16,
    pub repetition: u16,
    pub set: u16,
    pub acquisition_time_stamp: u32,
    pub physiology_time_stamp: [u32; 3],
    /// One of the `DATA_*` constants.
    pub image_data_type: u16,
    /// One of the `IMTYPE_*` constants.
    pub image_type: u16,
    pub image_index: u16,
    pub image_series_index: u16,
    pub user_int: [i32; 8],
    pub user_float: [f32; 8],
}

assert_eq_size!(ImageHeader, [u8; 194]);

impl ImageHeader {
    /// Number of elements declared by `matrix_size`.
    pub fn element_count(&self) -> u64 {
        let [x, y, z] = { self.matrix_size };
        u64::from(x) * u64::from(y) * u64::from(z)
    }
}

pub const DATA_USHORT: u16 = 1;
pub const DATA_FLOAT: u16 = 2;
pub const DATA_COMPLEX_FLOAT: u16 = 3;

pub const IMTYPE_MAGNITUDE: u16 = 1;
pub const IMTYPE_PHASE: u16 = 2;
pub const IMTYPE_REAL: u16 = 3;
pub const IMTYPE_IMAG: u16 = 4;
pub const IMTYPE_COMPLEX: u16 = 5;

// ── Reading image messages ───────────────────────────────────────────────────

/// An image message as read back from the wire.
#[derive(Debug, Clone)]
pub struct ImageMessage {
    pub identifier: u16,
    pub header: ImageHeader,
    pub payload: Vec<u8>,
}

impl ImageMessage {
    /// Read one image message: identifier, header, then as many payload bytes
    /// as the header's matrix size and the identifier's element width imply.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self, WireError> {
        let mut id = MessageIdentifier::new_zeroed();
        reader.read_exact(id.as_bytes_mut())?;
        let identifier = id.id;
        Self::read_body(identifier, reader)
    }

    /// Read header and payload after the identifier has been consumed.
    pub fn read_body<R: Read>(identifier: u16, reader: &mut R) -> Result<Self, WireError> {
        let width = element_width_for_identifier(identifier)
            .ok_or(WireError::UnknownIdentifier(identifier))?;

        let mut header = ImageHeader::new_zeroed();
        reader.read_exact(header.as_bytes_mut())?;

        let len = usize::try_from(header.element_count())
            .map_err(|_| WireError::PayloadTooLarge(header.element_count()))?
            * width;
        let mut payload = vec![0u8; len];
        reader.read_exact(&mut payload)?;

        Ok(Self {
            identifier,
            header,
            payload,
        })
    }

    /// Decode the payload as elements of `T`, shaped by `matrix_size`.
    pub fn to_array<T: Element>(&self) -> Result<NdArray<T>, WireError> {
        let expected = element_width_for_identifier(self.identifier);
        if expected != Some(T::KIND.width()) {
            return Err(WireError::ElementWidth {
                identifier: self.identifier,
                element: T::KIND,
            });
        }
        let data = self
            .payload
            .chunks_exact(T::KIND.width())
            .map(T::decode)
            .collect();
        let [x, y, z] = { self.header.matrix_size };
        Ok(NdArray::new(
            vec![usize::from(x), usize::from(y), usize::from(z)],
            data,
        )?)
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting wire-format data.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("unknown message identifier: {0}")]
    UnknownIdentifier(u16),

    #[error("identifier {identifier} does not carry {element} elements")]
    ElementWidth {
        identifier: u16,
        element: ElementKind,
    },

    #[error("declared payload of {0} elements is too large")]
    PayloadTooLarge(u64),

    #[error(transparent)]
    Shape(#[from] PayloadError),

    #[error("read failed: {0}")]
    Io(#[from] std::io::Error),
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifier_is_selected_by_width() {
        assert_eq!(
            image_identifier_for_width(ElementKind::U16.width()),
            Some(MSG_IMAGE_REAL_USHORT)
        );
        assert_eq!(
            image_identifier_for_width(ElementKind::F32.width()),
            Some(MSG_IMAGE_REAL_FLOAT)
        );
        assert_eq!(
            image_identifier_for_width(ElementKind::Complex32.width()),
            Some(MSG_IMAGE_CPLX_FLOAT)
        );
        assert_eq!(image_identifier_for_width(1), None);
        assert_eq!(image_identifier_for_width(16), None);
    }

    #[test]
    fn identifier_table_is_stable() {
        assert_eq!(MSG_CLOSE, 4);
        assert_eq!(MSG_ACQUISITION, 1008);
        assert_eq!(MSG_IMAGE_CPLX_FLOAT, 1009);
        assert_eq!(MSG_IMAGE_REAL_FLOAT, 1010);
        assert_eq!(MSG_IMAGE_REAL_USHORT, 1011);
    }

    #[test]
    fn image_header_layout() {
        let mut header = ImageHeader::new_zeroed();
        header.version = 1;
        header.matrix_size = [128, 64, 1];
        header.channels = 1;

        let bytes = header.as_bytes();
        assert_eq!(bytes.len(), 194);
        // version(2) flags(8) measurement_uid(4) then matrix_size
        assert_eq!(u16::from_ne_bytes(bytes[14..16].try_into().unwrap()), 128);
        assert_eq!(u16::from_ne_bytes(bytes[16..18].try_into().unwrap()), 64);
        assert_eq!(u16::from_ne_bytes(bytes[18..20].try_into().unwrap()), 1);
        assert_eq!(header.element_count(), 8192);

        let recovered = ImageHeader::read_from(bytes).unwrap();
        let size = recovered.matrix_size;
        assert_eq!(size, [128, 64, 1]);
    }

    #[test]
    fn acquisition_header_layout() {
        let mut acq = AcquisitionHeader::new_zeroed();
        acq.number_of_samples = 256;
        acq.active_channels = 4;
        acq.set_flag(ACQ_LAST_IN_SLICE);

        let bytes = acq.as_bytes();
        assert_eq!(bytes.len(), 340);
        // version(2) flags(8) uid(4) scan_counter(4) ts(4) physio(12)
        assert_eq!(u16::from_ne_bytes(bytes[34..36].try_into().unwrap()), 256);
        assert!(acq.is_flag_set(ACQ_LAST_IN_SLICE));
        assert!(!acq.is_flag_set(ACQ_FIRST_IN_SLICE));
    }

    #[test]
    fn element_count_does_not_overflow_u16() {
        let mut header = ImageHeader::new_zeroed();
        header.matrix_size = [u16::MAX, u16::MAX, 2];
        assert_eq!(header.element_count(), 65535 * 65535 * 2);
    }

    #[test]
    fn read_rejects_unknown_identifier() {
        let bytes = 1234u16.to_ne_bytes();
        let err = ImageMessage::read_from(&mut &bytes[..]).unwrap_err();
        assert!(matches!(err, WireError::UnknownIdentifier(1234)));
    }

    #[test]
    fn read_fails_on_truncated_payload() {
        let mut header = ImageHeader::new_zeroed();
        header.matrix_size = [4, 1, 1];
        let mut bytes = MSG_IMAGE_REAL_USHORT.to_ne_bytes().to_vec();
        bytes.extend_from_slice(header.as_bytes());
        bytes.extend_from_slice(&[0u8; 6]); // 3 of 4 elements

        let err = ImageMessage::read_from(&mut &bytes[..]).unwrap_err();
        assert!(matches!(err, WireError::Io(_)));
    }

    #[test]
    fn to_array_checks_width() {
        let mut header = ImageHeader::new_zeroed();
        header.matrix_size = [2, 1, 1];
        let msg = ImageMessage {
            identifier: MSG_IMAGE_REAL_USHORT,
            header,
            payload: vec![1, 0, 2, 0],
        };
        assert!(msg.to_array::<f32>().is_err());
        let array = msg.to_array::<u16>().unwrap();
        assert_eq!(array.dims(), &[2, 1, 1]);
        assert_eq!(array.element_count(), 2);
    }
}
