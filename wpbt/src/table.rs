//! WPBT image layout and construction.
//!
//! The wire format is authoritative: a 52-byte fixed prefix (standard 36-byte
//! ACPI description header plus the WPBT body) followed by the command line
//! bytes. Everything is little-endian with 1-byte packing.
//!
//! Layout (left column: byte offset):
//!   +----+---------------------------------+-------------------------------+
//!   |  0 | Signature = b"WPBT"             | u8[4]                         |
//!   |  4 | Length (whole image)            | u32 LE                        |
//!   |  8 | Revision = 1                    | u8                            |
//!   |  9 | Checksum                        | u8, image sums to 0 mod 256   |
//!   | 10 | OemId                           | u8[6]                         |
//!   | 16 | OemTableId                      | u8[8]                         |
//!   | 24 | OemRevision (must stay 1)       | u32 LE                        |
//!   | 28 | CreatorId                       | u8[4]                         |
//!   | 32 | CreatorRevision                 | u32 LE                        |
//!   | 36 | HandoffMemorySize               | u32 LE                        |
//!   | 40 | HandoffMemoryLocation           | u64 LE                        |
//!   | 48 | ContentLayout = 1 (single PE)   | u8                            |
//!   | 49 | ContentType = 1 (native app)    | u8                            |
//!   | 50 | CommandLineArgumentLength       | u16 LE, includes terminator   |
//!   | 52 | CommandLineArgument ...         | UTF-16LE, NUL-terminated      |
//!   +----+---------------------------------+-------------------------------+
//!
//! The header struct below is built from byte-array-backed endian types, so
//! its in-memory representation *is* the wire representation; no field ever
//! depends on native padding or byte order.

use alloc::vec::Vec;

use zerocopy::byteorder::{LittleEndian, U16, U32, U64};
use zerocopy::{AsBytes, FromBytes, LayoutVerified, Unaligned};

use crate::error::WpbtError;

/// 4-character ACPI signature of the WPBT.
pub const SIGNATURE: [u8; 4] = *b"WPBT";
/// Table revision required by the WPBT document.
pub const REVISION: u8 = 1;
/// OemId is free-form; any 6 bytes do.
pub const OEM_ID: [u8; 6] = *b"PURRRR";
/// OemTableId is free-form; any 8 bytes do.
pub const OEM_TABLE_ID: [u8; 8] = *b"MEOWPURR";
/// The OS consumer requires OemRevision == 1 in the installed table.
pub const OEM_REVISION: u32 = 1;
pub const CREATOR_ID: [u8; 4] = *b"MEOW";
pub const CREATOR_REVISION: u32 = 0;
/// Single contiguous PE image.
pub const CONTENT_LAYOUT_SINGLE_PE: u8 = 1;
/// Native application (subsystem NATIVE, NtProcessStartup entry).
pub const CONTENT_TYPE_NATIVE_APPLICATION: u8 = 1;

/// Size of the fixed part of the table, before command line bytes.
pub const FIXED_LEN: usize = 52;
/// Command line bytes must fit the 16-bit length field.
pub const MAX_COMMAND_LINE_BYTES: usize = u16::MAX as usize;

pub const LENGTH_OFFSET: usize = 4;
pub const REVISION_OFFSET: usize = 8;
pub const CHECKSUM_OFFSET: usize = 9;
pub const OEM_REVISION_OFFSET: usize = 24;
pub const HANDOFF_SIZE_OFFSET: usize = 36;
pub const HANDOFF_LOCATION_OFFSET: usize = 40;
pub const CONTENT_LAYOUT_OFFSET: usize = 48;
pub const CONTENT_TYPE_OFFSET: usize = 49;
pub const COMMAND_LINE_LENGTH_OFFSET: usize = 50;

/// The fixed 52-byte table prefix, wire-exact.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, AsBytes, FromBytes, Unaligned)]
pub struct WpbtHeader {
    pub signature: [u8; 4],
    pub length: U32<LittleEndian>,
    pub revision: u8,
    pub checksum: u8,
    pub oem_id: [u8; 6],
    pub oem_table_id: [u8; 8],
    pub oem_revision: U32<LittleEndian>,
    pub creator_id: [u8; 4],
    pub creator_revision: U32<LittleEndian>,
    pub handoff_memory_size: U32<LittleEndian>,
    pub handoff_memory_location: U64<LittleEndian>,
    pub content_layout: u8,
    pub content_type: u8,
    pub command_line_argument_length: U16<LittleEndian>,
}

/// An owned, finished table image, ready to hand to the platform registry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TableImage {
    bytes: Vec<u8>,
}

impl TableImage {
    /// Builds the complete image for a payload at `payload_location` of
    /// `payload_size` bytes, with `command_line` embedded verbatim when
    /// present (UTF-16LE bytes, terminator included).
    ///
    /// The command line length is checked before anything is allocated; the
    /// checksum is computed last, over the fully populated buffer.
    pub fn build(
        payload_location: u64,
        payload_size: u32,
        command_line: Option<&[u8]>,
    ) -> Result<Self, WpbtError> {
        let args = command_line.unwrap_or(&[]);
        if args.len() > MAX_COMMAND_LINE_BYTES {
            return Err(WpbtError::ArgumentsTooLong { len: args.len() });
        }

        let total = FIXED_LEN + args.len();
        let mut bytes = Vec::new();
        bytes
            .try_reserve_exact(total)
            .map_err(|_| WpbtError::AllocationFailed { len: total })?;
        bytes.resize(total, 0);

        let header = WpbtHeader {
            signature: SIGNATURE,
            length: U32::new(total as u32),
            revision: REVISION,
            checksum: 0, // filled in below, over the finished image
            oem_id: OEM_ID,
            oem_table_id: OEM_TABLE_ID,
            oem_revision: U32::new(OEM_REVISION),
            creator_id: CREATOR_ID,
            creator_revision: U32::new(CREATOR_REVISION),
            handoff_memory_size: U32::new(payload_size),
            handoff_memory_location: U64::new(payload_location),
            content_layout: CONTENT_LAYOUT_SINGLE_PE,
            content_type: CONTENT_TYPE_NATIVE_APPLICATION,
            command_line_argument_length: U16::new(args.len() as u16),
        };
        bytes[..FIXED_LEN].copy_from_slice(header.as_bytes());
        bytes[FIXED_LEN..].copy_from_slice(args);

        update_checksum(&mut bytes);
        Ok(Self { bytes })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Borrowed, decoded view over a table image.
///
/// Decoding recovers exactly what [`TableImage::build`] wrote, from the fixed
/// offsets; used for the post-install report and for round-trip checks.
pub struct WpbtView<'a> {
    pub header: &'a WpbtHeader,
    pub command_line: &'a [u8],
}

impl<'a> WpbtView<'a> {
    /// Decodes `bytes` as a WPBT. Returns `None` on a wrong signature or an
    /// internally inconsistent length.
    pub fn parse(bytes: &'a [u8]) -> Option<Self> {
        let (header, rest) = LayoutVerified::<&[u8], WpbtHeader>::new_from_prefix(bytes)?;
        let header = header.into_ref();
        if header.signature != SIGNATURE {
            return None;
        }

        let declared = header.length.get() as usize;
        let args_len = header.command_line_argument_length.get() as usize;
        if declared != FIXED_LEN + args_len || declared > bytes.len() {
            return None;
        }

        let command_line = rest.get(..args_len)?;
        Some(Self { header, command_line })
    }
}

/// Encodes command line text the way the table consumer expects it:
/// UTF-16LE code units followed by a NUL terminator.
pub fn encode_command_line(text: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity((text.len() + 1) * 2);
    for unit in text.encode_utf16() {
        out.extend_from_slice(&unit.to_le_bytes());
    }
    out.extend_from_slice(&0u16.to_le_bytes());
    out
}

/// Wrapping byte sum of the whole buffer.
pub fn byte_sum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |sum, &b| sum.wrapping_add(b))
}

/// Recomputes the checksum byte so the whole image sums to 0 mod 256.
/// The field is zeroed first so a stale value never feeds the sum.
pub fn update_checksum(bytes: &mut [u8]) {
    bytes[CHECKSUM_OFFSET] = 0;
    bytes[CHECKSUM_OFFSET] = 0u8.wrapping_sub(byte_sum(bytes));
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem;
    use pretty_assertions::assert_eq;

    const PAYLOAD_LOCATION: u64 = 0x7654_3210_0000;
    const PAYLOAD_SIZE: u32 = 1024;

    #[test]
    fn header_is_wire_sized() {
        assert_eq!(mem::size_of::<WpbtHeader>(), FIXED_LEN);
    }

    #[test]
    fn image_without_command_line_is_fixed_len() {
        let image = TableImage::build(PAYLOAD_LOCATION, PAYLOAD_SIZE, None).unwrap();
        assert_eq!(image.len(), FIXED_LEN);
    }

    #[test]
    fn whole_image_sums_to_zero() {
        let image = TableImage::build(PAYLOAD_LOCATION, PAYLOAD_SIZE, None).unwrap();
        assert_eq!(byte_sum(image.as_bytes()), 0);

        let args = encode_command_line("some arguments here");
        let image = TableImage::build(PAYLOAD_LOCATION, PAYLOAD_SIZE, Some(&args)).unwrap();
        assert_eq!(byte_sum(image.as_bytes()), 0);
    }

    #[test]
    fn fixed_fields_land_at_their_offsets() {
        let args = encode_command_line("hi");
        let image = TableImage::build(PAYLOAD_LOCATION, PAYLOAD_SIZE, Some(&args)).unwrap();
        let bytes = image.as_bytes();

        assert_eq!(&bytes[..4], b"WPBT");
        assert_eq!(bytes[LENGTH_OFFSET..LENGTH_OFFSET + 4], (FIXED_LEN as u32 + 6).to_le_bytes());
        assert_eq!(bytes[REVISION_OFFSET], REVISION);
        assert_eq!(&bytes[10..16], b"PURRRR");
        assert_eq!(&bytes[16..24], b"MEOWPURR");
        assert_eq!(bytes[OEM_REVISION_OFFSET..OEM_REVISION_OFFSET + 4], 1u32.to_le_bytes());
        assert_eq!(&bytes[28..32], b"MEOW");
        assert_eq!(
            bytes[HANDOFF_SIZE_OFFSET..HANDOFF_SIZE_OFFSET + 4],
            PAYLOAD_SIZE.to_le_bytes()
        );
        assert_eq!(
            bytes[HANDOFF_LOCATION_OFFSET..HANDOFF_LOCATION_OFFSET + 8],
            PAYLOAD_LOCATION.to_le_bytes()
        );
        assert_eq!(bytes[CONTENT_LAYOUT_OFFSET], CONTENT_LAYOUT_SINGLE_PE);
        assert_eq!(bytes[CONTENT_TYPE_OFFSET], CONTENT_TYPE_NATIVE_APPLICATION);
        assert_eq!(
            bytes[COMMAND_LINE_LENGTH_OFFSET..COMMAND_LINE_LENGTH_OFFSET + 2],
            6u16.to_le_bytes()
        );
        assert_eq!(&bytes[FIXED_LEN..], &args[..]);
    }

    #[test]
    fn command_line_length_is_exact_across_range() {
        for len in [0usize, 1, 511, MAX_COMMAND_LINE_BYTES] {
            let args = vec![0xAB; len];
            let image = TableImage::build(PAYLOAD_LOCATION, PAYLOAD_SIZE, Some(&args)).unwrap();
            assert_eq!(image.len(), FIXED_LEN + len);
            let view = WpbtView::parse(image.as_bytes()).unwrap();
            assert_eq!(view.header.command_line_argument_length.get() as usize, len);
        }
    }

    #[test]
    fn oversized_command_line_is_rejected() {
        for len in [MAX_COMMAND_LINE_BYTES + 1, 70_000] {
            let args = vec![0u8; len];
            assert_eq!(
                TableImage::build(PAYLOAD_LOCATION, PAYLOAD_SIZE, Some(&args)),
                Err(WpbtError::ArgumentsTooLong { len })
            );
        }
    }

    #[test]
    fn build_is_deterministic() {
        let args = encode_command_line("one two three");
        let a = TableImage::build(PAYLOAD_LOCATION, PAYLOAD_SIZE, Some(&args)).unwrap();
        let b = TableImage::build(PAYLOAD_LOCATION, PAYLOAD_SIZE, Some(&args)).unwrap();
        assert_eq!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn round_trip_recovers_inputs() {
        let args = encode_command_line("-flag value");
        let image = TableImage::build(PAYLOAD_LOCATION, PAYLOAD_SIZE, Some(&args)).unwrap();

        let view = WpbtView::parse(image.as_bytes()).unwrap();
        assert_eq!(view.header.handoff_memory_location.get(), PAYLOAD_LOCATION);
        assert_eq!(view.header.handoff_memory_size.get(), PAYLOAD_SIZE);
        assert_eq!(view.header.command_line_argument_length.get() as usize, args.len());
        assert_eq!(view.command_line, &args[..]);
    }

    #[test]
    fn hello_command_line_is_twelve_bytes() {
        let args = encode_command_line("hello");
        assert_eq!(args.len(), 12);
        assert_eq!(&args[args.len() - 2..], &[0, 0]);

        let image = TableImage::build(PAYLOAD_LOCATION, PAYLOAD_SIZE, Some(&args)).unwrap();
        assert_eq!(image.len(), 64);
    }

    #[test]
    fn parse_rejects_foreign_or_truncated_tables() {
        let image = TableImage::build(PAYLOAD_LOCATION, PAYLOAD_SIZE, None).unwrap();

        let mut wrong_sig = image.as_bytes().to_vec();
        wrong_sig[..4].copy_from_slice(b"FACP");
        assert!(WpbtView::parse(&wrong_sig).is_none());

        assert!(WpbtView::parse(&image.as_bytes()[..FIXED_LEN - 1]).is_none());

        let mut short_args = image.as_bytes().to_vec();
        short_args[COMMAND_LINE_LENGTH_OFFSET..COMMAND_LINE_LENGTH_OFFSET + 2]
            .copy_from_slice(&8u16.to_le_bytes());
        assert!(WpbtView::parse(&short_args).is_none());
    }
}
