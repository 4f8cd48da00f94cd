// Licensed under the Apache-2.0 license

//! Firmware image header as seen in the flat binary extracted from an ELF.
//!
//! The binary starts with a fixed 19-byte header whose last byte is the size of
//! a vector table entry. The vector table and a 10-byte git descriptor follow,
//! and everything after that is the payload covered by `data_size` and `crc`.

use core::mem::offset_of;

use crc32fast::Hasher;
use thiserror::Error;
use zerocopy::byteorder::{LittleEndian, U16};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

pub const IMAGE_MAGIC: u16 = 0xC0FE;
pub const IMAGE_VERSION: u16 = 0x0001;

/// Length of the fixed leading header region.
pub const IMAGE_HDR_FIXED_LEN: usize = core::mem::size_of::<ImageHeader>();
/// Length of the git descriptor trailing the vector table.
pub const IMAGE_HDR_GIT_LEN: usize = 10;
/// Supported vector table entry sizes (32-bit and 64-bit).
pub const VECTOR_SIZES: [u8; 2] = [4, 8];

/// Global symbol holding the header in the firmware ELF.
pub const IMAGE_HDR_SYMBOL: &str = "image_hdr";
pub const DATA_SIZE_FIELD: &str = "data_size";
pub const CRC_FIELD: &str = "crc";

pub const CRC_FIELD_OFFSET: usize = offset_of!(LinkedImageHeader, crc);
pub const DATA_SIZE_FIELD_OFFSET: usize = offset_of!(LinkedImageHeader, data_size);

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct ImageHeader {
    pub magic: U16<LittleEndian>,
    pub version: U16<LittleEndian>,
    pub reserved: [u8; 14],
    pub vector_size: u8,
}

const _: () = assert!(IMAGE_HDR_FIXED_LEN == 19);

/// Layout of the `image_hdr` global as linked into the firmware.
///
/// Only used to locate the `crc` and `data_size` fields inside the symbol;
/// multi-byte fields are stored in the target's byte order.
#[repr(C, packed)]
#[derive(Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct LinkedImageHeader {
    pub image_magic: u16,
    pub image_hdr_version: u16,
    pub crc: u32,
    pub data_size: u32,
    pub image_type: u8,
    pub version_major: u8,
    pub version_minor: u8,
    pub version_patch: u8,
    pub vector_addr: u32,
    pub device_id: u16,
    pub git_dirty: u8,
    pub git_ahead: u8,
    pub git_sha: [u8; 8],
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FormatError {
    #[error("Image too small to contain the header: {len} bytes, need {need}", need = IMAGE_HDR_FIXED_LEN)]
    Truncated { len: usize },
    #[error("Unsupported binary type. Expected {expected:#06x} Got {actual:#06x}")]
    BadMagic { expected: u16, actual: u16 },
    #[error("Unsupported image header version. Expected {expected:#04x} Got {actual:#04x}")]
    UnsupportedVersion { expected: u16, actual: u16 },
    #[error("Vector size is incorrect. Expected 0x4 or 0x8. Got {0:#04x}")]
    BadVectorSize(u8),
    #[error("Payload of {0} bytes does not fit the 32-bit data_size field")]
    PayloadTooLarge(usize),
}

/// Values destined for `image_hdr.data_size` and `image_hdr.crc`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadInfo {
    pub data_size: u32,
    pub crc32: u32,
}

impl core::fmt::Display for PayloadInfo {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "data_size={} crc={:#010x}", self.data_size, self.crc32)
    }
}

impl ImageHeader {
    pub fn read(image: &[u8]) -> Result<Self, FormatError> {
        let (header, _) = ImageHeader::read_from_prefix(image)
            .map_err(|_| FormatError::Truncated { len: image.len() })?;
        Ok(header)
    }

    pub fn validate(&self) -> Result<(), FormatError> {
        if self.magic.get() != IMAGE_MAGIC {
            return Err(FormatError::BadMagic {
                expected: IMAGE_MAGIC,
                actual: self.magic.get(),
            });
        }
        if self.version.get() != IMAGE_VERSION {
            return Err(FormatError::UnsupportedVersion {
                expected: IMAGE_VERSION,
                actual: self.version.get(),
            });
        }
        if !VECTOR_SIZES.contains(&self.vector_size) {
            return Err(FormatError::BadVectorSize(self.vector_size));
        }
        Ok(())
    }

    /// Offset of the payload from the start of the image.
    pub fn payload_offset(&self) -> usize {
        IMAGE_HDR_FIXED_LEN + self.vector_size as usize + IMAGE_HDR_GIT_LEN
    }
}

pub fn calculate_checksum(data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// Validates the header of a flat firmware binary and computes the size and
/// CRC32 of the payload following it.
///
/// An image that ends inside the vector table or git descriptor has an empty
/// payload.
pub fn process_binary_payload(image: &[u8]) -> Result<PayloadInfo, FormatError> {
    let header = ImageHeader::read(image)?;
    header.validate()?;

    let payload = image.get(header.payload_offset()..).unwrap_or_default();
    let data_size =
        u32::try_from(payload.len()).map_err(|_| FormatError::PayloadTooLarge(payload.len()))?;

    Ok(PayloadInfo {
        data_size,
        crc32: calculate_checksum(payload),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_image(magic: u16, version: u16, vector_size: u8, payload: &[u8]) -> Vec<u8> {
        let header = ImageHeader {
            magic: magic.into(),
            version: version.into(),
            reserved: [0xa5; 14],
            vector_size,
        };
        let mut image = header.as_bytes().to_vec();
        image.extend(vec![0x11; vector_size as usize]);
        image.extend(b"v1.2.3-4-g");
        image.extend_from_slice(payload);
        image
    }

    #[test]
    fn test_header_layout() {
        assert_eq!(IMAGE_HDR_FIXED_LEN, 19);
        assert_eq!(CRC_FIELD_OFFSET, 4);
        assert_eq!(DATA_SIZE_FIELD_OFFSET, 8);
        assert_eq!(core::mem::size_of::<LinkedImageHeader>(), 32);

        let image = build_image(IMAGE_MAGIC, IMAGE_VERSION, 8, &[]);
        assert_eq!(&image[0..4], &[0xfe, 0xc0, 0x01, 0x00]);
        assert_eq!(image[18], 8);
    }

    #[test]
    fn test_data_size_excludes_header_vectors_and_git() {
        let payload: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        for vector_size in VECTOR_SIZES {
            let image = build_image(IMAGE_MAGIC, IMAGE_VERSION, vector_size, &payload);
            let info = process_binary_payload(&image).unwrap();
            assert_eq!(
                info.data_size as usize,
                image.len() - 19 - vector_size as usize - 10
            );
            assert_eq!(info.crc32, calculate_checksum(&payload));
        }
    }

    #[test]
    fn test_forty_byte_image() {
        let mut image = vec![0u8; 40];
        image[0..4].copy_from_slice(&[0xfe, 0xc0, 0x01, 0x00]);
        image[18] = 0x04;

        let info = process_binary_payload(&image).unwrap();
        assert_eq!(info.data_size, 7);
        assert_eq!(info.crc32, calculate_checksum(&[0u8; 7]));
    }

    #[test]
    fn test_crc_matches_ieee_check_value() {
        let image = build_image(IMAGE_MAGIC, IMAGE_VERSION, 4, b"123456789");
        let info = process_binary_payload(&image).unwrap();
        assert_eq!(info.data_size, 9);
        assert_eq!(info.crc32, 0xcbf4_3926);
    }

    #[test]
    fn test_empty_payload() {
        for vector_size in VECTOR_SIZES {
            let image = build_image(IMAGE_MAGIC, IMAGE_VERSION, vector_size, &[]);
            assert_eq!(image.len(), 19 + vector_size as usize + 10);
            assert_eq!(
                process_binary_payload(&image).unwrap(),
                PayloadInfo {
                    data_size: 0,
                    crc32: 0
                }
            );
        }
    }

    #[test]
    fn test_image_ending_inside_git_descriptor() {
        let mut image = build_image(IMAGE_MAGIC, IMAGE_VERSION, 8, &[]);
        image.truncate(25);
        let info = process_binary_payload(&image).unwrap();
        assert_eq!(info.data_size, 0);
        assert_eq!(info.crc32, 0);
    }

    #[test]
    fn test_idempotent() {
        let image = build_image(IMAGE_MAGIC, IMAGE_VERSION, 4, b"firmware payload");
        assert_eq!(
            process_binary_payload(&image).unwrap(),
            process_binary_payload(&image).unwrap()
        );
    }

    #[test]
    fn test_bad_magic() {
        let image = build_image(0xDEAD, IMAGE_VERSION, 4, b"payload");
        let err = process_binary_payload(&image).unwrap_err();
        assert_eq!(
            err,
            FormatError::BadMagic {
                expected: 0xC0FE,
                actual: 0xDEAD
            }
        );
        let msg = err.to_string();
        assert!(msg.contains("0xc0fe"), "{msg}");
        assert!(msg.contains("0xdead"), "{msg}");
    }

    #[test]
    fn test_unsupported_version() {
        let image = build_image(IMAGE_MAGIC, 2, 4, b"payload");
        let err = process_binary_payload(&image).unwrap_err();
        assert_eq!(
            err,
            FormatError::UnsupportedVersion {
                expected: 1,
                actual: 2
            }
        );
        let msg = err.to_string();
        assert!(msg.contains("0x01"), "{msg}");
        assert!(msg.contains("0x02"), "{msg}");
    }

    #[test]
    fn test_bad_vector_size() {
        for vector_size in [0, 1, 2, 6, 7, 9, 16, 0xff] {
            let image = build_image(IMAGE_MAGIC, IMAGE_VERSION, vector_size, b"payload");
            assert_eq!(
                process_binary_payload(&image).unwrap_err(),
                FormatError::BadVectorSize(vector_size)
            );
        }
        let msg = FormatError::BadVectorSize(6).to_string();
        assert!(msg.contains("0x06"), "{msg}");
    }

    #[test]
    fn test_truncated_header() {
        let image = build_image(IMAGE_MAGIC, IMAGE_VERSION, 4, &[]);
        assert_eq!(
            process_binary_payload(&image[..18]).unwrap_err(),
            FormatError::Truncated { len: 18 }
        );
        assert_eq!(
            process_binary_payload(&[]).unwrap_err(),
            FormatError::Truncated { len: 0 }
        );
    }

    #[test]
    fn test_validation_order() {
        // magic is checked before version and vector size
        let image = build_image(0x1234, 7, 3, &[]);
        assert!(matches!(
            process_binary_payload(&image),
            Err(FormatError::BadMagic { .. })
        ));
        let image = build_image(IMAGE_MAGIC, 7, 3, &[]);
        assert!(matches!(
            process_binary_payload(&image),
            Err(FormatError::UnsupportedVersion { .. })
        ));
    }

    #[test]
    fn test_payload_info_display() {
        let info = PayloadInfo {
            data_size: 1024,
            crc32: 0xcbf4_3926,
        };
        assert_eq!(info.to_string(), "data_size=1024 crc=0xcbf43926");
    }
}
