//! Writing resolved addresses into segment bytes

use thiserror::Error;

use crate::program::{PointerSize, RelocationInfo, RelocationKind};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PatchError {
    #[error("patch of {width} bytes at offset {offset} exceeds {segment_size}-byte segment")]
    OutOfBounds {
        offset: u64,
        width: usize,
        segment_size: usize,
    },
    #[error("relocation kind {0:?} not supported in data segments")]
    UnsupportedDataKind(RelocationKind),
}

/// Number of bytes a relocation writes
pub fn patch_width(kind: RelocationKind, pointer_size: PointerSize) -> usize {
    match kind {
        RelocationKind::Address => pointer_size.bytes(),
        RelocationKind::AddressLow | RelocationKind::AddressHigh => 4,
    }
}

/// Little-endian bytes written for `address`
pub fn patch_value(kind: RelocationKind, address: u64, pointer_size: PointerSize) -> Vec<u8> {
    match kind {
        RelocationKind::Address => match pointer_size {
            PointerSize::Bits64 => address.to_le_bytes().to_vec(),
            PointerSize::Bits32 => (address as u32).to_le_bytes().to_vec(),
        },
        RelocationKind::AddressLow => ((address & 0xffff_ffff) as u32).to_le_bytes().to_vec(),
        RelocationKind::AddressHigh => ((address >> 32) as u32).to_le_bytes().to_vec(),
    }
}

/// Patch an instruction segment; returns the offset and bytes written
pub fn patch_instruction(
    segment: &mut [u8],
    relocation: &RelocationInfo,
    address: u64,
    pointer_size: PointerSize,
) -> Result<(usize, Vec<u8>), PatchError> {
    write_at(segment, relocation, patch_value(relocation.kind, address, pointer_size))
}

/// Patch a global data segment; only full and low-half addresses are allowed
pub fn patch_data(
    segment: &mut [u8],
    relocation: &RelocationInfo,
    address: u64,
    pointer_size: PointerSize,
) -> Result<(usize, Vec<u8>), PatchError> {
    if relocation.kind == RelocationKind::AddressHigh {
        return Err(PatchError::UnsupportedDataKind(relocation.kind));
    }
    write_at(segment, relocation, patch_value(relocation.kind, address, pointer_size))
}

fn write_at(
    segment: &mut [u8],
    relocation: &RelocationInfo,
    bytes: Vec<u8>,
) -> Result<(usize, Vec<u8>), PatchError> {
    let out_of_bounds = PatchError::OutOfBounds {
        offset: relocation.offset,
        width: bytes.len(),
        segment_size: segment.len(),
    };
    let start = usize::try_from(relocation.offset).map_err(|_| out_of_bounds.clone())?;
    let end = start
        .checked_add(bytes.len())
        .filter(|&end| end <= segment.len())
        .ok_or(out_of_bounds)?;
    segment[start..end].copy_from_slice(&bytes);
    Ok((start, bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::SegmentType;

    fn reloc(offset: u64, kind: RelocationKind) -> RelocationInfo {
        RelocationInfo {
            symbol_name: "sym".to_string(),
            offset,
            kind,
            target_segment: SegmentType::Instructions,
        }
    }

    const ADDR: u64 = 0x1122_3344_5566_7788;

    #[test]
    fn test_full_address_64() {
        let mut seg = vec![0u8; 16];
        patch_instruction(&mut seg, &reloc(4, RelocationKind::Address), ADDR, PointerSize::Bits64)
            .unwrap();
        assert_eq!(&seg[4..12], &ADDR.to_le_bytes());
        assert_eq!(&seg[..4], &[0; 4]);
    }

    #[test]
    fn test_full_address_32_writes_low_half() {
        let mut seg = vec![0xffu8; 8];
        patch_instruction(&mut seg, &reloc(0, RelocationKind::Address), ADDR, PointerSize::Bits32)
            .unwrap();
        assert_eq!(&seg[..4], &0x5566_7788u32.to_le_bytes());
        assert_eq!(&seg[4..], &[0xff; 4]);
    }

    #[test]
    fn test_low_and_high_halves() {
        let mut seg = vec![0u8; 8];
        patch_instruction(&mut seg, &reloc(0, RelocationKind::AddressLow), ADDR, PointerSize::Bits64)
            .unwrap();
        patch_instruction(&mut seg, &reloc(4, RelocationKind::AddressHigh), ADDR, PointerSize::Bits64)
            .unwrap();
        assert_eq!(seg, ADDR.to_le_bytes().to_vec());
    }

    #[test]
    fn test_out_of_bounds_is_rejected() {
        let mut seg = vec![0u8; 8];
        let err = patch_instruction(&mut seg, &reloc(4, RelocationKind::Address), ADDR, PointerSize::Bits64)
            .unwrap_err();
        assert_eq!(
            err,
            PatchError::OutOfBounds {
                offset: 4,
                width: 8,
                segment_size: 8
            }
        );
        assert_eq!(seg, vec![0u8; 8]);
        assert!(patch_instruction(&mut seg, &reloc(u64::MAX, RelocationKind::AddressLow), 1, PointerSize::Bits64).is_err());
    }

    #[test]
    fn test_data_segment_rejects_high_half() {
        let mut seg = vec![0u8; 8];
        assert_eq!(
            patch_data(&mut seg, &reloc(0, RelocationKind::AddressHigh), ADDR, PointerSize::Bits64),
            Err(PatchError::UnsupportedDataKind(RelocationKind::AddressHigh))
        );
        assert!(patch_data(&mut seg, &reloc(0, RelocationKind::AddressLow), ADDR, PointerSize::Bits64).is_ok());
    }

    #[test]
    fn test_patch_width() {
        assert_eq!(patch_width(RelocationKind::Address, PointerSize::Bits64), 8);
        assert_eq!(patch_width(RelocationKind::Address, PointerSize::Bits32), 4);
        assert_eq!(patch_width(RelocationKind::AddressHigh, PointerSize::Bits64), 4);
    }
}
