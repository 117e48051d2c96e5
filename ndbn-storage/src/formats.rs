//! Binary layouts for the NDBN container.
//!
//! Defines the header, tensor table entry and NF4 auxiliary block layouts,
//! plus the constants a loader relies on. All integers are little-endian.
//!
//! File layout:
//! ```text
//! [header: 32][table: 64 * tensor_count][pad][data 0][pad][aux 0]...[pad][vocab]
//! ```
//! Data, aux and vocab segments start on 64-byte boundaries; gaps are zero-filled.

use std::fmt;
use std::io::{self, Write};
use std::str::FromStr;

use serde::Serialize;

use crate::error::{Error, Result};

/// NDBN magic, reads as "NDBN" in a little-endian dump.
pub const NDBN_MAGIC: u32 = 0x4E42_444E;

/// Current format version.
pub const NDBN_VERSION: u16 = 1;

/// Header size in bytes, including trailing padding.
pub const HEADER_SIZE: usize = 32;

/// Size of one tensor table entry.
pub const TABLE_ENTRY_SIZE: usize = 64;

/// Alignment of every data, aux and vocab segment.
pub const SEGMENT_ALIGNMENT: usize = 64;

/// Maximum tensor rank representable in a table entry.
pub const MAX_RANK: usize = 4;

/// Fixed prefix of an NF4 auxiliary block, before the scale array.
pub const NF4_AUX_HEADER_SIZE: usize = 12;

/// Default number of elements sharing one NF4 scale.
pub const DEFAULT_BLOCK_SIZE: usize = 64;

/// Size of one serialized merge triple.
pub const MERGE_TRIPLE_SIZE: usize = 12;

/// Round `size` up to the next multiple of `alignment` (a power of two).
#[inline]
pub const fn align_to(size: u64, alignment: u64) -> u64 {
    (size + alignment - 1) & !(alignment - 1)
}

/// Element data types a table entry can declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum DType {
    F32 = 0,
    F16 = 1,
    Bf16 = 2,
    I8 = 3,
    Nf4 = 4,
}

impl DType {
    /// On-disk code.
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Whether payloads of this type carry packed codes plus an aux scale block.
    pub fn is_quantized(self) -> bool {
        matches!(self, DType::Nf4)
    }

    /// Bytes per element for unquantized types.
    pub fn element_size(self) -> Option<usize> {
        match self {
            DType::F32 => Some(4),
            DType::F16 | DType::Bf16 => Some(2),
            DType::I8 => Some(1),
            DType::Nf4 => None,
        }
    }

    /// Lowercase display name, also the accepted config spelling.
    pub fn as_str(self) -> &'static str {
        match self {
            DType::F32 => "f32",
            DType::F16 => "f16",
            DType::Bf16 => "bf16",
            DType::I8 => "i8",
            DType::Nf4 => "nf4",
        }
    }
}

impl TryFrom<u8> for DType {
    type Error = Error;

    fn try_from(code: u8) -> Result<Self> {
        match code {
            0 => Ok(DType::F32),
            1 => Ok(DType::F16),
            2 => Ok(DType::Bf16),
            3 => Ok(DType::I8),
            4 => Ok(DType::Nf4),
            other => Err(Error::invalid_format(format!("unknown dtype code {other}"))),
        }
    }
}

impl FromStr for DType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "f32" => Ok(DType::F32),
            "f16" => Ok(DType::F16),
            "bf16" => Ok(DType::Bf16),
            "i8" => Ok(DType::I8),
            "nf4" => Ok(DType::Nf4),
            other => Err(Error::invalid_format(format!(
                "unknown dtype '{other}' (valid: f32, f16, bf16, i8, nf4)"
            ))),
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// NDBN file header (32 bytes).
///
/// - magic: u32 (`NDBN_MAGIC`)
/// - version: u16
/// - flags: u16 (reserved, 0)
/// - tensor_count: u32
/// - tensor_table_offset: u32
/// - vocab_table_offset: u64 (0 = no vocab)
/// - 8 bytes zero padding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NdbnHeader {
    pub version: u16,
    pub flags: u16,
    pub tensor_count: u32,
    pub tensor_table_offset: u32,
    pub vocab_table_offset: u64,
}

impl NdbnHeader {
    /// Create a version-1 header.
    pub fn new(tensor_count: u32, tensor_table_offset: u32, vocab_table_offset: u64) -> Self {
        Self {
            version: NDBN_VERSION,
            flags: 0,
            tensor_count,
            tensor_table_offset,
            vocab_table_offset,
        }
    }

    /// Encode to the fixed 32-byte representation.
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0..4].copy_from_slice(&NDBN_MAGIC.to_le_bytes());
        out[4..6].copy_from_slice(&self.version.to_le_bytes());
        out[6..8].copy_from_slice(&self.flags.to_le_bytes());
        out[8..12].copy_from_slice(&self.tensor_count.to_le_bytes());
        out[12..16].copy_from_slice(&self.tensor_table_offset.to_le_bytes());
        out[16..24].copy_from_slice(&self.vocab_table_offset.to_le_bytes());
        out
    }

    /// Write header to writer
    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(&self.to_bytes())
    }

    /// Parse a header from the start of `bytes`, checking magic and version.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(Error::invalid_format(format!(
                "file is {} bytes, shorter than the {HEADER_SIZE}-byte header",
                bytes.len()
            )));
        }

        let magic = le_u32(bytes, 0);
        if magic != NDBN_MAGIC {
            return Err(Error::invalid_format(format!(
                "invalid magic: expected 0x{NDBN_MAGIC:08X}, got 0x{magic:08X}"
            )));
        }

        let version = le_u16(bytes, 4);
        if version != NDBN_VERSION {
            return Err(Error::invalid_format(format!(
                "unsupported version {version} (expected {NDBN_VERSION})"
            )));
        }

        Ok(Self {
            version,
            flags: le_u16(bytes, 6),
            tensor_count: le_u32(bytes, 8),
            tensor_table_offset: le_u32(bytes, 12),
            vocab_table_offset: le_u64(bytes, 16),
        })
    }

    /// Whether a vocab blob is present.
    pub fn has_vocab(&self) -> bool {
        self.vocab_table_offset != 0
    }
}

/// One fixed-size tensor table entry (64 bytes).
///
/// | offset | field        | type     |
/// |--------|--------------|----------|
/// | 0      | name_offset  | u32      |
/// | 4      | dtype        | u8       |
/// | 5      | rank         | u8       |
/// | 6      | layout       | u8       |
/// | 7      | is_quantized | u8       |
/// | 8      | shape        | [u32; 4] |
/// | 24     | data_offset  | u64      |
/// | 32     | data_size    | u64      |
/// | 40     | aux_offset   | u64      |
/// | 48     | aux_size     | u64      |
/// | 56     | zero padding | 8 bytes  |
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TensorEntry {
    /// Reserved; no name pool is emitted so this is always 0.
    pub name_offset: u32,
    pub dtype: DType,
    pub rank: u8,
    /// Reserved, 0.
    pub layout: u8,
    pub is_quantized: bool,
    /// Dimensions, zero past `rank`.
    pub shape: [u32; MAX_RANK],
    pub data_offset: u64,
    pub data_size: u64,
    pub aux_offset: u64,
    pub aux_size: u64,
}

impl TensorEntry {
    /// Dimensions actually declared by `rank`.
    pub fn dims(&self) -> &[u32] {
        &self.shape[..usize::from(self.rank).min(MAX_RANK)]
    }

    /// Product of the declared dimensions, `None` if it overflows u64.
    pub fn num_elements(&self) -> Option<u64> {
        self.dims()
            .iter()
            .try_fold(1u64, |acc, &d| acc.checked_mul(u64::from(d)))
    }

    /// Encode to the fixed 64-byte representation.
    ///
    /// Fails if a shape slot past `rank` is non-zero; loaders trust only the
    /// first `rank` entries and the padding must agree with them.
    pub fn to_bytes(&self) -> Result<[u8; TABLE_ENTRY_SIZE]> {
        check_shape_padding(self.rank, &self.shape)?;

        let mut out = [0u8; TABLE_ENTRY_SIZE];
        out[0..4].copy_from_slice(&self.name_offset.to_le_bytes());
        out[4] = self.dtype.code();
        out[5] = self.rank;
        out[6] = self.layout;
        out[7] = u8::from(self.is_quantized);
        for (i, dim) in self.shape.iter().enumerate() {
            let at = 8 + i * 4;
            out[at..at + 4].copy_from_slice(&dim.to_le_bytes());
        }
        out[24..32].copy_from_slice(&self.data_offset.to_le_bytes());
        out[32..40].copy_from_slice(&self.data_size.to_le_bytes());
        out[40..48].copy_from_slice(&self.aux_offset.to_le_bytes());
        out[48..56].copy_from_slice(&self.aux_size.to_le_bytes());
        Ok(out)
    }

    /// Parse one entry from exactly `TABLE_ENTRY_SIZE` bytes.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < TABLE_ENTRY_SIZE {
            return Err(Error::invalid_format("truncated tensor table entry"));
        }

        let rank = bytes[5];
        let mut shape = [0u32; MAX_RANK];
        for (i, dim) in shape.iter_mut().enumerate() {
            *dim = le_u32(bytes, 8 + i * 4);
        }
        check_shape_padding(rank, &shape)?;

        Ok(Self {
            name_offset: le_u32(bytes, 0),
            dtype: DType::try_from(bytes[4])?,
            rank,
            layout: bytes[6],
            is_quantized: bytes[7] != 0,
            shape,
            data_offset: le_u64(bytes, 24),
            data_size: le_u64(bytes, 32),
            aux_offset: le_u64(bytes, 40),
            aux_size: le_u64(bytes, 48),
        })
    }
}

fn check_shape_padding(rank: u8, shape: &[u32; MAX_RANK]) -> Result<()> {
    let rank = usize::from(rank);
    if rank == 0 || rank > MAX_RANK {
        return Err(Error::invalid_format(format!("rank {rank} outside 1..={MAX_RANK}")));
    }
    if let Some(pos) = shape[rank..].iter().position(|&d| d != 0) {
        return Err(Error::invalid_format(format!(
            "shape slot {} is {} but rank is {rank}",
            rank + pos,
            shape[rank + pos]
        )));
    }
    Ok(())
}

/// Prefix of an NF4 auxiliary block.
///
/// - has_zero_point: u8 (reserved, 0)
/// - scale_dtype: u8
/// - zero_point_dtype: u8
/// - reserved: u8
/// - block_size: u32
/// - num_blocks: u32
///
/// Followed by `num_blocks` little-endian f32 scales.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Nf4AuxHeader {
    pub has_zero_point: bool,
    pub scale_dtype: DType,
    pub zero_point_dtype: DType,
    pub block_size: u32,
    pub num_blocks: u32,
}

impl Nf4AuxHeader {
    /// Header for f32 scales without zero points.
    pub fn new(block_size: u32, num_blocks: u32) -> Self {
        Self {
            has_zero_point: false,
            scale_dtype: DType::F32,
            zero_point_dtype: DType::F32,
            block_size,
            num_blocks,
        }
    }

    /// Total aux block length: prefix plus one f32 per block.
    pub fn encoded_len(&self) -> usize {
        NF4_AUX_HEADER_SIZE + self.num_blocks as usize * 4
    }

    /// Serialize prefix and scales into one aux payload.
    pub fn encode(&self, scales: &[f32]) -> Vec<u8> {
        debug_assert_eq!(scales.len(), self.num_blocks as usize);

        let mut out = Vec::with_capacity(NF4_AUX_HEADER_SIZE + scales.len() * 4);
        out.push(u8::from(self.has_zero_point));
        out.push(self.scale_dtype.code());
        out.push(self.zero_point_dtype.code());
        out.push(0);
        out.extend_from_slice(&self.block_size.to_le_bytes());
        out.extend_from_slice(&self.num_blocks.to_le_bytes());
        for scale in scales {
            out.extend_from_slice(&scale.to_le_bytes());
        }
        out
    }

    /// Parse an aux payload back into its header and scale array.
    pub fn decode(bytes: &[u8]) -> Result<(Self, Vec<f32>)> {
        if bytes.len() < NF4_AUX_HEADER_SIZE {
            return Err(Error::invalid_format(format!(
                "NF4 aux block is {} bytes, shorter than its {NF4_AUX_HEADER_SIZE}-byte prefix",
                bytes.len()
            )));
        }

        let header = Self {
            has_zero_point: bytes[0] != 0,
            scale_dtype: DType::try_from(bytes[1])?,
            zero_point_dtype: DType::try_from(bytes[2])?,
            block_size: le_u32(bytes, 4),
            num_blocks: le_u32(bytes, 8),
        };

        if header.scale_dtype != DType::F32 {
            return Err(Error::invalid_format(format!(
                "unsupported NF4 scale dtype {}",
                header.scale_dtype
            )));
        }
        if header.encoded_len() != bytes.len() {
            return Err(Error::invalid_format(format!(
                "NF4 aux block declares {} blocks ({} bytes) but holds {} bytes",
                header.num_blocks,
                header.encoded_len(),
                bytes.len()
            )));
        }

        let scales = bytes[NF4_AUX_HEADER_SIZE..]
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();

        Ok((header, scales))
    }
}

#[inline]
pub(crate) fn le_u16(bytes: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([bytes[at], bytes[at + 1]])
}

#[inline]
pub(crate) fn le_u32(bytes: &[u8], at: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[at..at + 4]);
    u32::from_le_bytes(buf)
}

#[inline]
pub(crate) fn le_u64(bytes: &[u8], at: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[at..at + 8]);
    u64::from_le_bytes(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_entry() -> TensorEntry {
        TensorEntry {
            name_offset: 0,
            dtype: DType::Nf4,
            rank: 2,
            layout: 0,
            is_quantized: true,
            shape: [64, 64, 0, 0],
            data_offset: 128,
            data_size: 2048,
            aux_offset: 2176,
            aux_size: 268,
        }
    }

    // ==================== align_to tests ====================

    #[test]
    fn test_align_to() {
        assert_eq!(align_to(0, 64), 0);
        assert_eq!(align_to(1, 64), 64);
        assert_eq!(align_to(64, 64), 64);
        assert_eq!(align_to(65, 64), 128);
        assert_eq!(align_to(96, 64), 128);
    }

    // ==================== header tests ====================

    #[test]
    fn test_header_layout() {
        let header = NdbnHeader::new(3, 32, 4096);
        let bytes = header.to_bytes();

        assert_eq!(&bytes[0..4], &[0x4E, 0x44, 0x42, 0x4E]);
        assert_eq!(&bytes[0..4], b"NDBN");
        assert_eq!(u16::from_le_bytes([bytes[4], bytes[5]]), 1);
        assert_eq!(u16::from_le_bytes([bytes[6], bytes[7]]), 0);
        assert_eq!(le_u32(&bytes, 8), 3);
        assert_eq!(le_u32(&bytes, 12), 32);
        assert_eq!(le_u64(&bytes, 16), 4096);
        assert!(bytes[24..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_header_parse_roundtrip() {
        let header = NdbnHeader::new(7, 32, 0);
        let parsed = NdbnHeader::parse(&header.to_bytes()).unwrap();
        assert_eq!(parsed, header);
        assert!(!parsed.has_vocab());
    }

    #[test]
    fn test_header_parse_bad_magic() {
        let mut bytes = NdbnHeader::new(0, 32, 0).to_bytes();
        bytes[0] = b'X';
        let err = NdbnHeader::parse(&bytes).unwrap_err();
        assert!(err.to_string().contains("magic"));
    }

    #[test]
    fn test_header_parse_bad_version() {
        let mut header = NdbnHeader::new(0, 32, 0);
        header.version = 9;
        let err = NdbnHeader::parse(&header.to_bytes()).unwrap_err();
        assert!(err.to_string().contains("version 9"));
    }

    #[test]
    fn test_header_parse_truncated() {
        let err = NdbnHeader::parse(&[0u8; 10]).unwrap_err();
        assert!(err.to_string().contains("shorter"));
    }

    // ==================== table entry tests ====================

    #[test]
    fn test_entry_field_offsets() {
        let bytes = sample_entry().to_bytes().unwrap();

        assert_eq!(le_u32(&bytes, 0), 0);
        assert_eq!(bytes[4], 4);
        assert_eq!(bytes[5], 2);
        assert_eq!(bytes[6], 0);
        assert_eq!(bytes[7], 1);
        assert_eq!(le_u32(&bytes, 8), 64);
        assert_eq!(le_u32(&bytes, 12), 64);
        assert_eq!(le_u32(&bytes, 16), 0);
        assert_eq!(le_u32(&bytes, 20), 0);
        assert_eq!(le_u64(&bytes, 24), 128);
        assert_eq!(le_u64(&bytes, 32), 2048);
        assert_eq!(le_u64(&bytes, 40), 2176);
        assert_eq!(le_u64(&bytes, 48), 268);
        assert!(bytes[56..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_entry_parse_roundtrip() {
        let entry = sample_entry();
        let parsed = TensorEntry::parse(&entry.to_bytes().unwrap()).unwrap();
        assert_eq!(parsed, entry);
        assert_eq!(parsed.dims(), &[64, 64]);
        assert_eq!(parsed.num_elements(), Some(4096));
    }

    #[test]
    fn test_entry_rejects_shape_past_rank() {
        let mut entry = sample_entry();
        entry.shape[3] = 5;
        let err = entry.to_bytes().unwrap_err();
        assert!(err.to_string().contains("shape slot 3"));
    }

    #[test]
    fn test_entry_num_elements_overflow() {
        let mut entry = sample_entry();
        entry.rank = 4;
        entry.shape = [u32::MAX; 4];
        assert_eq!(entry.num_elements(), None);

        entry.rank = 2;
        entry.shape = [u32::MAX, u32::MAX, 0, 0];
        assert_eq!(entry.num_elements(), Some(u64::from(u32::MAX) * u64::from(u32::MAX)));
    }

    #[test]
    fn test_entry_parse_rejects_unknown_dtype() {
        let mut bytes = sample_entry().to_bytes().unwrap();
        bytes[4] = 9;
        assert!(TensorEntry::parse(&bytes).is_err());
    }

    // ==================== dtype tests ====================

    #[test]
    fn test_dtype_codes() {
        for code in 0u8..=4 {
            assert_eq!(DType::try_from(code).unwrap().code(), code);
        }
        assert!(DType::try_from(5).is_err());
    }

    #[test]
    fn test_dtype_from_str() {
        assert_eq!("nf4".parse::<DType>().unwrap(), DType::Nf4);
        assert_eq!("f16".parse::<DType>().unwrap(), DType::F16);
        let err = "NF4".parse::<DType>().unwrap_err();
        assert!(err.to_string().contains("valid"));
    }

    // ==================== NF4 aux tests ====================

    #[test]
    fn test_aux_encode_layout() {
        let header = Nf4AuxHeader::new(64, 2);
        let bytes = header.encode(&[1.5, 2.0]);

        assert_eq!(bytes.len(), 20);
        assert_eq!(&bytes[0..4], &[0, 0, 0, 0]);
        assert_eq!(le_u32(&bytes, 4), 64);
        assert_eq!(le_u32(&bytes, 8), 2);
        assert_eq!(f32::from_le_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]), 1.5);
        assert_eq!(f32::from_le_bytes([bytes[16], bytes[17], bytes[18], bytes[19]]), 2.0);
    }

    #[test]
    fn test_aux_decode_roundtrip() {
        let header = Nf4AuxHeader::new(32, 3);
        let scales = [0.5f32, 1.0, 7.25];
        let (parsed, decoded) = Nf4AuxHeader::decode(&header.encode(&scales)).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(decoded, scales);
    }

    #[test]
    fn test_aux_decode_length_mismatch() {
        let mut bytes = Nf4AuxHeader::new(32, 2).encode(&[1.0, 2.0]);
        bytes.truncate(16);
        let err = Nf4AuxHeader::decode(&bytes).unwrap_err();
        assert!(err.to_string().contains("declares 2 blocks"));
    }
}
