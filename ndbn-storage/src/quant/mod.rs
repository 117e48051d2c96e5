//! NF4 block quantization.
//!
//! Tensors are flattened row-major and split into fixed-size blocks. Each block
//! stores one f32 scale (its max absolute value, or 1.0 if the block is all zero)
//! and one 4-bit codebook index per element, packed two per byte with the even
//! element in the low nibble.
//!
//! The final block is zero-padded to full length before encoding, so the packed
//! payload always covers `num_blocks * block_size` codes. Consumers recover the
//! true element count from the tensor shape.

mod pack;


use crate::codebook::{self, NF4_ZERO_INDEX};
use crate::error::{Error, Result};
use crate::formats::Nf4AuxHeader;

pub use pack::{pack_nibble_pair, unpack_nibbles};

/// Packed NF4 payload plus its per-block scales.
#[derive(Debug, Clone, PartialEq)]
pub struct QuantizedTensor {
    /// Two codes per byte, `ceil(num_blocks * block_size / 2)` bytes.
    pub packed: Vec<u8>,
    /// One scale per block.
    pub scales: Vec<f32>,
    /// Elements per block (even).
    pub block_size: usize,
    /// Unpadded element count of the source tensor.
    pub num_elements: usize,
}

impl QuantizedTensor {
    /// Number of quantization blocks.
    pub fn num_blocks(&self) -> usize {
        self.scales.len()
    }

    /// Aux block header describing this tensor's scales.
    pub fn aux_header(&self) -> Result<Nf4AuxHeader> {
        let block_size = u32::try_from(self.block_size)
            .map_err(|_| Error::InvalidBlockSize(self.block_size))?;
        let num_blocks = u32::try_from(self.scales.len()).map_err(|_| {
            Error::LayoutOverflow(format!("{} NF4 blocks exceed u32", self.scales.len()))
        })?;
        Ok(Nf4AuxHeader::new(block_size, num_blocks))
    }

    /// Serialized aux payload: header prefix followed by little-endian f32 scales.
    pub fn aux_bytes(&self) -> Result<Vec<u8>> {
        Ok(self.aux_header()?.encode(&self.scales))
    }

    /// Decode back to f32 values (unpadded).
    pub fn dequantize(&self) -> Result<Vec<f32>> {
        dequantize_nf4(&self.packed, &self.scales, self.block_size, self.num_elements)
    }
}

/// Validate an NF4 block size.
pub fn check_block_size(block_size: usize) -> Result<()> {
    if block_size == 0 || block_size % 2 != 0 || u32::try_from(block_size).is_err() {
        return Err(Error::InvalidBlockSize(block_size));
    }
    Ok(())
}

/// Number of blocks needed to cover `num_elements`.
#[inline]
pub fn block_count(num_elements: usize, block_size: usize) -> usize {
    num_elements.div_ceil(block_size)
}

/// Packed payload length for `num_elements` at `block_size`.
#[inline]
pub fn packed_len(num_elements: usize, block_size: usize) -> usize {
    (block_count(num_elements, block_size) * block_size).div_ceil(2)
}

/// Quantize a flattened tensor to NF4.
///
/// # Errors
/// - `InvalidBlockSize` if `block_size` is zero or odd
/// - `NonFiniteValue` if any input is NaN or infinite
pub fn quantize_nf4(values: &[f32], block_size: usize) -> Result<QuantizedTensor> {
    check_block_size(block_size)?;

    if let Some(index) = values.iter().position(|v| !v.is_finite()) {
        return Err(Error::NonFiniteValue { index });
    }

    let num_blocks = block_count(values.len(), block_size);
    let mut packed = vec![0u8; packed_len(values.len(), block_size)];
    let mut scales = Vec::with_capacity(num_blocks);
    let mut codes = vec![NF4_ZERO_INDEX; block_size];

    for (block_idx, block) in values.chunks(block_size).enumerate() {
        let scale = block_scale(block);
        scales.push(scale);

        // Tail positions keep the zero code: padding encodes as exact 0.0
        codes.fill(NF4_ZERO_INDEX);
        for (code, &value) in codes.iter_mut().zip(block) {
            *code = codebook::nearest_index(value / scale);
        }

        let out = &mut packed[block_idx * block_size / 2..(block_idx + 1) * block_size / 2];
        for (byte, pair) in out.iter_mut().zip(codes.chunks_exact(2)) {
            *byte = pack_nibble_pair(pair[0], pair[1]);
        }
    }

    Ok(QuantizedTensor {
        packed,
        scales,
        block_size,
        num_elements: values.len(),
    })
}

/// Block scale: max absolute value, floored to 1.0 for an all-zero block.
#[inline]
fn block_scale(block: &[f32]) -> f32 {
    let max_abs = block.iter().fold(0.0f32, |acc, v| acc.max(v.abs()));
    if max_abs == 0.0 { 1.0 } else { max_abs }
}

/// Decode NF4 codes with their block scales.
///
/// Returns exactly `num_elements` values; trailing padding codes are dropped.
pub fn dequantize_nf4(
    packed: &[u8],
    scales: &[f32],
    block_size: usize,
    num_elements: usize,
) -> Result<Vec<f32>> {
    check_block_size(block_size)?;

    let num_blocks = block_count(num_elements, block_size);
    if scales.len() != num_blocks {
        return Err(Error::invalid_format(format!(
            "{num_elements} elements at block size {block_size} need {num_blocks} scales, got {}",
            scales.len()
        )));
    }
    let expected_len = packed_len(num_elements, block_size);
    if packed.len() != expected_len {
        return Err(Error::invalid_format(format!(
            "NF4 payload is {} bytes, expected {expected_len}",
            packed.len()
        )));
    }

    let mut out = Vec::with_capacity(num_elements);
    for (i, code) in unpack_nibbles(packed).take(num_elements).enumerate() {
        out.push(codebook::level(code) * scales[i / block_size]);
    }
    Ok(out)
}
