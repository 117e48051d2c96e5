//! Container layout builder.
//!
//! Accumulates tensor records (insertion order = table order = segment order)
//! and an optional vocab blob, then emits the NDBN byte stream. Two emitters
//! produce identical bytes:
//! - [`LayoutBuilder::finalize_to`]: placeholder header/table, stream segments
//!   forward while recording offsets, then seek back and patch. Needs `Seek`.
//! - [`LayoutBuilder::write_streaming`]: compute the plan up front and write
//!   everything in one forward pass. Works on any `Write`.

mod plan;
mod writer;


use half::f16;
use tracing::debug;

use crate::error::{Error, Result};
use crate::formats::{DType, Nf4AuxHeader, MAX_RANK};
use crate::quant::{self, QuantizedTensor};
use crate::vocab::VocabEncoding;

pub use plan::{Layout, Segment};

/// A tensor owned by the builder until the file is written.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorRecord {
    /// Source name. Not stored in the binary; kept for reporting.
    pub name: String,
    pub dtype: DType,
    pub rank: u8,
    /// Dimensions, zero past `rank`.
    pub shape: [u32; MAX_RANK],
    pub data: Vec<u8>,
    pub aux: Option<Vec<u8>>,
}

impl TensorRecord {
    pub fn dims(&self) -> &[u32] {
        &self.shape[..usize::from(self.rank)]
    }

    pub fn is_quantized(&self) -> bool {
        self.dtype.is_quantized()
    }
}

/// Builder for one NDBN file.
#[derive(Debug, Default)]
pub struct LayoutBuilder {
    tensors: Vec<TensorRecord>,
    vocab: Option<Vec<u8>>,
}

impl LayoutBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tensors added so far.
    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Records in table order.
    pub fn tensors(&self) -> &[TensorRecord] {
        &self.tensors
    }

    /// The vocab blob, if one was set.
    pub fn vocab(&self) -> Option<&[u8]> {
        self.vocab.as_deref()
    }

    /// Add a tensor with a pre-encoded payload.
    ///
    /// For unquantized dtypes the payload length must match the shape and no
    /// aux block may be given. For NF4 the caller supplies the packed codes and
    /// the aux block as-is; both are checked against the shape.
    ///
    /// # Errors
    /// - `InvalidShape` if rank is 0 or greater than 4, a dimension exceeds u32,
    ///   or the element count overflows
    /// - `ShapeMismatch` if an unquantized payload does not match the shape
    /// - `InvalidFormat` if the aux block is missing, unexpected, or disagrees
    ///   with the NF4 payload
    pub fn add_tensor(
        &mut self,
        name: impl Into<String>,
        dtype: DType,
        shape: &[usize],
        data: Vec<u8>,
        aux: Option<Vec<u8>>,
    ) -> Result<()> {
        let name = name.into();
        let (rank, fixed) = fixed_shape(&name, shape)?;
        let num_elements = element_count(&name, shape)?;

        match (dtype.element_size(), aux.as_deref()) {
            (Some(elem_size), None) => {
                let expected_bytes = num_elements.checked_mul(elem_size).ok_or_else(|| {
                    Error::invalid_shape(&name, shape.len(), "payload size overflows usize")
                })?;
                if data.len() != expected_bytes {
                    return Err(Error::ShapeMismatch {
                        name,
                        expected: num_elements,
                        actual: data.len() / elem_size,
                    });
                }
            }
            (Some(_), Some(_)) => {
                return Err(Error::invalid_format(format!(
                    "tensor '{name}': {dtype} tensors cannot carry an aux block"
                )));
            }
            (None, None) => {
                return Err(Error::invalid_format(format!(
                    "tensor '{name}': {dtype} tensors require an aux block"
                )));
            }
            (None, Some(aux)) => check_nf4_payload(&name, num_elements, &data, aux)?,
        }

        debug!(
            tensor = %name,
            dtype = %dtype,
            ?shape,
            data_bytes = data.len(),
            aux_bytes = aux.as_ref().map_or(0, Vec::len),
            "added tensor"
        );

        self.tensors.push(TensorRecord {
            name,
            dtype,
            rank,
            shape: fixed,
            data,
            aux,
        });
        Ok(())
    }

    /// Add an unquantized f32 tensor.
    pub fn add_f32(&mut self, name: impl Into<String>, shape: &[usize], values: &[f32]) -> Result<()> {
        let data = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        self.add_tensor(name, DType::F32, shape, data, None)
    }

    /// Add an unquantized tensor stored as IEEE half precision.
    pub fn add_f16(&mut self, name: impl Into<String>, shape: &[usize], values: &[f32]) -> Result<()> {
        let data = values
            .iter()
            .flat_map(|&v| f16::from_f32(v).to_le_bytes())
            .collect();
        self.add_tensor(name, DType::F16, shape, data, None)
    }

    /// Quantize `values` to NF4 and add the result.
    pub fn add_nf4(
        &mut self,
        name: impl Into<String>,
        shape: &[usize],
        values: &[f32],
        block_size: usize,
    ) -> Result<()> {
        let name = name.into();
        // Reject bad shapes before spending time quantizing
        fixed_shape(&name, shape)?;
        let quantized = quant::quantize_nf4(values, block_size)?;
        self.add_quantized(name, shape, quantized)
    }

    /// Add an already-quantized NF4 tensor, synthesizing its aux block.
    pub fn add_quantized(
        &mut self,
        name: impl Into<String>,
        shape: &[usize],
        quantized: QuantizedTensor,
    ) -> Result<()> {
        let name = name.into();
        fixed_shape(&name, shape)?;
        let expected = element_count(&name, shape)?;
        if quantized.num_elements != expected {
            return Err(Error::ShapeMismatch {
                name,
                expected,
                actual: quantized.num_elements,
            });
        }

        let aux = quantized.aux_bytes()?;
        self.add_tensor(name, DType::Nf4, shape, quantized.packed, Some(aux))
    }

    /// Set the raw vocab blob (12-byte merge triples).
    pub fn set_vocab(&mut self, blob: Vec<u8>) {
        self.vocab = Some(blob);
    }

    /// Set the vocab blob from an encoded merge table.
    pub fn set_merges(&mut self, encoding: &VocabEncoding) {
        self.set_vocab(encoding.to_bytes());
    }
}

/// Product of `shape`, rejecting counts that overflow usize.
fn element_count(name: &str, shape: &[usize]) -> Result<usize> {
    shape
        .iter()
        .try_fold(1usize, |acc, &d| acc.checked_mul(d))
        .ok_or_else(|| Error::invalid_shape(name, shape.len(), "element count overflows usize"))
}

/// Check packed NF4 codes and their aux block against the element count.
fn check_nf4_payload(name: &str, num_elements: usize, data: &[u8], aux: &[u8]) -> Result<()> {
    let (header, _) = Nf4AuxHeader::decode(aux).map_err(|e| match e {
        Error::InvalidFormat(msg) => Error::invalid_format(format!("tensor '{name}': {msg}")),
        other => other,
    })?;
    let block_size = header.block_size as usize;
    quant::check_block_size(block_size)?;

    let expected_blocks = quant::block_count(num_elements, block_size);
    if header.num_blocks as usize != expected_blocks {
        return Err(Error::invalid_format(format!(
            "tensor '{name}': aux declares {} blocks, {num_elements} elements at block size {block_size} need {expected_blocks}",
            header.num_blocks
        )));
    }

    let expected_len = quant::packed_len(num_elements, block_size);
    if data.len() != expected_len {
        return Err(Error::invalid_format(format!(
            "tensor '{name}': NF4 payload is {} bytes, expected {expected_len}",
            data.len()
        )));
    }
    Ok(())
}

/// Validate a shape and convert it to the table's zero-padded form.
fn fixed_shape(name: &str, shape: &[usize]) -> Result<(u8, [u32; MAX_RANK])> {
    let rank = shape.len();
    if rank == 0 || rank > MAX_RANK {
        return Err(Error::invalid_shape(
            name,
            rank,
            format!("rank must be between 1 and {MAX_RANK}"),
        ));
    }

    let mut fixed = [0u32; MAX_RANK];
    for (slot, &dim) in fixed.iter_mut().zip(shape) {
        *slot = u32::try_from(dim)
            .map_err(|_| Error::invalid_shape(name, rank, format!("dimension {dim} exceeds u32")))?;
    }

    Ok((rank as u8, fixed))
}
