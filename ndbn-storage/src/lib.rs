//! NDBN Storage - NF4 quantization and container layout for mmap loaders.
//!
//! Packs model tensors and a BPE merge table into a single little-endian file
//! that a runtime can memory-map and index without parsing.
//!
//! # Components
//! - `quant`: blockwise NF4 quantizer (one f32 scale per block, 4-bit codes)
//! - `layout`: builder that places header, tensor table and 64-byte aligned segments
//! - `vocab`: merge rule encoder producing `(id_a, id_b, rank)` triples
//! - `reader`: zero-copy validator used to verify written files
//!
//! # Usage
//! ```ignore
//! use ndbn_storage::{LayoutBuilder, encode_merges};
//!
//! let mut builder = LayoutBuilder::new();
//! builder.add_nf4("layers.0.wq", &[64, 64], &weights, 64)?;
//! builder.add_f32("norm", &[64], &norm)?;
//!
//! let merges = encode_merges(["a b", "ab c"], &vocab)?;
//! builder.set_merges(&merges);
//! builder.write_to_path(Path::new("model.nbbin"))?;
//! ```

pub mod codebook;
pub mod error;
pub mod formats;
pub mod layout;
pub mod quant;
pub mod reader;
pub mod vocab;

// Re-exports
pub use error::{Error, MergeRuleError, Result};
pub use formats::{
    DType, NdbnHeader, Nf4AuxHeader, TensorEntry, DEFAULT_BLOCK_SIZE, HEADER_SIZE, NDBN_MAGIC,
    NDBN_VERSION, SEGMENT_ALIGNMENT, TABLE_ENTRY_SIZE,
};
pub use layout::{Layout, LayoutBuilder, Segment, TensorRecord};
pub use quant::{dequantize_nf4, quantize_nf4, QuantizedTensor};
pub use reader::{MappedNdbn, NdbnFile};
pub use vocab::{
    encode_merges, encode_merges_strict, parse_merge_blob, FnResolver, MergeTriple,
    SymbolResolver, VocabEncoding,
};
