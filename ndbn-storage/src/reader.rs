//! Zero-copy reader and validator for NDBN files.
//!
//! [`NdbnFile`] borrows a byte slice (usually a memory map) and checks every
//! structural rule a loader depends on before handing out tensor slices.
//! [`MappedNdbn`] owns the map.

use std::fs::File;
use std::path::{Path, PathBuf};

use half::{bf16, f16};
use memmap2::Mmap;
use tracing::debug;

use crate::error::{Error, Result};
use crate::formats::{
    DType, NdbnHeader, Nf4AuxHeader, TensorEntry, HEADER_SIZE, MERGE_TRIPLE_SIZE,
    SEGMENT_ALIGNMENT, TABLE_ENTRY_SIZE,
};
use crate::layout::Segment;
use crate::quant;
use crate::vocab::{parse_merge_blob, MergeTriple};

/// A validated view of one NDBN container.
#[derive(Debug, Clone)]
pub struct NdbnFile<'a> {
    bytes: &'a [u8],
    header: NdbnHeader,
    entries: Vec<TensorEntry>,
}

impl<'a> NdbnFile<'a> {
    /// Parse and validate a complete container.
    ///
    /// Checks magic and version, that the table and every segment lie inside
    /// the buffer, that segments are 64-byte aligned, sit past the table and do
    /// not overlap, that shape slots past rank are zero, and that the vocab
    /// blob (offset to end of file) is a whole number of merge triples.
    pub fn parse(bytes: &'a [u8]) -> Result<Self> {
        let header = NdbnHeader::parse(bytes)?;
        let file_len = bytes.len() as u64;

        let table_offset = u64::from(header.tensor_table_offset);
        if table_offset < HEADER_SIZE as u64 {
            return Err(Error::invalid_format(format!(
                "tensor table offset {table_offset} overlaps the header"
            )));
        }
        let table_end = u64::from(header.tensor_count)
            .checked_mul(TABLE_ENTRY_SIZE as u64)
            .and_then(|len| len.checked_add(table_offset))
            .filter(|&end| end <= file_len)
            .ok_or_else(|| {
                Error::invalid_format(format!(
                    "tensor table of {} entries at {table_offset} runs past end of file ({file_len} bytes)",
                    header.tensor_count
                ))
            })?;

        let mut entries = Vec::with_capacity(header.tensor_count as usize);
        let mut segments = Vec::new();
        for index in 0..header.tensor_count as usize {
            let at = table_offset as usize + index * TABLE_ENTRY_SIZE;
            let entry =
                TensorEntry::parse(&bytes[at..at + TABLE_ENTRY_SIZE]).map_err(|e| match e {
                    Error::InvalidFormat(msg) => Error::invalid_format(format!("tensor {index}: {msg}")),
                    other => other,
                })?;
            check_entry(index, &entry)?;

            let data = Segment {
                offset: entry.data_offset,
                size: entry.data_size,
            };
            check_segment(&format!("tensor {index} data"), data, table_end, file_len)?;
            segments.push((format!("tensor {index} data"), data));

            if entry.is_quantized {
                let aux = Segment {
                    offset: entry.aux_offset,
                    size: entry.aux_size,
                };
                check_segment(&format!("tensor {index} aux"), aux, table_end, file_len)?;
                segments.push((format!("tensor {index} aux"), aux));
            }
            entries.push(entry);
        }

        if header.has_vocab() {
            let offset = header.vocab_table_offset;
            if offset > file_len {
                return Err(Error::invalid_format(format!(
                    "vocab offset {offset} past end of file ({file_len} bytes)"
                )));
            }
            let vocab = Segment {
                offset,
                size: file_len - offset,
            };
            check_segment("vocab", vocab, table_end, file_len)?;
            if vocab.size % MERGE_TRIPLE_SIZE as u64 != 0 {
                return Err(Error::invalid_format(format!(
                    "vocab blob is {} bytes, not a multiple of {MERGE_TRIPLE_SIZE}",
                    vocab.size
                )));
            }
            segments.push(("vocab".to_string(), vocab));
        }

        segments.sort_by_key(|(_, s)| (s.offset, s.size));
        for pair in segments.windows(2) {
            let (prev_name, prev) = &pair[0];
            let (next_name, next) = &pair[1];
            if prev.end() > next.offset {
                return Err(Error::invalid_format(format!(
                    "{prev_name} [{}..{}) overlaps {next_name} at {}",
                    prev.offset,
                    prev.end(),
                    next.offset
                )));
            }
        }

        debug!(
            tensors = entries.len(),
            vocab = header.has_vocab(),
            bytes = file_len,
            "validated NDBN container"
        );

        Ok(Self {
            bytes,
            header,
            entries,
        })
    }

    pub fn header(&self) -> &NdbnHeader {
        &self.header
    }

    /// Table entries in file order.
    pub fn entries(&self) -> &[TensorEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whole file.
    pub fn as_bytes(&self) -> &'a [u8] {
        self.bytes
    }

    pub fn entry(&self, index: usize) -> Result<&TensorEntry> {
        self.entries.get(index).ok_or_else(|| {
            Error::invalid_format(format!(
                "tensor index {index} out of range ({} tensors)",
                self.entries.len()
            ))
        })
    }

    /// Payload bytes of tensor `index`.
    pub fn tensor_data(&self, index: usize) -> Result<&'a [u8]> {
        let entry = self.entry(index)?;
        Ok(self.slice(entry.data_offset, entry.data_size))
    }

    /// Aux bytes of tensor `index`, `None` for unquantized tensors.
    pub fn tensor_aux(&self, index: usize) -> Result<Option<&'a [u8]>> {
        let entry = self.entry(index)?;
        if !entry.is_quantized {
            return Ok(None);
        }
        Ok(Some(self.slice(entry.aux_offset, entry.aux_size)))
    }

    /// Decoded NF4 aux block of tensor `index`.
    pub fn nf4_aux(&self, index: usize) -> Result<(Nf4AuxHeader, Vec<f32>)> {
        match self.tensor_aux(index)? {
            Some(aux) => Nf4AuxHeader::decode(aux),
            None => Err(Error::invalid_format(format!("tensor {index} is not quantized"))),
        }
    }

    /// Raw vocab blob, if present.
    pub fn vocab(&self) -> Option<&'a [u8]> {
        self.header
            .has_vocab()
            .then(|| &self.bytes[self.header.vocab_table_offset as usize..])
    }

    /// Decoded merge triples; empty when the file carries no vocab.
    pub fn merge_triples(&self) -> Result<Vec<MergeTriple>> {
        match self.vocab() {
            Some(blob) => parse_merge_blob(blob),
            None => Ok(Vec::new()),
        }
    }

    /// Decode tensor `index` to f32 values in row-major order.
    pub fn dequantize(&self, index: usize) -> Result<Vec<f32>> {
        let entry = self.entry(index)?;
        let data = self.tensor_data(index)?;
        let num_elements = entry
            .num_elements()
            .and_then(|n| usize::try_from(n).ok())
            .ok_or_else(|| Error::LayoutOverflow(format!("tensor {index} too large to decode")))?;

        let values: Vec<f32> = match entry.dtype {
            DType::F32 => data
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
            DType::F16 => data
                .chunks_exact(2)
                .map(|c| f16::from_le_bytes([c[0], c[1]]).to_f32())
                .collect(),
            DType::Bf16 => data
                .chunks_exact(2)
                .map(|c| bf16::from_le_bytes([c[0], c[1]]).to_f32())
                .collect(),
            DType::I8 => data.iter().map(|&b| f32::from(b as i8)).collect(),
            DType::Nf4 => {
                let (aux, scales) = self.nf4_aux(index)?;
                return quant::dequantize_nf4(data, &scales, aux.block_size as usize, num_elements);
            }
        };

        if values.len() != num_elements {
            return Err(Error::invalid_format(format!(
                "tensor {index} holds {} values, shape implies {num_elements}",
                values.len()
            )));
        }
        Ok(values)
    }

    fn slice(&self, offset: u64, size: u64) -> &'a [u8] {
        // Bounds were checked in parse
        &self.bytes[offset as usize..(offset + size) as usize]
    }
}

fn check_entry(index: usize, entry: &TensorEntry) -> Result<()> {
    let Some(num_elements) = entry.num_elements() else {
        return Err(Error::invalid_format(format!(
            "tensor {index}: element count of shape {:?} overflows u64",
            entry.dims()
        )));
    };
    if entry.is_quantized != entry.dtype.is_quantized() {
        return Err(Error::invalid_format(format!(
            "tensor {index}: is_quantized={} disagrees with dtype {}",
            entry.is_quantized, entry.dtype
        )));
    }
    if !entry.is_quantized && (entry.aux_offset != 0 || entry.aux_size != 0) {
        return Err(Error::invalid_format(format!(
            "tensor {index}: unquantized tensor declares an aux block"
        )));
    }
    if let Some(elem_size) = entry.dtype.element_size() {
        let expected = num_elements.checked_mul(elem_size as u64);
        if expected != Some(entry.data_size) {
            return Err(Error::invalid_format(format!(
                "tensor {index}: {} payload of {} bytes does not match shape {:?}",
                entry.dtype,
                entry.data_size,
                entry.dims()
            )));
        }
    }
    Ok(())
}

fn check_segment(what: &str, segment: Segment, table_end: u64, file_len: u64) -> Result<()> {
    if segment.offset % SEGMENT_ALIGNMENT as u64 != 0 {
        return Err(Error::invalid_format(format!(
            "{what} offset {} is not {SEGMENT_ALIGNMENT}-byte aligned",
            segment.offset
        )));
    }
    if segment.offset < table_end {
        return Err(Error::invalid_format(format!(
            "{what} offset {} overlaps the tensor table (ends at {table_end})",
            segment.offset
        )));
    }
    match segment.offset.checked_add(segment.size) {
        Some(end) if end <= file_len => Ok(()),
        _ => Err(Error::invalid_format(format!(
            "{what} [{}, +{}) runs past end of file ({file_len} bytes)",
            segment.offset, segment.size
        ))),
    }
}

/// Memory-mapped NDBN file, validated on open.
#[derive(Debug)]
pub struct MappedNdbn {
    mmap: Mmap,
    path: PathBuf,
}

impl MappedNdbn {
    /// Map `path` read-only and validate its structure.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)?;

        // SAFETY: The file is opened read-only and only ever read through the
        // map. Truncating it externally while mapped is outside our control.
        let mmap = unsafe { Mmap::map(&file)? };

        NdbnFile::parse(&mmap)?;
        Ok(Self {
            mmap,
            path: path.to_path_buf(),
        })
    }

    /// Validated view over the mapped bytes.
    pub fn file(&self) -> Result<NdbnFile<'_>> {
        NdbnFile::parse(&self.mmap)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// File size in bytes.
    pub fn file_size(&self) -> usize {
        self.mmap.len()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.mmap
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::LayoutBuilder;
    use crate::vocab::{encode_merges, MergeTriple};
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn sample_file() -> Vec<u8> {
        let mut builder = LayoutBuilder::new();
        builder
            .add_f32("embed", &[2, 3], &[1.0, -2.0, 3.5, 0.0, 4.25, -1.5])
            .unwrap();
        let weights: Vec<f32> = (0..100).map(|i| (i as f32 - 50.0) / 7.0).collect();
        builder.add_nf4("proj", &[10, 10], &weights, 32).unwrap();
        builder.add_f16("norm", &[4], &[1.0, 0.5, -0.25, 2.0]).unwrap();

        let vocab: HashMap<String, u32> = [("a", 0), ("b", 1), ("ab", 2)]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        let merges = encode_merges(["a b", "ab b"], &vocab).unwrap();
        builder.set_merges(&merges);
        builder.finalize().unwrap()
    }

    fn put_u64(bytes: &mut [u8], at: usize, value: u64) {
        bytes[at..at + 8].copy_from_slice(&value.to_le_bytes());
    }

    // ==================== parse tests ====================

    #[test]
    fn test_parse_valid_file() {
        let bytes = sample_file();
        let file = NdbnFile::parse(&bytes).unwrap();

        assert_eq!(file.len(), 3);
        assert_eq!(file.header().tensor_count, 3);
        assert_eq!(file.entries()[0].dtype, DType::F32);
        assert_eq!(file.entries()[1].dtype, DType::Nf4);
        assert_eq!(file.entries()[2].dtype, DType::F16);
        assert!(file.tensor_aux(0).unwrap().is_none());
        assert!(file.tensor_aux(1).unwrap().is_some());
    }

    #[test]
    fn test_parse_empty_container() {
        let bytes = LayoutBuilder::new().finalize().unwrap();
        let file = NdbnFile::parse(&bytes).unwrap();
        assert!(file.is_empty());
        assert!(file.vocab().is_none());
        assert!(file.merge_triples().unwrap().is_empty());
    }

    #[test]
    fn test_rejects_bad_magic() {
        let mut bytes = sample_file();
        bytes[0] ^= 0xFF;
        let err = NdbnFile::parse(&bytes).unwrap_err();
        assert!(err.to_string().contains("magic"));
    }

    #[test]
    fn test_rejects_truncated_table() {
        let bytes = sample_file();
        let err = NdbnFile::parse(&bytes[..100]).unwrap_err();
        assert!(err.to_string().contains("tensor table"));
    }

    #[test]
    fn test_rejects_segment_past_eof() {
        let mut bytes = sample_file();
        // data_size of tensor 0
        put_u64(&mut bytes, HEADER_SIZE + 32, 1 << 40);
        assert!(NdbnFile::parse(&bytes).is_err());
    }

    #[test]
    fn test_rejects_misaligned_segment() {
        let mut bytes = sample_file();
        let file = NdbnFile::parse(&bytes).unwrap();
        let offset = file.entries()[1].data_offset;
        put_u64(&mut bytes, HEADER_SIZE + TABLE_ENTRY_SIZE + 24, offset + 4);

        let err = NdbnFile::parse(&bytes).unwrap_err();
        assert!(err.to_string().contains("aligned"));
    }

    #[test]
    fn test_rejects_overlapping_segments() {
        let mut bytes = sample_file();
        let file = NdbnFile::parse(&bytes).unwrap();
        let first = file.entries()[0].data_offset;
        // Point the NF4 aux block at tensor 0's data
        put_u64(&mut bytes, HEADER_SIZE + TABLE_ENTRY_SIZE + 40, first);

        let err = NdbnFile::parse(&bytes).unwrap_err();
        assert!(err.to_string().contains("overlaps"));
    }

    #[test]
    fn test_rejects_shape_past_rank() {
        let mut bytes = sample_file();
        // shape[3] of tensor 0, which has rank 2
        bytes[HEADER_SIZE + 20] = 1;
        let err = NdbnFile::parse(&bytes).unwrap_err();
        assert!(err.to_string().contains("shape slot 3"));
    }

    #[test]
    fn test_rejects_element_count_overflow() {
        let mut bytes = sample_file();
        bytes[HEADER_SIZE + 5] = 4;
        bytes[HEADER_SIZE + 8..HEADER_SIZE + 24].fill(0xFF);

        let err = NdbnFile::parse(&bytes).unwrap_err();
        assert!(matches!(err, Error::InvalidFormat(_)));
        assert!(err.to_string().contains("overflows u64"));
    }

    #[test]
    fn test_rejects_ragged_vocab() {
        let mut bytes = sample_file();
        bytes.push(0);
        let err = NdbnFile::parse(&bytes).unwrap_err();
        assert!(err.to_string().contains("multiple of 12"));
    }

    #[test]
    fn test_rejects_quantized_flag_mismatch() {
        let mut bytes = sample_file();
        bytes[HEADER_SIZE + 7] = 1;
        let err = NdbnFile::parse(&bytes).unwrap_err();
        assert!(err.to_string().contains("disagrees"));
    }

    // ==================== accessor tests ====================

    #[test]
    fn test_dequantize_raw_tensors() {
        let bytes = sample_file();
        let file = NdbnFile::parse(&bytes).unwrap();

        assert_eq!(file.dequantize(0).unwrap(), vec![1.0, -2.0, 3.5, 0.0, 4.25, -1.5]);
        assert_eq!(file.dequantize(2).unwrap(), vec![1.0, 0.5, -0.25, 2.0]);
    }

    #[test]
    fn test_dequantize_nf4_tensor() {
        let bytes = sample_file();
        let file = NdbnFile::parse(&bytes).unwrap();

        let (aux, scales) = file.nf4_aux(1).unwrap();
        assert_eq!(aux.block_size, 32);
        assert_eq!(aux.num_blocks, 4);
        assert_eq!(scales.len(), 4);

        let values = file.dequantize(1).unwrap();
        assert_eq!(values.len(), 100);
        for (i, v) in values.iter().enumerate() {
            let original = (i as f32 - 50.0) / 7.0;
            let scale = scales[i / 32];
            assert!((v - original).abs() <= scale * 0.25 + 1e-5, "element {i}");
        }
    }

    #[test]
    fn test_merge_triples() {
        let bytes = sample_file();
        let file = NdbnFile::parse(&bytes).unwrap();
        assert_eq!(
            file.merge_triples().unwrap(),
            vec![MergeTriple::new(0, 1, 0), MergeTriple::new(2, 1, 1)]
        );
    }

    #[test]
    fn test_entry_out_of_range() {
        let bytes = sample_file();
        let file = NdbnFile::parse(&bytes).unwrap();
        assert!(file.tensor_data(3).is_err());
        assert!(file.nf4_aux(0).is_err());
    }

    // ==================== MappedNdbn tests ====================

    #[test]
    fn test_mapped_open() {
        let mut tmp = NamedTempFile::new().unwrap();
        let bytes = sample_file();
        tmp.write_all(&bytes).unwrap();
        tmp.flush().unwrap();

        let mapped = MappedNdbn::open(tmp.path()).unwrap();
        assert_eq!(mapped.file_size(), bytes.len());
        assert_eq!(mapped.as_bytes(), &bytes[..]);

        let file = mapped.file().unwrap();
        assert_eq!(file.len(), 3);
        assert_eq!(file.dequantize(0).unwrap()[2], 3.5);
    }

    #[test]
    fn test_mapped_open_rejects_garbage() {
        let mut tmp = NamedTempFile::new().unwrap();
        tmp.write_all(&[0xAB; 64]).unwrap();
        tmp.flush().unwrap();
        assert!(MappedNdbn::open(tmp.path()).is_err());
    }

    #[test]
    fn test_mapped_open_missing_file() {
        let err = MappedNdbn::open("/nonexistent/model.nbbin").unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }
}
