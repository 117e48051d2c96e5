//! Physical layout: where every segment of the file lands.

use crate::error::{Error, Result};
use crate::formats::{
    align_to, NdbnHeader, TensorEntry, HEADER_SIZE, SEGMENT_ALIGNMENT, TABLE_ENTRY_SIZE,
};

use super::TensorRecord;

/// A byte range in the output file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Segment {
    pub offset: u64,
    pub size: u64,
}

impl Segment {
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }
}

/// Final header, table and segment placement of one container.
#[derive(Debug, Clone, PartialEq)]
pub struct Layout {
    pub header: NdbnHeader,
    /// Table entries in insertion order.
    pub entries: Vec<TensorEntry>,
    /// Vocab blob placement, if present.
    pub vocab: Option<Segment>,
    /// Total file length in bytes.
    pub total_size: u64,
}

impl Layout {
    /// Compute the layout analytically from record sizes.
    pub(crate) fn compute(tensors: &[TensorRecord], vocab_len: Option<usize>) -> Result<Self> {
        let mut cursor = SegmentCursor::after_table(tensors.len());
        let mut entries = Vec::with_capacity(tensors.len());

        for record in tensors {
            let data = cursor.place(record.data.len() as u64);
            let aux = record.aux.as_ref().map(|aux| cursor.place(aux.len() as u64));
            entries.push(table_entry(record, data, aux));
        }

        let vocab = vocab_len.map(|len| cursor.place(len as u64));

        Ok(Self {
            header: header_for(tensors.len(), vocab)?,
            entries,
            vocab,
            total_size: cursor.position(),
        })
    }

    /// Offset of the first table entry.
    pub fn table_offset(&self) -> u64 {
        u64::from(self.header.tensor_table_offset)
    }

    /// Every data, aux and vocab segment in file order.
    pub fn segments(&self) -> Vec<Segment> {
        let mut segments = Vec::with_capacity(self.entries.len() * 2 + 1);
        for entry in &self.entries {
            segments.push(Segment {
                offset: entry.data_offset,
                size: entry.data_size,
            });
            if entry.aux_offset != 0 {
                segments.push(Segment {
                    offset: entry.aux_offset,
                    size: entry.aux_size,
                });
            }
        }
        segments.extend(self.vocab);
        segments
    }
}

/// Forward-only position tracker that hands out 64-byte aligned segments.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SegmentCursor {
    pos: u64,
}

impl SegmentCursor {
    /// Cursor positioned just past the header and a table of `tensor_count` entries.
    pub(crate) fn after_table(tensor_count: usize) -> Self {
        Self {
            pos: (HEADER_SIZE + TABLE_ENTRY_SIZE * tensor_count) as u64,
        }
    }

    pub(crate) fn position(&self) -> u64 {
        self.pos
    }

    /// Zero bytes needed to reach the next segment boundary.
    pub(crate) fn padding(&self) -> u64 {
        align_to(self.pos, SEGMENT_ALIGNMENT as u64) - self.pos
    }

    /// Align, then claim `size` bytes.
    pub(crate) fn place(&mut self, size: u64) -> Segment {
        self.pos += self.padding();
        let segment = Segment {
            offset: self.pos,
            size,
        };
        self.pos += size;
        segment
    }
}

/// Header for a file with `tensor_count` tensors and the given vocab placement.
pub(crate) fn header_for(tensor_count: usize, vocab: Option<Segment>) -> Result<NdbnHeader> {
    let count = u32::try_from(tensor_count)
        .map_err(|_| Error::LayoutOverflow(format!("{tensor_count} tensors exceed u32")))?;
    Ok(NdbnHeader::new(
        count,
        HEADER_SIZE as u32,
        vocab.map_or(0, |v| v.offset),
    ))
}

/// Table entry for a record placed at `data` (and `aux`, if any).
pub(crate) fn table_entry(record: &TensorRecord, data: Segment, aux: Option<Segment>) -> TensorEntry {
    let aux = aux.unwrap_or_default();
    TensorEntry {
        name_offset: 0,
        dtype: record.dtype,
        rank: record.rank,
        layout: 0,
        is_quantized: record.is_quantized(),
        shape: record.shape,
        data_offset: data.offset,
        data_size: data.size,
        aux_offset: aux.offset,
        aux_size: aux.size,
    }
}
