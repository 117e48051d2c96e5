//! Emitting a finished layout to a sink.

use std::fs;
use std::io::{BufWriter, Cursor, Seek, SeekFrom, Write};
use std::path::Path;

use tempfile::NamedTempFile;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::formats::{HEADER_SIZE, SEGMENT_ALIGNMENT, TABLE_ENTRY_SIZE};
use crate::reader::MappedNdbn;

use super::plan::{header_for, table_entry, Layout, SegmentCursor};
use super::LayoutBuilder;

const ZERO_PAD: [u8; SEGMENT_ALIGNMENT] = [0u8; SEGMENT_ALIGNMENT];

impl LayoutBuilder {
    /// Compute the final layout without writing anything.
    pub fn plan(&self) -> Result<Layout> {
        Layout::compute(&self.tensors, self.vocab.as_ref().map(Vec::len))
    }

    /// Two-pass emit into a seekable sink positioned at offset 0.
    ///
    /// Writes zeroed header and table placeholders, streams every segment
    /// forward while recording where it landed, then rewinds to patch the
    /// header and the table. The sink is left positioned at end of file.
    pub fn finalize_to<W: Write + Seek>(&self, w: &mut W) -> Result<Layout> {
        // 1. Placeholders
        w.write_all(&[0u8; HEADER_SIZE])?;
        let table_offset = HEADER_SIZE as u64;
        for _ in &self.tensors {
            w.write_all(&[0u8; TABLE_ENTRY_SIZE])?;
        }

        // 2. Data and aux segments, offsets discovered as we go
        let mut cursor = SegmentCursor::after_table(self.tensors.len());
        let mut entries = Vec::with_capacity(self.tensors.len());
        for record in &self.tensors {
            let data = write_segment(w, &mut cursor, &record.data)?;
            let aux = match &record.aux {
                Some(aux) => Some(write_segment(w, &mut cursor, aux)?),
                None => None,
            };
            debug!(
                tensor = %record.name,
                data_offset = data.offset,
                data_size = data.size,
                aux_offset = aux.map_or(0, |a| a.offset),
                "wrote tensor segments"
            );
            entries.push(table_entry(record, data, aux));
        }

        // 3. Vocab
        let vocab = match &self.vocab {
            Some(blob) => Some(write_segment(w, &mut cursor, blob)?),
            None => None,
        };
        let total_size = cursor.position();

        // 4. Patch header
        let header = header_for(self.tensors.len(), vocab)?;
        w.seek(SeekFrom::Start(0))?;
        header.write_to(w)?;

        // 5. Patch table
        w.seek(SeekFrom::Start(table_offset))?;
        for entry in &entries {
            w.write_all(&entry.to_bytes()?)?;
        }

        w.seek(SeekFrom::Start(total_size))?;
        w.flush()?;

        info!(
            tensors = entries.len(),
            vocab = vocab.is_some(),
            bytes = total_size,
            "finalized NDBN container"
        );

        Ok(Layout {
            header,
            entries,
            vocab,
            total_size,
        })
    }

    /// Emit into an in-memory buffer.
    pub fn finalize(&self) -> Result<Vec<u8>> {
        let mut cursor = Cursor::new(Vec::new());
        self.finalize_to(&mut cursor)?;
        Ok(cursor.into_inner())
    }

    /// Single forward pass for sinks that cannot seek.
    ///
    /// Offsets come from [`LayoutBuilder::plan`]; output is byte-identical to
    /// [`LayoutBuilder::finalize_to`].
    pub fn write_streaming<W: Write>(&self, w: &mut W) -> Result<Layout> {
        let layout = self.plan()?;

        layout.header.write_to(w)?;
        for entry in &layout.entries {
            w.write_all(&entry.to_bytes()?)?;
        }

        let mut cursor = SegmentCursor::after_table(self.tensors.len());
        for record in &self.tensors {
            write_segment(w, &mut cursor, &record.data)?;
            if let Some(aux) = &record.aux {
                write_segment(w, &mut cursor, aux)?;
            }
        }
        if let Some(blob) = &self.vocab {
            write_segment(w, &mut cursor, blob)?;
        }
        debug_assert_eq!(cursor.position(), layout.total_size);

        w.flush()?;
        Ok(layout)
    }

    /// Write the container to `path` atomically.
    ///
    /// The file is built in a temporary sibling and renamed over `path` only
    /// after every byte is written, synced and re-validated through
    /// [`MappedNdbn`]. On failure `path` is untouched.
    pub fn write_to_path(&self, path: &Path) -> Result<Layout> {
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir)?;

        let mut tmp = NamedTempFile::new_in(dir)?;
        let layout = {
            let mut writer = BufWriter::new(tmp.as_file_mut());
            let layout = self.finalize_to(&mut writer)?;
            writer.flush()?;
            layout
        };
        tmp.as_file().sync_all()?;

        // Map dropped before the rename
        let mapped = MappedNdbn::open(tmp.path())?;
        debug!(bytes = mapped.file_size(), "validated temporary output");
        drop(mapped);

        tmp.persist(path).map_err(|e| Error::Io(e.error))?;

        info!(path = %path.display(), bytes = layout.total_size, "published NDBN file");
        Ok(layout)
    }
}

/// Pad to the next segment boundary, then write `bytes`.
fn write_segment<W: Write>(
    w: &mut W,
    cursor: &mut SegmentCursor,
    bytes: &[u8],
) -> Result<super::Segment> {
    let padding = cursor.padding() as usize;
    w.write_all(&ZERO_PAD[..padding])?;
    w.write_all(bytes)?;
    Ok(cursor.place(bytes.len() as u64))
}
