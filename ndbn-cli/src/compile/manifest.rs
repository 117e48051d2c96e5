//! Name sidecar written next to the compiled file.
//!
//! The binary table has no string pool, so tensor names and the merge skip
//! report live here, keyed by table index.

use anyhow::{Context, Result};
use ndbn_storage::{Layout, TensorRecord, VocabEncoding};
use serde::Serialize;
use std::fs;
use std::path::Path;

#[derive(Debug, Serialize)]
pub struct Manifest {
    pub file: String,
    pub total_bytes: u64,
    pub tensors: Vec<ManifestTensor>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vocab: Option<ManifestVocab>,
}

#[derive(Debug, Serialize)]
pub struct ManifestTensor {
    pub index: usize,
    pub name: String,
    pub dtype: String,
    pub shape: Vec<u32>,
    pub data_offset: u64,
    pub data_size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aux_offset: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aux_size: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct ManifestVocab {
    pub offset: u64,
    pub merges: usize,
    /// One line per skipped rule.
    pub skipped: Vec<String>,
}

impl Manifest {
    pub fn new(
        file: &Path,
        records: &[TensorRecord],
        layout: &Layout,
        merges: Option<&VocabEncoding>,
    ) -> Self {
        let tensors = records
            .iter()
            .zip(&layout.entries)
            .enumerate()
            .map(|(index, (record, entry))| ManifestTensor {
                index,
                name: record.name.clone(),
                dtype: entry.dtype.to_string(),
                shape: entry.dims().to_vec(),
                data_offset: entry.data_offset,
                data_size: entry.data_size,
                aux_offset: entry.is_quantized.then_some(entry.aux_offset),
                aux_size: entry.is_quantized.then_some(entry.aux_size),
            })
            .collect();

        let vocab = layout.vocab.zip(merges).map(|(segment, encoding)| ManifestVocab {
            offset: segment.offset,
            merges: encoding.triples.len(),
            skipped: encoding.skipped.iter().map(ToString::to_string).collect(),
        });

        Self {
            file: file.display().to_string(),
            total_bytes: layout.total_size,
            tensors,
            vocab,
        }
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json).with_context(|| format!("Failed to write manifest: {}", path.display()))
    }
}
