//! Compile configuration for SafeTensors to NDBN conversion.

use anyhow::{Context, Result};
use ndbn_storage::{quant, DType, DEFAULT_BLOCK_SIZE};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Dtypes the compiler can emit.
pub const SUPPORTED_DTYPES: [DType; 3] = [DType::Nf4, DType::F32, DType::F16];

/// Configuration for compiling a model to an NDBN file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompileConfig {
    /// Elements per NF4 scale block
    #[serde(default = "default_block_size")]
    pub block_size: u32,

    /// Dtype for tensors without an override: "nf4", "f32" or "f16"
    #[serde(default = "default_dtype")]
    pub default_dtype: String,

    /// Tensors to pack. Order here is table order in the output.
    pub tensor_map: Vec<TensorMapping>,

    /// HuggingFace tokenizer.json whose merges are embedded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokenizer: Option<String>,

    /// Abort on the first malformed or unresolvable merge rule
    #[serde(default)]
    pub strict_merges: bool,

    /// Write a `<output>.json` sidecar with tensor names
    #[serde(default = "default_true")]
    pub write_manifest: bool,
}

/// One source tensor and how to store it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TensorMapping {
    /// Tensor name in the SafeTensors file
    pub source: String,

    /// Per-tensor dtype override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dtype: Option<String>,

    /// Whether to include this tensor
    #[serde(default = "default_true")]
    pub include: bool,
}

fn default_block_size() -> u32 {
    DEFAULT_BLOCK_SIZE as u32
}

fn default_dtype() -> String {
    DType::Nf4.as_str().to_string()
}

fn default_true() -> bool {
    true
}

impl Default for CompileConfig {
    fn default() -> Self {
        Self {
            block_size: default_block_size(),
            default_dtype: default_dtype(),
            tensor_map: Vec::new(),
            tokenizer: None,
            strict_merges: false,
            write_manifest: true,
        }
    }
}

impl CompileConfig {
    /// Check block size, dtype strings and duplicate sources before any work starts.
    pub fn validate(&self) -> Result<()> {
        quant::check_block_size(self.block_size as usize)
            .with_context(|| format!("Invalid block_size in config: {}", self.block_size))?;
        parse_dtype(&self.default_dtype).context("Invalid default_dtype")?;

        let mut seen = HashSet::new();
        for mapping in &self.tensor_map {
            if let Some(dtype) = &mapping.dtype {
                parse_dtype(dtype)
                    .with_context(|| format!("Invalid dtype for tensor '{}'", mapping.source))?;
            }
            if !seen.insert(mapping.source.as_str()) {
                anyhow::bail!("Tensor '{}' appears more than once in tensor_map", mapping.source);
            }
        }
        Ok(())
    }

    /// Dtype a mapping resolves to, falling back to `default_dtype`.
    pub fn dtype_for(&self, mapping: &TensorMapping) -> Result<DType> {
        parse_dtype(mapping.dtype.as_deref().unwrap_or(&self.default_dtype))
    }

    /// Mappings with `include: true`, in config order.
    pub fn included(&self) -> impl Iterator<Item = &TensorMapping> {
        self.tensor_map.iter().filter(|m| m.include)
    }
}

/// Parse a dtype string, accepting only dtypes the compiler emits.
pub fn parse_dtype(s: &str) -> Result<DType> {
    let dtype: DType = s.parse()?;
    if !SUPPORTED_DTYPES.contains(&dtype) {
        anyhow::bail!("Unsupported output dtype '{}' (valid: nf4, f32, f16)", s);
    }
    Ok(dtype)
}
