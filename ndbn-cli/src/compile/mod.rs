//! Compile module - SafeTensors to NDBN conversion.
//!
//! Tensors are read in `tensor_map` order, converted to f32, encoded to the
//! requested dtype and handed to the layout builder. The finished file is
//! validated and then published atomically, before the manifest sidecar is
//! written.

mod manifest;

use anyhow::{Context, Result};
use ndbn_storage::{encode_merges, encode_merges_strict, DType, LayoutBuilder, VocabEncoding};
use safetensors::SafeTensors;
use safetensors::tensor::TensorView;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::common::{bytes_to_f32, discover_model_shards, load_json_config, manifest_path};
use crate::config::compile_config::{CompileConfig, TensorMapping};
use crate::tokens::parse_hf_tokenizer;

pub use manifest::Manifest;

const CONFIG_NAME: &str = "compile_config.json";
const DEFAULT_OUTPUT: &str = "model.nbbin";

/// Generate a compile config template from a model file or folder.
pub fn generate_config_template(model_path: &str) -> Result<()> {
    let files = discover_model_shards(Path::new(model_path))?;
    println!("Found {} safetensors file(s)", files.len());

    let config = build_config_template(&files)?;

    let json = serde_json::to_string_pretty(&config)?;
    fs::write(CONFIG_NAME, json).with_context(|| format!("Failed to write {}", CONFIG_NAME))?;

    println!("\n=== Generated {} ===", CONFIG_NAME);
    println!("Tensors: {}", config.tensor_map.len());
    println!("\nEdit the config, then run:");
    println!("  nc compile --model {} --config {}", model_path, CONFIG_NAME);

    Ok(())
}

/// Template listing every tensor in sorted name order, all included.
fn build_config_template(files: &[PathBuf]) -> Result<CompileConfig> {
    let mut tensors: Vec<(String, Vec<usize>)> = Vec::new();
    for file_path in files {
        let data = fs::read(file_path)
            .with_context(|| format!("Failed to read: {}", file_path.display()))?;
        let st = SafeTensors::deserialize(&data)
            .with_context(|| format!("Failed to parse: {}", file_path.display()))?;

        tensors.extend(
            st.tensors()
                .into_iter()
                .map(|(name, view)| (name, view.shape().to_vec())),
        );
    }
    tensors.sort_by(|a, b| a.0.cmp(&b.0));

    let tensor_map = tensors
        .into_iter()
        .map(|(name, shape)| {
            println!("  - {} (shape: {:?})", name, shape);
            TensorMapping {
                source: name,
                dtype: None,
                include: true,
            }
        })
        .collect();

    Ok(CompileConfig {
        tensor_map,
        ..Default::default()
    })
}

/// Run the compile: read, encode, lay out and publish.
pub fn run(
    model_path: &str,
    config_path: Option<&str>,
    output_path: Option<&str>,
    tokenizer_path: Option<&str>,
) -> Result<()> {
    let config: CompileConfig = load_json_config(config_path, CONFIG_NAME)?;
    config.validate()?;

    let output = PathBuf::from(output_path.unwrap_or(DEFAULT_OUTPUT));
    println!("Output: {}", output.display());
    println!("Default dtype: {} (block size {})", config.default_dtype, config.block_size);

    let files = discover_model_shards(Path::new(model_path))?;
    println!("Found {} safetensors file(s)", files.len());

    let shards = files
        .iter()
        .map(|path| fs::read(path).with_context(|| format!("Failed to read: {}", path.display())))
        .collect::<Result<Vec<_>>>()?;
    let parsed = shards
        .iter()
        .zip(&files)
        .map(|(data, path)| {
            SafeTensors::deserialize(data)
                .with_context(|| format!("Failed to parse: {}", path.display()))
        })
        .collect::<Result<Vec<_>>>()?;
    let index = index_tensors(&parsed, &files)?;

    let included: Vec<&TensorMapping> = config.included().collect();
    let total = included.len();
    println!("Processing {} tensors...", total);

    let mut builder = LayoutBuilder::new();
    for (i, mapping) in included.into_iter().enumerate() {
        let shard = *index
            .get(mapping.source.as_str())
            .with_context(|| format!("Tensor '{}' not found in model", mapping.source))?;
        let view = parsed[shard]
            .tensor(&mapping.source)
            .with_context(|| format!("Failed to read tensor '{}'", mapping.source))?;

        let dtype = config.dtype_for(mapping)?;
        add_tensor(&mut builder, &mapping.source, &view, dtype, config.block_size as usize)
            .with_context(|| format!("Failed to encode tensor '{}'", mapping.source))?;

        let record = &builder.tensors()[builder.len() - 1];
        println!(
            "[{}/{}] {} {:?} -> {} ({} bytes{})",
            i + 1,
            total,
            mapping.source,
            view.shape(),
            dtype,
            record.data.len(),
            record
                .aux
                .as_ref()
                .map(|aux| format!(" + {} aux", aux.len()))
                .unwrap_or_default()
        );
    }

    let merges = match tokenizer_path.map(str::to_string).or_else(|| config.tokenizer.clone()) {
        Some(path) => Some(encode_tokenizer(Path::new(&path), config.strict_merges)?),
        None => None,
    };
    if let Some(encoding) = &merges {
        builder.set_merges(encoding);
    }

    // Validated through the loader-side reader before it is renamed into place
    let layout = builder
        .write_to_path(&output)
        .with_context(|| format!("Failed to write {}", output.display()))?;

    if config.write_manifest {
        let sidecar = manifest_path(&output);
        Manifest::new(&output, builder.tensors(), &layout, merges.as_ref()).write(&sidecar)?;
        println!("Manifest: {}", sidecar.display());
    }

    println!(
        "\n=== Compile Complete: {} tensors, {} bytes ===",
        layout.entries.len(),
        layout.total_size
    );
    Ok(())
}

/// Map every tensor name to the shard that holds it.
fn index_tensors<'a>(
    parsed: &'a [SafeTensors<'_>],
    files: &[PathBuf],
) -> Result<HashMap<&'a str, usize>> {
    let mut index = HashMap::new();
    for (shard, st) in parsed.iter().enumerate() {
        for name in st.names() {
            if let Some(prev) = index.insert(name.as_str(), shard) {
                anyhow::bail!(
                    "Tensor '{}' appears in both {} and {}",
                    name,
                    files[prev].display(),
                    files[shard].display()
                );
            }
        }
    }
    Ok(index)
}

/// Convert one SafeTensors view and add it to the builder as `dtype`.
fn add_tensor(
    builder: &mut LayoutBuilder,
    name: &str,
    view: &TensorView<'_>,
    dtype: DType,
    block_size: usize,
) -> Result<()> {
    let shape = view.shape();
    let count: usize = shape.iter().product();
    let values = bytes_to_f32(view.data(), view.dtype(), count)?;

    match dtype {
        DType::Nf4 => builder.add_nf4(name, shape, &values, block_size)?,
        DType::F32 => builder.add_f32(name, shape, &values)?,
        DType::F16 => builder.add_f16(name, shape, &values)?,
        other => anyhow::bail!("Unsupported output dtype: {}", other),
    }
    Ok(())
}

/// Parse a tokenizer.json and encode its merge table.
fn encode_tokenizer(path: &Path, strict: bool) -> Result<VocabEncoding> {
    let source = parse_hf_tokenizer(path)?;

    let encoding = if strict {
        encode_merges_strict(&source.merges, &source.vocab)
            .context("Merge table rejected (strict_merges is set)")?
    } else {
        encode_merges(&source.merges, &source.vocab)?
    };

    println!(
        "Merges: {} encoded, {} skipped (from {})",
        encoding.triples.len(),
        encoding.skipped_count(),
        path.display()
    );
    if !encoding.is_complete() {
        warn!(
            skipped = encoding.skipped_count(),
            "some merge rules were skipped; see manifest for details"
        );
    }
    Ok(encoding)
}
