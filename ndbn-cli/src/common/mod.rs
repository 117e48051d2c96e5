//! Helpers shared by the nc subcommands: model discovery, config loading and
//! SafeTensors payload decoding.

use anyhow::{Context, Result};
use half::{bf16, f16};
use serde::de::DeserializeOwned;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

const SHARD_EXTENSION: &str = "safetensors";

fn is_shard(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case(SHARD_EXTENSION))
}

/// Collect the SafeTensors shards that make up a model.
///
/// A single file is taken as-is. A directory contributes every `.safetensors`
/// file in it, sorted by name so numbered shards keep their order.
pub fn discover_model_shards(model: &Path) -> Result<Vec<PathBuf>> {
    if model.is_file() {
        anyhow::ensure!(
            is_shard(model),
            "Model file {} is not a .safetensors shard",
            model.display()
        );
        return Ok(vec![model.to_path_buf()]);
    }
    anyhow::ensure!(model.is_dir(), "Model path not found: {}", model.display());

    let mut shards = Vec::new();
    for entry in fs::read_dir(model)
        .with_context(|| format!("Failed to list model directory: {}", model.display()))?
    {
        let path = entry
            .with_context(|| format!("Failed to list model directory: {}", model.display()))?
            .path();
        if path.is_file() && is_shard(&path) {
            shards.push(path);
        }
    }

    anyhow::ensure!(
        !shards.is_empty(),
        "Model directory {} holds no .safetensors shards",
        model.display()
    );
    shards.sort_unstable();
    Ok(shards)
}

/// Read the JSON config named by `--config`.
///
/// `template_name` is the file `--generate-config` writes, quoted in the error
/// when no config was given.
pub fn load_json_config<T: DeserializeOwned>(config_path: Option<&str>, template_name: &str) -> Result<T> {
    let path = config_path.map(Path::new).ok_or_else(|| {
        anyhow::anyhow!(
            "--config is required (run with --generate-config to write {})",
            template_name
        )
    })?;

    let json = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config: {}", path.display()))?;
    serde_json::from_str(&json)
        .with_context(|| format!("Config {} does not match the expected schema", path.display()))
}

/// Sidecar path for an output file: `model.nbbin` -> `model.nbbin.json`.
pub fn manifest_path(output: &Path) -> PathBuf {
    let mut name = OsString::from(output.as_os_str());
    name.push(".json");
    PathBuf::from(name)
}

/// Convert raw bytes to f32 based on dtype.
pub fn bytes_to_f32(data: &[u8], dtype: safetensors::Dtype, count: usize) -> Result<Vec<f32>> {
    use safetensors::Dtype;

    let elem_size = match dtype {
        Dtype::F32 => 4,
        Dtype::F16 | Dtype::BF16 => 2,
        _ => anyhow::bail!("Unsupported dtype: {:?}. Only F32, F16, BF16 supported.", dtype),
    };
    if data.len() != count * elem_size {
        anyhow::bail!(
            "{:?} size mismatch: expected {} bytes, got {}",
            dtype,
            count * elem_size,
            data.len()
        );
    }

    let values = match dtype {
        Dtype::F32 => data
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
        Dtype::F16 => data
            .chunks_exact(2)
            .map(|c| f16::from_le_bytes([c[0], c[1]]).to_f32())
            .collect(),
        _ => data
            .chunks_exact(2)
            .map(|c| bf16::from_le_bytes([c[0], c[1]]).to_f32())
            .collect(),
    };
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    // ==================== discover_model_shards tests ====================

    #[test]
    fn test_single_shard_file() {
        let dir = TempDir::new().unwrap();
        let shard = dir.path().join("model.SafeTensors");
        fs::File::create(&shard).unwrap();

        assert_eq!(discover_model_shards(&shard).unwrap(), vec![shard]);
    }

    #[test]
    fn test_rejects_non_shard_file() {
        let dir = TempDir::new().unwrap();
        let nbbin = dir.path().join("model.nbbin");
        fs::File::create(&nbbin).unwrap();

        let err = discover_model_shards(&nbbin).unwrap_err();
        assert!(err.to_string().contains("is not a .safetensors shard"));
    }

    #[test]
    fn test_directory_shards_in_name_order() {
        let dir = TempDir::new().unwrap();
        fs::File::create(dir.path().join("model-00002-of-00002.safetensors")).unwrap();
        fs::File::create(dir.path().join("model-00001-of-00002.safetensors")).unwrap();
        fs::File::create(dir.path().join("tokenizer.json")).unwrap();
        fs::create_dir(dir.path().join("nested.safetensors")).unwrap();

        let shards = discover_model_shards(dir.path()).unwrap();
        let names: Vec<_> = shards
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            names,
            ["model-00001-of-00002.safetensors", "model-00002-of-00002.safetensors"]
        );
    }

    #[test]
    fn test_directory_without_shards_fails() {
        let dir = TempDir::new().unwrap();
        fs::File::create(dir.path().join("tokenizer.json")).unwrap();

        let err = discover_model_shards(dir.path()).unwrap_err();
        assert!(err.to_string().contains("holds no .safetensors shards"));
    }

    #[test]
    fn test_missing_model_path_fails() {
        let dir = TempDir::new().unwrap();
        let err = discover_model_shards(&dir.path().join("gone")).unwrap_err();
        assert!(err.to_string().contains("Model path not found"));
    }

    // ==================== load_json_config tests ====================

    #[derive(Debug, serde::Deserialize)]
    struct BlockOnly {
        block_size: u32,
    }

    #[test]
    fn test_load_json_config() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("compile_config.json");
        fs::write(&path, r#"{"block_size": 128}"#).unwrap();

        let config: BlockOnly = load_json_config(path.to_str(), "compile_config.json").unwrap();
        assert_eq!(config.block_size, 128);
    }

    #[test]
    fn test_load_json_config_requires_path() {
        let err = load_json_config::<BlockOnly>(None, "compile_config.json").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("--config is required"));
        assert!(msg.contains("compile_config.json"));
    }

    #[test]
    fn test_load_json_config_schema_mismatch() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("compile_config.json");
        fs::write(&path, r#"{"block_size": "large"}"#).unwrap();

        let err = load_json_config::<BlockOnly>(path.to_str(), "compile_config.json").unwrap_err();
        assert!(err.to_string().contains("does not match the expected schema"));
    }

    // ==================== manifest_path tests ====================

    #[test]
    fn test_manifest_path_appends_json() {
        assert_eq!(
            manifest_path(Path::new("out/model.nbbin")),
            PathBuf::from("out/model.nbbin.json")
        );
        assert_eq!(manifest_path(Path::new("model")), PathBuf::from("model.json"));
    }

    // ==================== bytes_to_f32 tests ====================

    #[test]
    fn test_bytes_to_f32_f32() {
        use safetensors::Dtype;

        let values: Vec<f32> = vec![1.0, -2.5, 3.0, 0.125];
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();

        assert_eq!(bytes_to_f32(&bytes, Dtype::F32, 4).unwrap(), values);
    }

    #[test]
    fn test_bytes_to_f32_f16() {
        use safetensors::Dtype;

        let bytes: Vec<u8> = [f16::from_f32(1.0), f16::from_f32(-0.5)]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();

        assert_eq!(bytes_to_f32(&bytes, Dtype::F16, 2).unwrap(), vec![1.0, -0.5]);
    }

    #[test]
    fn test_bytes_to_f32_bf16() {
        use safetensors::Dtype;

        let bytes: Vec<u8> = [bf16::from_f32(1.5), bf16::from_f32(3.0)]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();

        assert_eq!(bytes_to_f32(&bytes, Dtype::BF16, 2).unwrap(), vec![1.5, 3.0]);
    }

    #[test]
    fn test_bytes_to_f32_size_mismatch() {
        use safetensors::Dtype;

        let result = bytes_to_f32(&[0u8; 12], Dtype::F32, 4);
        assert!(result.unwrap_err().to_string().contains("size mismatch"));

        let result = bytes_to_f32(&[0u8; 4], Dtype::BF16, 3);
        assert!(result.unwrap_err().to_string().contains("size mismatch"));
    }

    #[test]
    fn test_bytes_to_f32_unsupported_dtype() {
        use safetensors::Dtype;

        let result = bytes_to_f32(&[0u8; 8], Dtype::I64, 1);
        assert!(result.unwrap_err().to_string().contains("Unsupported dtype"));
    }
}
