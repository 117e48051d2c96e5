//! Tokenizer parsing.
//!
//! Extracts the ordered BPE merge list and the token -> id vocabulary from a
//! HuggingFace tokenizer.json. The vocabulary doubles as the symbol resolver
//! for the merge encoder.

use anyhow::{Context, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::fs;
use std::path::Path;

/// Merge rules plus the vocabulary they refer to.
#[derive(Debug, Default)]
pub struct MergeSource {
    /// Rules in priority order, each as `"left right"`.
    pub merges: Vec<String>,
    /// Token text -> id, including added tokens.
    pub vocab: HashMap<String, u32>,
}

/// Parse a HuggingFace tokenizer.json file.
pub fn parse_hf_tokenizer(path: &Path) -> Result<MergeSource> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read tokenizer.json: {}", path.display()))?;
    let json: Value = serde_json::from_str(&content).context("Failed to parse tokenizer.json")?;

    parse_tokenizer_json(&json)
        .with_context(|| format!("Invalid tokenizer: {}", path.display()))
}

/// Extract merges and vocabulary from parsed tokenizer.json content.
pub fn parse_tokenizer_json(json: &Value) -> Result<MergeSource> {
    let model = json.get("model").context("Missing 'model' field in tokenizer.json")?;

    // Older files omit `type` on BPE models
    let model_type = model.get("type").and_then(Value::as_str).unwrap_or("BPE");
    if model_type != "BPE" {
        anyhow::bail!("Tokenizer model type is {}, only BPE has merge rules", model_type);
    }

    let vocab_obj = model
        .get("vocab")
        .and_then(Value::as_object)
        .context("Missing 'model.vocab' object")?;

    let mut vocab = HashMap::with_capacity(vocab_obj.len());
    for (token, id) in vocab_obj {
        vocab.insert(token.clone(), parse_id(id, token)?);
    }

    if let Some(added) = json.get("added_tokens").and_then(Value::as_array) {
        for entry in added {
            let (Some(content), Some(id)) = (
                entry.get("content").and_then(Value::as_str),
                entry.get("id"),
            ) else {
                continue;
            };
            let id = parse_id(id, content)?;
            vocab.entry(content.to_string()).or_insert(id);
        }
    }

    let merges = model
        .get("merges")
        .and_then(Value::as_array)
        .context("Missing 'model.merges' array")?
        .iter()
        .map(merge_rule_text)
        .collect();

    Ok(MergeSource { merges, vocab })
}

fn parse_id(id: &Value, token: &str) -> Result<u32> {
    id.as_u64()
        .and_then(|id| u32::try_from(id).ok())
        .with_context(|| format!("Token '{}' has invalid id {}", token, id))
}

/// Normalize one merge entry to `"left right"`.
///
/// Entries that are neither strings nor arrays of strings are rendered as
/// their JSON text so the encoder reports them as malformed at the right
/// index instead of shifting later ranks.
fn merge_rule_text(entry: &Value) -> String {
    match entry {
        Value::String(rule) => rule.clone(),
        Value::Array(parts) => parts
            .iter()
            .map(|p| match p {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect::<Vec<_>>()
            .join(" "),
        other => other.to_string(),
    }
}
