//! Inspect command - dump the header and tensor table of an NDBN file.

use anyhow::{Context, Result};
use ndbn_storage::{MappedNdbn, NdbnFile, HEADER_SIZE, TABLE_ENTRY_SIZE};
use std::collections::BTreeMap;

/// Per-dtype totals collected by `--audit`.
#[derive(Debug, Default, PartialEq)]
struct DtypeStats {
    tensors: usize,
    elements: u64,
    data_bytes: u64,
    aux_bytes: u64,
}

pub fn run(model_path: &str, audit: bool) -> Result<()> {
    let mapped = MappedNdbn::open(model_path)
        .with_context(|| format!("Failed to open NDBN file: {}", model_path))?;
    let file = mapped.file()?;
    let header = file.header();

    println!("=== {} ===", mapped.path().display());
    println!("Version: {}", header.version);
    println!("Flags: 0x{:04X}", header.flags);
    println!("Tensors: {}", header.tensor_count);
    println!("Tensor table offset: {}", header.tensor_table_offset);
    if header.has_vocab() {
        println!(
            "Vocab: {} merges at offset {}",
            file.merge_triples()?.len(),
            header.vocab_table_offset
        );
    } else {
        println!("Vocab: none");
    }

    println!();
    for (i, entry) in file.entries().iter().enumerate() {
        let aux = if entry.is_quantized {
            format!(" aux@{} ({} bytes)", entry.aux_offset, entry.aux_size)
        } else {
            String::new()
        };
        println!(
            "[{:>4}] {:<4} rank {} {:?} data@{} ({} bytes){}",
            i,
            entry.dtype,
            entry.rank,
            entry.dims(),
            entry.data_offset,
            entry.data_size,
            aux
        );
    }

    if audit {
        print_audit(&file, mapped.file_size())?;
    }

    Ok(())
}

fn dtype_stats(file: &NdbnFile<'_>) -> BTreeMap<String, DtypeStats> {
    let mut stats: BTreeMap<String, DtypeStats> = BTreeMap::new();
    for entry in file.entries() {
        let s = stats.entry(entry.dtype.to_string()).or_default();
        s.tensors += 1;
        // Parse already rejected overflowing shapes
        s.elements += entry.num_elements().unwrap_or(0);
        s.data_bytes += entry.data_size;
        if entry.is_quantized {
            s.aux_bytes += entry.aux_size;
        }
    }
    stats
}

fn print_audit(file: &NdbnFile<'_>, file_size: usize) -> Result<()> {
    let stats = dtype_stats(file);

    println!("\n=== Audit ===");
    println!("File size: {} bytes", file_size);

    let mut payload = 0u64;
    for (dtype, s) in &stats {
        let bytes = s.data_bytes + s.aux_bytes;
        payload += bytes;
        println!(
            "  {:<4} {} tensors, {} elements, {} data + {} aux bytes ({:.2} bits/element)",
            dtype,
            s.tensors,
            s.elements,
            s.data_bytes,
            s.aux_bytes,
            if s.elements == 0 { 0.0 } else { bytes as f64 * 8.0 / s.elements as f64 }
        );
    }

    let vocab = file.vocab().map_or(0, |v| v.len() as u64);
    let structure = (HEADER_SIZE + TABLE_ENTRY_SIZE * file.len()) as u64;
    let padding = (file_size as u64).saturating_sub(payload + vocab + structure);
    println!("  header + table: {} bytes", structure);
    println!("  vocab: {} bytes", vocab);
    println!("  alignment padding: {} bytes", padding);

    println!();
    for i in 0..file.len() {
        let values = file
            .dequantize(i)
            .with_context(|| format!("Failed to decode tensor {}", i))?;
        let (min, max) = values
            .iter()
            .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
        if values.is_empty() {
            println!("[{:>4}] empty", i);
        } else {
            println!("[{:>4}] decoded {} values, range [{:.6}, {:.6}]", i, values.len(), min, max);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndbn_storage::LayoutBuilder;
    use tempfile::TempDir;

    #[test]
    fn test_dtype_stats() {
        let mut builder = LayoutBuilder::new();
        builder.add_f32("a", &[4], &[1.0; 4]).unwrap();
        builder.add_f32("b", &[2, 2], &[2.0; 4]).unwrap();
        builder.add_nf4("c", &[32], &[0.5; 32], 16).unwrap();
        let bytes = builder.finalize().unwrap();
        let file = NdbnFile::parse(&bytes).unwrap();

        let stats = dtype_stats(&file);
        assert_eq!(
            stats["f32"],
            DtypeStats {
                tensors: 2,
                elements: 8,
                data_bytes: 32,
                aux_bytes: 0,
            }
        );
        assert_eq!(stats["nf4"].data_bytes, 16);
        assert_eq!(stats["nf4"].aux_bytes, 12 + 8);
    }

    #[test]
    fn test_run_with_audit() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("m.nbbin");
        let mut builder = LayoutBuilder::new();
        builder.add_nf4("w", &[8, 8], &[0.25; 64], 64).unwrap();
        builder.set_vocab(vec![0u8; 12]);
        builder.write_to_path(&path).unwrap();

        run(path.to_str().unwrap(), true).unwrap();
    }

    #[test]
    fn test_run_rejects_non_ndbn() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("junk.nbbin");
        std::fs::write(&path, [0u8; 40]).unwrap();

        let err = run(path.to_str().unwrap(), false).unwrap_err();
        assert!(err.to_string().contains("Failed to open NDBN file"));
    }
}
