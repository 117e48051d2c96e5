//! Mock command - small deterministic file for loader smoke tests.

use anyhow::{Context, Result};
use ndbn_storage::LayoutBuilder;
use std::path::Path;

const MOCK_SHAPE: [usize; 2] = [4, 4];
const MOCK_BLOCK_SIZE: usize = 16;

/// Ramp in [-1, 1) so every mock build is byte-identical.
fn mock_values() -> Vec<f32> {
    let n = MOCK_SHAPE.iter().product::<usize>();
    (0..n).map(|i| (i as f32 - n as f32 / 2.0) / (n as f32 / 2.0)).collect()
}

/// Builder holding one F32 and one NF4 copy of the same 4x4 tensor.
pub fn mock_builder() -> Result<LayoutBuilder> {
    let values = mock_values();
    let mut builder = LayoutBuilder::new();
    builder.add_f32("mock_weight", &MOCK_SHAPE, &values)?;
    builder.add_nf4("mock_weight_nf4", &MOCK_SHAPE, &values, MOCK_BLOCK_SIZE)?;
    Ok(builder)
}

pub fn run(output: &str) -> Result<()> {
    let builder = mock_builder()?;
    let layout = builder
        .write_to_path(Path::new(output))
        .with_context(|| format!("Failed to write mock file: {}", output))?;

    println!(
        "Wrote {} mock tensors to {} ({} bytes)",
        layout.entries.len(),
        output,
        layout.total_size
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndbn_storage::{DType, NdbnFile};

    #[test]
    fn test_mock_is_deterministic() {
        let a = mock_builder().unwrap().finalize().unwrap();
        let b = mock_builder().unwrap().finalize().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_mock_contents() {
        let bytes = mock_builder().unwrap().finalize().unwrap();
        let file = NdbnFile::parse(&bytes).unwrap();

        assert_eq!(file.len(), 2);
        assert_eq!(file.entries()[0].dtype, DType::F32);
        assert_eq!(file.entries()[1].dtype, DType::Nf4);
        assert_eq!(file.entries()[1].data_size, 8);

        let raw = file.dequantize(0).unwrap();
        assert_eq!(raw, mock_values());
        assert_eq!(raw[0], -1.0);

        let (aux, scales) = file.nf4_aux(1).unwrap();
        assert_eq!(aux.block_size, 16);
        assert_eq!(scales, vec![1.0]);
    }
}
