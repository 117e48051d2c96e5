//! NF4 codebook: the 16 normalized values a 4-bit code can represent.
//!
//! The table is asymmetric (index 15 sits above 1.0) and sorted ascending,
//! with the exact zero at index 7 so all-zero blocks encode losslessly.

/// NF4 lookup table, sorted ascending.
pub const NF4_CODEBOOK: [f32; 16] = [
    -1.000000, -0.694417, -0.512093, -0.373103, -0.255986, -0.150166, -0.051515, 0.000000,
    0.051515, 0.150166, 0.255986, 0.373103, 0.512093, 0.694417, 1.000000, 1.250000,
];

/// Index of the codebook's zero entry.
pub const NF4_ZERO_INDEX: u8 = 7;

/// Find the codebook index closest to a block-normalized value.
///
/// Plain minimum-distance scan over all 16 entries; on a tie the lowest
/// index wins.
#[inline]
pub fn nearest_index(normalized: f32) -> u8 {
    let mut best = 0usize;
    let mut best_dist = (normalized - NF4_CODEBOOK[0]).abs();

    for (idx, &level) in NF4_CODEBOOK.iter().enumerate().skip(1) {
        let dist = (normalized - level).abs();
        if dist < best_dist {
            best = idx;
            best_dist = dist;
        }
    }

    best as u8
}

/// Normalized value for a 4-bit code (upper bits ignored).
#[inline(always)]
pub fn level(code: u8) -> f32 {
    NF4_CODEBOOK[usize::from(code & 0x0F)]
}

/// Largest distance between adjacent codebook entries.
///
/// Any normalized value in [-1, 1] decodes within half of this.
pub fn max_adjacent_gap() -> f32 {
    NF4_CODEBOOK
        .windows(2)
        .map(|pair| pair[1] - pair[0])
        .fold(0.0f32, f32::max)
}
