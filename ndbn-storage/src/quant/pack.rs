//! Nibble packing (2×u4 → u8): low nibble = even idx, high nibble = odd idx.

#[inline(always)]
pub fn pack_nibble_pair(even: u8, odd: u8) -> u8 {
    (even & 0x0F) | ((odd & 0x0F) << 4)
}

/// Iterate codes in element order, low nibble first.
pub fn unpack_nibbles(packed: &[u8]) -> impl Iterator<Item = u8> + '_ {
    packed
        .iter()
        .flat_map(|&byte| [byte & 0x0F, byte >> 4])
}
