//! BPE merge table encoding.
//!
//! Turns an ordered list of `"tokenA tokenB"` merge rules into fixed-width
//! `(id_a, id_b, rank)` triples. The rank is the rule's position in the
//! original list, so merge priority survives even when earlier rules are
//! skipped. Order is never changed and duplicates are kept.

mod resolver;

use tracing::{debug, warn};

use crate::error::{Error, MergeRuleError, Result};
use crate::formats::{le_u32, MERGE_TRIPLE_SIZE};

pub use resolver::{FnResolver, SymbolResolver};

/// One encoded merge rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MergeTriple {
    pub left: u32,
    pub right: u32,
    /// 0-based position in the source rule list; lower merges first.
    pub rank: u32,
}

impl MergeTriple {
    pub fn new(left: u32, right: u32, rank: u32) -> Self {
        Self { left, right, rank }
    }

    /// Encode as three little-endian u32.
    pub fn to_bytes(&self) -> [u8; MERGE_TRIPLE_SIZE] {
        let mut out = [0u8; MERGE_TRIPLE_SIZE];
        out[0..4].copy_from_slice(&self.left.to_le_bytes());
        out[4..8].copy_from_slice(&self.right.to_le_bytes());
        out[8..12].copy_from_slice(&self.rank.to_le_bytes());
        out
    }
}

/// Result of encoding a merge list: the triples plus every rule that was skipped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VocabEncoding {
    pub triples: Vec<MergeTriple>,
    pub skipped: Vec<MergeRuleError>,
}

impl VocabEncoding {
    /// Serialized vocab blob, 12 bytes per triple in rule order.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.triples.len() * MERGE_TRIPLE_SIZE);
        for triple in &self.triples {
            out.extend_from_slice(&triple.to_bytes());
        }
        out
    }

    pub fn skipped_count(&self) -> usize {
        self.skipped.len()
    }

    /// True when no rule was skipped.
    pub fn is_complete(&self) -> bool {
        self.skipped.is_empty()
    }
}

/// Encode merge rules, skipping and reporting malformed or unresolvable ones.
///
/// A rule must split on whitespace into exactly two tokens, and both must
/// resolve to an id. Anything else lands in `VocabEncoding::skipped`.
///
/// # Errors
/// `LayoutOverflow` if the rule list is longer than `u32::MAX`.
pub fn encode_merges<I, S, R>(rules: I, resolver: &R) -> Result<VocabEncoding>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
    R: SymbolResolver + ?Sized,
{
    let mut encoding = VocabEncoding::default();

    for (index, rule) in rules.into_iter().enumerate() {
        let rank = u32::try_from(index)
            .map_err(|_| Error::LayoutOverflow(format!("merge rank {index} exceeds u32")))?;

        match encode_rule(index, rule.as_ref(), resolver) {
            Ok((left, right)) => encoding.triples.push(MergeTriple::new(left, right, rank)),
            Err(skip) => {
                warn!(index, reason = %skip, "skipping merge rule");
                encoding.skipped.push(skip);
            }
        }
    }

    debug!(
        encoded = encoding.triples.len(),
        skipped = encoding.skipped.len(),
        "encoded merge table"
    );
    Ok(encoding)
}

/// Like [`encode_merges`], but the first skipped rule aborts with `Error::MergeRule`.
pub fn encode_merges_strict<I, S, R>(rules: I, resolver: &R) -> Result<VocabEncoding>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
    R: SymbolResolver + ?Sized,
{
    let encoding = encode_merges(rules, resolver)?;
    match encoding.skipped.first() {
        Some(skip) => Err(Error::MergeRule(skip.clone())),
        None => Ok(encoding),
    }
}

fn encode_rule<R>(
    index: usize,
    rule: &str,
    resolver: &R,
) -> std::result::Result<(u32, u32), MergeRuleError>
where
    R: SymbolResolver + ?Sized,
{
    let tokens: Vec<&str> = rule.split_whitespace().collect();
    let [left, right] = tokens[..] else {
        return Err(MergeRuleError::Malformed {
            index,
            rule: rule.to_string(),
            token_count: tokens.len(),
        });
    };

    let resolve = |symbol: &str| {
        resolver
            .resolve(symbol)
            .ok_or_else(|| MergeRuleError::UnresolvableSymbol {
                index,
                symbol: symbol.to_string(),
            })
    };

    Ok((resolve(left)?, resolve(right)?))
}

/// Parse a vocab blob back into triples.
pub fn parse_merge_blob(bytes: &[u8]) -> Result<Vec<MergeTriple>> {
    if bytes.len() % MERGE_TRIPLE_SIZE != 0 {
        return Err(Error::invalid_format(format!(
            "vocab blob is {} bytes, not a multiple of {MERGE_TRIPLE_SIZE}",
            bytes.len()
        )));
    }

    Ok(bytes
        .chunks_exact(MERGE_TRIPLE_SIZE)
        .map(|c| MergeTriple::new(le_u32(c, 0), le_u32(c, 4), le_u32(c, 8)))
        .collect())
}
