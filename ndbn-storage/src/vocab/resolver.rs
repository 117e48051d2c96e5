//! Symbol-to-id lookup used by the merge encoder.

use std::collections::{BTreeMap, HashMap};
use std::hash::BuildHasher;

/// Maps a token's text to its vocabulary id.
///
/// Returning `None` marks the symbol as unresolvable; the encoder reports it
/// instead of substituting a default id.
pub trait SymbolResolver {
    fn resolve(&self, symbol: &str) -> Option<u32>;
}

impl<S: BuildHasher> SymbolResolver for HashMap<String, u32, S> {
    fn resolve(&self, symbol: &str) -> Option<u32> {
        self.get(symbol).copied()
    }
}

impl SymbolResolver for BTreeMap<String, u32> {
    fn resolve(&self, symbol: &str) -> Option<u32> {
        self.get(symbol).copied()
    }
}

impl<T: SymbolResolver + ?Sized> SymbolResolver for &T {
    fn resolve(&self, symbol: &str) -> Option<u32> {
        (**self).resolve(symbol)
    }
}

/// Adapter for closure-based lookups.
///
/// ```ignore
/// let byte_ids = FnResolver(|s: &str| s.bytes().next().filter(|_| s.len() == 1).map(u32::from));
/// ```
pub struct FnResolver<F>(pub F);

impl<F> SymbolResolver for FnResolver<F>
where
    F: Fn(&str) -> Option<u32>,
{
    fn resolve(&self, symbol: &str) -> Option<u32> {
        (self.0)(symbol)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hashmap_resolver() {
        let mut map = HashMap::new();
        map.insert("hello".to_string(), 42u32);
        assert_eq!(map.resolve("hello"), Some(42));
        assert_eq!(map.resolve("world"), None);
    }

    #[test]
    fn test_btreemap_resolver() {
        let mut map = BTreeMap::new();
        map.insert("<s>".to_string(), 1u32);
        assert_eq!(map.resolve("<s>"), Some(1));
    }

    #[test]
    fn test_fn_resolver() {
        let single_byte = FnResolver(|s: &str| {
            let mut bytes = s.bytes();
            match (bytes.next(), bytes.next()) {
                (Some(b), None) => Some(u32::from(b)),
                _ => None,
            }
        });
        assert_eq!(single_byte.resolve("a"), Some(97));
        assert_eq!(single_byte.resolve("ab"), None);
    }

    #[test]
    fn test_reference_resolver() {
        let mut map = HashMap::new();
        map.insert("x".to_string(), 9u32);
        let dyn_ref: &dyn SymbolResolver = &map;
        assert_eq!((&dyn_ref).resolve("x"), Some(9));
    }
}
