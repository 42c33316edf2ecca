//! BIP157 filter header chaining.
//!
//! A filter header commits to the filter of its block and to the previous
//! filter header: `header_n = sha256d(filter_hash_n || header_{n-1})`, where
//! `filter_hash_n = sha256d(filter_bytes_n)`. Peers send filter hashes in
//! `cfheaders`; the headers themselves are derived locally.

use cfsync_consensus::Hash256;

use crate::hash::sha256d;

pub fn filter_hash(filter: &[u8]) -> Hash256 {
    sha256d(filter)
}

pub fn next_filter_header(filter_hash: &Hash256, previous_header: &Hash256) -> Hash256 {
    let mut preimage = [0u8; 64];
    preimage[..32].copy_from_slice(filter_hash);
    preimage[32..].copy_from_slice(previous_header);
    sha256d(&preimage)
}

/// Iterator that folds a list of filter hashes into `(filter_hash, header)`
/// pairs starting from a known previous header.
pub struct FilterHeaderChain<'a> {
    previous: Hash256,
    hashes: std::slice::Iter<'a, Hash256>,
}

impl<'a> FilterHeaderChain<'a> {
    pub fn new(previous: Hash256, hashes: &'a [Hash256]) -> Self {
        Self {
            previous,
            hashes: hashes.iter(),
        }
    }
}

impl Iterator for FilterHeaderChain<'_> {
    type Item = (Hash256, Hash256);

    fn next(&mut self) -> Option<Self::Item> {
        let hash = *self.hashes.next()?;
        let header = next_filter_header(&hash, &self.previous);
        self.previous = header;
        Some((hash, header))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.hashes.size_hint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_links_each_header_to_the_previous() {
        let hashes = [filter_hash(b"one"), filter_hash(b"two"), filter_hash(b"three")];
        let chain: Vec<_> = FilterHeaderChain::new([0u8; 32], &hashes).collect();
        assert_eq!(chain.len(), 3);
        assert_eq!(chain[0].1, next_filter_header(&hashes[0], &[0u8; 32]));
        assert_eq!(chain[2].1, next_filter_header(&hashes[2], &chain[1].1));
        assert_ne!(chain[1].1, next_filter_header(&hashes[1], &[0u8; 32]));
    }
}
