use cfsync_consensus::{DigestKind, Hash256};
use sha2::{Digest, Sha256};

pub fn sha256(data: &[u8]) -> Hash256 {
    Sha256::digest(data).into()
}

pub fn sha256d(data: &[u8]) -> Hash256 {
    Sha256::digest(Sha256::digest(data)).into()
}

/// Digest selected by a chain's wire dialect.
pub fn digest(kind: DigestKind, data: &[u8]) -> Hash256 {
    match kind {
        DigestKind::Sha256d => sha256d(data),
    }
}

/// First four bytes of the dialect digest, as carried in message headers.
pub fn checksum(kind: DigestKind, payload: &[u8]) -> [u8; 4] {
    let full = digest(kind, payload);
    [full[0], full[1], full[2], full[3]]
}
