//! `RootId`: an opaque identifier for a commit or snapshot, as distinct
//! from the [crate::ObjectId] of the tree it resolves to. Unlike `ObjectId`
//! it's variable-width, since different backends (git, Mercurial, and
//! whatever comes after) don't agree on a hash size for commits.

use data_encoding::HEXLOWER;

/// An opaque commit/snapshot identifier. Two representations are accepted
/// on input (raw binary, and lowercase hex) but only the binary form is
/// kept internally and only the hex form is ever rendered back out, so
/// `parse_root_id(render_root_id(r)) == r` for any `r`.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub struct RootId(Vec<u8>);

impl RootId {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Display for RootId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", HEXLOWER.encode(&self.0))
    }
}

impl std::fmt::Debug for RootId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RootId({})", HEXLOWER.encode(&self.0))
    }
}

/// Canonical codec for [RootId], owned by the object store rather than by
/// `RootId` itself: accepts either raw binary or hex-encoded ASCII on
/// input, always emits hex on output.
pub fn parse_root_id(bytes: &[u8]) -> RootId {
    if let Ok(s) = std::str::from_utf8(bytes) {
        if s.len() % 2 == 0 && !s.is_empty() && s.bytes().all(|b| b.is_ascii_hexdigit()) {
            if let Ok(decoded) = HEXLOWER.decode(s.to_lowercase().as_bytes()) {
                return RootId(decoded);
            }
        }
    }
    RootId(bytes.to_vec())
}

pub fn render_root_id(root_id: &RootId) -> Vec<u8> {
    HEXLOWER.encode(&root_id.0).into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_from_binary() {
        let binary = vec![0xde, 0xad, 0xbe, 0xef];
        let root_id = parse_root_id(&binary);
        let rendered = render_root_id(&root_id);
        let reparsed = parse_root_id(&rendered);
        assert_eq!(root_id, reparsed);
    }

    #[test]
    fn accepts_hex_on_input() {
        let a = parse_root_id(b"deadbeef");
        let b = parse_root_id(&[0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(a, b);
    }

    #[test]
    fn renders_lowercase_hex() {
        let root_id = parse_root_id(&[0xAB, 0xCD]);
        assert_eq!(render_root_id(&root_id), b"abcd");
    }
}
