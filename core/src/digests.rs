use bytes::Bytes;
use data_encoding::HEXLOWER;
use thiserror::Error;

/// Width of an [ObjectId] in bytes. Source-control systems fronted by this
/// daemon (git, Mercurial) both identify trees/blobs/commits by a 20-byte
/// hash, so that's what we standardize on at this layer; a backend that uses
/// a different width hash internally is responsible for mapping to/from this
/// representation (see [crate::proxyhash]).
pub const OBJECT_ID_LEN: usize = 20;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum Error {
    #[error("invalid object id length: {0}")]
    InvalidLen(usize),
}

/// Opaque content hash identifying an immutable tree or blob.
/// Equality is bytewise; ordering is lexicographic, both derived directly.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectId(Bytes);

impl ObjectId {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Computes the [ObjectId] that would back a blob with the given
    /// contents, for backends that derive content hashes locally rather
    /// than accepting one from the remote side.
    pub fn of_blob_contents(data: &[u8]) -> Self {
        use sha1::{Digest, Sha1};
        let mut hasher = Sha1::new();
        hasher.update(data);
        Self(Bytes::copy_from_slice(&hasher.finalize()))
    }
}

impl TryFrom<Vec<u8>> for ObjectId {
    type Error = Error;

    fn try_from(value: Vec<u8>) -> Result<Self, Self::Error> {
        if value.len() != OBJECT_ID_LEN {
            Err(Error::InvalidLen(value.len()))
        } else {
            Ok(Self(value.into()))
        }
    }
}

impl TryFrom<Bytes> for ObjectId {
    type Error = Error;

    fn try_from(value: Bytes) -> Result<Self, Self::Error> {
        if value.len() != OBJECT_ID_LEN {
            Err(Error::InvalidLen(value.len()))
        } else {
            Ok(Self(value))
        }
    }
}

impl TryFrom<&[u8]> for ObjectId {
    type Error = Error;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        if value.len() != OBJECT_ID_LEN {
            Err(Error::InvalidLen(value.len()))
        } else {
            Ok(Self(Bytes::copy_from_slice(value)))
        }
    }
}

impl From<ObjectId> for Bytes {
    fn from(value: ObjectId) -> Self {
        value.0
    }
}

impl From<[u8; OBJECT_ID_LEN]> for ObjectId {
    fn from(value: [u8; OBJECT_ID_LEN]) -> Self {
        Self(Bytes::copy_from_slice(&value))
    }
}

impl std::fmt::Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", HEXLOWER.encode(&self.0))
    }
}

impl std::fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ObjectId({})", HEXLOWER.encode(&self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_wrong_length() {
        assert_eq!(ObjectId::try_from(vec![0u8; 19]), Err(Error::InvalidLen(19)));
        assert_eq!(ObjectId::try_from(vec![0u8; 21]), Err(Error::InvalidLen(21)));
        assert!(ObjectId::try_from(vec![0u8; 20]).is_ok());
    }

    #[test]
    fn ordering_is_lexicographic() {
        let a = ObjectId::try_from(vec![0u8; 20]).unwrap();
        let mut b_bytes = vec![0u8; 20];
        b_bytes[19] = 1;
        let b = ObjectId::try_from(b_bytes).unwrap();
        assert!(a < b);
    }

    #[test]
    fn display_is_lowercase_hex() {
        let id = ObjectId::try_from(vec![0xab, 0xcd].repeat(10)).unwrap();
        assert_eq!(format!("{}", id), "abcd".repeat(10));
    }
}
