use {
  multihash::{Code as MultihashCode, MultihashDigest},
  serde::{Deserialize, Serialize},
  std::{fmt, str::FromStr},
  thiserror::Error,
};

/// A 32-byte keccak-256 digest.
///
/// Every identifier in the protocol is one of these: assertion
/// hashes, edge ids, mutual ids, origin ids and history roots are
/// all keccak digests over the canonical byte encoding of their
/// respective fields.
#[derive(
  Clone,
  Copy,
  PartialEq,
  Eq,
  Hash,
  PartialOrd,
  Ord,
  Default,
  Serialize,
  Deserialize,
)]
pub struct Digest(pub [u8; 32]);

impl Digest {
  pub const ZERO: Digest = Digest([0u8; 32]);

  pub fn is_zero(&self) -> bool {
    self.0 == [0u8; 32]
  }

  pub fn as_bytes(&self) -> &[u8] {
    &self.0
  }
}

impl From<[u8; 32]> for Digest {
  fn from(bytes: [u8; 32]) -> Self {
    Digest(bytes)
  }
}

impl fmt::Display for Digest {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "0x{}", hex::encode(self.0))
  }
}

impl fmt::Debug for Digest {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    // full digests are unreadable in logs, print a prefix
    write!(f, "0x{}..", hex::encode(&self.0[..4]))
  }
}

#[derive(Debug, Error)]
pub enum ParseDigestError {
  #[error("invalid hex encoding: {0}")]
  Hex(#[from] hex::FromHexError),

  #[error("expected {expected} bytes, got {got}")]
  Length { expected: usize, got: usize },
}

impl FromStr for Digest {
  type Err = ParseDigestError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let bytes = hex::decode(s.trim_start_matches("0x"))?;
    let bytes: [u8; 32] =
      bytes.try_into().map_err(|b: Vec<u8>| ParseDigestError::Length {
        expected: 32,
        got: b.len(),
      })?;
    Ok(Digest(bytes))
  }
}

/// A 20-byte account address on the parent chain, such as the
/// staker that created an assertion or a level-zero edge.
#[derive(
  Clone,
  Copy,
  PartialEq,
  Eq,
  Hash,
  PartialOrd,
  Ord,
  Default,
  Serialize,
  Deserialize,
)]
pub struct Address(pub [u8; 20]);

impl fmt::Display for Address {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "0x{}", hex::encode(self.0))
  }
}

impl fmt::Debug for Address {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "0x{}..", hex::encode(&self.0[..4]))
  }
}

impl FromStr for Address {
  type Err = ParseDigestError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let bytes = hex::decode(s.trim_start_matches("0x"))?;
    let bytes: [u8; 20] =
      bytes.try_into().map_err(|b: Vec<u8>| ParseDigestError::Length {
        expected: 20,
        got: b.len(),
      })?;
    Ok(Address(bytes))
  }
}

/// Keccak-256 over the concatenation of the given byte slices.
pub fn keccak(parts: &[&[u8]]) -> Digest {
  let len = parts.iter().map(|p| p.len()).sum();
  let mut buf = Vec::with_capacity(len);
  for part in parts {
    buf.extend_from_slice(part);
  }
  let hash = MultihashCode::Keccak256.digest(&buf);
  let mut out = [0u8; 32];
  out.copy_from_slice(hash.digest());
  Digest(out)
}

/// Keccak-256 of two digests, the node function of every merkle
/// tree in the protocol.
pub fn keccak2(left: Digest, right: Digest) -> Digest {
  keccak(&[left.as_bytes(), right.as_bytes()])
}

#[cfg(test)]
mod tests {
  use super::{keccak, keccak2, Digest};

  #[test]
  fn digest_roundtrip() {
    let d = keccak(&[b"hello"]);
    let s = d.to_string();
    assert!(s.starts_with("0x"));
    assert_eq!(s.parse::<Digest>().unwrap(), d);
  }

  #[test]
  fn keccak_is_concatenation() {
    assert_eq!(keccak(&[b"ab", b"cd"]), keccak(&[b"abcd"]));
    let (a, b) = (keccak(&[b"a"]), keccak(&[b"b"]));
    assert_eq!(keccak2(a, b), keccak(&[a.as_bytes(), b.as_bytes()]));
    assert_ne!(keccak2(a, b), keccak2(b, a));
  }

  #[test]
  fn zero_digest() {
    assert!(Digest::ZERO.is_zero());
    assert!(!keccak(&[b"x"]).is_zero());
  }
}
