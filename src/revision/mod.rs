//! Document revisions
//!
//! A revision names one version of a document. Revisions of the same document
//! form a tree: every revision points at its parent, and two edits made from
//! the same parent without seeing each other become sibling leaves. The winner
//! among the leaves is chosen the same way on every replica, so replicas agree
//! on the current version without coordinating.

mod tree;

pub use tree::{InsertOutcome, RevisionNode, RevisionTree};

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Depth of a revision in its document's tree (roots are generation 1)
pub type Generation = u64;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RevisionParseError {
    #[error("Missing generation separator in {0:?}")]
    MissingSeparator(String),

    #[error("Invalid generation: {0}")]
    InvalidGeneration(String),

    #[error("Invalid revision hash: {0}")]
    InvalidHash(String),
}

/// SHA-256 content address of a revision.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RevisionHash([u8; 32]);

impl RevisionHash {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, RevisionParseError> {
        let bytes = hex::decode(s).map_err(|_| RevisionParseError::InvalidHash(s.to_string()))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| RevisionParseError::InvalidHash(s.to_string()))?;
        Ok(Self(bytes))
    }
}

impl fmt::Debug for RevisionHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RevisionHash({})", &self.to_hex()[..12])
    }
}

impl fmt::Display for RevisionHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for RevisionHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for RevisionHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        RevisionHash::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Identity of a revision: its generation plus its hash.
///
/// The derived ordering compares generation first and then the hash bytes,
/// which is exactly the winner ordering used for conflict resolution.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RevisionRef {
    pub generation: Generation,
    pub hash: RevisionHash,
}

impl fmt::Display for RevisionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.generation, self.hash)
    }
}

impl FromStr for RevisionRef {
    type Err = RevisionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (generation, hash) = s
            .split_once('-')
            .ok_or_else(|| RevisionParseError::MissingSeparator(s.to_string()))?;
        let generation = generation
            .parse::<Generation>()
            .map_err(|_| RevisionParseError::InvalidGeneration(generation.to_string()))?;
        if generation == 0 {
            return Err(RevisionParseError::InvalidGeneration(s.to_string()));
        }
        Ok(Self {
            generation,
            hash: RevisionHash::from_hex(hash)?,
        })
    }
}

/// One version of a document.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Revision {
    pub generation: Generation,
    pub hash: RevisionHash,
    pub parent: Option<RevisionRef>,
}

impl Revision {
    /// The `(generation, hash)` identity of this revision
    pub fn id(&self) -> RevisionRef {
        RevisionRef {
            generation: self.generation,
            hash: self.hash,
        }
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    /// Whether this revision names the same version as `other`
    pub fn matches(&self, other: &RevisionRef) -> bool {
        self.id() == *other
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.id().fmt(f)
    }
}

/// Outcome of comparing two revisions for the winner slot
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Winner {
    Left,
    Right,
    Tie,
}

/// Deterministic winner: highest generation, then lexicographically greatest hash.
pub fn compare(a: &RevisionRef, b: &RevisionRef) -> Winner {
    match a.cmp(b) {
        Ordering::Greater => Winner::Left,
        Ordering::Less => Winner::Right,
        Ordering::Equal => Winner::Tie,
    }
}

/// Compute the revision that follows `current` for the given content.
///
/// The hash covers the parent hash, the tombstone flag and the canonical body,
/// so two replicas making the same edit on the same parent produce the same
/// revision id.
pub fn next_revision(current: Option<&Revision>, body: &Value, deleted: bool) -> Revision {
    let parent = current.map(Revision::id);

    let mut hasher = Sha256::new();
    if let Some(parent) = &parent {
        hasher.update(parent.hash.as_bytes());
    }
    hasher.update([deleted as u8]);
    hasher.update(canonical_json(body));

    Revision {
        // Saturates; verify_revision refuses the saturated case from peers
        generation: parent.map_or(1, |p| p.generation.saturating_add(1)),
        hash: RevisionHash(hasher.finalize().into()),
        parent,
    }
}

/// Whether `revision` really is the content address of `body` on its parent.
///
/// A parent whose generation cannot be incremented never verifies.
pub fn verify_revision(revision: &Revision, body: &Value, deleted: bool) -> bool {
    let expected_generation = match revision.parent {
        Some(p) => p.generation.checked_add(1),
        None => Some(1),
    };
    if expected_generation != Some(revision.generation) {
        return false;
    }
    let parent = revision.parent.map(|p| Revision {
        generation: p.generation,
        hash: p.hash,
        parent: None,
    });
    next_revision(parent.as_ref(), body, deleted).id() == revision.id()
}

/// Serialize a JSON value with object keys in sorted order at every depth.
pub fn canonical_json(value: &Value) -> Vec<u8> {
    let mut out = Vec::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push(b'{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                // Serializing a string cannot fail
                out.extend(serde_json::to_vec(key).unwrap_or_default());
                out.push(b':');
                write_canonical(&map[key], out);
            }
            out.push(b'}');
        }
        Value::Array(items) => {
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_canonical(item, out);
            }
            out.push(b']');
        }
        scalar => out.extend(serde_json::to_vec(scalar).unwrap_or_default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_first_revision_is_generation_one() {
        let rev = next_revision(None, &json!({"species": "xuthus"}), false);
        assert_eq!(rev.generation, 1);
        assert!(rev.is_root());
    }

    #[test]
    fn test_next_revision_increments_and_links_parent() {
        let first = next_revision(None, &json!({"n": 1}), false);
        let second = next_revision(Some(&first), &json!({"n": 2}), false);

        assert_eq!(second.generation, 2);
        assert_eq!(second.parent, Some(first.id()));
        assert_ne!(second.hash, first.hash);
    }

    #[test]
    fn test_identical_edits_converge() {
        let base = next_revision(None, &json!({"n": 1}), false);
        // Key order must not matter
        let a = next_revision(Some(&base), &json!({"a": 1, "b": {"y": 2, "x": 1}}), false);
        let b = next_revision(Some(&base), &json!({"b": {"x": 1, "y": 2}, "a": 1}), false);
        assert_eq!(a, b);
    }

    #[test]
    fn test_tombstone_hash_differs() {
        let base = next_revision(None, &json!({}), false);
        let edit = next_revision(Some(&base), &Value::Null, false);
        let delete = next_revision(Some(&base), &Value::Null, true);
        assert_ne!(edit.hash, delete.hash);
    }

    #[test]
    fn test_verify_revision() {
        let base = next_revision(None, &json!({"n": 1}), false);
        let next = next_revision(Some(&base), &json!({"n": 2}), false);
        assert!(verify_revision(&base, &json!({"n": 1}), false));
        assert!(verify_revision(&next, &json!({"n": 2}), false));
        assert!(!verify_revision(&next, &json!({"n": 3}), false));
        assert!(!verify_revision(&next, &json!({"n": 2}), true));
    }

    #[test]
    fn test_generation_overflow_does_not_verify() {
        let parent = RevisionRef {
            generation: Generation::MAX,
            hash: RevisionHash::from_bytes([7; 32]),
        };
        let parent_rev = Revision {
            generation: parent.generation,
            hash: parent.hash,
            parent: None,
        };
        // Same hash a peer would compute; the generation cannot follow the parent
        let forged = next_revision(Some(&parent_rev), &json!({"n": 1}), false);
        assert_eq!(forged.generation, Generation::MAX);
        assert!(!verify_revision(&forged, &json!({"n": 1}), false));
    }

    #[test]
    fn test_compare_generation_then_hash() {
        let low = RevisionRef {
            generation: 1,
            hash: RevisionHash::from_bytes([0xff; 32]),
        };
        let high = RevisionRef {
            generation: 2,
            hash: RevisionHash::from_bytes([0x00; 32]),
        };
        assert_eq!(compare(&low, &high), Winner::Right);
        assert_eq!(compare(&high, &low), Winner::Left);

        let a = RevisionRef {
            generation: 3,
            hash: RevisionHash::from_bytes([0x10; 32]),
        };
        let b = RevisionRef {
            generation: 3,
            hash: RevisionHash::from_bytes([0x20; 32]),
        };
        assert_eq!(compare(&a, &b), Winner::Right);
        assert_eq!(compare(&a, &a), Winner::Tie);
    }

    #[test]
    fn test_revision_ref_string_form() {
        let rev = next_revision(None, &json!({"k": "v"}), false).id();
        let text = rev.to_string();
        assert!(text.starts_with("1-"));
        assert_eq!(text.parse::<RevisionRef>().unwrap(), rev);

        assert!(matches!(
            "nohyphen".parse::<RevisionRef>(),
            Err(RevisionParseError::MissingSeparator(_))
        ));
        assert!(matches!(
            "0-abcd".parse::<RevisionRef>(),
            Err(RevisionParseError::InvalidGeneration(_))
        ));
        assert!(matches!(
            "1-zz".parse::<RevisionRef>(),
            Err(RevisionParseError::InvalidHash(_))
        ));
    }

    #[test]
    fn test_revision_serializes_hash_as_hex() {
        let rev = next_revision(None, &json!(1), false);
        let json = serde_json::to_value(&rev).unwrap();
        assert_eq!(json["hash"].as_str().unwrap().len(), 64);
        let back: Revision = serde_json::from_value(json).unwrap();
        assert_eq!(back, rev);
    }
}
