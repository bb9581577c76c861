//! Dictionary compression for layer and attribute-key strings.
//!
//! Feature records store layer names and attribute keys as a single byte to
//! keep the intermediate format compact. Each namespace supports at most
//! [`MAX_STRINGS`] distinct values; running out is a fatal, user-visible
//! error naming the namespace, since it means the profile emits an unbounded
//! set of layer or key strings.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::{Error, Result};

/// Maximum number of distinct strings per namespace.
pub const MAX_STRINGS: usize = 250;

/// Bijective string <-> u8 dictionary for one namespace.
///
/// Ids are assigned 1..=250 in first-seen order and never rewritten; the byte
/// values 0 and 251..=255 are reserved and never returned. Writes are
/// serialized through an internal lock; decoding an id that was assigned
/// before the decode call is always consistent.
#[derive(Debug)]
pub struct CommonStringEncoder {
    namespace: &'static str,
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    ids: HashMap<String, u8>,
    // index i holds the string for id i + 1
    strings: Vec<String>,
}

impl CommonStringEncoder {
    pub fn new(namespace: &'static str) -> Self {
        Self {
            namespace,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Returns the id for `string`, assigning the next free one on first
    /// sight. Fails once the namespace holds [`MAX_STRINGS`] entries.
    pub fn encode(&self, string: &str) -> Result<u8> {
        let mut inner = self.inner.lock().expect("string table lock poisoned");
        if let Some(&id) = inner.ids.get(string) {
            return Ok(id);
        }
        if inner.strings.len() >= MAX_STRINGS {
            return Err(Error::StringsExhausted {
                namespace: self.namespace,
            });
        }
        inner.strings.push(string.to_string());
        let id = inner.strings.len() as u8;
        inner.ids.insert(string.to_string(), id);
        Ok(id)
    }

    /// Returns the string previously assigned to `id`.
    pub fn decode(&self, id: u8) -> Result<String> {
        let inner = self.inner.lock().expect("string table lock poisoned");
        inner
            .strings
            .get(id.wrapping_sub(1) as usize)
            .filter(|_| id != 0)
            .cloned()
            .ok_or_else(|| {
                Error::Codec(format!(
                    "unassigned {} string id {id}",
                    self.namespace
                ))
            })
    }

    /// Number of strings assigned so far.
    pub fn len(&self) -> usize {
        self.inner.lock().expect("string table lock poisoned").strings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_round_trip() {
        let encoder = CommonStringEncoder::new("layer");
        let id = encoder.encode("water").unwrap();
        assert_eq!(encoder.decode(id).unwrap(), "water");
    }

    #[test]
    fn test_same_string_same_id() {
        let encoder = CommonStringEncoder::new("layer");
        let a = encoder.encode("water").unwrap();
        let b = encoder.encode("landuse").unwrap();
        let c = encoder.encode("water").unwrap();
        assert_eq!(a, c);
        assert_ne!(a, b);
        assert_eq!(encoder.len(), 2);
    }

    #[test]
    fn test_ids_avoid_reserved_bytes() {
        let encoder = CommonStringEncoder::new("attr_key");
        for i in 0..MAX_STRINGS {
            let id = encoder.encode(&format!("key{i}")).unwrap();
            assert!(id >= 1 && id <= 250, "id {id} outside 1..=250");
        }
    }

    #[test]
    fn test_saturation_is_fatal_and_names_namespace() {
        let encoder = CommonStringEncoder::new("attr_key");
        for i in 0..MAX_STRINGS {
            encoder.encode(&format!("key{i}")).unwrap();
        }
        let err = encoder.encode("one_too_many").unwrap_err();
        match err {
            Error::StringsExhausted { namespace } => assert_eq!(namespace, "attr_key"),
            other => panic!("expected StringsExhausted, got {other:?}"),
        }
        // existing entries still decode after saturation
        assert_eq!(encoder.decode(1).unwrap(), "key0");
    }

    #[test]
    fn test_decode_unassigned_id_fails() {
        let encoder = CommonStringEncoder::new("layer");
        assert!(encoder.decode(0).is_err());
        assert!(encoder.decode(7).is_err());
        encoder.encode("roads").unwrap();
        assert!(encoder.decode(2).is_err());
    }
}
