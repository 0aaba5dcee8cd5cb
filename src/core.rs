use std::any::Any;
use std::sync::Arc;

use crate::value::Value;

/// A type-erased, thread-safe container for reduction outputs.
pub type Dynamic = Arc<dyn Any + Send + Sync>;

/// Atomic reference-counted string type used for identifiers.
pub(crate) type ArcStr = std::sync::Arc<str>;

/// A 32-byte BLAKE3 hash used to fingerprint persisted results.
///
/// A result file is named after the fingerprint of the task class and the
/// concrete options it was computed from, so a persisted sweep can only be
/// loaded back into a graph that would compute the same thing.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Hash32([u8; 32]);

impl<T> From<T> for Hash32
where
    T: Into<[u8; 32]>,
{
    fn from(value: T) -> Self {
        Hash32(value.into())
    }
}

impl Hash32 {
    /// Fingerprint of one reduction: its class, concrete options and the
    /// fingerprints of the results it consumed.
    pub(crate) fn fingerprint(
        class: &str,
        options: &Value,
        upstream: &[Hash32],
    ) -> Result<Self, serde_json::Error> {
        let options = serde_json::to_vec(options)?;

        let mut hasher = blake3::Hasher::new();
        hasher.update(class.as_bytes()).update(&[0]).update(&options);

        for hash in upstream {
            hasher.update(&hash.0);
        }

        Ok(hasher.finalize().into())
    }

    pub fn to_hex(self) -> String {
        const HEX: &[u8; 16] = b"0123456789abcdef";
        let mut acc = String::with_capacity(64);

        for &byte in self.0.iter() {
            acc.push(HEX[(byte >> 4) as usize] as char);
            acc.push(HEX[(byte & 0xF) as usize] as char);
        }

        acc
    }
}

impl std::fmt::Debug for Hash32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Hash32({})", self.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex() {
        let hash = Hash32::from([0xab; 32]);
        assert_eq!(hash.to_hex(), "ab".repeat(32));
    }

    #[test]
    fn test_fingerprint_depends_on_class_and_options() {
        let a = Value::map([("v", 1.0)]);
        let b = Value::map([("v", 2.0)]);

        let fa = Hash32::fingerprint("poisson", &a, &[]).unwrap();
        assert_eq!(fa, Hash32::fingerprint("poisson", &a, &[]).unwrap());
        assert_ne!(fa, Hash32::fingerprint("poisson", &b, &[]).unwrap());
        assert_ne!(fa, Hash32::fingerprint("mesh", &a, &[]).unwrap());
        assert_ne!(fa, Hash32::fingerprint("poisson", &a, &[fa]).unwrap());
    }
}
