//! Content fingerprints.
//!
//! Hashes are opaque strings to the rest of the core. [`ContentHasher`] is
//! the seam for whatever service produces them; [`Sha256Hasher`] is the
//! built-in implementation used when a caller does not bring its own.

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::diff::{FieldMap, Snapshot};

/// Produces a comparable fingerprint for a snapshot's field data.
pub trait ContentHasher: Send + Sync {
    fn fingerprint(&self, data: &FieldMap) -> String;

    /// Fingerprint a whole snapshot, preferring a hash it already carries.
    fn fingerprint_snapshot(&self, snapshot: &Snapshot) -> String {
        match &snapshot.hash {
            Some(hash) if !hash.is_empty() => hash.clone(),
            _ => self.fingerprint(&snapshot.data),
        }
    }
}

/// SHA-256 over the canonical JSON encoding of the field data.
///
/// Object keys are emitted in sorted order at every depth, so two snapshots
/// with equal data always share a fingerprint.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sha256Hasher;

impl ContentHasher for Sha256Hasher {
    fn fingerprint(&self, data: &FieldMap) -> String {
        let mut canonical = String::new();
        write_canonical(&mut canonical, &Value::Object(data.clone().into_iter().collect()));

        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        hex::encode(hasher.finalize())
    }
}

fn write_canonical(out: &mut String, value: &Value) {
    match value {
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(out, item);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(out, &map[key]);
            }
            out.push('}');
        }
        // Integral floats hash like integers so that 1 and 1.0 agree.
        Value::Number(n) => match n.as_f64() {
            Some(f) if n.is_f64() && f.fract() == 0.0 && f.abs() < 9.0e15 => {
                out.push_str(&(f as i64).to_string())
            }
            _ => out.push_str(&n.to_string()),
        },
        scalar => out.push_str(&scalar.to_string()),
    }
}
