//! Causal-context carrier propagated across the cluster boundary.
//!
//! The pipeline cannot keep an in-memory future waiting on a cluster
//! resource, so on resource creation a handler embeds a serialized carrier
//! into the resource's annotations; ingress rehydrates it and resumes the
//! pipeline. A carrier is deliberately an opaque map of string key/value
//! pairs rather than anything framework-specific.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// An opaque causal-context map, serialized into cluster annotations and
/// rehydrated by ingress callbacks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Carrier(BTreeMap<String, String>);

/// Injects a carrier into an outbound medium (e.g. resource annotations).
pub trait Inject {
    fn inject(&self, carrier: &Carrier);
}

/// Extracts a carrier from an inbound medium (e.g. informer callback
/// annotations).
pub trait Extract {
    fn extract(&self) -> Carrier;
}

impl Carrier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Serializes the carrier to the JSON form embedded in a `task_carrier`
    /// or `trace_carrier` annotation.
    pub fn to_annotation(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Parses a carrier back out of an annotation value. A missing or
    /// malformed annotation yields an empty carrier rather than an error —
    /// the carrier is best-effort context, never load-bearing for
    /// correctness of the state machine itself.
    pub fn from_annotation(raw: &str) -> Self {
        serde_json::from_str(raw).unwrap_or_default()
    }
}

/// A plain string-keyed map implements [`Extract`] directly, covering the
/// common case of annotation maps already deserialized by the ingress
/// transport layer.
impl Extract for BTreeMap<String, String> {
    fn extract(&self) -> Carrier {
        Carrier(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_annotation_string() {
        let mut carrier = Carrier::new();
        carrier.set("trace_id", "abc-123");
        carrier.set("span_id", "def-456");

        let annotation = carrier.to_annotation();
        let restored = Carrier::from_annotation(&annotation);

        assert_eq!(restored.get("trace_id"), Some("abc-123"));
        assert_eq!(restored.get("span_id"), Some("def-456"));
    }

    #[test]
    fn malformed_annotation_yields_empty_carrier() {
        let restored = Carrier::from_annotation("not json");
        assert!(restored.is_empty());
    }

    #[test]
    fn map_extract_impl_copies_entries() {
        let mut map = BTreeMap::new();
        map.insert("task_id".to_string(), "t-1".to_string());
        let carrier = map.extract();
        assert_eq!(carrier.get("task_id"), Some("t-1"));
    }
}
