use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// The view of a connection every plugin callback receives.
///
/// Everything except `metadata` is fixed once the downstream user is known.
/// `metadata` is the only way one plugin can hand information to a later
/// plugin in the chain (or to its own upstream-side callbacks, eg.
/// `VerifyHostKey`). Merges happen between callbacks, never during one, since
/// callbacks for a single connection are serialized.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnMeta {
  /// A random UUID assigned at accept time. Unique across all live pipes.
  pub unique_id: String,

  /// The user name the downstream client presented. Empty until the first
  /// user-auth request arrives.
  pub user_name: String,

  /// The downstream peer, "host:port".
  pub from_addr: String,

  #[serde(default)]
  pub metadata: HashMap<String, String>,
}

impl ConnMeta {
  pub fn new(from_addr: impl Into<String>) -> Self {
    ConnMeta {
      unique_id: Uuid::new_v4().to_string(),
      user_name: String::new(),
      from_addr: from_addr.into(),
      metadata: HashMap::new(),
    }
  }

  /// Merge `delta` into the metadata bag. Keys in `delta` win, keys that are
  /// not mentioned are left alone.
  pub fn merge(&mut self, delta: &HashMap<String, String>) {
    self
      .metadata
      .extend(delta.iter().map(|(k, v)| (k.clone(), v.clone())));
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::collections::HashSet;

  #[test]
  fn merge_overwrites_and_preserves() {
    let mut meta = ConnMeta::new("192.0.2.1:5555");
    meta.merge(&HashMap::from([
      ("totp".to_string(), "ok".to_string()),
      ("team".to_string(), "infra".to_string()),
    ]));
    meta.merge(&HashMap::from([("team".to_string(), "dba".to_string())]));

    assert_eq!(meta.metadata.get("totp").map(String::as_str), Some("ok"));
    assert_eq!(meta.metadata.get("team").map(String::as_str), Some("dba"));
    assert_eq!(meta.metadata.len(), 2);
  }

  #[test]
  fn merge_sequence_is_order_sensitive() {
    let deltas = [
      HashMap::from([("step".to_string(), "1".to_string())]),
      HashMap::from([("step".to_string(), "2".to_string()), ("a".to_string(), "x".to_string())]),
      HashMap::from([("b".to_string(), "y".to_string())]),
    ];
    let mut meta = ConnMeta::new("192.0.2.1:5555");
    for delta in &deltas {
      meta.merge(delta);
    }
    assert_eq!(
      meta.metadata,
      HashMap::from([
        ("step".to_string(), "2".to_string()),
        ("a".to_string(), "x".to_string()),
        ("b".to_string(), "y".to_string()),
      ])
    );
  }

  #[test]
  fn unique_ids_do_not_collide() {
    let ids: HashSet<String> = (0..1000).map(|_| ConnMeta::new("127.0.0.1:1").unique_id).collect();
    assert_eq!(ids.len(), 1000);
  }

  #[test]
  fn wire_form_uses_snake_case_fields() {
    let mut meta = ConnMeta::new("198.51.100.7:40022");
    meta.user_name = "alice".into();
    let value = serde_json::to_value(&meta).unwrap();
    assert_eq!(value["user_name"], "alice");
    assert_eq!(value["from_addr"], "198.51.100.7:40022");
    assert!(value["metadata"].as_object().unwrap().is_empty());

    let back: ConnMeta = serde_json::from_value(serde_json::json!({
      "unique_id": "u1",
      "user_name": "bob",
      "from_addr": "127.0.0.1:1",
    }))
    .unwrap();
    assert!(back.metadata.is_empty());
  }
}
