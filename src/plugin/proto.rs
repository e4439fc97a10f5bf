//! Wire types of the plugin protocol.
//!
//! Every message on a plugin's stdio is a [`Frame`] serialized as JSON and
//! prefixed with its length (see [`super::codec`]). Field names below are part
//! of the protocol and must not change.

use crate::meta::ConnMeta;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Names of every callback either side may invoke. The proxy calls all of
/// these on plugins except `Prompt`, which plugins call on the proxy while a
/// `KeyboardInteractive` request is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Callback {
  ListCallbacks,
  NewConnection,
  NextAuthMethods,
  NoClientAuth,
  Password,
  PublicKey,
  KeyboardInteractive,
  VerifyHostKey,
  UpstreamAuthFailure,
  Banner,
  PipeStart,
  PipeError,
  PipeCreateError,
  Sign,
  Prompt,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Frame {
  Request {
    id: u64,
    callback: Callback,
    #[serde(default)]
    body: serde_json::Value,
  },
  /// A non-empty `error` means the callback failed and `body` is meaningless.
  Response {
    id: u64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    error: String,
    #[serde(default)]
    body: serde_json::Value,
  },
  Event {
    #[serde(default)]
    id: u64,
    callback: Callback,
    #[serde(default)]
    body: serde_json::Value,
  },
}

/// Base64 for byte fields, so that keys and signatures stay readable in logs
/// of the raw stream.
mod b64 {
  use base64::engine::general_purpose::STANDARD;
  use base64::Engine;
  use serde::{Deserialize, Deserializer, Serializer};

  pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&STANDARD.encode(bytes))
  }

  pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
    let encoded = String::deserialize(deserializer)?;
    STANDARD.decode(encoded).map_err(serde::de::Error::custom)
  }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ListCallbacksResponse {
  /// Unknown names are ignored so that newer plugins keep working.
  pub callbacks: Vec<String>,
}

/// Body of every callback that only needs the connection view: NewConnection,
/// NextAuthMethods, NoClientAuth, Banner, PipeStart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetaRequest {
  pub meta: ConnMeta,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NextAuthMethodsResponse {
  pub methods: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PasswordRequest {
  pub meta: ConnMeta,
  #[serde(with = "b64")]
  pub password: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublicKeyRequest {
  pub meta: ConnMeta,
  /// The downstream key in SSH wire form.
  #[serde(with = "b64")]
  pub public_key: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyboardInteractiveRequest {
  pub meta: ConnMeta,
  /// Routes the plugin's `Prompt` calls back to this exchange.
  pub session_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Question {
  pub text: String,
  #[serde(default)]
  pub echo: bool,
}

/// One keyboard-interactive round. Sent downstream as a single info request
/// with the questions in order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptRequest {
  pub session_id: String,
  #[serde(default)]
  pub name: String,
  #[serde(default)]
  pub instruction: String,
  #[serde(default)]
  pub questions: Vec<Question>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PromptResponse {
  pub answers: Vec<String>,
}

/// Reply to NoClientAuth, Password, PublicKey and KeyboardInteractive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerdictResponse {
  pub upstream: Upstream,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerifyHostKeyRequest {
  pub meta: ConnMeta,
  pub hostname: String,
  pub netaddr: String,
  #[serde(with = "b64")]
  pub key: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpstreamAuthFailureNotice {
  pub meta: ConnMeta,
  pub method: String,
  pub error: String,
  #[serde(default)]
  pub allowed_methods: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BannerResponse {
  #[serde(default)]
  pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipeErrorNotice {
  pub meta: ConnMeta,
  pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipeCreateErrorNotice {
  pub from_addr: String,
  pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignRequest {
  pub handle: String,
  #[serde(with = "b64")]
  pub data: Vec<u8>,
  /// "" for the key's default, otherwise "sha256" or "sha512" (RSA only).
  #[serde(default)]
  pub hash_alg: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignResponse {
  /// SSH signature blob: string(algorithm) || string(signature).
  #[serde(with = "b64")]
  pub signature: Vec<u8>,
}

/// Where to connect and how to authenticate there. Produced by a plugin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Upstream {
  #[serde(default)]
  pub host: String,

  /// 0 means 22.
  #[serde(default)]
  pub port: i32,

  /// `tcp://host:port`. Wins over `host`/`port` when set.
  #[serde(default, skip_serializing_if = "String::is_empty")]
  pub uri: String,

  /// Empty means "use the downstream user".
  #[serde(default)]
  pub user_name: String,

  #[serde(default)]
  pub ignore_host_key: bool,

  /// known_hosts content to verify the upstream key against. When empty and
  /// `ignore_host_key` is false the plugin's `VerifyHostKey` decides.
  #[serde(default, with = "b64", skip_serializing_if = "Vec::is_empty")]
  pub known_hosts: Vec<u8>,

  pub auth: UpstreamAuth,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UpstreamAuth {
  None,
  Password {
    password: String,
  },
  PrivateKey {
    /// OpenSSH or PKCS#8 PEM.
    #[serde(with = "b64")]
    private_key: Vec<u8>,
    /// Optional OpenSSH certificate (`ssh-ed25519-cert-v01@openssh.com AAAA...`).
    #[serde(default, with = "b64", skip_serializing_if = "Vec::is_empty")]
    certificate: Vec<u8>,
  },
  RemoteSigner {
    handle: String,
    /// The key the plugin will sign with, SSH wire form.
    #[serde(with = "b64")]
    public_key: Vec<u8>,
  },
  NextPlugin {
    #[serde(default)]
    meta: HashMap<String, String>,
  },
  /// Fail this downstream attempt, stay on the current plugin.
  RetryDownstream {
    #[serde(default)]
    meta: HashMap<String, String>,
    #[serde(default)]
    methods: Vec<String>,
  },
}

/// How to treat the upstream's host key, derived from a decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostKeyPolicy {
  IgnoreAll,
  KnownHosts(Vec<u8>),
  Callback,
}

impl Upstream {
  /// The `(host, port)` to dial.
  pub fn target(&self) -> Result<(String, u16), String> {
    if let Some(rest) = self.uri.strip_prefix("tcp://") {
      return split_host_port(rest);
    }
    if !self.uri.is_empty() {
      return Err(format!("unsupported upstream uri {:?}", self.uri));
    }
    if self.host.is_empty() {
      return Err("upstream host is empty".to_string());
    }
    let port = match self.port {
      0 => 22,
      port => u16::try_from(port).map_err(|_| format!("upstream port {port} out of range"))?,
    };
    Ok((self.host.clone(), port))
  }

  pub fn user_or<'a>(&'a self, downstream_user: &'a str) -> &'a str {
    if self.user_name.is_empty() {
      downstream_user
    } else {
      &self.user_name
    }
  }

  pub fn host_key_policy(&self) -> HostKeyPolicy {
    if self.ignore_host_key {
      HostKeyPolicy::IgnoreAll
    } else if !self.known_hosts.is_empty() {
      HostKeyPolicy::KnownHosts(self.known_hosts.clone())
    } else {
      HostKeyPolicy::Callback
    }
  }
}

/// Split "host", "host:port" or "[v6]:port" for SSH. The port defaults to 22.
pub fn split_host_port(addr: &str) -> Result<(String, u16), String> {
  if addr.is_empty() {
    return Err("empty address".to_string());
  }
  let parse_port = |port: &str| {
    port
      .parse::<u16>()
      .map_err(|error| format!("bad port in {addr:?}: {error}"))
  };
  if let Some(rest) = addr.strip_prefix('[') {
    let (host, tail) = rest
      .split_once(']')
      .ok_or_else(|| format!("missing ']' in {addr:?}"))?;
    return match tail.strip_prefix(':') {
      Some(port) => Ok((host.to_string(), parse_port(port)?)),
      None if tail.is_empty() => Ok((host.to_string(), 22)),
      None => Err(format!("garbage after ']' in {addr:?}")),
    };
  }
  match addr.rsplit_once(':') {
    // More than one colon without brackets is a bare IPv6 address.
    Some((host, _)) if host.contains(':') => Ok((addr.to_string(), 22)),
    Some((host, port)) if !host.is_empty() => Ok((host.to_string(), parse_port(port)?)),
    Some(_) => Err(format!("empty host in {addr:?}")),
    None => Ok((addr.to_string(), 22)),
  }
}
