//! Upstream public-key auth with a key only a plugin holds.

use crate::knownhosts::same_key;
use crate::plugin::{Plugin, RpcError};
use russh::keys::ssh_key::{Algorithm, HashAlg, PublicKey, Signature};
use russh::{CryptoVec, Signer};
use signature::Verifier;
use std::future::Future;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum SignerError {
  #[error(transparent)]
  Send(#[from] russh::SendError),

  #[error("remote signer failed: {0}")]
  Rpc(#[from] RpcError),

  #[error("upstream asked for a signature with a key the plugin did not declare")]
  WrongKey,

  /// The plugin produced something that does not verify under the key it
  /// declared. Nothing it signs for this pipe can be trusted after that.
  #[error("remote signature does not verify: {0}")]
  BadSignature(String),
}

/// Signs upstream user-auth challenges by asking the plugin that minted
/// `handle`. Every signature is checked against `key` before it leaves.
pub struct RemoteSigner {
  plugin: Arc<Plugin>,
  handle: String,
  key: PublicKey,
}

/// The `hash_alg` field of a `Sign` request.
fn hash_alg_name(hash_alg: Option<HashAlg>) -> &'static str {
  match hash_alg {
    Some(HashAlg::Sha256) => "sha256",
    Some(HashAlg::Sha512) => "sha512",
    _ => "",
  }
}

impl RemoteSigner {
  pub fn new(plugin: Arc<Plugin>, handle: String, key: PublicKey) -> Self {
    RemoteSigner { plugin, handle, key }
  }
}

/// Check a plugin's signature over `data` before it goes upstream. For RSA the
/// signature must use the hash the upstream negotiated.
fn check_signature(key: &PublicKey, data: &[u8], blob: &[u8], hash_alg: Option<HashAlg>) -> Result<(), SignerError> {
  let signature =
    Signature::try_from(blob).map_err(|error| SignerError::BadSignature(format!("malformed signature: {error}")))?;
  if let Algorithm::Rsa { .. } = key.algorithm() {
    let expected = Algorithm::Rsa { hash: hash_alg };
    if signature.algorithm() != expected {
      return Err(SignerError::BadSignature(format!(
        "expected {expected}, got {}",
        signature.algorithm()
      )));
    }
  }
  Verifier::verify(key, data, &signature).map_err(|error| SignerError::BadSignature(error.to_string()))
}

impl Signer for RemoteSigner {
  type Error = SignerError;

  fn auth_publickey_sign(
    &mut self,
    key: &PublicKey,
    hash_alg: Option<HashAlg>,
    mut to_sign: CryptoVec,
  ) -> impl Future<Output = Result<CryptoVec, Self::Error>> + Send {
    // Owned before the async block so the future does not borrow russh's key.
    let key = key.clone();
    async move {
      if !same_key(&key, &self.key) {
        return Err(SignerError::WrongKey);
      }
      let blob = self
        .plugin
        .sign(&self.handle, &to_sign, hash_alg_name(hash_alg))
        .await?;
      check_signature(&self.key, &to_sign, &blob, hash_alg)?;
      tracing::debug!(handle = %self.handle, "remote signature verified");

      to_sign.extend(&(blob.len() as u32).to_be_bytes());
      to_sign.extend(&blob);
      Ok(to_sign)
    }
  }
}
