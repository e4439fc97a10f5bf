//! The client half of a pipe: dialing the upstream a plugin picked and
//! authenticating there the way the decision says.

use crate::auth::AuthMethod;
use crate::knownhosts;
use crate::meta::ConnMeta;
use crate::pipe::splice::Splice;
use crate::plugin::proto::{HostKeyPolicy, Upstream, UpstreamAuth, VerifyHostKeyRequest};
use crate::plugin::{Plugin, RpcError};
use crate::signer::{RemoteSigner, SignerError};
use crate::{Error, Result};
use russh::client::{self, AuthResult};
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::ssh_key::{Algorithm, Certificate, HashAlg};
use russh::keys::PublicKey;
use russh::{Channel, MethodSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

/// Everything the upstream side of one pipe needs to know about the pipe.
#[derive(Clone)]
pub struct PipeContext {
  pub span: tracing::Span,
  pub meta: ConnMeta,
  /// The plugin whose decision is being dialed. It answers `VerifyHostKey`
  /// and `Sign`.
  pub plugin: Arc<Plugin>,
  pub splice: Splice,
  pub cancel: CancellationToken,
  /// Bounds the TCP connect and the SSH handshake separately.
  pub timeout: Duration,
}

/// A failed dial. `allowed_methods` is what the upstream offered when it
/// rejected our credentials, if it got that far.
#[derive(Debug)]
pub struct ConnectError {
  pub method: &'static str,
  pub error: Error,
  pub allowed_methods: Vec<String>,
}

impl ConnectError {
  fn new(method: &'static str, error: Error) -> Self {
    ConnectError {
      method,
      error,
      allowed_methods: Vec::new(),
    }
  }
}

pub struct UpstreamHandler {
  span: tracing::Span,
  meta: ConnMeta,
  hostname: String,
  port: u16,
  addr: Option<SocketAddr>,
  policy: HostKeyPolicy,
  plugin: Arc<Plugin>,
  splice: Splice,
  cancel: CancellationToken,
  /// Set once auth succeeded; from then on losing the upstream ends the pipe.
  established: Arc<AtomicBool>,
}

impl UpstreamHandler {
  async fn verify(&self, key: &PublicKey) -> Result<()> {
    match &self.policy {
      HostKeyPolicy::IgnoreAll => {
        tracing::debug!(parent: &self.span, fingerprint = %key.fingerprint(HashAlg::Sha256), "ignoring upstream host key");
        Ok(())
      }
      HostKeyPolicy::KnownHosts(data) => knownhosts::verify_host_key(
        data,
        &self.hostname,
        self.port,
        self.addr.map(|addr| addr.ip()),
        key,
      ),
      HostKeyPolicy::Callback => {
        let request = VerifyHostKeyRequest {
          meta: self.meta.clone(),
          hostname: format!("{}:{}", self.hostname, self.port),
          netaddr: self.addr.map(|addr| addr.to_string()).unwrap_or_default(),
          key: knownhosts::wire_form(key)?,
        };
        match self.plugin.verify_host_key(&request).await {
          Ok(()) => Ok(()),
          Err(RpcError::Remote(reason)) => Err(Error::HostKeyMismatch(reason)),
          Err(error) => Err(error.into()),
        }
      }
    }
  }
}

impl client::Handler for UpstreamHandler {
  type Error = anyhow::Error;

  async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
    match self.verify(server_public_key).await {
      Ok(()) => Ok(true),
      Err(error) => {
        tracing::warn!(
          parent: &self.span,
          host = %self.hostname,
          port = self.port,
          fingerprint = %server_public_key.fingerprint(HashAlg::Sha256),
          %error,
          "upstream host key rejected"
        );
        Err(error.into())
      }
    }
  }

  // The downstream banner slot is spent by now, so these only get logged.
  async fn auth_banner(&mut self, banner: &str, _session: &mut client::Session) -> Result<(), Self::Error> {
    tracing::info!(parent: &self.span, banner, "upstream banner");
    Ok(())
  }

  async fn server_channel_open_forwarded_tcpip(
    &mut self,
    channel: Channel<client::Msg>,
    connected_address: &str,
    connected_port: u32,
    originator_address: &str,
    originator_port: u32,
    _session: &mut client::Session,
  ) -> Result<(), Self::Error> {
    tracing::debug!(
      parent: &self.span,
      connected_address,
      connected_port,
      originator_address,
      originator_port,
      "upstream opened forwarded-tcpip"
    );
    self.splice.open_forwarded(
      channel,
      connected_address.to_string(),
      connected_port,
      originator_address.to_string(),
      originator_port,
    );
    Ok(())
  }
}

impl Drop for UpstreamHandler {
  fn drop(&mut self) {
    if self.established.load(Ordering::Acquire) {
      tracing::debug!(parent: &self.span, "upstream session ended");
      self.cancel.cancel();
    }
  }
}

fn auth_method_name(auth: &UpstreamAuth) -> &'static str {
  match auth {
    UpstreamAuth::None => "none",
    UpstreamAuth::Password { .. } => "password",
    UpstreamAuth::PrivateKey { .. } | UpstreamAuth::RemoteSigner { .. } => "publickey",
    UpstreamAuth::NextPlugin { .. } => "next_plugin",
    UpstreamAuth::RetryDownstream { .. } => "retry_downstream",
  }
}

/// The method names in an upstream USERAUTH_FAILURE that we know about.
fn method_names(methods: &MethodSet) -> Vec<String> {
  AuthMethod::ALL
    .into_iter()
    .filter(|method| methods.contains(&method.kind()))
    .map(|method| method.name().to_string())
    .collect()
}

/// A handshake error from russh carries our own [`Error`] when it came out of
/// `check_server_key`; everything else means the upstream is unusable.
fn handshake_error(error: anyhow::Error) -> Error {
  match error.downcast::<Error>() {
    Ok(error) => error,
    Err(error) => Error::UpstreamUnreachable(format!("{error:#}")),
  }
}

fn decision_error(what: &str, error: impl std::fmt::Display) -> Error {
  Error::AuthRejected(format!("bad {what} in upstream decision: {error}"))
}

/// Dial `upstream` and authenticate as its user (or `downstream_user`).
/// Nothing is sent to the upstream before this is called.
#[tracing::instrument(parent = &ctx.span, skip_all, fields(upstream = %upstream.host, auth = auth_method_name(&upstream.auth)))]
pub async fn connect(
  ctx: &PipeContext,
  upstream: &Upstream,
  downstream_user: &str,
) -> std::result::Result<client::Handle<UpstreamHandler>, ConnectError> {
  let method = auth_method_name(&upstream.auth);
  let fail = |error: Error| ConnectError::new(method, error);

  let (host, port) = upstream.target().map_err(|reason| fail(Error::UpstreamUnreachable(reason)))?;
  let stream = tokio::time::timeout(ctx.timeout, TcpStream::connect((host.as_str(), port)))
    .await
    .map_err(|_| fail(Error::UpstreamUnreachable(format!("timed out connecting to {host}:{port}"))))?
    .map_err(|error| fail(Error::UpstreamUnreachable(format!("{host}:{port}: {error}"))))?;
  let addr = stream.peer_addr().ok();
  tracing::debug!(?addr, "upstream tcp connected");

  let established = Arc::new(AtomicBool::new(false));
  let handler = UpstreamHandler {
    span: ctx.span.clone(),
    meta: ctx.meta.clone(),
    hostname: host.clone(),
    port,
    addr,
    policy: upstream.host_key_policy(),
    plugin: ctx.plugin.clone(),
    splice: ctx.splice.clone(),
    cancel: ctx.cancel.clone(),
    established: established.clone(),
  };
  let config = Arc::new(client::Config::default());
  let mut handle = tokio::time::timeout(ctx.timeout, client::connect_stream(config, stream, handler))
    .await
    .map_err(|_| fail(Error::UpstreamUnreachable(format!("ssh handshake with {host}:{port} timed out"))))?
    .map_err(|error| fail(handshake_error(error)))?;

  let user = upstream.user_or(downstream_user);
  match authenticate(&mut handle, user, &upstream.auth, &ctx.plugin).await {
    Ok(AuthResult::Success) => {
      established.store(true, Ordering::Release);
      tracing::info!(%host, port, user, "upstream authenticated");
      Ok(handle)
    }
    Ok(AuthResult::Failure { remaining_methods, .. }) => {
      let _ = handle
        .disconnect(russh::Disconnect::ByApplication, "", "en")
        .await;
      Err(ConnectError {
        method,
        error: Error::AuthRejected(format!("{host}:{port} rejected {method} auth for {user}")),
        allowed_methods: method_names(&remaining_methods),
      })
    }
    Err(error) => {
      let _ = handle
        .disconnect(russh::Disconnect::ByApplication, "", "en")
        .await;
      Err(fail(error))
    }
  }
}

async fn authenticate(
  handle: &mut client::Handle<UpstreamHandler>,
  user: &str,
  auth: &UpstreamAuth,
  plugin: &Arc<Plugin>,
) -> Result<AuthResult> {
  let transport = |error: russh::Error| Error::UpstreamUnreachable(error.to_string());
  match auth {
    UpstreamAuth::None => handle.authenticate_none(user).await.map_err(transport),
    UpstreamAuth::Password { password } => handle.authenticate_password(user, password).await.map_err(transport),
    UpstreamAuth::PrivateKey {
      private_key,
      certificate,
    } => {
      let pem = std::str::from_utf8(private_key).map_err(|error| decision_error("private key", error))?;
      // NOTE: encrypted keys are not supported.
      let key = russh::keys::decode_secret_key(pem, None).map_err(|error| decision_error("private key", error))?;
      if certificate.is_empty() {
        let hash_alg = handle.best_supported_rsa_hash().await.map_err(transport)?.flatten();
        handle
          .authenticate_publickey(user, PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg))
          .await
          .map_err(transport)
      } else {
        let text = std::str::from_utf8(certificate).map_err(|error| decision_error("certificate", error))?;
        let cert = Certificate::from_openssh(text.trim()).map_err(|error| decision_error("certificate", error))?;
        handle
          .authenticate_openssh_cert(user, Arc::new(key), cert)
          .await
          .map_err(transport)
      }
    }
    UpstreamAuth::RemoteSigner {
      handle: key_handle,
      public_key,
    } => {
      let key = PublicKey::from_bytes(public_key).map_err(|error| decision_error("signer public key", error))?;
      let hash_alg = match key.algorithm() {
        Algorithm::Rsa { .. } => handle.best_supported_rsa_hash().await.map_err(transport)?.flatten(),
        _ => None,
      };
      let mut signer = RemoteSigner::new(plugin.clone(), key_handle.clone(), key.clone());
      handle
        .authenticate_publickey_with(user, key, hash_alg, &mut signer)
        .await
        .map_err(|error| match error {
          SignerError::Send(error) => Error::UpstreamUnreachable(error.to_string()),
          SignerError::Rpc(error) => error.into(),
          // A plugin that signs with a key other than the one it declared is
          // broken; keep it away from this pipe.
          SignerError::WrongKey | SignerError::BadSignature(_) => Error::Protocol(error.to_string()),
        })
    }
    UpstreamAuth::NextPlugin { .. } | UpstreamAuth::RetryDownstream { .. } => Err(Error::InternalInvariant(
      "chain-stepping verdict reached the upstream dialer".to_string(),
    )),
  }
}
