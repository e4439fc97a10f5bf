use super::proto::*;
use super::rpc::{Dispatch, RpcPeer};
use super::RpcError;
use crate::meta::ConnMeta;
use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio_util::task::AbortOnDropHandle;
use uuid::Uuid;

/// A `Prompt` the plugin sent, waiting for the downstream user's answers.
#[derive(Debug)]
pub struct PromptExchange {
  pub request: PromptRequest,
  pub reply: oneshot::Sender<Vec<String>>,
}

type PromptRoutes = DashMap<String, mpsc::Sender<PromptExchange>>;

/// Removes a keyboard-interactive route when the exchange is abandoned.
struct RouteGuard {
  routes: Arc<PromptRoutes>,
  session_id: String,
}

impl Drop for RouteGuard {
  fn drop(&mut self) {
    self.routes.remove(&self.session_id);
  }
}

/// A keyboard-interactive call in flight. The plugin's prompts arrive on
/// `prompts` until `verdict` resolves.
pub struct KeyboardInteractive {
  pub prompts: mpsc::Receiver<PromptExchange>,
  pub verdict: BoxFuture<'static, Result<Upstream, RpcError>>,
  _route: RouteGuard,
}

/// Answers the one callback plugins may invoke on the proxy.
struct ProxyDispatch {
  routes: Arc<PromptRoutes>,
}

#[async_trait]
impl Dispatch for ProxyDispatch {
  async fn request(&self, callback: Callback, body: serde_json::Value) -> Result<serde_json::Value, String> {
    if callback != Callback::Prompt {
      return Err(format!("the proxy does not implement {callback:?}"));
    }
    let request: PromptRequest = serde_json::from_value(body).map_err(|error| error.to_string())?;
    // Clone the sender out so that the map shard is not locked while we wait
    // on the downstream user.
    let route = self
      .routes
      .get(&request.session_id)
      .map(|entry| entry.value().clone())
      .ok_or_else(|| format!("no keyboard-interactive session {:?}", request.session_id))?;

    let (reply, answers) = oneshot::channel();
    route
      .send(PromptExchange { request, reply })
      .await
      .map_err(|_| "keyboard-interactive session ended".to_string())?;
    let answers = answers
      .await
      .map_err(|_| "downstream did not answer".to_string())?;
    serde_json::to_value(PromptResponse { answers }).map_err(|error| error.to_string())
  }
}

/// A connected plugin. Cheap to share between pipes; every call is
/// independent and may run concurrently with calls from other pipes.
pub struct Plugin {
  name: String,
  peer: Arc<RpcPeer>,
  callbacks: HashSet<Callback>,
  routes: Arc<PromptRoutes>,
  _stderr: Option<AbortOnDropHandle<()>>,
  _child: Option<tokio::process::Child>,
}

impl std::fmt::Debug for Plugin {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Plugin")
      .field("name", &self.name)
      .field("callbacks", &self.callbacks)
      .finish()
  }
}

impl Plugin {
  /// Speak the plugin protocol over an arbitrary stream pair and learn which
  /// callbacks the other side implements.
  #[tracing::instrument(level = "debug", skip(reader, writer))]
  pub async fn connect<R, W>(name: &str, reader: R, writer: W) -> Result<Plugin, RpcError>
  where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + 'static,
  {
    let routes = Arc::new(PromptRoutes::new());
    let dispatch = Arc::new(ProxyDispatch { routes: routes.clone() });
    let peer = RpcPeer::start(name, reader, writer, dispatch);

    let declared: ListCallbacksResponse = peer.call(Callback::ListCallbacks, &serde_json::json!({})).await?;
    let callbacks = declared
      .callbacks
      .iter()
      .filter_map(|name| match serde_json::from_value(serde_json::Value::String(name.clone())) {
        Ok(callback) => Some(callback),
        Err(_) => {
          tracing::warn!(callback = %name, "plugin declared an unknown callback");
          None
        }
      })
      .collect::<HashSet<Callback>>();
    tracing::info!(plugin = name, ?callbacks, "plugin connected");

    Ok(Plugin {
      name: name.to_string(),
      peer,
      callbacks,
      routes,
      _stderr: None,
      _child: None,
    })
  }

  /// Tie a subprocess' lifetime to this plugin.
  pub(super) fn attach_process(&mut self, child: tokio::process::Child, stderr: Option<AbortOnDropHandle<()>>) {
    self._child = Some(child);
    self._stderr = stderr;
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn supports(&self, callback: Callback) -> bool {
    self.callbacks.contains(&callback)
  }

  /// Close the RPC stream. Outstanding calls fail with [`RpcError::Closed`].
  pub fn shutdown(&self) {
    self.peer.close();
  }

  fn require(&self, callback: Callback) -> Result<(), RpcError> {
    if self.supports(callback) {
      Ok(())
    } else {
      Err(RpcError::Remote(format!("{} does not implement {callback:?}", self.name)))
    }
  }

  pub async fn new_connection(&self, meta: &ConnMeta) -> Result<(), RpcError> {
    self.require(Callback::NewConnection)?;
    self
      .peer
      .call::<_, serde_json::Value>(Callback::NewConnection, &MetaRequest { meta: meta.clone() })
      .await
      .map(|_| ())
  }

  pub async fn next_auth_methods(&self, meta: &ConnMeta) -> Result<Vec<String>, RpcError> {
    self.require(Callback::NextAuthMethods)?;
    let response: NextAuthMethodsResponse = self
      .peer
      .call(Callback::NextAuthMethods, &MetaRequest { meta: meta.clone() })
      .await?;
    Ok(response.methods)
  }

  pub async fn no_client_auth(&self, meta: &ConnMeta) -> Result<Upstream, RpcError> {
    self.require(Callback::NoClientAuth)?;
    let response: VerdictResponse = self
      .peer
      .call(Callback::NoClientAuth, &MetaRequest { meta: meta.clone() })
      .await?;
    Ok(response.upstream)
  }

  // NOTE: `password` is kept out of the span.
  #[tracing::instrument(level = "debug", skip_all, fields(plugin = %self.name))]
  pub async fn password(&self, meta: &ConnMeta, password: &[u8]) -> Result<Upstream, RpcError> {
    self.require(Callback::Password)?;
    let request = PasswordRequest {
      meta: meta.clone(),
      password: password.to_vec(),
    };
    let response: VerdictResponse = self.peer.call(Callback::Password, &request).await?;
    Ok(response.upstream)
  }

  pub async fn public_key(&self, meta: &ConnMeta, public_key: &[u8]) -> Result<Upstream, RpcError> {
    self.require(Callback::PublicKey)?;
    let request = PublicKeyRequest {
      meta: meta.clone(),
      public_key: public_key.to_vec(),
    };
    let response: VerdictResponse = self.peer.call(Callback::PublicKey, &request).await?;
    Ok(response.upstream)
  }

  /// Prepare a keyboard-interactive exchange. Nothing is sent until `verdict`
  /// is first polled; prompts for it are only accepted while the returned
  /// value is alive.
  pub fn keyboard_interactive(&self, meta: &ConnMeta) -> Result<KeyboardInteractive, RpcError> {
    self.require(Callback::KeyboardInteractive)?;
    let session_id = Uuid::new_v4().to_string();
    let (tx, prompts) = mpsc::channel(1);
    self.routes.insert(session_id.clone(), tx);
    let route = RouteGuard {
      routes: self.routes.clone(),
      session_id: session_id.clone(),
    };

    let peer = self.peer.clone();
    let request = KeyboardInteractiveRequest {
      meta: meta.clone(),
      session_id,
    };
    let verdict = async move {
      let response: VerdictResponse = peer.call(Callback::KeyboardInteractive, &request).await?;
      Ok(response.upstream)
    }
    .boxed();

    Ok(KeyboardInteractive {
      prompts,
      verdict,
      _route: route,
    })
  }

  pub async fn verify_host_key(&self, request: &VerifyHostKeyRequest) -> Result<(), RpcError> {
    self.require(Callback::VerifyHostKey)?;
    self
      .peer
      .call::<_, serde_json::Value>(Callback::VerifyHostKey, request)
      .await
      .map(|_| ())
  }

  pub async fn banner(&self, meta: &ConnMeta) -> Result<String, RpcError> {
    self.require(Callback::Banner)?;
    let response: BannerResponse = self
      .peer
      .call(Callback::Banner, &MetaRequest { meta: meta.clone() })
      .await?;
    Ok(response.message)
  }

  #[tracing::instrument(level = "debug", skip(self, data), fields(plugin = %self.name, len = data.len()))]
  pub async fn sign(&self, handle: &str, data: &[u8], hash_alg: &str) -> Result<Vec<u8>, RpcError> {
    self.require(Callback::Sign)?;
    let request = SignRequest {
      handle: handle.to_string(),
      data: data.to_vec(),
      hash_alg: hash_alg.to_string(),
    };
    let response: SignResponse = self.peer.call(Callback::Sign, &request).await?;
    Ok(response.signature)
  }

  /// Events are best effort: a plugin that did not declare the callback is
  /// skipped and delivery failures are only logged.
  async fn event<B: serde::Serialize>(&self, callback: Callback, body: &B) {
    if !self.supports(callback) {
      return;
    }
    if let Err(error) = self.peer.notify(callback, body).await {
      tracing::warn!(plugin = %self.name, ?callback, ?error, "failed to deliver event");
    }
  }

  pub async fn upstream_auth_failure(&self, notice: &UpstreamAuthFailureNotice) {
    self.event(Callback::UpstreamAuthFailure, notice).await
  }

  pub async fn pipe_start(&self, meta: &ConnMeta) {
    self.event(Callback::PipeStart, &MetaRequest { meta: meta.clone() }).await
  }

  pub async fn pipe_error(&self, meta: &ConnMeta, error: &str) {
    let notice = PipeErrorNotice {
      meta: meta.clone(),
      error: error.to_string(),
    };
    self.event(Callback::PipeError, &notice).await
  }

  pub async fn pipe_create_error(&self, from_addr: &str, error: &str) {
    let notice = PipeCreateErrorNotice {
      from_addr: from_addr.to_string(),
      error: error.to_string(),
    };
    self.event(Callback::PipeCreateError, &notice).await
  }
}

impl Drop for Plugin {
  fn drop(&mut self) {
    self.peer.close();
  }
}
