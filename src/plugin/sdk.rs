//! The plugin side of the protocol.
//!
//! A plugin implements [`PluginHandler`] and hands it to [`serve`] (or
//! [`serve_stdio`] from its `main`). Only the callbacks listed by
//! [`PluginHandler::callbacks`] are ever invoked by the proxy; the default
//! bodies exist so that implementations stay short.
//!
//! ```no_run
//! use piper::plugin::proto::{Callback, Upstream, UpstreamAuth};
//! use piper::plugin::sdk::{serve_stdio, PluginHandler};
//! use piper::meta::ConnMeta;
//!
//! struct AllowAll;
//!
//! #[async_trait::async_trait]
//! impl PluginHandler for AllowAll {
//!   fn callbacks(&self) -> Vec<Callback> {
//!     vec![Callback::NoClientAuth]
//!   }
//!
//!   async fn no_client_auth(&self, _meta: ConnMeta) -> Result<Upstream, String> {
//!     Ok(Upstream {
//!       host: "10.0.0.5".into(),
//!       port: 22,
//!       uri: String::new(),
//!       user_name: String::new(),
//!       ignore_host_key: true,
//!       known_hosts: vec![],
//!       auth: UpstreamAuth::None,
//!     })
//!   }
//! }
//!
//! # async fn run() -> Result<(), piper::plugin::RpcError> {
//! serve_stdio(AllowAll).await
//! # }
//! ```

use super::proto::*;
use super::rpc::{Dispatch, RpcPeer};
use super::RpcError;
use crate::meta::ConnMeta;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::{Arc, Weak};
use tokio::io::{AsyncRead, AsyncWrite};

fn not_implemented(callback: Callback) -> String {
  format!("{callback:?} is not implemented")
}

#[async_trait]
pub trait PluginHandler: Send + Sync + 'static {
  /// The callbacks this plugin implements, reported to the proxy once at
  /// startup.
  fn callbacks(&self) -> Vec<Callback>;

  /// Return an error to refuse the connection outright.
  async fn new_connection(&self, _meta: ConnMeta) -> Result<(), String> {
    Err(not_implemented(Callback::NewConnection))
  }

  async fn next_auth_methods(&self, _meta: ConnMeta) -> Result<Vec<String>, String> {
    Err(not_implemented(Callback::NextAuthMethods))
  }

  async fn no_client_auth(&self, _meta: ConnMeta) -> Result<Upstream, String> {
    Err(not_implemented(Callback::NoClientAuth))
  }

  async fn password(&self, _meta: ConnMeta, _password: Vec<u8>) -> Result<Upstream, String> {
    Err(not_implemented(Callback::Password))
  }

  /// Called when the client offers a key. The answer only takes effect once
  /// the client has proven it holds the key; a plugin reached by a hand-off
  /// from an earlier one is asked after that proof.
  async fn public_key(&self, _meta: ConnMeta, _public_key: Vec<u8>) -> Result<Upstream, String> {
    Err(not_implemented(Callback::PublicKey))
  }

  async fn keyboard_interactive(&self, _meta: ConnMeta, _prompter: Prompter) -> Result<Upstream, String> {
    Err(not_implemented(Callback::KeyboardInteractive))
  }

  async fn verify_host_key(&self, _request: VerifyHostKeyRequest) -> Result<(), String> {
    Err(not_implemented(Callback::VerifyHostKey))
  }

  async fn banner(&self, _meta: ConnMeta) -> Result<String, String> {
    Err(not_implemented(Callback::Banner))
  }

  /// Produce an SSH signature blob for `request.data` with the key behind
  /// `request.handle`.
  async fn sign(&self, _request: SignRequest) -> Result<Vec<u8>, String> {
    Err(not_implemented(Callback::Sign))
  }

  async fn upstream_auth_failure(&self, _notice: UpstreamAuthFailureNotice) {}

  async fn pipe_start(&self, _meta: ConnMeta) {}

  async fn pipe_error(&self, _notice: PipeErrorNotice) {}

  async fn pipe_create_error(&self, _notice: PipeCreateErrorNotice) {}
}

/// Asks the downstream user questions during `keyboard_interactive`.
pub struct Prompter {
  peer: Weak<RpcPeer>,
  session_id: String,
}

impl Prompter {
  /// One round of questions. The answers come back in question order. An
  /// empty `questions` list still shows `name` and `instruction` to the user.
  pub async fn prompt(&self, name: &str, instruction: &str, questions: Vec<Question>) -> Result<Vec<String>, String> {
    let peer = self.peer.upgrade().ok_or_else(|| RpcError::Closed.to_string())?;
    let request = PromptRequest {
      session_id: self.session_id.clone(),
      name: name.to_string(),
      instruction: instruction.to_string(),
      questions,
    };
    let response: PromptResponse = peer
      .call(Callback::Prompt, &request)
      .await
      .map_err(|error| error.to_string())?;
    Ok(response.answers)
  }
}

struct HandlerDispatch<H> {
  handler: H,
  peer: Weak<RpcPeer>,
}

fn parse<T: DeserializeOwned>(body: serde_json::Value) -> Result<T, String> {
  serde_json::from_value(body).map_err(|error| format!("bad request body: {error}"))
}

fn reply<T: Serialize>(body: T) -> Result<serde_json::Value, String> {
  serde_json::to_value(body).map_err(|error| error.to_string())
}

#[async_trait]
impl<H: PluginHandler> Dispatch for HandlerDispatch<H> {
  async fn request(&self, callback: Callback, body: serde_json::Value) -> Result<serde_json::Value, String> {
    let handler = &self.handler;
    match callback {
      Callback::ListCallbacks => {
        let callbacks = handler
          .callbacks()
          .into_iter()
          .filter_map(|callback| match serde_json::to_value(callback) {
            Ok(serde_json::Value::String(name)) => Some(name),
            _ => None,
          })
          .collect();
        reply(ListCallbacksResponse { callbacks })
      }
      Callback::NewConnection => {
        let MetaRequest { meta } = parse(body)?;
        handler.new_connection(meta).await?;
        Ok(serde_json::Value::Null)
      }
      Callback::NextAuthMethods => {
        let MetaRequest { meta } = parse(body)?;
        let methods = handler.next_auth_methods(meta).await?;
        reply(NextAuthMethodsResponse { methods })
      }
      Callback::NoClientAuth => {
        let MetaRequest { meta } = parse(body)?;
        let upstream = handler.no_client_auth(meta).await?;
        reply(VerdictResponse { upstream })
      }
      Callback::Password => {
        let PasswordRequest { meta, password } = parse(body)?;
        let upstream = handler.password(meta, password).await?;
        reply(VerdictResponse { upstream })
      }
      Callback::PublicKey => {
        let PublicKeyRequest { meta, public_key } = parse(body)?;
        let upstream = handler.public_key(meta, public_key).await?;
        reply(VerdictResponse { upstream })
      }
      Callback::KeyboardInteractive => {
        let KeyboardInteractiveRequest { meta, session_id } = parse(body)?;
        let prompter = Prompter {
          peer: self.peer.clone(),
          session_id,
        };
        let upstream = handler.keyboard_interactive(meta, prompter).await?;
        reply(VerdictResponse { upstream })
      }
      Callback::VerifyHostKey => {
        handler.verify_host_key(parse(body)?).await?;
        Ok(serde_json::Value::Null)
      }
      Callback::Banner => {
        let MetaRequest { meta } = parse(body)?;
        let message = handler.banner(meta).await?;
        reply(BannerResponse { message })
      }
      Callback::Sign => {
        let signature = handler.sign(parse(body)?).await?;
        reply(SignResponse { signature })
      }
      other => Err(not_implemented(other)),
    }
  }

  async fn event(&self, callback: Callback, body: serde_json::Value) {
    let handler = &self.handler;
    let delivered = match callback {
      Callback::UpstreamAuthFailure => parse(body).map(|notice| handler.upstream_auth_failure(notice)),
      Callback::PipeStart => parse::<MetaRequest>(body).map(|request| handler.pipe_start(request.meta)),
      Callback::PipeError => parse(body).map(|notice| handler.pipe_error(notice)),
      Callback::PipeCreateError => parse(body).map(|notice| handler.pipe_create_error(notice)),
      other => Err(not_implemented(other)),
    };
    match delivered {
      Ok(future) => future.await,
      Err(error) => tracing::warn!(?callback, %error, "dropping event"),
    }
  }
}

/// Run `handler` over the given stream pair until the proxy goes away.
pub async fn serve<H, R, W>(handler: H, reader: R, writer: W) -> Result<(), RpcError>
where
  H: PluginHandler,
  R: AsyncRead + Send + Unpin + 'static,
  W: AsyncWrite + Send + 'static,
{
  let peer = RpcPeer::start_with("proxy", reader, writer, |peer| {
    Arc::new(HandlerDispatch { handler, peer }) as Arc<dyn Dispatch>
  });
  peer.closed().await;
  Ok(())
}

/// [`serve`] over this process' stdin and stdout. Logs belong on stderr.
pub async fn serve_stdio<H: PluginHandler>(handler: H) -> Result<(), RpcError> {
  serve(handler, tokio::io::stdin(), tokio::io::stdout()).await
}
