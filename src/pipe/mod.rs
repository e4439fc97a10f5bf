//! One downstream connection: the server-side handler that runs the plugin
//! chain during user-auth, dials the upstream it settles on, and then relays
//! channels between the two sessions.
//!
//! A pipe moves through Accept → ServerHS → AuthLoop → UpstreamDial →
//! ClientHS → Splice → Close. russh drives the first two and calls the
//! `auth_*` methods below for the loop; the dial happens inside the auth call
//! that produced an upstream decision, so the downstream only sees
//! USERAUTH_SUCCESS once the upstream has accepted us.

pub mod splice;

use crate::auth::{self, AuthMethod, Handoff, Verdict};
use crate::knownhosts;
use crate::meta::ConnMeta;
use crate::plugin::proto::{Callback, PromptRequest, Upstream, UpstreamAuthFailureNotice};
use crate::plugin::{KeyboardInteractive, Plugin, PluginChain, PromptExchange};
use crate::upstream::{self, PipeContext, UpstreamHandler};
use crate::{Error, ErrorKind};
use russh::keys::PublicKey;
use russh::server::{self, Auth, Msg, Session};
use russh::{client, Channel, ChannelId, Disconnect, Pty, Sig};
use splice::{Forward, Splice};
use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;

/// Settings shared by every pipe.
#[derive(Debug, Clone)]
pub struct PipeConfig {
  /// Static text shown before the head plugin's banner. May be empty.
  pub banner: String,
  /// Bound on the upstream TCP connect and on its SSH handshake.
  pub upstream_timeout: Duration,
}

impl Default for PipeConfig {
  fn default() -> Self {
    PipeConfig {
      banner: String::new(),
      upstream_timeout: Duration::from_secs(30),
    }
  }
}

/// What the daemon can see of a pipe while russh owns its handler.
#[derive(Debug, Clone)]
pub struct PipeSnapshot {
  pub meta: ConnMeta,
  /// The upstream accepted us and the downstream got USERAUTH_SUCCESS.
  pub started: bool,
  /// Why the pipe hung up on the downstream before it started, if it did.
  pub failure: Option<String>,
}

/// What a downstream attempt hands to the current plugin.
#[derive(Clone)]
enum Credential {
  None,
  Password(String),
  /// Wire form of the offered key.
  PublicKey(Vec<u8>),
  Interactive,
}

enum Settled {
  /// Answer the downstream with this.
  Reply(Auth),
  /// Dial this upstream on behalf of `plugin`.
  Decided(Arc<Plugin>, Upstream),
}

enum Step {
  Settled(Settled),
  /// Ask the (new) current plugin with this credential.
  Ask(Credential),
}

/// A keyboard-interactive call the current plugin has not answered yet.
struct Interactive {
  plugin: Arc<Plugin>,
  exchange: KeyboardInteractive,
  /// Where the downstream's answers to the last prompt go.
  reply: Option<oneshot::Sender<Vec<String>>>,
}

enum Pumped {
  Prompt(Auth),
  Verdict(Arc<Plugin>, crate::Result<Verdict>),
}

/// The current plugin's answer to a publickey query. Nothing in it takes
/// effect until the client proves it holds the key.
struct OfferedKey {
  blob: Vec<u8>,
  cursor: usize,
  plugin: Arc<Plugin>,
  verdict: Verdict,
}

fn partial(request: PromptRequest) -> Auth {
  Auth::Partial {
    name: Cow::Owned(request.name),
    instructions: Cow::Owned(request.instruction),
    prompts: Cow::Owned(
      request
        .questions
        .into_iter()
        .map(|question| (Cow::Owned(question.text), question.echo))
        .collect(),
    ),
  }
}

pub struct PipeHandler {
  span: tracing::Span,
  meta: ConnMeta,
  chain: PluginChain,
  config: Arc<PipeConfig>,

  /// Index of the current plugin. Only ever moves forward.
  cursor: usize,
  admitted: bool,
  interactive: Option<Interactive>,
  offered: Option<OfferedKey>,

  upstream: Option<client::Handle<UpstreamHandler>>,
  failure: Option<String>,
  splice: Splice,
  cancel: CancellationToken,
  state: watch::Sender<PipeSnapshot>,
}

impl PipeHandler {
  pub fn new(
    chain: PluginChain,
    config: Arc<PipeConfig>,
    from_addr: String,
    cancel: CancellationToken,
  ) -> (Self, watch::Receiver<PipeSnapshot>) {
    let meta = ConnMeta::new(from_addr);
    let span = tracing::info_span!("pipe", id = %meta.unique_id, from = %meta.from_addr);
    let (state, snapshots) = watch::channel(PipeSnapshot {
      meta: meta.clone(),
      started: false,
      failure: None,
    });
    let handler = PipeHandler {
      span,
      meta,
      chain,
      config,
      cursor: 0,
      admitted: false,
      interactive: None,
      offered: None,
      upstream: None,
      failure: None,
      splice: Splice::new(cancel.clone()),
      cancel,
      state,
    };
    (handler, snapshots)
  }

  pub fn span(&self) -> &tracing::Span {
    &self.span
  }

  /// The pipe's channel table. The daemon binds the downstream session to it
  /// as soon as russh hands out a handle.
  pub fn splice(&self) -> &Splice {
    &self.splice
  }

  fn publish(&self) {
    self.state.send_replace(PipeSnapshot {
      meta: self.meta.clone(),
      started: self.upstream.is_some(),
      failure: self.failure.clone(),
    });
  }

  fn current(&self) -> Option<Arc<Plugin>> {
    self.chain.get(self.cursor).cloned()
  }

  /// Run `NewConnection` on the chain, once.
  async fn admit(&mut self) -> anyhow::Result<()> {
    if !self.admitted {
      self.admitted = true;
      self.chain.new_connection(&self.meta).await?;
    }
    Ok(())
  }

  /// Every auth request starts here. The first one also admits the
  /// connection, so `NewConnection` sees the user name.
  async fn begin(&mut self, user: &str) -> anyhow::Result<()> {
    if self.meta.user_name != user {
      self.meta.user_name = user.to_string();
      self.publish();
    }
    self.admit().await
  }

  /// End the pipe with `description` as the reason. A server only gets to
  /// send a banner before user-auth starts, so the DISCONNECT is the one
  /// place left to tell the user.
  fn hang_up(&mut self, reason: Disconnect, description: String) {
    self.failure = Some(description.clone());
    self.publish();
    let Some(handle) = self.splice.downstream() else {
      tracing::warn!("no downstream session handle, cannot disconnect");
      self.cancel.cancel();
      return;
    };
    // Queued behind the USERAUTH_FAILURE this auth call is about to send.
    tokio::spawn(async move {
      let _ = handle.disconnect(reason, description, "en".to_string()).await;
    });
  }

  /// USERAUTH_FAILURE listing `methods`, or what the current plugin advertises.
  async fn reject(&mut self, methods: Option<Vec<AuthMethod>>, partial_success: bool) -> Auth {
    let methods = match methods.filter(|methods| !methods.is_empty()) {
      Some(methods) => methods,
      None => match self.current() {
        Some(plugin) => auth::next_methods(&plugin, &self.meta).await,
        None => Vec::new(),
      },
    };
    Auth::Reject {
      proceed_with_methods: Some(auth::method_set(&methods)),
      partial_success,
    }
  }

  async fn ask(&mut self, plugin: &Plugin, credential: &Credential) -> crate::Result<Verdict> {
    let answer = match credential {
      Credential::None => plugin.no_client_auth(&self.meta).await,
      Credential::Password(password) => plugin.password(&self.meta, password.as_bytes()).await,
      Credential::PublicKey(blob) => plugin.public_key(&self.meta, blob).await,
      Credential::Interactive => {
        return Err(Error::InternalInvariant(
          "keyboard-interactive is not a one-shot query".to_string(),
        ))
      }
    };
    Verdict::from_rpc(answer)
  }

  /// Walk the chain with one downstream attempt until something settles it.
  async fn attempt(&mut self, method: AuthMethod, mut credential: Credential) -> anyhow::Result<Settled> {
    loop {
      let Some(plugin) = self.current() else {
        return Ok(Settled::Reply(self.reject(None, false).await));
      };
      let verdict = match credential {
        Credential::Interactive => match plugin.keyboard_interactive(&self.meta) {
          Ok(exchange) => {
            self.interactive = Some(Interactive {
              plugin: plugin.clone(),
              exchange,
              reply: None,
            });
            match self.pump().await? {
              Pumped::Prompt(auth) => return Ok(Settled::Reply(auth)),
              Pumped::Verdict(_, verdict) => verdict,
            }
          }
          Err(error) => Verdict::from_rpc(Err(error)),
        },
        _ => self.ask(&plugin, &credential).await,
      };
      match self.conclude(method, &plugin, verdict, &credential).await? {
        Step::Settled(settled) => return Ok(settled),
        Step::Ask(next) => credential = next,
      }
    }
  }

  async fn conclude(
    &mut self,
    method: AuthMethod,
    plugin: &Arc<Plugin>,
    verdict: crate::Result<Verdict>,
    credential: &Credential,
  ) -> anyhow::Result<Step> {
    let verdict = match verdict {
      Ok(verdict) => verdict,
      Err(error) if error.is_recoverable() => {
        tracing::warn!(plugin = plugin.name(), %error, "auth attempt failed");
        return Ok(Step::Settled(Settled::Reply(self.reject(None, false).await)));
      }
      Err(error) => {
        tracing::error!(plugin = plugin.name(), %error, "plugin failed during auth");
        return Err(error.into());
      }
    };

    match verdict {
      Verdict::Upstream(upstream) => Ok(Step::Settled(Settled::Decided(plugin.clone(), upstream))),
      Verdict::Rejected(reason) => {
        tracing::debug!(plugin = plugin.name(), method = method.name(), %reason, "attempt rejected");
        Ok(Step::Settled(Settled::Reply(self.reject(None, false).await)))
      }
      Verdict::Retry { meta, methods } => {
        self.meta.merge(&meta);
        self.publish();
        Ok(Step::Settled(Settled::Reply(self.reject(Some(methods), false).await)))
      }
      Verdict::NextPlugin(delta) => {
        self.meta.merge(&delta);
        self.cursor += 1;
        self.publish();
        let Some(next) = self.current() else {
          tracing::warn!(plugin = plugin.name(), "last plugin asked for a next plugin");
          return Ok(Step::Settled(Settled::Reply(self.reject(None, false).await)));
        };
        tracing::info!(from = plugin.name(), to = next.name(), "handing off to next plugin");
        Ok(match auth::handoff(&next, method) {
          Handoff::SameMethod => Step::Ask(credential.clone()),
          Handoff::NoClientAuth => Step::Ask(Credential::None),
          Handoff::Prompt => Step::Settled(Settled::Reply(self.reject(None, true).await)),
        })
      }
    }
  }

  /// Apply a verdict that arrived outside [`Self::attempt`] and keep walking
  /// the chain if it hands off.
  async fn resume(
    &mut self,
    method: AuthMethod,
    plugin: &Arc<Plugin>,
    verdict: crate::Result<Verdict>,
    credential: Credential,
  ) -> anyhow::Result<Settled> {
    match self.conclude(method, plugin, verdict, &credential).await? {
      Step::Settled(settled) => Ok(settled),
      Step::Ask(next) => self.attempt(method, next).await,
    }
  }

  /// Wait for the pending keyboard-interactive call to either prompt the user
  /// or decide.
  async fn pump(&mut self) -> anyhow::Result<Pumped> {
    enum Raw {
      Prompt(PromptExchange),
      Verdict(Result<Upstream, crate::plugin::RpcError>),
    }

    let Some(pending) = self.interactive.as_mut() else {
      return Err(Error::InternalInvariant("no keyboard-interactive call in flight".to_string()).into());
    };
    let exchange = &mut pending.exchange;
    let raw = tokio::select! {
      prompt = exchange.prompts.recv() => match prompt {
        Some(prompt) => Raw::Prompt(prompt),
        None => Raw::Verdict((&mut exchange.verdict).await),
      },
      verdict = &mut exchange.verdict => Raw::Verdict(verdict),
    };

    match raw {
      Raw::Prompt(PromptExchange { request, reply }) => {
        tracing::debug!(questions = request.questions.len(), "relaying prompt");
        pending.reply = Some(reply);
        Ok(Pumped::Prompt(partial(request)))
      }
      Raw::Verdict(answer) => {
        let plugin = pending.plugin.clone();
        self.interactive = None;
        Ok(Pumped::Verdict(plugin, Verdict::from_rpc(answer)))
      }
    }
  }

  async fn finish(&mut self, settled: Settled) -> anyhow::Result<Auth> {
    match settled {
      Settled::Reply(auth) => Ok(auth),
      Settled::Decided(plugin, upstream) => self.dial(plugin, upstream).await,
    }
  }

  async fn dial(&mut self, plugin: Arc<Plugin>, upstream: Upstream) -> anyhow::Result<Auth> {
    if self.upstream.is_some() {
      return Err(Error::InternalInvariant("pipe already has an upstream".to_string()).into());
    }
    let ctx = PipeContext {
      span: self.span.clone(),
      meta: self.meta.clone(),
      plugin: plugin.clone(),
      splice: self.splice.clone(),
      cancel: self.cancel.clone(),
      timeout: self.config.upstream_timeout,
    };
    let user = self.meta.user_name.clone();
    // Dropping the dial closes the upstream socket.
    let dialed = tokio::select! {
      _ = self.cancel.cancelled() => {
        tracing::info!(plugin = plugin.name(), "downstream went away during the upstream dial");
        return Err(Error::UpstreamUnreachable("dial abandoned, downstream is gone".to_string()).into());
      }
      dialed = upstream::connect(&ctx, &upstream, &user) => dialed,
    };
    match dialed {
      Ok(handle) => {
        self.upstream = Some(handle);
        self.publish();
        tracing::info!(plugin = plugin.name(), "pipe established");
        self.chain.pipe_start(&self.meta).await;
        Ok(Auth::Accept)
      }
      Err(failure) => {
        tracing::warn!(plugin = plugin.name(), error = %failure.error, "upstream dial failed");
        let notice = UpstreamAuthFailureNotice {
          meta: self.meta.clone(),
          method: failure.method.to_string(),
          error: failure.error.to_string(),
          allowed_methods: failure.allowed_methods,
        };
        plugin.upstream_auth_failure(&notice).await;
        if failure.error.is_recoverable() {
          Ok(self.reject(None, false).await)
        } else if failure.error.kind() == ErrorKind::HostKeyMismatch {
          self.hang_up(Disconnect::HostKeyNotVerifiable, failure.error.to_string());
          Ok(self.reject(None, false).await)
        } else {
          Err(failure.error.into())
        }
      }
    }
  }

  /// Queue a channel request that expects an answer; the answer comes from
  /// the upstream through the relay.
  fn request(&self, channel: ChannelId, forward: Forward, session: &mut Session) {
    if !self.splice.forward(channel, forward) {
      let _ = session.channel_failure(channel);
    }
  }
}

impl server::Handler for PipeHandler {
  type Error = anyhow::Error;

  async fn authentication_banner(&mut self) -> Result<Option<String>, Self::Error> {
    let mut banner = self.config.banner.clone();
    if let Some(head) = self.chain.head().cloned() {
      if head.supports(Callback::Banner) {
        match head.banner(&self.meta).await {
          Ok(message) => banner.push_str(&message),
          Err(error) => tracing::warn!(parent: &self.span, plugin = head.name(), %error, "Banner failed"),
        }
      }
    }
    Ok((!banner.is_empty()).then_some(banner))
  }

  #[tracing::instrument(parent = &self.span, skip(self))]
  async fn auth_none(&mut self, user: &str) -> Result<Auth, Self::Error> {
    self.begin(user).await?;
    let settled = self.attempt(AuthMethod::None, Credential::None).await?;
    self.finish(settled).await
  }

  #[tracing::instrument(parent = &self.span, skip(self, password))]
  async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
    self.begin(user).await?;
    let settled = self
      .attempt(AuthMethod::Password, Credential::Password(password.to_string()))
      .await?;
    self.finish(settled).await
  }

  /// The query carries no signature, so the current plugin is only asked
  /// whether it would take the key. Its answer is parked until
  /// [`Self::auth_publickey`]; metadata and the chain stay as they are.
  #[tracing::instrument(parent = &self.span, skip(self, public_key))]
  async fn auth_publickey_offered(&mut self, user: &str, public_key: &PublicKey) -> Result<Auth, Self::Error> {
    self.begin(user).await?;
    self.offered = None;
    let blob = knownhosts::wire_form(public_key)?;
    let Some(plugin) = self.current() else {
      return Ok(self.reject(None, false).await);
    };
    let verdict = match self.ask(&plugin, &Credential::PublicKey(blob.clone())).await {
      Ok(Verdict::Rejected(reason)) => {
        tracing::debug!(plugin = plugin.name(), %reason, "key not accepted");
        return Ok(self.reject(None, false).await);
      }
      Ok(verdict) => verdict,
      Err(error) if error.is_recoverable() => {
        tracing::warn!(plugin = plugin.name(), %error, "publickey query failed");
        return Ok(self.reject(None, false).await);
      }
      Err(error) => return Err(error.into()),
    };
    self.offered = Some(OfferedKey {
      blob,
      cursor: self.cursor,
      plugin,
      verdict,
    });
    Ok(Auth::Accept)
  }

  /// russh has verified the signature by the time this runs.
  #[tracing::instrument(parent = &self.span, skip(self, public_key))]
  async fn auth_publickey(&mut self, user: &str, public_key: &PublicKey) -> Result<Auth, Self::Error> {
    self.begin(user).await?;
    let blob = knownhosts::wire_form(public_key)?;
    let settled = match self.offered.take() {
      Some(offered) if offered.blob == blob && offered.cursor == self.cursor => {
        self
          .resume(
            AuthMethod::PublicKey,
            &offered.plugin,
            Ok(offered.verdict),
            Credential::PublicKey(blob),
          )
          .await?
      }
      _ => {
        self
          .attempt(AuthMethod::PublicKey, Credential::PublicKey(blob))
          .await?
      }
    };
    self.finish(settled).await
  }

  #[tracing::instrument(parent = &self.span, skip(self, response))]
  async fn auth_keyboard_interactive<'a>(
    &'a mut self,
    user: &str,
    submethods: &str,
    response: Option<server::Response<'a>>,
  ) -> Result<Auth, Self::Error> {
    // NOTE: answers are never logged.
    let answers: Option<Vec<String>> =
      response.map(|response| response.map(|answer| String::from_utf8_lossy(&answer).into_owned()).collect());
    self.begin(user).await?;

    let reply = self.interactive.as_mut().and_then(|pending| pending.reply.take());
    let settled = match (answers, reply) {
      (Some(answers), Some(reply)) => {
        let _ = reply.send(answers);
        match self.pump().await? {
          Pumped::Prompt(auth) => return Ok(auth),
          Pumped::Verdict(plugin, verdict) => {
            self
              .resume(AuthMethod::KeyboardInteractive, &plugin, verdict, Credential::Interactive)
              .await?
          }
        }
      }
      _ => {
        // A new exchange; whatever was in flight is abandoned.
        self.interactive = None;
        self
          .attempt(AuthMethod::KeyboardInteractive, Credential::Interactive)
          .await?
      }
    };
    self.finish(settled).await
  }

  #[tracing::instrument(parent = &self.span, skip(self, channel, session))]
  async fn channel_open_session(&mut self, channel: Channel<Msg>, session: &mut Session) -> Result<bool, Self::Error> {
    self.splice.bind(session.handle());
    let Some(upstream) = self.upstream.as_mut() else {
      return Ok(false);
    };
    match upstream.channel_open_session().await {
      Ok(up) => Ok(self.splice.attach(channel.id(), up)),
      Err(error) => {
        tracing::warn!(?error, "upstream refused session channel");
        Ok(false)
      }
    }
  }

  #[tracing::instrument(parent = &self.span, skip(self, channel, session))]
  async fn channel_open_direct_tcpip(
    &mut self,
    channel: Channel<Msg>,
    host_to_connect: &str,
    port_to_connect: u32,
    originator_address: &str,
    originator_port: u32,
    session: &mut Session,
  ) -> Result<bool, Self::Error> {
    self.splice.bind(session.handle());
    let Some(upstream) = self.upstream.as_mut() else {
      return Ok(false);
    };
    let opened = upstream
      .channel_open_direct_tcpip(host_to_connect, port_to_connect, originator_address, originator_port)
      .await;
    match opened {
      Ok(up) => Ok(self.splice.attach(channel.id(), up)),
      Err(error) => {
        tracing::info!(?error, "upstream refused direct-tcpip");
        Ok(false)
      }
    }
  }

  #[tracing::instrument(parent = &self.span, skip(self, session))]
  async fn tcpip_forward(&mut self, address: &str, port: &mut u32, session: &mut Session) -> Result<bool, Self::Error> {
    self.splice.bind(session.handle());
    let Some(upstream) = self.upstream.as_mut() else {
      return Ok(false);
    };
    match upstream.tcpip_forward(address, *port).await {
      Ok(bound) => {
        if *port == 0 {
          *port = bound;
        }
        Ok(true)
      }
      Err(error) => {
        tracing::info!(?error, "upstream refused tcpip-forward");
        Ok(false)
      }
    }
  }

  #[tracing::instrument(parent = &self.span, skip(self, _session))]
  async fn cancel_tcpip_forward(&mut self, address: &str, port: u32, _session: &mut Session) -> Result<bool, Self::Error> {
    let Some(upstream) = self.upstream.as_mut() else {
      return Ok(false);
    };
    Ok(upstream.cancel_tcpip_forward(address, port).await.is_ok())
  }

  async fn pty_request(
    &mut self,
    channel: ChannelId,
    term: &str,
    col_width: u32,
    row_height: u32,
    pix_width: u32,
    pix_height: u32,
    modes: &[(Pty, u32)],
    session: &mut Session,
  ) -> Result<(), Self::Error> {
    let forward = Forward::Pty {
      term: term.to_string(),
      col_width,
      row_height,
      pix_width,
      pix_height,
      modes: modes.to_vec(),
    };
    self.request(channel, forward, session);
    Ok(())
  }

  async fn env_request(
    &mut self,
    channel: ChannelId,
    variable_name: &str,
    variable_value: &str,
    _session: &mut Session,
  ) -> Result<(), Self::Error> {
    self.splice.forward(
      channel,
      Forward::Env {
        name: variable_name.to_string(),
        value: variable_value.to_string(),
      },
    );
    Ok(())
  }

  async fn shell_request(&mut self, channel: ChannelId, session: &mut Session) -> Result<(), Self::Error> {
    self.request(channel, Forward::Shell, session);
    Ok(())
  }

  #[tracing::instrument(parent = &self.span, skip(self, data, session))]
  async fn exec_request(&mut self, channel: ChannelId, data: &[u8], session: &mut Session) -> Result<(), Self::Error> {
    tracing::debug!(command = %String::from_utf8_lossy(data));
    self.request(channel, Forward::Exec(data.to_vec()), session);
    Ok(())
  }

  #[tracing::instrument(parent = &self.span, skip(self, session))]
  async fn subsystem_request(&mut self, channel: ChannelId, name: &str, session: &mut Session) -> Result<(), Self::Error> {
    self.request(channel, Forward::Subsystem(name.to_string()), session);
    Ok(())
  }

  async fn window_change_request(
    &mut self,
    channel: ChannelId,
    col_width: u32,
    row_height: u32,
    pix_width: u32,
    pix_height: u32,
    _session: &mut Session,
  ) -> Result<(), Self::Error> {
    self.splice.forward(
      channel,
      Forward::WindowChange {
        col_width,
        row_height,
        pix_width,
        pix_height,
      },
    );
    Ok(())
  }

  async fn signal(&mut self, channel: ChannelId, signal: Sig, _session: &mut Session) -> Result<(), Self::Error> {
    self.splice.forward(channel, Forward::Signal(signal));
    Ok(())
  }

  async fn data(&mut self, channel: ChannelId, data: &[u8], _session: &mut Session) -> Result<(), Self::Error> {
    self.splice.forward(channel, Forward::Data(data.to_vec()));
    Ok(())
  }

  async fn extended_data(
    &mut self,
    channel: ChannelId,
    code: u32,
    data: &[u8],
    _session: &mut Session,
  ) -> Result<(), Self::Error> {
    self.splice.forward(
      channel,
      Forward::ExtendedData {
        code,
        data: data.to_vec(),
      },
    );
    Ok(())
  }

  async fn channel_eof(&mut self, channel: ChannelId, _session: &mut Session) -> Result<(), Self::Error> {
    self.splice.forward(channel, Forward::Eof);
    Ok(())
  }

  async fn channel_close(&mut self, channel: ChannelId, _session: &mut Session) -> Result<(), Self::Error> {
    self.splice.forward(channel, Forward::Close);
    Ok(())
  }
}

impl Drop for PipeHandler {
  fn drop(&mut self) {
    // Stops the relays and, through the dropped client handle, the upstream.
    self.cancel.cancel();
  }
}
