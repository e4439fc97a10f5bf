//! Everything an end-to-end test needs: a throwaway upstream sshd, plugins
//! that run inside the test process, a proxy between the two and a client.

#![allow(dead_code)]

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use piper::daemon::{Daemon, DaemonConfig};
use piper::hostkey::HostKeySource;
use piper::meta::ConnMeta;
use piper::plugin::proto::{
  Callback, PipeCreateErrorNotice, PipeErrorNotice, Question, SignRequest, Upstream, UpstreamAuth,
  UpstreamAuthFailureNotice, VerifyHostKeyRequest,
};
use piper::plugin::sdk::{serve, PluginHandler, Prompter};
use piper::plugin::{Plugin, PluginChain};
use russh::keys::ssh_key::rand_core::OsRng;
use russh::keys::ssh_key::LineEnding;
use russh::keys::{Algorithm, HashAlg, PrivateKey, PublicKey};
use russh::server::{self, Auth, Msg, Session};
use russh::{client, Channel, ChannelId, ChannelMsg, CryptoVec};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

pub fn init_tracing() {
  let _ = tracing_subscriber::fmt()
    .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
    .with_test_writer()
    .try_init();
}

pub fn ed25519() -> PrivateKey {
  PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap()
}

/// A decision pointing at an upstream on localhost, host key ignored.
pub fn upstream(port: u16, auth: UpstreamAuth) -> Upstream {
  Upstream {
    host: "127.0.0.1".into(),
    port: i32::from(port),
    uri: String::new(),
    user_name: String::new(),
    ignore_host_key: true,
    known_hosts: Vec::new(),
    auth,
  }
}

pub fn password(password: &str) -> UpstreamAuth {
  UpstreamAuth::Password {
    password: password.to_string(),
  }
}

pub fn next_plugin(pairs: &[(&str, &str)]) -> UpstreamAuth {
  UpstreamAuth::NextPlugin {
    meta: pairs
      .iter()
      .map(|(k, v)| (k.to_string(), v.to_string()))
      .collect::<HashMap<_, _>>(),
  }
}

// ---------------------------------------------------------------------------
// upstream

/// A minimal sshd. `exec` answers with `user@name: command`; a shell echoes
/// its input upper-cased until EOF, and so does a direct-tcpip channel. A
/// tcpip-forward request is granted on port 4242 and immediately followed by
/// one forwarded connection that says `knock knock`.
#[derive(Clone)]
struct Sshd {
  name: &'static str,
  password: Option<String>,
  authorized_key: Option<PublicKey>,
  logins: Arc<Mutex<Vec<(String, &'static str)>>>,
  forwards: Arc<Mutex<Vec<String>>>,
  user: String,
}

impl Sshd {
  fn accept(&mut self, user: &str, method: &'static str) -> Auth {
    self.user = user.to_string();
    self.logins.lock().unwrap().push((user.to_string(), method));
    Auth::Accept
  }

  fn authorized(&self, key: &PublicKey) -> bool {
    self
      .authorized_key
      .as_ref()
      .is_some_and(|authorized| authorized.key_data() == key.key_data())
  }
}

fn reject() -> Auth {
  Auth::Reject {
    proceed_with_methods: None,
    partial_success: false,
  }
}

impl server::Handler for Sshd {
  type Error = russh::Error;

  async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
    if self.password.as_deref() == Some(password) {
      Ok(self.accept(user, "password"))
    } else {
      Ok(reject())
    }
  }

  async fn auth_publickey_offered(&mut self, _user: &str, key: &PublicKey) -> Result<Auth, Self::Error> {
    Ok(if self.authorized(key) { Auth::Accept } else { reject() })
  }

  async fn auth_publickey(&mut self, user: &str, key: &PublicKey) -> Result<Auth, Self::Error> {
    if self.authorized(key) {
      Ok(self.accept(user, "publickey"))
    } else {
      Ok(reject())
    }
  }

  async fn channel_open_session(&mut self, _channel: Channel<Msg>, _session: &mut Session) -> Result<bool, Self::Error> {
    Ok(true)
  }

  async fn channel_open_direct_tcpip(
    &mut self,
    _channel: Channel<Msg>,
    host_to_connect: &str,
    port_to_connect: u32,
    _originator_address: &str,
    _originator_port: u32,
    _session: &mut Session,
  ) -> Result<bool, Self::Error> {
    self
      .forwards
      .lock()
      .unwrap()
      .push(format!("direct-tcpip {host_to_connect}:{port_to_connect}"));
    Ok(true)
  }

  async fn tcpip_forward(&mut self, address: &str, port: &mut u32, session: &mut Session) -> Result<bool, Self::Error> {
    if *port == 0 {
      *port = 4242;
    }
    self.forwards.lock().unwrap().push(format!("tcpip-forward {address}:{port}"));
    let handle = session.handle();
    let (address, port) = (address.to_string(), *port);
    tokio::spawn(async move {
      if let Ok(channel) = handle.channel_open_forwarded_tcpip(address, port, "203.0.113.9", 5555).await {
        let _ = channel.data(&b"knock knock"[..]).await;
        let _ = channel.eof().await;
        let _ = channel.close().await;
      }
    });
    Ok(true)
  }

  async fn exec_request(&mut self, channel: ChannelId, data: &[u8], session: &mut Session) -> Result<(), Self::Error> {
    let reply = format!("{}@{}: {}\n", self.user, self.name, String::from_utf8_lossy(data));
    let _ = session.channel_success(channel);
    let _ = session.data(channel, CryptoVec::from_slice(reply.as_bytes()));
    let _ = session.exit_status_request(channel, 0);
    let _ = session.eof(channel);
    let _ = session.close(channel);
    Ok(())
  }

  async fn shell_request(&mut self, channel: ChannelId, session: &mut Session) -> Result<(), Self::Error> {
    let _ = session.channel_success(channel);
    Ok(())
  }

  async fn data(&mut self, channel: ChannelId, data: &[u8], session: &mut Session) -> Result<(), Self::Error> {
    let _ = session.data(channel, CryptoVec::from_slice(&data.to_ascii_uppercase()));
    Ok(())
  }

  async fn channel_eof(&mut self, channel: ChannelId, session: &mut Session) -> Result<(), Self::Error> {
    let _ = session.exit_status_request(channel, 0);
    let _ = session.eof(channel);
    let _ = session.close(channel);
    Ok(())
  }
}

pub struct TestUpstream {
  pub port: u16,
  pub host_key: PublicKey,
  logins: Arc<Mutex<Vec<(String, &'static str)>>>,
  forwards: Arc<Mutex<Vec<String>>>,
  _task: tokio::task::JoinHandle<()>,
}

impl TestUpstream {
  /// Successful logins so far, as (user, method).
  pub fn logins(&self) -> Vec<(String, &'static str)> {
    self.logins.lock().unwrap().clone()
  }

  /// Forwarding requests seen so far, as `kind host:port`.
  pub fn forwards(&self) -> Vec<String> {
    self.forwards.lock().unwrap().clone()
  }
}

impl Drop for TestUpstream {
  fn drop(&mut self) {
    self._task.abort();
  }
}

pub async fn start_upstream(name: &'static str, password: Option<&str>, authorized_key: Option<PublicKey>) -> TestUpstream {
  let key = ed25519();
  let host_key = key.public_key().clone();
  let config = Arc::new(server::Config {
    keys: vec![key],
    auth_rejection_time: Duration::from_millis(10),
    auth_rejection_time_initial: Some(Duration::ZERO),
    ..Default::default()
  });
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let port = listener.local_addr().unwrap().port();
  let logins = Arc::new(Mutex::new(Vec::new()));
  let forwards = Arc::new(Mutex::new(Vec::new()));
  let sshd = Sshd {
    name,
    password: password.map(str::to_string),
    authorized_key,
    logins: logins.clone(),
    forwards: forwards.clone(),
    user: String::new(),
  };

  let task = tokio::spawn(async move {
    while let Ok((stream, _)) = listener.accept().await {
      let config = config.clone();
      let handler = sshd.clone();
      tokio::spawn(async move {
        if let Ok(session) = server::run_stream(config, stream, handler).await {
          let _ = session.await;
        }
      });
    }
  });

  TestUpstream {
    port,
    host_key,
    logins,
    forwards,
    _task: task,
  }
}

// ---------------------------------------------------------------------------
// plugins

/// A callback a test plugin saw.
#[derive(Debug, Clone)]
pub enum Seen {
  NewConnection(ConnMeta),
  NoClientAuth(ConnMeta),
  Password(ConnMeta),
  PublicKey(ConnMeta),
  KeyboardInteractive(ConnMeta),
  VerifyHostKey(VerifyHostKeyRequest),
  Sign(SignRequest),
  UpstreamAuthFailure(UpstreamAuthFailureNotice),
  PipeStart(ConnMeta),
  PipeError(PipeErrorNotice),
  PipeCreateError(PipeCreateErrorNotice),
}

type Decide = Box<dyn Fn(&ConnMeta) -> Result<Upstream, String> + Send + Sync>;
type DecidePassword = Box<dyn Fn(&ConnMeta, &str) -> Result<Upstream, String> + Send + Sync>;
type DecideKey = Box<dyn Fn(&ConnMeta, &[u8]) -> Result<Upstream, String> + Send + Sync>;

/// A plugin assembled from closures. Every callback it sees is reported on
/// the channel returned by [`TestPlugin::new`].
pub struct TestPlugin {
  deny: Option<String>,
  no_client_auth: Option<Decide>,
  password: Option<DecidePassword>,
  public_key: Option<DecideKey>,
  keyboard_interactive: Option<(String, DecidePassword)>,
  verify_host_key: Option<Result<(), String>>,
  signing_key: Option<PrivateKey>,
  seen: mpsc::UnboundedSender<Seen>,
}

impl TestPlugin {
  pub fn new() -> (Self, mpsc::UnboundedReceiver<Seen>) {
    let (seen, rx) = mpsc::unbounded_channel();
    let plugin = TestPlugin {
      deny: None,
      no_client_auth: None,
      password: None,
      public_key: None,
      keyboard_interactive: None,
      verify_host_key: None,
      signing_key: None,
      seen,
    };
    (plugin, rx)
  }

  pub fn deny(mut self, reason: &str) -> Self {
    self.deny = Some(reason.to_string());
    self
  }

  pub fn on_no_client_auth(mut self, decide: impl Fn(&ConnMeta) -> Result<Upstream, String> + Send + Sync + 'static) -> Self {
    self.no_client_auth = Some(Box::new(decide));
    self
  }

  pub fn on_password(
    mut self,
    decide: impl Fn(&ConnMeta, &str) -> Result<Upstream, String> + Send + Sync + 'static,
  ) -> Self {
    self.password = Some(Box::new(decide));
    self
  }

  /// `decide` gets the offered key in SSH wire encoding.
  pub fn on_public_key(
    mut self,
    decide: impl Fn(&ConnMeta, &[u8]) -> Result<Upstream, String> + Send + Sync + 'static,
  ) -> Self {
    self.public_key = Some(Box::new(decide));
    self
  }

  /// Ask `question` once and decide on the answer.
  pub fn on_keyboard_interactive(
    mut self,
    question: &str,
    decide: impl Fn(&ConnMeta, &str) -> Result<Upstream, String> + Send + Sync + 'static,
  ) -> Self {
    self.keyboard_interactive = Some((question.to_string(), Box::new(decide)));
    self
  }

  pub fn verify_host_key(mut self, answer: Result<(), String>) -> Self {
    self.verify_host_key = Some(answer);
    self
  }

  pub fn signing_key(mut self, key: PrivateKey) -> Self {
    self.signing_key = Some(key);
    self
  }

  pub async fn connect(self, name: &str) -> Plugin {
    in_process(name, self).await
  }

  fn saw(&self, seen: Seen) {
    let _ = self.seen.send(seen);
  }
}

#[async_trait]
impl PluginHandler for TestPlugin {
  fn callbacks(&self) -> Vec<Callback> {
    let mut callbacks = vec![
      Callback::NewConnection,
      Callback::UpstreamAuthFailure,
      Callback::PipeStart,
      Callback::PipeError,
      Callback::PipeCreateError,
    ];
    if self.no_client_auth.is_some() {
      callbacks.push(Callback::NoClientAuth);
    }
    if self.password.is_some() {
      callbacks.push(Callback::Password);
    }
    if self.public_key.is_some() {
      callbacks.push(Callback::PublicKey);
    }
    if self.keyboard_interactive.is_some() {
      callbacks.push(Callback::KeyboardInteractive);
    }
    if self.verify_host_key.is_some() {
      callbacks.push(Callback::VerifyHostKey);
    }
    if self.signing_key.is_some() {
      callbacks.push(Callback::Sign);
    }
    callbacks
  }

  async fn new_connection(&self, meta: ConnMeta) -> Result<(), String> {
    self.saw(Seen::NewConnection(meta));
    match &self.deny {
      Some(reason) => Err(reason.clone()),
      None => Ok(()),
    }
  }

  async fn no_client_auth(&self, meta: ConnMeta) -> Result<Upstream, String> {
    self.saw(Seen::NoClientAuth(meta.clone()));
    let decide = self.no_client_auth.as_ref().ok_or("no NoClientAuth")?;
    decide(&meta)
  }

  async fn password(&self, meta: ConnMeta, password: Vec<u8>) -> Result<Upstream, String> {
    self.saw(Seen::Password(meta.clone()));
    let decide = self.password.as_ref().ok_or("no Password")?;
    let password = String::from_utf8(password).map_err(|e| e.to_string())?;
    decide(&meta, &password)
  }

  async fn public_key(&self, meta: ConnMeta, public_key: Vec<u8>) -> Result<Upstream, String> {
    self.saw(Seen::PublicKey(meta.clone()));
    let decide = self.public_key.as_ref().ok_or("no PublicKey")?;
    decide(&meta, &public_key)
  }

  async fn keyboard_interactive(&self, meta: ConnMeta, prompter: Prompter) -> Result<Upstream, String> {
    self.saw(Seen::KeyboardInteractive(meta.clone()));
    let (question, decide) = self.keyboard_interactive.as_ref().ok_or("no KeyboardInteractive")?;
    let question = Question {
      text: question.clone(),
      echo: false,
    };
    let answers = prompter.prompt("piper", "", vec![question]).await?;
    decide(&meta, answers.first().map(String::as_str).unwrap_or_default())
  }

  async fn verify_host_key(&self, request: VerifyHostKeyRequest) -> Result<(), String> {
    self.saw(Seen::VerifyHostKey(request));
    self.verify_host_key.clone().unwrap_or(Ok(()))
  }

  async fn sign(&self, request: SignRequest) -> Result<Vec<u8>, String> {
    use signature::Signer;

    self.saw(Seen::Sign(request.clone()));
    let key = self.signing_key.as_ref().ok_or("no signing key")?;
    let signature: russh::keys::ssh_key::Signature = key.try_sign(&request.data).map_err(|e| e.to_string())?;
    Vec::<u8>::try_from(signature).map_err(|e| e.to_string())
  }

  async fn upstream_auth_failure(&self, notice: UpstreamAuthFailureNotice) {
    self.saw(Seen::UpstreamAuthFailure(notice));
  }

  async fn pipe_start(&self, meta: ConnMeta) {
    self.saw(Seen::PipeStart(meta));
  }

  async fn pipe_error(&self, notice: PipeErrorNotice) {
    self.saw(Seen::PipeError(notice));
  }

  async fn pipe_create_error(&self, notice: PipeCreateErrorNotice) {
    self.saw(Seen::PipeCreateError(notice));
  }
}

/// Run `handler` on the far end of an in-memory pipe and connect to it.
pub async fn in_process<H: PluginHandler>(name: &str, handler: H) -> Plugin {
  let (proxy_end, plugin_end) = tokio::io::duplex(64 * 1024);
  let (reader, writer) = tokio::io::split(plugin_end);
  tokio::spawn(serve(handler, reader, writer));
  let (reader, writer) = tokio::io::split(proxy_end);
  Plugin::connect(name, reader, writer).await.unwrap()
}

/// The first callback `pick` accepts, skipping the others.
pub async fn wait_for<T>(seen: &mut mpsc::UnboundedReceiver<Seen>, mut pick: impl FnMut(Seen) -> Option<T>) -> T {
  tokio::time::timeout(Duration::from_secs(5), async {
    loop {
      let next = seen.recv().await.expect("plugin went away");
      if let Some(found) = pick(next) {
        return found;
      }
    }
  })
  .await
  .expect("timed out waiting for a plugin callback")
}

// ---------------------------------------------------------------------------
// proxy

pub struct TestProxy {
  pub port: u16,
  shutdown: CancellationToken,
  _task: tokio::task::JoinHandle<anyhow::Result<()>>,
}

impl Drop for TestProxy {
  fn drop(&mut self) {
    self.shutdown.cancel();
  }
}

pub fn proxy_config(login_grace_time: Duration) -> DaemonConfig {
  DaemonConfig {
    listen: "127.0.0.1:0".parse().unwrap(),
    host_keys: HostKeySource::Inline(STANDARD.encode(ed25519().to_openssh(LineEnding::LF).unwrap().as_bytes())),
    login_grace_time,
    banner: String::new(),
    keepalive_interval: None,
    keepalive_max: 3,
    setuid: None,
    setgid: None,
    plugins: Vec::new(),
  }
}

pub async fn start_proxy(plugins: Vec<Plugin>) -> TestProxy {
  start_proxy_with(PluginChain::new(plugins), proxy_config(Duration::from_secs(10))).await
}

pub async fn start_proxy_with(chain: PluginChain, config: DaemonConfig) -> TestProxy {
  init_tracing();
  let daemon = Daemon::bind(&config, chain).await.unwrap();
  let port = daemon.local_addr().unwrap().port();
  let shutdown = CancellationToken::new();
  let task = tokio::spawn(daemon.serve(shutdown.clone()));
  TestProxy {
    port,
    shutdown,
    _task: task,
  }
}

// ---------------------------------------------------------------------------
// downstream client

/// Hands out what the proxy sends unprompted: the DISCONNECT message and
/// forwarded-tcpip channels.
#[derive(Default)]
pub struct TestClient {
  hangup: Option<oneshot::Sender<String>>,
  forwarded: Option<mpsc::UnboundedSender<Channel<client::Msg>>>,
}

impl TestClient {
  pub fn on_hangup(mut self) -> (Self, oneshot::Receiver<String>) {
    let (tx, rx) = oneshot::channel();
    self.hangup = Some(tx);
    (self, rx)
  }

  pub fn on_forwarded(mut self) -> (Self, mpsc::UnboundedReceiver<Channel<client::Msg>>) {
    let (tx, rx) = mpsc::unbounded_channel();
    self.forwarded = Some(tx);
    (self, rx)
  }
}

impl client::Handler for TestClient {
  type Error = russh::Error;

  async fn check_server_key(&mut self, _server_public_key: &PublicKey) -> Result<bool, Self::Error> {
    Ok(true)
  }

  async fn server_channel_open_forwarded_tcpip(
    &mut self,
    channel: Channel<client::Msg>,
    _connected_address: &str,
    _connected_port: u32,
    _originator_address: &str,
    _originator_port: u32,
    _session: &mut client::Session,
  ) -> Result<(), Self::Error> {
    if let Some(forwarded) = &self.forwarded {
      let _ = forwarded.send(channel);
    }
    Ok(())
  }

  async fn disconnected(&mut self, reason: client::DisconnectReason<Self::Error>) -> Result<(), Self::Error> {
    match reason {
      client::DisconnectReason::ReceivedDisconnect(info) => {
        if let Some(hangup) = self.hangup.take() {
          let _ = hangup.send(info.message);
        }
        Ok(())
      }
      client::DisconnectReason::Error(error) => Err(error),
    }
  }
}

pub async fn connect(port: u16) -> client::Handle<TestClient> {
  connect_as(port, TestClient::default()).await
}

pub async fn connect_as(port: u16, handler: TestClient) -> client::Handle<TestClient> {
  client::connect(Arc::new(client::Config::default()), ("127.0.0.1", port), handler)
    .await
    .unwrap()
}

/// The message of the DISCONNECT the proxy sent.
pub async fn hangup_message(hangup: oneshot::Receiver<String>) -> String {
  tokio::time::timeout(Duration::from_secs(5), hangup)
    .await
    .expect("timed out waiting for a disconnect")
    .expect("connection ended without a DISCONNECT")
}

/// Signs with a key other than the one it offers.
pub struct Forger(pub PrivateKey);

impl russh::Signer for Forger {
  type Error = russh::AgentAuthError;

  fn auth_publickey_sign(
    &mut self,
    _key: &PublicKey,
    _hash_alg: Option<HashAlg>,
    mut to_sign: CryptoVec,
  ) -> impl std::future::Future<Output = Result<CryptoVec, Self::Error>> + Send {
    use signature::Signer;

    let signature: russh::keys::ssh_key::Signature = self.0.try_sign(&to_sign).unwrap();
    let blob = Vec::<u8>::try_from(signature).unwrap();
    to_sign.extend(&(blob.len() as u32).to_be_bytes());
    to_sign.extend(&blob);
    async move { Ok(to_sign) }
  }
}
/// Whether a password login through the proxy succeeds. A proxy that hangs
/// up counts as a failure.
pub async fn password_login(handle: &mut client::Handle<TestClient>, user: &str, password: &str) -> bool {
  matches!(handle.authenticate_password(user, password).await, Ok(result) if result.success())
}

/// Drain a channel until the upstream closes it.
pub async fn collect(mut channel: Channel<client::Msg>) -> (String, Option<u32>) {
  let mut output = Vec::new();
  let mut status = None;
  tokio::time::timeout(Duration::from_secs(5), async {
    while let Some(msg) = channel.wait().await {
      match msg {
        ChannelMsg::Data { data } => output.extend_from_slice(&data),
        ChannelMsg::ExitStatus { exit_status } => status = Some(exit_status),
        ChannelMsg::Close => break,
        _ => {}
      }
    }
  })
  .await
  .expect("timed out reading the channel");
  (String::from_utf8_lossy(&output).into_owned(), status)
}

pub async fn exec(handle: &client::Handle<TestClient>, command: &str) -> (String, Option<u32>) {
  let channel = handle.channel_open_session().await.unwrap();
  channel.exec(true, command).await.unwrap();
  collect(channel).await
}
