use crate::hostkey::{load_host_keys, HostKeySource};
use crate::pipe::splice::Splice;
use crate::pipe::{PipeConfig, PipeHandler, PipeSnapshot};
use crate::plugin::{PluginChain, PluginCommand};
use crate::{Error, ErrorKind};
use anyhow::Context;
use russh::server;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Buffer of the in-memory pipe between a client socket and its session.
const BRIDGE_BUFFER: usize = 256 * 1024;

/// Everything the daemon needs, already validated.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
  pub listen: SocketAddr,
  pub host_keys: HostKeySource,
  /// Connections that have not authenticated by then are dropped.
  pub login_grace_time: Duration,
  pub banner: String,
  pub keepalive_interval: Option<Duration>,
  pub keepalive_max: usize,
  pub setuid: Option<u32>,
  pub setgid: Option<u32>,
  pub plugins: Vec<PluginCommand>,
}

/// A bound listener plus everything a connection needs.
pub struct Daemon {
  listener: TcpListener,
  ssh: Arc<server::Config>,
  chain: PluginChain,
  pipe: Arc<PipeConfig>,
  login_grace_time: Duration,
}

impl Daemon {
  pub async fn bind(config: &DaemonConfig, chain: PluginChain) -> anyhow::Result<Daemon> {
    let keys = load_host_keys(&config.host_keys)?;
    let ssh = server::Config {
      auth_rejection_time: Duration::from_secs(1),
      auth_rejection_time_initial: Some(Duration::from_secs(0)),
      keys,
      keepalive_interval: config.keepalive_interval,
      keepalive_max: config.keepalive_max,
      inactivity_timeout: None,
      ..Default::default()
    };
    let listener = TcpListener::bind(config.listen)
      .await
      .with_context(|| format!("failed to bind {}", config.listen))?;
    tracing::info!(address = ?listener.local_addr().ok(), plugins = chain.len(), "listening");

    Ok(Daemon {
      listener,
      ssh: Arc::new(ssh),
      chain,
      pipe: Arc::new(PipeConfig {
        banner: config.banner.clone(),
        upstream_timeout: config.login_grace_time,
      }),
      login_grace_time: config.login_grace_time,
    })
  }

  pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
    self.listener.local_addr()
  }

  /// Accept until `shutdown` fires, then cancel live pipes and wait a little
  /// for them to wind down.
  pub async fn serve(self, shutdown: CancellationToken) -> anyhow::Result<()> {
    let mut pipes = JoinSet::new();
    loop {
      tokio::select! {
        _ = shutdown.cancelled() => break,
        accepted = self.listener.accept() => {
          let (stream, peer) = match accepted {
            Ok(accepted) => accepted,
            Err(error) => {
              tracing::warn!(?error, "accept failed");
              continue;
            }
          };
          let _ = stream.set_nodelay(true);
          pipes.spawn(connection(
            stream,
            peer,
            self.ssh.clone(),
            self.chain.clone(),
            self.pipe.clone(),
            self.login_grace_time,
            shutdown.child_token(),
          ));
        }
        Some(_) = pipes.join_next(), if !pipes.is_empty() => {}
      }
    }

    tracing::info!(live = pipes.len(), "shutting down");
    let drained = tokio::time::timeout(Duration::from_secs(5), async {
      while pipes.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
      tracing::warn!(live = pipes.len(), "aborting pipes that did not close in time");
      pipes.abort_all();
    }
    self.chain.shutdown();
    Ok(())
  }
}

/// Spawn the plugins, bind, drop privileges, and serve until `shutdown`.
pub async fn run(config: DaemonConfig, shutdown: CancellationToken) -> anyhow::Result<()> {
  let chain = PluginChain::spawn(&config.plugins).await?;
  if chain.is_empty() {
    tracing::warn!("no plugins configured, every login will be rejected");
  }
  let daemon = Daemon::bind(&config, chain).await?;
  drop_privileges(config.setgid, config.setuid)?;
  daemon.serve(shutdown).await
}

/// Group first: once the uid is gone we usually may not change the gid.
pub fn drop_privileges(setgid: Option<u32>, setuid: Option<u32>) -> anyhow::Result<()> {
  use nix::unistd::{Gid, Uid};

  if let Some(gid) = setgid {
    nix::unistd::setgid(Gid::from_raw(gid)).with_context(|| format!("setgid({gid}) failed"))?;
    tracing::info!(gid, "switched group");
  }
  if let Some(uid) = setuid {
    nix::unistd::setuid(Uid::from_raw(uid)).with_context(|| format!("setuid({uid}) failed"))?;
    tracing::info!(uid, "switched user");
  }
  Ok(())
}

async fn connection(
  stream: TcpStream,
  peer: SocketAddr,
  ssh: Arc<server::Config>,
  chain: PluginChain,
  pipe: Arc<PipeConfig>,
  login_grace_time: Duration,
  cancel: CancellationToken,
) {
  let (handler, mut snapshots) = PipeHandler::new(chain.clone(), pipe, peer.to_string(), cancel.clone());
  let span = handler.span().clone();
  let splice = handler.splice().clone();
  async move {
    tracing::info!("connection accepted");
    let outcome = drive(stream, ssh, handler, &splice, &mut snapshots, login_grace_time, &cancel).await;
    let snapshot = snapshots.borrow().clone();
    // A pipe that hung up on purpose ends the session cleanly; its reason is
    // what the plugins should hear about.
    let outcome = match &snapshot.failure {
      Some(reason) => Err(anyhow::anyhow!(reason.clone())),
      None => outcome,
    };
    match outcome {
      Ok(()) => tracing::info!(started = snapshot.started, "connection closed"),
      Err(error) => report(&chain, &snapshot, error).await,
    }
  }
  .instrument(span)
  .await
}

async fn drive(
  stream: TcpStream,
  ssh: Arc<server::Config>,
  handler: PipeHandler,
  splice: &Splice,
  snapshots: &mut watch::Receiver<PipeSnapshot>,
  login_grace_time: Duration,
  cancel: &CancellationToken,
) -> anyhow::Result<()> {
  let too_slow = || Error::Protocol(format!("not authenticated within {login_grace_time:?}"));
  // Covers the version exchange too: a client that never says hello is as
  // unauthenticated as one that never logs in.
  let deadline = tokio::time::sleep(login_grace_time);
  tokio::pin!(deadline);

  let stream = watch_downstream(stream, cancel.clone());
  let session = tokio::select! {
    session = server::run_stream(ssh, stream, handler) => session?,
    _ = &mut deadline => return Err(too_slow().into()),
    _ = cancel.cancelled() => return Ok(()),
  };
  let handle = session.handle();
  splice.bind(handle.clone());
  tokio::pin!(session);

  loop {
    let started = snapshots.borrow().started;
    tokio::select! {
      result = &mut session => return result,
      _ = &mut deadline, if !started => return Err(too_slow().into()),
      _ = cancel.cancelled() => {
        let _ = handle
          .disconnect(russh::Disconnect::ByApplication, "connection closed".to_string(), "en".to_string())
          .await;
        let _ = tokio::time::timeout(Duration::from_secs(1), &mut session).await;
        return Ok(());
      }
      Ok(()) = snapshots.changed() => {}
    }
  }
}

/// Give russh an in-memory pipe in place of the socket and cancel the pipe
/// as soon as the client's side reaches EOF. russh reads nothing while an
/// auth callback runs, so on its own it would only notice a client that hung
/// up mid-dial once the dial is over.
fn watch_downstream(stream: TcpStream, cancel: CancellationToken) -> DuplexStream {
  let (session_end, socket_end) = tokio::io::duplex(BRIDGE_BUFFER);
  let (mut from_client, mut to_client) = stream.into_split();
  let (mut from_session, mut to_session) = tokio::io::split(socket_end);

  tokio::spawn(async move {
    tokio::select! {
      _ = cancel.cancelled() => {}
      copied = tokio::io::copy(&mut from_client, &mut to_session) => {
        tracing::debug!(?copied, "downstream socket closed");
        cancel.cancel();
      }
    }
    let _ = to_session.shutdown().await;
  });
  tokio::spawn(async move {
    let _ = tokio::io::copy(&mut from_session, &mut to_client).await;
    let _ = to_client.shutdown().await;
  });
  session_end
}

/// Log a failed pipe and tell the plugins: `PipeError` once the pipe had
/// started, `PipeCreateError` before that.
async fn report(chain: &PluginChain, snapshot: &PipeSnapshot, error: anyhow::Error) {
  let message = format!("{error:#}");
  match error.downcast_ref::<Error>().map(Error::kind) {
    Some(ErrorKind::PolicyDeny) => tracing::info!(%message, "connection denied"),
    Some(ErrorKind::InternalInvariant) => tracing::error!(%message, "pipe failed"),
    _ => tracing::warn!(%message, started = snapshot.started, "pipe failed"),
  }
  if snapshot.started {
    chain.pipe_error(&snapshot.meta, &message).await;
  } else {
    chain.pipe_create_error(&snapshot.meta.from_addr, &message).await;
  }
}
