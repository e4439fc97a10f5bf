//! Relaying channels between the downstream session and the upstream one.
//!
//! Every downstream channel is paired with exactly one upstream channel. The
//! downstream half reaches us through the server handler callbacks (`data`,
//! `exec_request`, ...), which push [`Forward`] messages onto the pair's queue
//! in the order russh delivered them. Each pair runs two pumps: one drains
//! that queue into the upstream channel's write half, the other replays the
//! read half through the downstream [`server::Handle`]. Neither waits on the
//! other, so a full window in one direction never stalls the opposite one.
//! Channel ids are the only thing that gets rewritten.

use dashmap::DashMap;
use russh::client;
use russh::server;
use russh::{Channel, ChannelId, ChannelMsg, ChannelReadHalf, ChannelWriteHalf, CryptoVec, Pty, Sig};
use std::sync::{Arc, OnceLock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Something the downstream did on a channel, to be replayed upstream.
#[derive(Debug)]
pub enum Forward {
  Pty {
    term: String,
    col_width: u32,
    row_height: u32,
    pix_width: u32,
    pix_height: u32,
    modes: Vec<(Pty, u32)>,
  },
  Env {
    name: String,
    value: String,
  },
  Shell,
  Exec(Vec<u8>),
  Subsystem(String),
  WindowChange {
    col_width: u32,
    row_height: u32,
    pix_width: u32,
    pix_height: u32,
  },
  Signal(Sig),
  Data(Vec<u8>),
  ExtendedData {
    code: u32,
    data: Vec<u8>,
  },
  Eof,
  Close,
}

struct Inner {
  downstream: OnceLock<server::Handle>,
  routes: DashMap<ChannelId, mpsc::UnboundedSender<Forward>>,
  cancel: CancellationToken,
}

/// The channel table of one pipe. Cheap to clone; the upstream client
/// handler holds a clone to accept forwarded-tcpip channels.
#[derive(Clone)]
pub struct Splice {
  inner: Arc<Inner>,
}

impl Splice {
  /// Relays stop when `cancel` fires.
  pub fn new(cancel: CancellationToken) -> Self {
    Splice {
      inner: Arc::new(Inner {
        downstream: OnceLock::new(),
        routes: DashMap::new(),
        cancel,
      }),
    }
  }

  /// Remember the downstream session. Only the first call has an effect.
  pub fn bind(&self, handle: server::Handle) {
    let _ = self.inner.downstream.set(handle);
  }

  pub fn downstream(&self) -> Option<server::Handle> {
    self.inner.downstream.get().cloned()
  }

  /// Start relaying between downstream channel `down` and `up`.
  pub fn attach(&self, down: ChannelId, up: Channel<client::Msg>) -> bool {
    let Some(handle) = self.inner.downstream.get().cloned() else {
      tracing::error!(?down, "no downstream session to relay to");
      return false;
    };
    let (tx, rx) = mpsc::unbounded_channel();
    if self.inner.routes.insert(down, tx).is_some() {
      tracing::warn!(?down, "replacing an existing channel relay");
    }

    // Stops both pumps of this pair, whichever side finishes first.
    let pair = self.inner.cancel.child_token();
    let (reader, writer) = up.split();
    tracing::debug!(?down, upstream = ?writer.id(), "relay started");

    let inner = self.inner.clone();
    let outbound = pair.clone();
    let downstream = handle.clone();
    tokio::spawn(async move {
      if let Err(error) = pump_upstream(&writer, rx, &outbound).await {
        tracing::debug!(?down, ?error, "upstream write failed");
        let _ = downstream.close(down).await;
      }
      outbound.cancel();
      let _ = writer.close().await;
      inner.routes.remove(&down);
      tracing::debug!(?down, "upstream pump finished");
    });
    tokio::spawn(async move {
      pump_downstream(&handle, down, reader, &pair).await;
      pair.cancel();
      tracing::debug!(?down, "downstream pump finished");
    });
    true
  }

  /// Queue `forward` for the upstream side of `down`. Returns false when the
  /// channel is not (or no longer) relayed.
  pub fn forward(&self, down: ChannelId, forward: Forward) -> bool {
    match self.inner.routes.get(&down) {
      Some(route) => route.send(forward).is_ok(),
      None => {
        tracing::debug!(?down, ?forward, "dropping message for unknown channel");
        false
      }
    }
  }

  /// The upstream opened a forwarded-tcpip channel. Open the matching one
  /// towards the downstream client and relay between them.
  pub fn open_forwarded(
    &self,
    up: Channel<client::Msg>,
    connected_address: String,
    connected_port: u32,
    originator_address: String,
    originator_port: u32,
  ) {
    let Some(handle) = self.inner.downstream.get().cloned() else {
      tracing::warn!("forwarded-tcpip before any downstream channel, refusing");
      return;
    };
    let splice = self.clone();
    tokio::spawn(async move {
      let opened = handle
        .channel_open_forwarded_tcpip(
          connected_address.clone(),
          connected_port,
          originator_address,
          originator_port,
        )
        .await;
      match opened {
        Ok(down) => {
          splice.attach(down.id(), up);
        }
        Err(error) => {
          tracing::warn!(%connected_address, connected_port, ?error, "downstream refused forwarded-tcpip");
          let _ = up.close().await;
        }
      }
    });
  }
}

/// Downstream → upstream, in the order the handler queued it.
async fn pump_upstream(
  up: &ChannelWriteHalf<client::Msg>,
  mut requests: mpsc::UnboundedReceiver<Forward>,
  cancel: &CancellationToken,
) -> Result<(), russh::Error> {
  loop {
    let request = tokio::select! {
      _ = cancel.cancelled() => return Ok(()),
      request = requests.recv() => request,
    };
    let Some(request) = request else {
      return Ok(());
    };
    let closing = matches!(request, Forward::Close);
    // A write waiting for upstream window still gives way to cancellation.
    tokio::select! {
      _ = cancel.cancelled() => return Ok(()),
      sent = send_upstream(up, request) => sent?,
    }
    if closing {
      return Ok(());
    }
  }
}

/// Upstream → downstream until either side closes.
async fn pump_downstream(down: &server::Handle, id: ChannelId, mut up: ChannelReadHalf, cancel: &CancellationToken) {
  loop {
    let message = tokio::select! {
      _ = cancel.cancelled() => return,
      message = up.wait() => message,
    };
    let Some(message) = message else {
      let _ = down.close(id).await;
      return;
    };
    if !send_downstream(down, id, message).await {
      return;
    }
  }
}

// Requests that expect a reply are forwarded with want_reply set; the
// upstream's answer comes back as ChannelMsg::Success or Failure. `env` goes
// without, since clients do not wait for an answer to it and an unexpected
// failure would be matched against the next pending request.
async fn send_upstream(up: &ChannelWriteHalf<client::Msg>, request: Forward) -> Result<(), russh::Error> {
  match request {
    Forward::Pty {
      term,
      col_width,
      row_height,
      pix_width,
      pix_height,
      modes,
    } => {
      up.request_pty(true, &term, col_width, row_height, pix_width, pix_height, &modes)
        .await
    }
    Forward::Env { name, value } => up.set_env(false, name, value).await,
    Forward::Shell => up.request_shell(true).await,
    Forward::Exec(command) => up.exec(true, command).await,
    Forward::Subsystem(name) => up.request_subsystem(true, name).await,
    Forward::WindowChange {
      col_width,
      row_height,
      pix_width,
      pix_height,
    } => up.window_change(col_width, row_height, pix_width, pix_height).await,
    Forward::Signal(signal) => up.signal(signal).await,
    Forward::Data(data) => up.data(&data[..]).await,
    Forward::ExtendedData { code, data } => up.extended_data(code, &data[..]).await,
    Forward::Eof => up.eof().await,
    Forward::Close => up.close().await,
  }
}

/// Replay one upstream message on the downstream channel. False once the
/// downstream side is gone or the channel is closed.
async fn send_downstream(down: &server::Handle, id: ChannelId, message: ChannelMsg) -> bool {
  match message {
    ChannelMsg::Data { data } => down.data(id, CryptoVec::from_slice(&data)).await.is_ok(),
    ChannelMsg::ExtendedData { data, ext } => down
      .extended_data(id, ext, CryptoVec::from_slice(&data))
      .await
      .is_ok(),
    ChannelMsg::Eof => down.eof(id).await.is_ok(),
    ChannelMsg::Close => {
      let _ = down.close(id).await;
      false
    }
    ChannelMsg::Success => down.channel_success(id).await.is_ok(),
    ChannelMsg::Failure => down.channel_failure(id).await.is_ok(),
    ChannelMsg::ExitStatus { exit_status } => down.exit_status_request(id, exit_status).await.is_ok(),
    ChannelMsg::ExitSignal {
      signal_name,
      core_dumped,
      error_message,
      lang_tag,
    } => down
      .exit_signal_request(id, signal_name, core_dumped, error_message, lang_tag)
      .await
      .is_ok(),
    // Window adjustments are per hop; russh handles both sides.
    ChannelMsg::WindowAdjusted { .. } => true,
    other => {
      tracing::debug!(?id, message = ?other, "not relaying upstream channel message");
      true
    }
  }
}
