use super::codec::{self, FrameReader, FrameWriter};
use super::proto::{Callback, Frame};
use super::RpcError;
use async_trait::async_trait;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;

type BoxedWriter = Pin<Box<dyn AsyncWrite + Send>>;

/// Serves the requests the other side sends us. The proxy installs one that
/// answers `Prompt`; plugins install one that answers everything else.
#[async_trait]
pub trait Dispatch: Send + Sync + 'static {
  async fn request(&self, callback: Callback, body: serde_json::Value) -> Result<serde_json::Value, String>;

  async fn event(&self, callback: Callback, body: serde_json::Value) {
    tracing::debug!(?callback, ?body, "ignoring event");
  }
}

/// One end of a framed RPC stream.
///
/// Outbound frames go through a single writer lock. Inbound frames are read by
/// a dedicated task: responses are matched to callers through `pending`,
/// requests and events are handed to the [`Dispatch`] on their own task so a
/// long-running callback (keyboard-interactive) never blocks the stream.
pub struct RpcPeer {
  name: String,
  writer: Mutex<FrameWriter<BoxedWriter>>,
  pending: DashMap<u64, oneshot::Sender<Result<serde_json::Value, RpcError>>>,
  next_id: AtomicU64,
  closed: AtomicBool,
  shutdown: CancellationToken,
}

impl RpcPeer {
  /// Wire up a peer and spawn its reader task. The task runs until the
  /// stream hits EOF or a read error, then fails everything in flight.
  pub fn start<R, W>(name: impl Into<String>, reader: R, writer: W, dispatch: Arc<dyn Dispatch>) -> Arc<RpcPeer>
  where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + 'static,
  {
    RpcPeer::start_with(name, reader, writer, |_| dispatch)
  }

  /// Like [`RpcPeer::start`], for dispatchers that call back into the peer
  /// they serve.
  pub fn start_with<R, W, F>(name: impl Into<String>, reader: R, writer: W, make_dispatch: F) -> Arc<RpcPeer>
  where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + 'static,
    F: FnOnce(Weak<RpcPeer>) -> Arc<dyn Dispatch>,
  {
    let mut dispatch = None;
    let peer = Arc::new_cyclic(|weak| {
      dispatch = Some(make_dispatch(weak.clone()));
      RpcPeer {
        name: name.into(),
        writer: Mutex::new(codec::writer(Box::pin(writer) as BoxedWriter)),
        pending: DashMap::new(),
        next_id: AtomicU64::new(1),
        closed: AtomicBool::new(false),
        shutdown: CancellationToken::new(),
      }
    });
    if let Some(dispatch) = dispatch {
      tokio::spawn(peer.clone().read_loop(codec::reader(reader), dispatch));
    }
    peer
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn is_closed(&self) -> bool {
    self.closed.load(Ordering::SeqCst)
  }

  /// Resolves once the stream is gone.
  pub async fn closed(&self) {
    self.shutdown.cancelled().await
  }

  /// Stop reading and fail everything in flight. The underlying stream is
  /// released once the reader task notices.
  pub fn close(&self) {
    self.shutdown.cancel();
    self.fail_pending();
  }

  /// Invoke `callback` on the other side and wait for its response.
  #[tracing::instrument(level = "debug", skip(self, request), fields(peer = %self.name))]
  pub async fn call<Req, Resp>(&self, callback: Callback, request: &Req) -> Result<Resp, RpcError>
  where
    Req: Serialize + ?Sized,
    Resp: DeserializeOwned,
  {
    let body = serde_json::to_value(request)?;
    let id = self.next_id.fetch_add(1, Ordering::SeqCst);
    let (tx, rx) = oneshot::channel();
    self.pending.insert(id, tx);
    // `fail_pending` sets `closed` before draining, so checking after the
    // insert catches a close that raced with us.
    if self.is_closed() {
      self.pending.remove(&id);
      return Err(RpcError::Closed);
    }

    if let Err(error) = self.send(&Frame::Request { id, callback, body }).await {
      self.pending.remove(&id);
      return Err(error);
    }

    let body = rx.await.map_err(|_| RpcError::Closed)??;
    serde_json::from_value(body).map_err(|error| RpcError::Protocol(format!("bad {callback:?} response: {error}")))
  }

  /// Fire-and-forget notification.
  pub async fn notify<Req: Serialize + ?Sized>(&self, callback: Callback, body: &Req) -> Result<(), RpcError> {
    if self.is_closed() {
      return Err(RpcError::Closed);
    }
    let body = serde_json::to_value(body)?;
    self.send(&Frame::Event { id: 0, callback, body }).await
  }

  async fn send(&self, frame: &Frame) -> Result<(), RpcError> {
    let payload = codec::encode(frame)?;
    let mut writer = self.writer.lock().await;
    writer.send(payload).await.map_err(RpcError::from)
  }

  fn fail_pending(&self) {
    self.closed.store(true, Ordering::SeqCst);
    let ids: Vec<u64> = self.pending.iter().map(|entry| *entry.key()).collect();
    for id in ids {
      if let Some((_, tx)) = self.pending.remove(&id) {
        let _ = tx.send(Err(RpcError::Closed));
      }
    }
  }

  async fn read_loop<R>(self: Arc<Self>, mut reader: FrameReader<R>, dispatch: Arc<dyn Dispatch>)
  where
    R: AsyncRead + Unpin,
  {
    loop {
      let next = tokio::select! {
        next = reader.next() => next,
        _ = self.shutdown.cancelled() => break,
      };
      let payload = match next {
        Some(Ok(payload)) => payload,
        Some(Err(error)) => {
          tracing::error!(peer = %self.name, ?error, "rpc stream read failed");
          break;
        }
        None => {
          tracing::debug!(peer = %self.name, "rpc stream closed");
          break;
        }
      };
      let frame = match codec::decode(&payload) {
        Ok(frame) => frame,
        Err(error) => {
          // A frame we cannot parse may have been a response somebody is
          // waiting for; the stream is no longer trustworthy.
          tracing::error!(peer = %self.name, ?error, "malformed rpc frame");
          break;
        }
      };

      match frame {
        Frame::Response { id, error, body } => match self.pending.remove(&id) {
          Some((_, tx)) => {
            let result = if error.is_empty() {
              Ok(body)
            } else {
              Err(RpcError::Remote(error))
            };
            let _ = tx.send(result);
          }
          None => tracing::warn!(peer = %self.name, id, "response for unknown request"),
        },
        Frame::Request { id, callback, body } => {
          let peer = self.clone();
          let dispatch = dispatch.clone();
          tokio::spawn(async move {
            let response = match dispatch.request(callback, body).await {
              Ok(body) => Frame::Response {
                id,
                error: String::new(),
                body,
              },
              Err(error) => Frame::Response {
                id,
                error,
                body: serde_json::Value::Null,
              },
            };
            if let Err(error) = peer.send(&response).await {
              tracing::warn!(peer = %peer.name, ?callback, ?error, "failed to send response");
            }
          });
        }
        Frame::Event { callback, body, .. } => {
          let dispatch = dispatch.clone();
          tokio::spawn(async move { dispatch.event(callback, body).await });
        }
      }
    }

    self.shutdown.cancel();
    self.fail_pending();
  }
}
