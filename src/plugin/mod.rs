//! Out-of-process plugins and the RPC they speak.

mod chain;
mod client;
pub mod codec;
mod process;
pub mod proto;
pub mod rpc;
pub mod sdk;

pub use chain::PluginChain;
pub use client::{KeyboardInteractive, Plugin, PromptExchange};
pub use process::{split_plugin_args, PluginCommand};

use crate::Error;

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
  /// The stream is gone: EOF, a read error, or an explicit close.
  #[error("plugin connection closed")]
  Closed,

  /// The other side answered with an error string.
  #[error("{0}")]
  Remote(String),

  #[error("plugin protocol violation: {0}")]
  Protocol(String),

  #[error("plugin i/o: {0}")]
  Io(#[from] std::io::Error),

  #[error("plugin message encoding: {0}")]
  Json(#[from] serde_json::Error),
}

impl From<RpcError> for Error {
  fn from(error: RpcError) -> Self {
    match error {
      RpcError::Closed | RpcError::Io(_) => Error::PluginUnavailable(error.to_string()),
      RpcError::Protocol(_) | RpcError::Json(_) => Error::Protocol(error.to_string()),
      RpcError::Remote(message) => Error::AuthRejected(message),
    }
  }
}

/// Serve `handler` from inside this process and connect to it.
#[cfg(test)]
pub(crate) async fn in_memory<H: sdk::PluginHandler>(name: &str, handler: H) -> Plugin {
  let (proxy_end, plugin_end) = tokio::io::duplex(64 * 1024);
  let (reader, writer) = tokio::io::split(plugin_end);
  tokio::spawn(sdk::serve(handler, reader, writer));
  let (reader, writer) = tokio::io::split(proxy_end);
  Plugin::connect(name, reader, writer).await.unwrap()
}
