/// Coarse classification of everything that can go wrong in a pipe. The pipe
/// engine decides what to do with an error (retry the auth loop, tear the pipe
/// down, drop the connection) by looking only at its kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
  /// Malformed SSH or RPC frame. Fatal to the transport that produced it.
  Protocol,
  /// One auth attempt failed. The downstream gets USERAUTH_FAILURE and may retry.
  AuthRejected,
  /// A plugin process died or its RPC stream broke.
  PluginUnavailable,
  /// TCP or handshake failure towards the upstream.
  UpstreamUnreachable,
  /// The upstream host key did not pass the decision's host-key policy. Ends
  /// the pipe with a DISCONNECT that names the reason.
  HostKeyMismatch,
  /// `NewConnection` refused the client.
  PolicyDeny,
  /// A bug.
  InternalInvariant,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
  #[error("protocol error: {0}")]
  Protocol(String),

  #[error("authentication rejected: {0}")]
  AuthRejected(String),

  #[error("plugin unavailable: {0}")]
  PluginUnavailable(String),

  #[error("upstream unreachable: {0}")]
  UpstreamUnreachable(String),

  #[error("host key verification failed: {0}")]
  HostKeyMismatch(String),

  #[error("connection denied: {0}")]
  PolicyDeny(String),

  #[error("internal invariant violated: {0}")]
  InternalInvariant(String),
}

impl Error {
  pub fn kind(&self) -> ErrorKind {
    match self {
      Error::Protocol(_) => ErrorKind::Protocol,
      Error::AuthRejected(_) => ErrorKind::AuthRejected,
      Error::PluginUnavailable(_) => ErrorKind::PluginUnavailable,
      Error::UpstreamUnreachable(_) => ErrorKind::UpstreamUnreachable,
      Error::HostKeyMismatch(_) => ErrorKind::HostKeyMismatch,
      Error::PolicyDeny(_) => ErrorKind::PolicyDeny,
      Error::InternalInvariant(_) => ErrorKind::InternalInvariant,
    }
  }

  /// Whether the auth loop can continue after this error. Everything else
  /// ends the pipe.
  pub fn is_recoverable(&self) -> bool {
    matches!(
      self.kind(),
      ErrorKind::AuthRejected | ErrorKind::UpstreamUnreachable
    )
  }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
