//! An SSH reverse proxy. Downstream clients authenticate against a chain of
//! out-of-process plugins; the plugin that settles a connection picks the
//! upstream server and the credentials to log in there with, and the proxy
//! then relays the session between the two.

pub mod auth;
pub mod daemon;
pub mod error;
pub mod hostkey;
pub mod knownhosts;
pub mod meta;
pub mod pipe;
pub mod plugin;
pub mod signer;
pub mod upstream;

pub use error::{Error, ErrorKind, Result};
