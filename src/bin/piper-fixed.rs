//! Route every login to one fixed upstream.
//!
//! Password logins are passed through as they are. With `--authorized-keys`,
//! public-key logins are accepted for the listed keys and continued upstream
//! with `--private-key`.

use anyhow::Context;
use async_trait::async_trait;
use clap::Parser;
use piper::knownhosts::authorized_keys_contains;
use piper::meta::ConnMeta;
use piper::plugin::proto::{split_host_port, Callback, Upstream, UpstreamAuth};
use piper::plugin::sdk::{serve_stdio, PluginHandler};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
  /// Upstream to send everyone to, `host` or `host:port`.
  #[arg(long)]
  target: String,

  /// Accept public keys listed in this authorized_keys file.
  #[arg(long, requires = "private_key")]
  authorized_keys: Option<PathBuf>,

  /// Private key used upstream for public-key logins.
  #[arg(long, requires = "authorized_keys")]
  private_key: Option<PathBuf>,
}

struct KeyLogin {
  authorized_keys: String,
  private_key: Vec<u8>,
}

struct Fixed {
  host: String,
  port: u16,
  keys: Option<KeyLogin>,
}

impl Fixed {
  fn upstream(&self, auth: UpstreamAuth) -> Upstream {
    Upstream {
      host: self.host.clone(),
      port: i32::from(self.port),
      uri: String::new(),
      user_name: String::new(),
      ignore_host_key: true,
      known_hosts: Vec::new(),
      auth,
    }
  }
}

#[async_trait]
impl PluginHandler for Fixed {
  fn callbacks(&self) -> Vec<Callback> {
    let mut callbacks = vec![Callback::Password];
    if self.keys.is_some() {
      callbacks.push(Callback::PublicKey);
    }
    callbacks
  }

  async fn password(&self, meta: ConnMeta, password: Vec<u8>) -> Result<Upstream, String> {
    let password = String::from_utf8(password).map_err(|_| "password is not valid UTF-8".to_string())?;
    tracing::info!(user = %meta.user_name, from = %meta.from_addr, "routing password login");
    Ok(self.upstream(UpstreamAuth::Password { password }))
  }

  async fn public_key(&self, meta: ConnMeta, public_key: Vec<u8>) -> Result<Upstream, String> {
    let keys = self.keys.as_ref().ok_or("public keys are not accepted")?;
    if !authorized_keys_contains(&keys.authorized_keys, &public_key) {
      return Err(format!("key not authorized for {}", meta.user_name));
    }
    tracing::info!(user = %meta.user_name, from = %meta.from_addr, "routing public-key login");
    Ok(self.upstream(UpstreamAuth::PrivateKey {
      private_key: keys.private_key.clone(),
      certificate: Vec::new(),
    }))
  }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  // stdout carries the plugin protocol; logs go to stderr, where the proxy
  // picks them up.
  tracing_subscriber::fmt()
    .with_writer(std::io::stderr)
    .with_ansi(false)
    .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
    .init();

  let args = Args::parse();
  let (host, port) = split_host_port(&args.target).map_err(anyhow::Error::msg)?;
  let keys = match (&args.authorized_keys, &args.private_key) {
    (Some(authorized_keys), Some(private_key)) => Some(KeyLogin {
      authorized_keys: std::fs::read_to_string(authorized_keys)
        .with_context(|| format!("failed to read {}", authorized_keys.display()))?,
      private_key: std::fs::read(private_key).with_context(|| format!("failed to read {}", private_key.display()))?,
    }),
    _ => None,
  };

  serve_stdio(Fixed { host, port, keys })
    .await
    .context("plugin stream failed")
}
