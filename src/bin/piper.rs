use anyhow::Context;
use clap::{Parser, ValueEnum};
use piper::daemon::{self, DaemonConfig};
use piper::hostkey::{GenerateMode, HostKeySource};
use piper::plugin::split_plugin_args;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::prelude::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
  Text,
  Json,
}

/// An SSH reverse proxy that lets a chain of plugins decide where each
/// connection goes.
///
/// Plugins come last, after `--`, each one as its executable followed by its
/// own flags. Separate plugins with another `--`:
///
///   piper --port 2222 -- /usr/lib/piper/totp --secrets /etc/totp -- piper-fixed --target 10.0.0.5:22
#[derive(Parser, Debug)]
#[command(author, version, about, verbatim_doc_comment)]
struct Args {
  /// Address to listen on.
  #[arg(long, env = "PIPER_ADDRESS", default_value = "0.0.0.0")]
  address: IpAddr,

  /// Port to listen on.
  #[arg(long, env = "PIPER_PORT", default_value_t = 2222)]
  port: u16,

  /// Host private key files. Can be given multiple times.
  #[arg(
    long,
    env = "PIPER_SERVER_KEY",
    value_delimiter = ',',
    default_value = "/etc/ssh/ssh_host_ed25519_key"
  )]
  server_key: Vec<PathBuf>,

  /// Base64 of an OpenSSH host private key. Wins over --server-key.
  #[arg(long, env = "PIPER_SERVER_KEY_DATA", hide_env_values = true)]
  server_key_data: Option<String>,

  /// Whether to generate an ed25519 host key instead of loading one.
  #[arg(long, env = "PIPER_SERVER_KEY_GENERATE_MODE", value_enum, default_value_t = GenerateMode::Disable)]
  server_key_generate_mode: GenerateMode,

  /// Seconds a client has to authenticate before it is disconnected.
  #[arg(long, env = "PIPER_LOGIN_GRACE_TIME", default_value_t = 30)]
  login_grace_time: u64,

  /// Text shown to clients before authentication.
  #[arg(long, env = "PIPER_BANNER_TEXT")]
  banner_text: Option<String>,

  /// File whose contents are shown to clients before authentication, after
  /// --banner-text.
  #[arg(long, env = "PIPER_BANNER_FILE")]
  banner_file: Option<PathBuf>,

  /// Log filter used when RUST_LOG is not set.
  #[arg(long, env = "PIPER_LOG_LEVEL", default_value = "info")]
  log_level: String,

  #[arg(long, env = "PIPER_LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
  log_format: LogFormat,

  /// Seconds between keepalives sent to quiet clients. Off when unset.
  #[arg(long, env = "PIPER_KEEPALIVE_INTERVAL_SECONDS")]
  keepalive_interval_seconds: Option<u64>,

  /// Drop a client once this many keepalives in a row go unanswered.
  #[arg(long, env = "PIPER_KEEPALIVE_MAX_UNANSWERED", default_value_t = 3)]
  keepalive_max_unanswered: usize,

  /// Switch to this uid once the listener is bound.
  #[arg(long, env = "PIPER_SETUID")]
  setuid: Option<u32>,

  /// Switch to this gid once the listener is bound.
  #[arg(long, env = "PIPER_SETGID")]
  setgid: Option<u32>,

  /// Plugin commands, separated by `--`.
  #[arg(trailing_var_arg = true, allow_hyphen_values = true, value_name = "PLUGIN")]
  plugins: Vec<String>,
}

fn init_logging(args: &Args) {
  let filter = tracing_subscriber::EnvFilter::try_from_default_env()
    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&args.log_level));
  let registry = tracing_subscriber::registry().with(filter);
  match args.log_format {
    LogFormat::Text => registry
      .with(tracing_subscriber::fmt::layer().with_span_events(tracing_subscriber::fmt::format::FmtSpan::NEW))
      .init(),
    LogFormat::Json => registry
      .with(tracing_subscriber::fmt::layer().json().with_current_span(true))
      .init(),
  }
}

fn banner(args: &Args) -> anyhow::Result<String> {
  let mut banner = args.banner_text.clone().unwrap_or_default();
  if let Some(path) = &args.banner_file {
    let text = std::fs::read_to_string(path).with_context(|| format!("failed to read banner file {}", path.display()))?;
    banner.push_str(&text);
  }
  Ok(banner)
}

impl TryFrom<&Args> for DaemonConfig {
  type Error = anyhow::Error;

  fn try_from(args: &Args) -> anyhow::Result<Self> {
    let host_keys = match &args.server_key_data {
      Some(data) => HostKeySource::Inline(data.clone()),
      None => HostKeySource::Files {
        paths: args.server_key.clone(),
        mode: args.server_key_generate_mode,
      },
    };
    Ok(DaemonConfig {
      listen: SocketAddr::new(args.address, args.port),
      host_keys,
      login_grace_time: Duration::from_secs(args.login_grace_time),
      banner: banner(args)?,
      keepalive_interval: args.keepalive_interval_seconds.map(Duration::from_secs),
      keepalive_max: args.keepalive_max_unanswered,
      setuid: args.setuid,
      setgid: args.setgid,
      plugins: split_plugin_args(&args.plugins),
    })
  }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  let args = Args::parse();
  init_logging(&args);

  let config = DaemonConfig::try_from(&args)?;
  tracing::debug!(?config.plugins, "starting");

  let shutdown = CancellationToken::new();
  {
    let shutdown = shutdown.clone();
    tokio::spawn(async move {
      if tokio::signal::ctrl_c().await.is_ok() {
        tracing::info!("interrupted");
        shutdown.cancel();
      }
    });
  }

  daemon::run(config, shutdown).await
}
