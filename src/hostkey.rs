use anyhow::{bail, Context};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use russh::keys::ssh_key::rand_core::OsRng;
use russh::keys::ssh_key::{Algorithm, LineEnding};
use russh::keys::PrivateKey;
use std::path::{Path, PathBuf};

/// When to make up a host key instead of loading one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum GenerateMode {
  /// Only load keys. A missing file is an error.
  #[default]
  Disable,
  /// Generate and save a key when the file does not exist yet.
  Notexist,
  /// Generate a fresh key on every start, replacing the file.
  Always,
}

/// Where host keys come from.
#[derive(Debug, Clone)]
pub enum HostKeySource {
  Files { paths: Vec<PathBuf>, mode: GenerateMode },
  /// Base64 of an OpenSSH private key, eg. from an environment variable.
  Inline(String),
}

pub fn load_host_keys(source: &HostKeySource) -> anyhow::Result<Vec<PrivateKey>> {
  match source {
    HostKeySource::Inline(data) => {
      let pem = STANDARD
        .decode(data.trim())
        .context("server key data is not valid base64")?;
      let pem = String::from_utf8(pem).context("server key data is not UTF-8")?;
      let key = russh::keys::decode_secret_key(&pem, None).context("failed to decode server key data")?;
      Ok(vec![key])
    }
    HostKeySource::Files { paths, mode } => {
      if paths.is_empty() {
        bail!("no server key paths given");
      }
      paths.iter().map(|path| load_or_generate(path, *mode)).collect()
    }
  }
}

#[tracing::instrument(level = "debug")]
fn load_or_generate(path: &Path, mode: GenerateMode) -> anyhow::Result<PrivateKey> {
  match mode {
    GenerateMode::Always => {
      tracing::info!(?path, "regenerating ed25519 host key");
      let key = generate()?;
      match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
        Err(error) => return Err(error).with_context(|| format!("failed to replace {}", path.display())),
      }
      write_private_key(path, &key)?;
      Ok(key)
    }
    GenerateMode::Notexist if !path.exists() => {
      tracing::info!(?path, "generating ed25519 host key");
      let key = generate()?;
      write_private_key(path, &key)?;
      Ok(key)
    }
    // NOTE: encrypted keys are not supported.
    _ => russh::keys::load_secret_key(path, None).with_context(|| format!("failed to load host key {}", path.display())),
  }
}

fn generate() -> anyhow::Result<PrivateKey> {
  PrivateKey::random(&mut OsRng, Algorithm::Ed25519).context("failed to generate host key")
}

/// Write `key` in OpenSSH format, readable by the owner only.
fn write_private_key(path: &Path, key: &PrivateKey) -> anyhow::Result<()> {
  use std::io::Write;
  use std::os::unix::fs::OpenOptionsExt;

  if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
    std::fs::create_dir_all(parent).with_context(|| format!("failed to create {}", parent.display()))?;
  }
  let encoded = key.to_openssh(LineEnding::LF).context("failed to encode host key")?;
  let mut file = std::fs::OpenOptions::new()
    .write(true)
    .create_new(true)
    .mode(0o600)
    .open(path)
    .with_context(|| format!("failed to create {}", path.display()))?;
  file
    .write_all(encoded.as_bytes())
    .with_context(|| format!("failed to write {}", path.display()))?;
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::os::unix::fs::PermissionsExt;

  fn files(path: &Path, mode: GenerateMode) -> HostKeySource {
    HostKeySource::Files {
      paths: vec![path.to_path_buf()],
      mode,
    }
  }

  #[test]
  fn notexist_generates_once_then_loads() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("keys/ssh_host_ed25519_key");

    let first = load_host_keys(&files(&path, GenerateMode::Notexist)).unwrap();
    let mode = std::fs::metadata(&path).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o600);

    let second = load_host_keys(&files(&path, GenerateMode::Notexist)).unwrap();
    assert_eq!(first[0].public_key(), second[0].public_key());

    let loaded = load_host_keys(&files(&path, GenerateMode::Disable)).unwrap();
    assert_eq!(first[0].public_key(), loaded[0].public_key());
  }

  #[test]
  fn disable_requires_the_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("missing");
    assert!(load_host_keys(&files(&path, GenerateMode::Disable)).is_err());
    assert!(!path.exists());
  }

  #[test]
  fn always_replaces_the_key_on_every_start() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ssh_host_ed25519_key");
    let a = load_host_keys(&files(&path, GenerateMode::Always)).unwrap();
    let b = load_host_keys(&files(&path, GenerateMode::Always)).unwrap();
    assert_ne!(a[0].public_key(), b[0].public_key());

    let mode = std::fs::metadata(&path).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o600);
    let saved = load_host_keys(&files(&path, GenerateMode::Disable)).unwrap();
    assert_eq!(saved[0].public_key(), b[0].public_key());
  }

  #[test]
  fn inline_base64_key() {
    let key = generate().unwrap();
    let pem = key.to_openssh(LineEnding::LF).unwrap();
    let loaded = load_host_keys(&HostKeySource::Inline(STANDARD.encode(pem.as_bytes()))).unwrap();
    assert_eq!(loaded[0].public_key(), key.public_key());
    assert!(load_host_keys(&HostKeySource::Inline("!!".into())).is_err());
  }
}
