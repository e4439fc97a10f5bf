//! known_hosts and authorized_keys handling.
//!
//! These are plain functions over text buffers: plugins hand the proxy
//! known_hosts content inside a decision, and nothing here touches the
//! filesystem.

use crate::{Error, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use hmac::{Hmac, Mac};
use russh::keys::ssh_key::certificate::CertType;
use russh::keys::ssh_key::{Certificate, Fingerprint, HashAlg, PublicKey};
use sha1::Sha1;
use std::net::IpAddr;

const HASH_MAGIC: &str = "|1|";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Marker {
  CertAuthority,
  Revoked,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostPatterns {
  /// Comma separated patterns, with `*`/`?` globs and `!` negation.
  Patterns(Vec<String>),
  /// `|1|salt|hash`: HMAC-SHA1 of the host name keyed by the salt.
  Hashed { salt: Vec<u8>, hash: Vec<u8> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnownHostsEntry {
  pub marker: Option<Marker>,
  pub patterns: HostPatterns,
  pub key: PublicKey,
}

/// Outcome of looking a host key up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostKeyCheck {
  Match,
  /// A `@revoked` line names this key.
  Revoked,
  /// The host is known, but with other keys.
  Mismatch,
  /// No line is about this host.
  Unknown,
}

impl HostPatterns {
  fn parse(field: &str) -> Option<HostPatterns> {
    if let Some(rest) = field.strip_prefix(HASH_MAGIC) {
      let (salt, hash) = rest.split_once('|')?;
      return Some(HostPatterns::Hashed {
        salt: STANDARD.decode(salt).ok()?,
        hash: STANDARD.decode(hash).ok()?,
      });
    }
    if field.is_empty() {
      return None;
    }
    Some(HostPatterns::Patterns(
      field.split(',').filter(|p| !p.is_empty()).map(str::to_lowercase).collect(),
    ))
  }

  /// Whether `candidate` (a host name, an address, or `[host]:port`) is
  /// covered. A matching negated pattern wins over everything else.
  pub fn matches(&self, candidate: &str) -> bool {
    match self {
      HostPatterns::Hashed { salt, hash } => {
        let Ok(mut mac) = Hmac::<Sha1>::new_from_slice(salt) else {
          return false;
        };
        mac.update(candidate.as_bytes());
        mac.verify_slice(hash).is_ok()
      }
      HostPatterns::Patterns(patterns) => {
        let candidate = candidate.to_lowercase();
        let mut matched = false;
        for pattern in patterns {
          match pattern.strip_prefix('!') {
            Some(negated) if glob_match(negated, &candidate) => return false,
            Some(_) => {}
            None => matched |= glob_match(pattern, &candidate),
          }
        }
        matched
      }
    }
  }
}

/// `*` matches any run of characters, `?` exactly one.
fn glob_match(pattern: &str, text: &str) -> bool {
  let pattern: Vec<char> = pattern.chars().collect();
  let text: Vec<char> = text.chars().collect();
  let (mut p, mut t) = (0, 0);
  let mut backtrack: Option<(usize, usize)> = None;
  while t < text.len() {
    match pattern.get(p) {
      Some('*') => {
        backtrack = Some((p, t));
        p += 1;
      }
      Some(&c) if c == '?' || c == text[t] => {
        p += 1;
        t += 1;
      }
      _ => match backtrack {
        Some((star, consumed)) => {
          p = star + 1;
          t = consumed + 1;
          backtrack = Some((star, consumed + 1));
        }
        None => return false,
      },
    }
  }
  pattern[p..].iter().all(|&c| c == '*')
}

/// Parse known_hosts content. Malformed lines are skipped, as ssh does.
pub fn parse_known_hosts(data: &str) -> Vec<KnownHostsEntry> {
  data
    .lines()
    .enumerate()
    .filter_map(|(index, line)| {
      let line = line.trim();
      if line.is_empty() || line.starts_with('#') {
        return None;
      }
      let entry = parse_known_hosts_line(line);
      if entry.is_none() {
        tracing::debug!(line = index + 1, "skipping malformed known_hosts line");
      }
      entry
    })
    .collect()
}

fn parse_known_hosts_line(line: &str) -> Option<KnownHostsEntry> {
  let mut fields = line.split_whitespace();
  let mut first = fields.next()?;
  let marker = match first {
    "@cert-authority" => Some(Marker::CertAuthority),
    "@revoked" => Some(Marker::Revoked),
    other if other.starts_with('@') => return None,
    _ => None,
  };
  if marker.is_some() {
    first = fields.next()?;
  }
  let patterns = HostPatterns::parse(first)?;
  let algorithm = fields.next()?;
  let blob = fields.next()?;
  let key = PublicKey::from_openssh(&format!("{algorithm} {blob}")).ok()?;
  Some(KnownHostsEntry { marker, patterns, key })
}

/// The names a host goes by in known_hosts: `host` on port 22, `[host]:port`
/// elsewhere, plus the same forms of its address when one is known.
pub fn host_candidates(hostname: &str, port: u16, addr: Option<IpAddr>) -> Vec<String> {
  let format = |host: &str| {
    if port == 22 {
      host.to_string()
    } else {
      format!("[{host}]:{port}")
    }
  };
  let mut candidates = vec![format(hostname)];
  if let Some(addr) = addr {
    let addr = format(&addr.to_string());
    if !candidates.contains(&addr) {
      candidates.push(addr);
    }
  }
  candidates
}

/// Keys are compared by their wire form, so comments never matter.
pub fn same_key(a: &PublicKey, b: &PublicKey) -> bool {
  a.key_data() == b.key_data()
}

/// The marshaled SSH wire form of a public key.
pub fn wire_form(key: &PublicKey) -> Result<Vec<u8>> {
  key
    .to_bytes()
    .map_err(|error| Error::Protocol(format!("cannot encode public key: {error}")))
}

pub fn check_host_key(entries: &[KnownHostsEntry], candidates: &[String], key: &PublicKey) -> HostKeyCheck {
  let about_host = |entry: &&KnownHostsEntry| candidates.iter().any(|c| entry.patterns.matches(c));

  // A revoked key is refused whatever host line it appears on.
  if entries
    .iter()
    .any(|entry| entry.marker == Some(Marker::Revoked) && same_key(&entry.key, key))
  {
    return HostKeyCheck::Revoked;
  }

  let mut known = false;
  for entry in entries.iter().filter(|entry| entry.marker.is_none()).filter(about_host) {
    if same_key(&entry.key, key) {
      return HostKeyCheck::Match;
    }
    known = true;
  }
  if known {
    HostKeyCheck::Mismatch
  } else {
    HostKeyCheck::Unknown
  }
}

/// Check a host certificate against the `@cert-authority` lines for the host.
/// `now` is a unix timestamp.
pub fn check_host_certificate(
  entries: &[KnownHostsEntry],
  candidates: &[String],
  hostname: &str,
  certificate: &Certificate,
  now: u64,
) -> HostKeyCheck {
  let revoked = entries.iter().any(|entry| {
    entry.marker == Some(Marker::Revoked)
      && (entry.key.key_data() == certificate.public_key() || entry.key.key_data() == certificate.signature_key())
  });
  if revoked {
    return HostKeyCheck::Revoked;
  }

  let authorities: Vec<Fingerprint> = entries
    .iter()
    .filter(|entry| entry.marker == Some(Marker::CertAuthority))
    .filter(|entry| candidates.iter().any(|c| entry.patterns.matches(c)))
    .map(|entry| entry.key.fingerprint(HashAlg::Sha256))
    .collect();
  if authorities.is_empty() {
    return HostKeyCheck::Unknown;
  }
  if certificate.cert_type() != CertType::Host {
    return HostKeyCheck::Mismatch;
  }
  let principals = certificate.valid_principals();
  if !principals.is_empty() && !principals.iter().any(|p| p.eq_ignore_ascii_case(hostname)) {
    return HostKeyCheck::Mismatch;
  }
  match certificate.validate_at(now, &authorities) {
    Ok(()) => HostKeyCheck::Match,
    Err(_) => HostKeyCheck::Mismatch,
  }
}

/// Verify `key` for `hostname:port` against known_hosts content, the way a
/// decision's `known_hosts` field is applied.
pub fn verify_host_key(known_hosts: &[u8], hostname: &str, port: u16, addr: Option<IpAddr>, key: &PublicKey) -> Result<()> {
  let text = std::str::from_utf8(known_hosts)
    .map_err(|_| Error::HostKeyMismatch("known_hosts data is not valid UTF-8".into()))?;
  let entries = parse_known_hosts(text);
  let candidates = host_candidates(hostname, port, addr);
  let fingerprint = key.fingerprint(HashAlg::Sha256);
  match check_host_key(&entries, &candidates, key) {
    HostKeyCheck::Match => Ok(()),
    HostKeyCheck::Revoked => Err(Error::HostKeyMismatch(format!("{fingerprint} is revoked"))),
    HostKeyCheck::Mismatch => Err(Error::HostKeyMismatch(format!(
      "{fingerprint} does not match the known keys for {hostname}"
    ))),
    HostKeyCheck::Unknown => Err(Error::HostKeyMismatch(format!("{hostname} is not in known_hosts"))),
  }
}

/// Split an authorized_keys line into its options and key parts. Options may
/// contain quoted spaces.
fn split_options(line: &str) -> (&str, &str) {
  let mut quoted = false;
  for (index, c) in line.char_indices() {
    match c {
      '"' => quoted = !quoted,
      c if c.is_whitespace() && !quoted => return (&line[..index], line[index..].trim_start()),
      _ => {}
    }
  }
  (line, "")
}

/// Parse authorized_keys content into its keys. Options are accepted but not
/// interpreted.
pub fn parse_authorized_keys(data: &str) -> Vec<PublicKey> {
  data
    .lines()
    .map(str::trim)
    .filter(|line| !line.is_empty() && !line.starts_with('#'))
    .filter_map(|line| {
      PublicKey::from_openssh(line).ok().or_else(|| {
        let (_options, rest) = split_options(line);
        PublicKey::from_openssh(rest).ok()
      })
    })
    .collect()
}

/// Whether `key` (SSH wire form) is listed in authorized_keys content.
pub fn authorized_keys_contains(data: &str, key: &[u8]) -> bool {
  let Ok(key) = PublicKey::from_bytes(key) else {
    return false;
  };
  parse_authorized_keys(data).iter().any(|listed| same_key(listed, &key))
}

#[cfg(test)]
mod tests {
  use super::*;
  use russh::keys::ssh_key::rand_core::OsRng;
  use russh::keys::ssh_key::{Algorithm, PrivateKey};

  fn key() -> PublicKey {
    PrivateKey::random(&mut OsRng, Algorithm::Ed25519)
      .unwrap()
      .public_key()
      .clone()
  }

  fn line(patterns: &str, key: &PublicKey) -> String {
    format!("{patterns} {}", key.to_openssh().unwrap())
  }

  fn hashed(host: &str, salt: &[u8]) -> String {
    let mut mac = Hmac::<Sha1>::new_from_slice(salt).unwrap();
    mac.update(host.as_bytes());
    format!(
      "|1|{}|{}",
      STANDARD.encode(salt),
      STANDARD.encode(mac.finalize().into_bytes())
    )
  }

  #[test]
  fn globs() {
    assert!(glob_match("*.example.com", "db.example.com"));
    assert!(glob_match("10.0.0.?", "10.0.0.5"));
    assert!(!glob_match("10.0.0.?", "10.0.0.55"));
    assert!(glob_match("*", ""));
    assert!(glob_match("a*b*c", "aXXbYYc"));
    assert!(!glob_match("a*b*c", "aXXbYY"));
  }

  #[test]
  fn plain_hashed_and_negated_patterns() {
    let host_key = key();
    let data = [
      line("db.example.com,10.0.0.5", &host_key),
      line(&hashed("[bastion]:2222", b"0123456789abcdefghij"), &host_key),
      line("*.corp,!evil.corp", &host_key),
      "# comment".to_string(),
      "garbage".to_string(),
    ]
    .join("\n");
    let entries = parse_known_hosts(&data);
    assert_eq!(entries.len(), 3);

    let check = |host: &str, port: u16| check_host_key(&entries, &host_candidates(host, port, None), &host_key);
    assert_eq!(check("db.example.com", 22), HostKeyCheck::Match);
    assert_eq!(check("DB.example.com", 22), HostKeyCheck::Match);
    assert_eq!(check("bastion", 2222), HostKeyCheck::Match);
    assert_eq!(check("bastion", 22), HostKeyCheck::Unknown);
    assert_eq!(check("web.corp", 22), HostKeyCheck::Match);
    assert_eq!(check("evil.corp", 22), HostKeyCheck::Unknown);
  }

  #[test]
  fn matches_by_resolved_address() {
    let host_key = key();
    let entries = parse_known_hosts(&line("10.0.0.5", &host_key));
    let candidates = host_candidates("db.internal", 22, Some("10.0.0.5".parse().unwrap()));
    assert_eq!(check_host_key(&entries, &candidates, &host_key), HostKeyCheck::Match);
  }

  #[test]
  fn other_keys_and_revocations() {
    let (good, other) = (key(), key());
    let data = format!("{}\n@revoked * {}", line("db", &good), other.to_openssh().unwrap());
    let entries = parse_known_hosts(&data);
    let candidates = host_candidates("db", 22, None);
    assert_eq!(check_host_key(&entries, &candidates, &other), HostKeyCheck::Revoked);
    assert_eq!(check_host_key(&entries, &candidates, &key()), HostKeyCheck::Mismatch);

    let error = verify_host_key(data.as_bytes(), "db", 22, None, &key()).unwrap_err();
    assert_eq!(error.kind(), crate::error::ErrorKind::HostKeyMismatch);
    verify_host_key(data.as_bytes(), "db", 22, None, &good).unwrap();
  }

  #[test]
  fn host_certificates_signed_by_a_trusted_authority() {
    use russh::keys::ssh_key::certificate::Builder;

    let ca = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();
    let host = key();
    let sign = |cert_type: CertType, principal: &str, signer: &PrivateKey| {
      let mut builder = Builder::new(vec![7u8; 16], host.key_data().clone(), 1_000, 2_000_000_000).unwrap();
      builder.cert_type(cert_type).unwrap();
      builder.valid_principal(principal).unwrap();
      builder.sign(signer).unwrap()
    };
    let entries = parse_known_hosts(&format!("@cert-authority *.internal {}", ca.public_key().to_openssh().unwrap()));
    let candidates = host_candidates("db.internal", 22, None);
    let now = 1_700_000_000;
    let check = |cert: &Certificate, hostname: &str| check_host_certificate(&entries, &candidates, hostname, cert, now);

    let good = sign(CertType::Host, "db.internal", &ca);
    assert_eq!(check(&good, "db.internal"), HostKeyCheck::Match);
    assert_eq!(
      check_host_certificate(&entries, &candidates, "db.internal", &good, 2_100_000_000),
      HostKeyCheck::Mismatch
    );
    assert_eq!(check(&sign(CertType::Host, "web.internal", &ca), "db.internal"), HostKeyCheck::Mismatch);
    assert_eq!(check(&sign(CertType::User, "db.internal", &ca), "db.internal"), HostKeyCheck::Mismatch);

    let rogue = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();
    assert_eq!(check(&sign(CertType::Host, "db.internal", &rogue), "db.internal"), HostKeyCheck::Mismatch);

    let elsewhere = host_candidates("db.example.com", 22, None);
    assert_eq!(
      check_host_certificate(&entries, &elsewhere, "db.example.com", &good, now),
      HostKeyCheck::Unknown
    );

    let revoked = parse_known_hosts(&format!(
      "@cert-authority *.internal {}\n@revoked * {}",
      ca.public_key().to_openssh().unwrap(),
      host.to_openssh().unwrap()
    ));
    assert_eq!(
      check_host_certificate(&revoked, &candidates, "db.internal", &good, now),
      HostKeyCheck::Revoked
    );
  }

  #[test]
  fn authorized_keys_with_options() {
    let (listed, unlisted) = (key(), key());
    let data = format!(
      "# keys\ncommand=\"echo hi there\",no-pty {}\n",
      listed.to_openssh().unwrap()
    );
    assert_eq!(parse_authorized_keys(&data).len(), 1);
    assert!(authorized_keys_contains(&data, &wire_form(&listed).unwrap()));
    assert!(!authorized_keys_contains(&data, &wire_form(&unlisted).unwrap()));
    assert!(!authorized_keys_contains(&data, b"not a key"));
  }

  #[test]
  fn comments_do_not_affect_identity() {
    let mut a = key();
    let b = a.clone();
    a.set_comment("alice@laptop");
    assert!(same_key(&a, &b));
    assert_eq!(wire_form(&a).unwrap(), wire_form(&b).unwrap());
  }
}
