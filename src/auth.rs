//! Translating between downstream auth attempts and plugin verdicts.

use crate::meta::ConnMeta;
use crate::plugin::proto::{Callback, Upstream, UpstreamAuth};
use crate::plugin::{Plugin, RpcError};
use crate::{Error, Result};
use russh::{MethodKind, MethodSet};
use std::collections::HashMap;

/// The downstream user-auth methods the proxy can translate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthMethod {
  None,
  Password,
  PublicKey,
  KeyboardInteractive,
}

impl AuthMethod {
  pub const ALL: [AuthMethod; 4] = [
    AuthMethod::None,
    AuthMethod::Password,
    AuthMethod::PublicKey,
    AuthMethod::KeyboardInteractive,
  ];

  /// The SSH method name.
  pub fn name(self) -> &'static str {
    match self {
      AuthMethod::None => "none",
      AuthMethod::Password => "password",
      AuthMethod::PublicKey => "publickey",
      AuthMethod::KeyboardInteractive => "keyboard-interactive",
    }
  }

  pub fn from_name(name: &str) -> Option<Self> {
    AuthMethod::ALL.into_iter().find(|method| method.name() == name)
  }

  /// The plugin callback that decides attempts made with this method.
  pub fn callback(self) -> Callback {
    match self {
      AuthMethod::None => Callback::NoClientAuth,
      AuthMethod::Password => Callback::Password,
      AuthMethod::PublicKey => Callback::PublicKey,
      AuthMethod::KeyboardInteractive => Callback::KeyboardInteractive,
    }
  }

  pub(crate) fn kind(self) -> MethodKind {
    match self {
      AuthMethod::None => MethodKind::None,
      AuthMethod::Password => MethodKind::Password,
      AuthMethod::PublicKey => MethodKind::PublicKey,
      AuthMethod::KeyboardInteractive => MethodKind::KeyboardInteractive,
    }
  }
}

/// The methods a plugin can decide, judging only by what it declared.
pub fn declared_methods(plugin: &Plugin) -> Vec<AuthMethod> {
  AuthMethod::ALL
    .into_iter()
    .filter(|method| plugin.supports(method.callback()))
    .collect()
}

/// Parse method names, dropping the ones we cannot translate.
pub fn parse_methods<S: AsRef<str>>(names: &[S]) -> Vec<AuthMethod> {
  names
    .iter()
    .filter_map(|name| {
      let method = AuthMethod::from_name(name.as_ref());
      if method.is_none() {
        tracing::debug!(method = name.as_ref(), "ignoring unknown auth method");
      }
      method
    })
    .collect()
}

/// The methods to advertise while `plugin` is the current one: what its
/// `NextAuthMethods` says, or what it declared when it has no opinion.
pub async fn next_methods(plugin: &Plugin, meta: &ConnMeta) -> Vec<AuthMethod> {
  if plugin.supports(Callback::NextAuthMethods) {
    match plugin.next_auth_methods(meta).await {
      Ok(names) => return parse_methods(&names),
      Err(error) => tracing::warn!(plugin = plugin.name(), %error, "NextAuthMethods failed"),
    }
  }
  declared_methods(plugin)
}

/// The method list sent in USERAUTH_FAILURE. `none` must not be listed
/// (RFC 4252 §5.2); clients try it on their own before anything else.
pub fn method_set(methods: &[AuthMethod]) -> MethodSet {
  let mut set = MethodSet::empty();
  for method in methods {
    if *method != AuthMethod::None {
      set.push(method.kind());
    }
  }
  set
}

/// What to do with one plugin answer.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
  /// Dial this upstream.
  Upstream(Upstream),
  /// Merge `meta` and hand the connection to the next plugin.
  NextPlugin(HashMap<String, String>),
  /// Merge `meta`, fail this attempt and let the downstream try again, with
  /// `methods` if given.
  Retry {
    meta: HashMap<String, String>,
    methods: Vec<AuthMethod>,
  },
  /// The plugin rejected the attempt.
  Rejected(String),
}

impl Verdict {
  /// Classify a plugin's answer. A plugin that cannot be reached is an error
  /// for the whole pipe, not a verdict.
  pub fn from_rpc(answer: std::result::Result<Upstream, RpcError>) -> Result<Verdict> {
    match answer {
      Ok(upstream) => Ok(Verdict::from_upstream(upstream)),
      Err(RpcError::Remote(reason)) => Ok(Verdict::Rejected(reason)),
      Err(error) => Err(Error::from(error)),
    }
  }

  pub fn from_upstream(upstream: Upstream) -> Verdict {
    match upstream.auth {
      UpstreamAuth::NextPlugin { meta } => Verdict::NextPlugin(meta),
      UpstreamAuth::RetryDownstream { meta, methods } => Verdict::Retry {
        meta,
        methods: parse_methods(&methods),
      },
      _ => Verdict::Upstream(upstream),
    }
  }
}

/// How a `NextPlugin` verdict continues on the plugin that follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handoff {
  /// Ask the next plugin about the same credential.
  SameMethod,
  /// The next plugin decides without asking the user anything.
  NoClientAuth,
  /// The downstream has to authenticate again with one of these methods.
  Prompt,
}

pub fn handoff(next: &Plugin, method: AuthMethod) -> Handoff {
  if next.supports(method.callback()) {
    Handoff::SameMethod
  } else if next.supports(Callback::NoClientAuth) {
    Handoff::NoClientAuth
  } else {
    Handoff::Prompt
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn upstream(auth: UpstreamAuth) -> Upstream {
    Upstream {
      host: "10.0.0.5".into(),
      port: 22,
      uri: String::new(),
      user_name: String::new(),
      ignore_host_key: true,
      known_hosts: vec![],
      auth,
    }
  }

  #[test]
  fn method_names_round_trip() {
    for method in AuthMethod::ALL {
      assert_eq!(AuthMethod::from_name(method.name()), Some(method));
    }
    assert_eq!(AuthMethod::from_name("hostbased"), None);
    assert_eq!(
      parse_methods(&["publickey", "gssapi-with-mic", "password"]),
      vec![AuthMethod::PublicKey, AuthMethod::Password]
    );
  }

  #[test]
  fn failure_lists_never_carry_none() {
    let set = method_set(&[AuthMethod::None, AuthMethod::Password, AuthMethod::KeyboardInteractive]);
    assert!(set.contains(&MethodKind::Password));
    assert!(set.contains(&MethodKind::KeyboardInteractive));
    assert!(!set.contains(&MethodKind::None));
    assert!(!set.contains(&MethodKind::PublicKey));
  }

  #[test]
  fn verdicts_are_classified_by_auth_kind() {
    let meta = HashMap::from([("totp".to_string(), "ok".to_string())]);
    assert_eq!(
      Verdict::from_upstream(upstream(UpstreamAuth::NextPlugin { meta: meta.clone() })),
      Verdict::NextPlugin(meta.clone())
    );
    assert_eq!(
      Verdict::from_upstream(upstream(UpstreamAuth::RetryDownstream {
        meta: meta.clone(),
        methods: vec!["keyboard-interactive".into()],
      })),
      Verdict::Retry {
        meta,
        methods: vec![AuthMethod::KeyboardInteractive]
      }
    );
    let terminal = upstream(UpstreamAuth::Password {
      password: "hunter2".into(),
    });
    assert_eq!(
      Verdict::from_upstream(terminal.clone()),
      Verdict::Upstream(terminal)
    );
  }

  #[test]
  fn remote_errors_are_rejections_and_broken_streams_are_errors() {
    assert_eq!(
      Verdict::from_rpc(Err(RpcError::Remote("wrong password".into()))).unwrap(),
      Verdict::Rejected("wrong password".into())
    );
    let error = Verdict::from_rpc(Err(RpcError::Closed)).unwrap_err();
    assert_eq!(error.kind(), crate::error::ErrorKind::PluginUnavailable);
  }
}
