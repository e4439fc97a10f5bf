use super::{Plugin, PluginCommand};
use crate::meta::ConnMeta;
use crate::{Error, Result};
use anyhow::Context;
use futures::future::join_all;
use std::sync::Arc;

/// The ordered plugins every connection walks through. Fixed at startup and
/// shared by all pipes.
#[derive(Debug, Clone, Default)]
pub struct PluginChain {
  plugins: Vec<Arc<Plugin>>,
}

impl PluginChain {
  pub fn new(plugins: Vec<Plugin>) -> Self {
    PluginChain {
      plugins: plugins.into_iter().map(Arc::new).collect(),
    }
  }

  /// Spawn every plugin, in order. Fails if any of them does not come up.
  pub async fn spawn(commands: &[PluginCommand]) -> anyhow::Result<Self> {
    let mut plugins = Vec::with_capacity(commands.len());
    for command in commands {
      let plugin = command
        .spawn()
        .await
        .with_context(|| format!("failed to start plugin {}", command.program.display()))?;
      plugins.push(plugin);
    }
    Ok(PluginChain::new(plugins))
  }

  pub fn len(&self) -> usize {
    self.plugins.len()
  }

  pub fn is_empty(&self) -> bool {
    self.plugins.is_empty()
  }

  pub fn get(&self, index: usize) -> Option<&Arc<Plugin>> {
    self.plugins.get(index)
  }

  pub fn head(&self) -> Option<&Arc<Plugin>> {
    self.plugins.first()
  }

  pub fn iter(&self) -> impl Iterator<Item = &Arc<Plugin>> {
    self.plugins.iter()
  }

  /// Offer a fresh connection to every plugin that cares. The first refusal
  /// wins; a plugin that cannot be reached counts as a refusal too.
  #[tracing::instrument(level = "debug", skip_all, fields(from_addr = %meta.from_addr))]
  pub async fn new_connection(&self, meta: &ConnMeta) -> Result<()> {
    for plugin in &self.plugins {
      if !plugin.supports(super::proto::Callback::NewConnection) {
        continue;
      }
      if let Err(error) = plugin.new_connection(meta).await {
        tracing::info!(plugin = plugin.name(), %error, "connection refused by plugin");
        return Err(Error::PolicyDeny(format!("{}: {error}", plugin.name())));
      }
    }
    Ok(())
  }

  pub async fn pipe_start(&self, meta: &ConnMeta) {
    join_all(self.plugins.iter().map(|plugin| plugin.pipe_start(meta))).await;
  }

  pub async fn pipe_error(&self, meta: &ConnMeta, error: &str) {
    join_all(self.plugins.iter().map(|plugin| plugin.pipe_error(meta, error))).await;
  }

  pub async fn pipe_create_error(&self, from_addr: &str, error: &str) {
    join_all(
      self
        .plugins
        .iter()
        .map(|plugin| plugin.pipe_create_error(from_addr, error)),
    )
    .await;
  }

  /// Close every plugin's stream. Used on shutdown.
  pub fn shutdown(&self) {
    for plugin in &self.plugins {
      plugin.shutdown();
    }
  }
}
