use super::Plugin;
use anyhow::Context;
use std::path::PathBuf;
use tokio::io::AsyncBufReadExt;
use tokio_util::task::AbortOnDropHandle;

/// An executable and its own flags, as given on the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginCommand {
  pub program: PathBuf,
  pub args: Vec<String>,
}

impl PluginCommand {
  /// A short label for logs: the file name of the executable.
  pub fn name(&self) -> String {
    self
      .program
      .file_name()
      .map(|name| name.to_string_lossy().into_owned())
      .unwrap_or_else(|| self.program.display().to_string())
  }

  /// Spawn the plugin and complete the callback handshake.
  ///
  /// The child is killed when the returned [`Plugin`] is dropped. Its stderr
  /// is forwarded line by line into our own log.
  #[tracing::instrument(level = "debug", skip(self), fields(program = %self.program.display()))]
  pub async fn spawn(&self) -> anyhow::Result<Plugin> {
    let name = self.name();
    // Plugins are trusted, so they inherit our environment.
    let mut child = tokio::process::Command::new(&self.program)
      .args(&self.args)
      // kill_on_drop(true) keeps plugins from outliving the proxy.
      .kill_on_drop(true)
      .stdin(std::process::Stdio::piped())
      .stdout(std::process::Stdio::piped())
      .stderr(std::process::Stdio::piped())
      .spawn()
      .with_context(|| format!("failed to spawn plugin {}", self.program.display()))?;
    tracing::info!(pid = child.id(), plugin = %name, "plugin spawned");

    let stdin = child.stdin.take().context("failed to get stdin for plugin")?;
    let stdout = child.stdout.take().context("failed to get stdout for plugin")?;
    let stderr = child.stderr.take().context("failed to get stderr for plugin")?;

    let stderr_task = {
      let name = name.clone();
      AbortOnDropHandle::new(tokio::spawn(async move {
        let mut lines = tokio::io::BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
          tracing::info!(plugin = %name, "{line}");
        }
      }))
    };

    let mut plugin = Plugin::connect(&name, stdout, stdin)
      .await
      .with_context(|| format!("plugin {name} did not answer ListCallbacks"))?;
    plugin.attach_process(child, Some(stderr_task));
    Ok(plugin)
  }
}

/// Split the positional arguments into plugin commands on literal `--`
/// tokens. Empty groups (eg. a leading `--`) are skipped.
pub fn split_plugin_args<S: AsRef<str>>(args: &[S]) -> Vec<PluginCommand> {
  args
    .split(|arg| arg.as_ref() == "--")
    .filter(|group| !group.is_empty())
    .map(|group| PluginCommand {
      program: PathBuf::from(group[0].as_ref()),
      args: group[1..].iter().map(|arg| arg.as_ref().to_string()).collect(),
    })
    .collect()
}
