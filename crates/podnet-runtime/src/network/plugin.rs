//! Network plugin invocation.
//!
//! A plugin is an external executable named after the network's `type`.
//! It receives its parameters through `CNI_*` environment variables and
//! the network definition on standard input, and reports its result on
//! standard output (see [`super::result`]).

use std::ffi::OsString;
use std::io::{Read, Write};
#[cfg(unix)]
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use podnet_common::config::PodnetConfig;
use podnet_common::error::PodnetError;
use podnet_common::types::PodId;
use podnet_core::namespace::NetnsHandle;
use podnet_core::process::kill_process_group;

use super::error::{NetworkError, Result};
use super::netconf::NetworkConf;
use super::result::{PluginErrorPayload, PluginResult};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Plugin verb.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginCommand {
    /// Configure the attachment.
    Add,
    /// Remove the attachment.
    Del,
}

impl PluginCommand {
    /// Value of `CNI_COMMAND`.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Add => "ADD",
            Self::Del => "DEL",
        }
    }
}

/// Parameters of one plugin invocation.
#[derive(Debug, Clone, Copy)]
pub struct PluginRequest<'a> {
    /// Pod being configured.
    pub pod_id: &'a PodId,
    /// Network definition.
    pub network: &'a NetworkConf,
    /// Pod network namespace.
    pub netns: &'a NetnsHandle,
    /// Interface name inside the pod (`eth<i>`).
    pub container_if: &'a str,
    /// Host-side interface name.
    pub host_if: &'a str,
}

/// Runs plugin ADD and DEL operations.
///
/// Implemented by [`ExecPluginInvoker`] for real plugins and by
/// in-process fakes in tests.
pub trait PluginInvoker: Send + Sync {
    /// Configures the attachment and returns what the plugin assigned.
    ///
    /// # Errors
    ///
    /// Returns `PluginExecution` if the plugin fails, `PluginResultParse`
    /// if its output is malformed, or `Timeout` if it overruns.
    fn add(&self, request: &PluginRequest<'_>) -> Result<PluginResult>;

    /// Removes the attachment. Succeeds if it is already gone.
    ///
    /// # Errors
    ///
    /// Returns `PluginExecution` or `Timeout` for failures other than
    /// the attachment not existing.
    fn del(&self, request: &PluginRequest<'_>) -> Result<()>;
}

/// [`PluginInvoker`] that executes plugin binaries as subprocesses.
#[derive(Debug, Clone)]
pub struct ExecPluginInvoker {
    plugin_dirs: Vec<PathBuf>,
    timeout: Duration,
}

impl ExecPluginInvoker {
    /// Searches `plugin_dirs` for binaries and kills any invocation that
    /// runs longer than `timeout`.
    #[must_use]
    pub const fn new(plugin_dirs: Vec<PathBuf>, timeout: Duration) -> Self {
        Self {
            plugin_dirs,
            timeout,
        }
    }

    /// Builds an invoker from the runtime configuration.
    #[must_use]
    pub fn from_config(config: &PodnetConfig) -> Self {
        Self::new(config.plugin_dirs.clone(), config.plugin_timeout())
    }

    fn search_path(&self) -> Result<OsString> {
        std::env::join_paths(&self.plugin_dirs).map_err(|e| {
            NetworkError::Host(PodnetError::Config {
                message: format!("invalid plugin directory list: {e}"),
            })
        })
    }

    fn locate(&self, request: &PluginRequest<'_>) -> Result<PathBuf> {
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"));
        which::which_in(
            request.network.plugin_type(),
            Some(self.search_path()?),
            cwd,
        )
        .map_err(|_| {
            failure(
                request,
                None,
                None,
                format!("plugin binary missing from {:?}", self.plugin_dirs),
            )
        })
    }

    fn environment(
        &self,
        command: PluginCommand,
        request: &PluginRequest<'_>,
    ) -> Result<Vec<(&'static str, OsString)>> {
        // A namespace that is already gone is reported as empty so DEL can
        // still clean up host-side state.
        let netns = if command == PluginCommand::Del && !request.netns.exists() {
            OsString::new()
        } else {
            request.netns.path().as_os_str().to_os_string()
        };
        Ok(vec![
            ("CNI_COMMAND", command.as_str().into()),
            ("CNI_CONTAINERID", request.pod_id.as_str().into()),
            ("CNI_NETNS", netns),
            ("CNI_IFNAME", request.container_if.into()),
            (
                "CNI_ARGS",
                format!("IgnoreUnknown=1;PODNET_HOST_IFNAME={}", request.host_if).into(),
            ),
            ("CNI_PATH", self.search_path()?),
        ])
    }

    /// Runs the plugin and returns its standard output on success.
    fn execute(&self, command: PluginCommand, request: &PluginRequest<'_>) -> Result<Vec<u8>> {
        let plugin = request.network.plugin_type();
        let network = request.network.name();
        let binary = self.locate(request)?;
        let payload =
            serde_json::to_vec(request.network.plugin_config()).map_err(PodnetError::from)?;

        tracing::debug!(
            pod = %request.pod_id,
            network,
            plugin,
            command = command.as_str(),
            ifname = request.container_if,
            "invoking plugin"
        );
        let mut cmd = Command::new(&binary);
        let _ = cmd
            .envs(self.environment(command, request)?)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        // Own group so a timeout also reaches helpers such as IPAM plugins.
        #[cfg(unix)]
        let _ = cmd.process_group(0);
        let mut child = cmd
            .spawn()
            .map_err(|e| {
                failure(
                    request,
                    None,
                    None,
                    format!("failed to spawn {}: {e}", binary.display()),
                )
            })?;

        let stdin = child.stdin.take();
        let writer = std::thread::spawn(move || {
            if let Some(mut stdin) = stdin {
                // The plugin may exit without reading its input.
                let _ = stdin.write_all(&payload);
            }
        });
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let status = wait_with_deadline(&mut child, self.timeout);
        let _ = writer.join();
        let stdout = stdout.join().unwrap_or_default();
        let stderr = stderr.join().unwrap_or_default();
        let status = status
            .map_err(|e| failure(request, None, None, format!("failed to wait for plugin: {e}")))?;
        let Some(status) = status else {
            tracing::warn!(
                pod = %request.pod_id,
                network,
                plugin,
                timeout = ?self.timeout,
                "plugin timed out and was killed"
            );
            return Err(NetworkError::Timeout {
                plugin: plugin.to_string(),
                network: network.to_string(),
                timeout: self.timeout,
            });
        };

        if status.success() {
            return Ok(stdout);
        }
        let error_payload = PluginErrorPayload::parse(&stdout);
        let message = error_payload.as_ref().map_or_else(
            || {
                let stderr = String::from_utf8_lossy(&stderr).trim().to_string();
                if stderr.is_empty() {
                    format!("exited with {status}")
                } else {
                    stderr
                }
            },
            ToString::to_string,
        );
        Err(failure(
            request,
            status.code(),
            error_payload.map(|p| p.code),
            message,
        ))
    }
}

impl PluginInvoker for ExecPluginInvoker {
    fn add(&self, request: &PluginRequest<'_>) -> Result<PluginResult> {
        let stdout = self.execute(PluginCommand::Add, request)?;
        let result =
            PluginResult::parse(&stdout).map_err(|message| NetworkError::PluginResultParse {
                plugin: request.network.plugin_type().to_string(),
                network: request.network.name().to_string(),
                message,
            })?;
        tracing::info!(
            pod = %request.pod_id,
            network = request.network.name(),
            ip = %result.ip,
            "plugin ADD succeeded"
        );
        Ok(result)
    }

    fn del(&self, request: &PluginRequest<'_>) -> Result<()> {
        match self.execute(PluginCommand::Del, request) {
            Ok(_) => {
                tracing::info!(pod = %request.pod_id, network = request.network.name(), "plugin DEL succeeded");
                Ok(())
            }
            Err(err) if is_not_found(&err) => {
                tracing::debug!(pod = %request.pod_id, network = request.network.name(), error = %err, "attachment already gone");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}

fn failure(
    request: &PluginRequest<'_>,
    exit_code: Option<i32>,
    plugin_code: Option<u32>,
    message: String,
) -> NetworkError {
    NetworkError::PluginExecution {
        plugin: request.network.plugin_type().to_string(),
        network: request.network.name().to_string(),
        exit_code,
        plugin_code,
        message,
    }
}

/// Whether a plugin that ran to completion reported the attachment as
/// nonexistent.
fn is_not_found(err: &NetworkError) -> bool {
    let NetworkError::PluginExecution {
        exit_code: Some(_),
        plugin_code,
        message,
        ..
    } = err
    else {
        return false;
    };
    if *plugin_code == Some(PluginErrorPayload::UNKNOWN_CONTAINER) {
        return true;
    }
    let message = message.to_ascii_lowercase();
    message.contains("not found") || message.contains("no such")
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> JoinHandle<Vec<u8>> {
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf);
        }
        buf
    })
}

/// Waits for `child`, killing its whole process group and reaping it once
/// `timeout` elapses.
///
/// Returns `Ok(None)` on timeout. The group is also killed if waiting
/// fails, so the output pipes always reach end of file.
fn wait_with_deadline(child: &mut Child, timeout: Duration) -> std::io::Result<Option<ExitStatus>> {
    let deadline = Instant::now() + timeout;
    loop {
        let polled = child.try_wait();
        if let Ok(Some(status)) = polled {
            return Ok(Some(status));
        }
        if polled.is_err() || Instant::now() >= deadline {
            if let Err(e) = kill_process_group(child.id()) {
                tracing::warn!(pid = child.id(), error = %e, "failed to kill plugin process group");
            }
            let _ = child.kill();
            let _ = child.wait();
            return polled.map(|_| None);
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}
