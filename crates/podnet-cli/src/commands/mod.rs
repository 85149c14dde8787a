//! CLI command definitions and dispatch.

pub mod down;
pub mod gc;
pub mod kvm_args;
pub mod ls;
pub mod up;

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use podnet_common::config::PodnetConfig;
use podnet_runtime::engine::NetworkEngine;

/// podnet: pod network provisioning for namespace and KVM pods.
#[derive(Parser, Debug)]
#[command(name = "podnet", version, about, long_about = None)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Command,

    /// Path to a JSON configuration file.
    #[arg(long, global = true, env = "PODNET_CONFIG")]
    pub config: Option<PathBuf>,

    /// Override the data directory.
    #[arg(long, global = true, env = "PODNET_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Override the network definition directory.
    #[arg(long, global = true, env = "PODNET_NET_CONF_DIR")]
    pub net_conf_dir: Option<PathBuf>,

    /// Plugin search directory; repeat to search several.
    #[arg(long = "plugin-dir", global = true)]
    pub plugin_dirs: Vec<PathBuf>,

    /// Deadline for one plugin invocation, in milliseconds.
    #[arg(long, global = true, env = "PODNET_PLUGIN_TIMEOUT_MS")]
    pub plugin_timeout_ms: Option<u64>,

    /// Log output format.
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human-readable lines.
    Text,
    /// One JSON object per line.
    Json,
}

/// Available CLI subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Set up networking for a namespace pod.
    Up(up::UpArgs),
    /// Tear down networking for a pod.
    Down(down::DownArgs),
    /// Reclaim networking of pods whose process has exited.
    Gc(gc::GcArgs),
    /// Print hypervisor and kernel arguments for KVM networks.
    KvmArgs(kvm_args::KvmArgsArgs),
    /// List pods with persisted network state.
    Ls(ls::LsArgs),
}

impl Cli {
    /// Loads the configuration file, if any, and applies flag overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be loaded or the result is
    /// invalid.
    pub fn load_config(&self) -> anyhow::Result<PodnetConfig> {
        let mut config = match &self.config {
            Some(path) => PodnetConfig::load(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => PodnetConfig::default(),
        };
        if let Some(dir) = &self.data_dir {
            config.data_dir.clone_from(dir);
        }
        if let Some(dir) = &self.net_conf_dir {
            config.net_conf_dir.clone_from(dir);
        }
        if !self.plugin_dirs.is_empty() {
            config.plugin_dirs.clone_from(&self.plugin_dirs);
        }
        if let Some(ms) = self.plugin_timeout_ms {
            config.plugin_timeout_ms = ms;
        }
        config.validate()?;
        tracing::debug!(?config, "configuration loaded");
        Ok(config)
    }

    /// Builds the engine from the effective configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration or network definitions
    /// cannot be loaded.
    pub fn engine(&self) -> anyhow::Result<NetworkEngine> {
        let config = self.load_config()?;
        NetworkEngine::from_config(&config).context("initializing network engine")
    }
}

/// Dispatches the parsed CLI command to its handler.
///
/// # Errors
///
/// Returns an error if the command execution fails.
pub fn execute(cli: Cli) -> anyhow::Result<()> {
    match &cli.command {
        Command::Up(args) => up::execute(&cli, args),
        Command::Down(args) => down::execute(&cli, args),
        Command::Gc(args) => gc::execute(&cli, args),
        Command::KvmArgs(args) => kvm_args::execute(args),
        Command::Ls(args) => ls::execute(&cli, args),
    }
}
