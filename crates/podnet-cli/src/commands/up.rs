//! `podnet up`: Set up networking for a namespace pod.

use std::path::PathBuf;

use anyhow::Context;
use clap::Args;
use podnet_common::types::{Pod, PodId};
use podnet_core::namespace::NetnsHandle;
use podnet_runtime::engine::PodNetworkBackend;
use podnet_runtime::network::CancelToken;

use super::Cli;
use crate::output;

/// Arguments for the `up` command.
#[derive(Args, Debug)]
pub struct UpArgs {
    /// Pod identifier. A random one is generated and printed when omitted.
    #[arg(long)]
    pub pod: Option<String>,

    /// PID of the pod's init process; owns the leases.
    #[arg(long)]
    pub pid: u32,

    /// Network namespace path. Defaults to the namespace of `--pid`.
    #[arg(long)]
    pub netns: Option<PathBuf>,

    /// Network to join, as `<name>[:<host-ifname>]`. Repeat for several;
    /// the Nth network becomes `eth<N>` in the pod.
    #[arg(long = "net", default_value = "default")]
    pub nets: Vec<String>,

    /// Print the result as JSON.
    #[arg(long)]
    pub json: bool,
}

/// Splits `<name>[:<ifname>]`.
fn parse_net(value: &str) -> anyhow::Result<(&str, Option<&str>)> {
    let (name, if_name) = match value.split_once(':') {
        Some((name, if_name)) => (name, Some(if_name)),
        None => (value, None),
    };
    if name.is_empty() || if_name.is_some_and(str::is_empty) {
        anyhow::bail!("invalid network {value:?}, expected <name>[:<ifname>]");
    }
    Ok((name, if_name))
}

fn pod_id(requested: Option<&str>) -> PodId {
    requested.map_or_else(PodId::generate, PodId::new)
}

/// Executes the `up` command.
///
/// Ctrl-C during setup cancels it and rolls back whatever was done.
///
/// # Errors
///
/// Returns an error if any network cannot be set up.
pub fn execute(cli: &Cli, args: &UpArgs) -> anyhow::Result<()> {
    let engine = cli.engine()?;
    let pod = Pod::new(pod_id(args.pod.as_deref()), args.pid);
    if args.pod.is_none() {
        eprintln!("pod: {}", pod.id);
    }
    let netns = match &args.netns {
        Some(path) => NetnsHandle::open(path)?,
        None => NetnsHandle::for_pid(args.pid),
    };

    let requests = args
        .nets
        .iter()
        .map(|value| {
            let (name, if_name) = parse_net(value)?;
            engine
                .attachment_request(&pod.id, name, if_name)
                .with_context(|| format!("network {name:?}"))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    let cancel = CancelToken::new();
    let on_interrupt = cancel.clone();
    ctrlc::set_handler(move || on_interrupt.cancel())
        .map_err(|e| anyhow::anyhow!("failed to set Ctrl+C handler: {e}"))?;

    let provisioned = engine
        .provision(&pod, PodNetworkBackend::Namespace { netns, requests }, &cancel)
        .map_err(|failure| {
            for err in &failure.rollback_errors {
                eprintln!("  rollback: {err}");
            }
            failure
        })?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(provisioned.descriptors())?);
    } else {
        print!("{}", output::descriptor_table(provisioned.descriptors()));
    }
    Ok(())
}
