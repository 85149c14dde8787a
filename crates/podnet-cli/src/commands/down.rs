//! `podnet down`: Tear down networking for a pod.

use clap::Args;
use podnet_common::types::PodId;

use super::Cli;

/// Arguments for the `down` command.
#[derive(Args, Debug)]
pub struct DownArgs {
    /// Pod identifier.
    #[arg(long)]
    pub pod: String,
}

/// Executes the `down` command.
///
/// Tearing down a pod that has no networking is not an error.
///
/// # Errors
///
/// Returns an error if the pod's setup record cannot be read or removed.
pub fn execute(cli: &Cli, args: &DownArgs) -> anyhow::Result<()> {
    let engine = cli.engine()?;
    let report = engine.teardown(&PodId::new(args.pod.as_str()))?;
    println!(
        "{}: {} ({} step(s) undone, {} lease(s) released)",
        report.pod_id,
        report.state,
        report.replayed,
        report.released.len()
    );
    for warning in &report.warnings {
        eprintln!("  warning: {warning}");
    }
    Ok(())
}
