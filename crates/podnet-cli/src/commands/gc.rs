//! `podnet gc`: Reclaim networking of pods whose process has exited.

use clap::Args;

use super::Cli;

/// Arguments for the `gc` command.
#[derive(Args, Debug)]
pub struct GcArgs {}

/// Executes the `gc` command.
///
/// # Errors
///
/// Returns an error if the setup records cannot be scanned, or if any
/// pod could not be reclaimed.
pub fn execute(cli: &Cli, _args: &GcArgs) -> anyhow::Result<()> {
    let engine = cli.engine()?;
    let report = engine.recover()?;
    for torn in &report.reclaimed {
        println!("reclaimed {} ({} lease(s))", torn.pod_id, torn.released.len());
        for warning in &torn.warnings {
            eprintln!("  warning: {warning}");
        }
    }
    println!(
        "{} lease(s) restored, {} pod(s) reclaimed",
        report.restored,
        report.reclaimed.len()
    );
    if !report.failed.is_empty() {
        for (pod, reason) in &report.failed {
            eprintln!("  failed: {pod}: {reason}");
        }
        anyhow::bail!("{} pod(s) could not be reclaimed", report.failed.len());
    }
    Ok(())
}
