//! `podnet ls`: List pods with persisted network state.

use clap::Args;

use super::Cli;
use crate::output;

/// Arguments for the `ls` command.
#[derive(Args, Debug)]
pub struct LsArgs {
    /// Print the records as JSON.
    #[arg(long)]
    pub json: bool,
}

/// Executes the `ls` command.
///
/// # Errors
///
/// Returns an error if the records directory cannot be read.
pub fn execute(cli: &Cli, args: &LsArgs) -> anyhow::Result<()> {
    let config = cli.load_config()?;
    let records = podnet_runtime::state::RecordStore::open(config.records_dir())?.list()?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }
    if records.is_empty() {
        println!("No pods with network state.");
        return Ok(());
    }
    print!("{}", output::record_table(&records));
    Ok(())
}
