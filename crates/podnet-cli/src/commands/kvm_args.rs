//! `podnet kvm-args`: Print hypervisor and kernel arguments for KVM
//! networks.

use std::net::Ipv4Addr;

use anyhow::Context;
use clap::Args;
use podnet_runtime::network::{NetworkDescriptor, kvm_net_args};

/// Arguments for the `kvm-args` command.
#[derive(Args, Debug)]
pub struct KvmArgsArgs {
    /// Network as `if=<tap>,guest=<ip>,mask=<ip>[,host=<ip>][,masq][,name=<n>]`.
    /// Repeat for several; order decides the guest device (`eth<N>`).
    #[arg(long = "net", required = true)]
    pub nets: Vec<String>,

    /// Print the result as JSON.
    #[arg(long)]
    pub json: bool,
}

fn parse_descriptor(ordinal: usize, value: &str) -> anyhow::Result<NetworkDescriptor> {
    let mut if_name = None;
    let mut name = None;
    let mut guest = None;
    let mut mask = None;
    let mut host = None;
    let mut masq = false;
    let addr = |raw: &str| -> anyhow::Result<Ipv4Addr> {
        raw
            .parse()
            .with_context(|| format!("invalid IPv4 address {raw:?}"))
    };

    for field in value.split(',') {
        match field.split_once('=') {
            Some(("if", v)) => if_name = Some(v),
            Some(("name", v)) => name = Some(v),
            Some(("guest", v)) => guest = Some(addr(v)?),
            Some(("mask", v)) => mask = Some(addr(v)?),
            Some(("host", v)) => host = Some(addr(v)?),
            None if field == "masq" => masq = true,
            _ => anyhow::bail!("unknown field {field:?} in {value:?}"),
        }
    }

    let if_name = if_name.with_context(|| format!("missing if= in {value:?}"))?;
    let default_name = format!("net{ordinal}");
    let mut descriptor =
        NetworkDescriptor::new(name.unwrap_or(&default_name), if_name).with_ip_masq(masq);
    if let (Some(guest), Some(mask)) = (guest, mask) {
        descriptor = descriptor.with_guest(guest, mask);
    }
    if let Some(host) = host {
        descriptor = descriptor.with_host_ip(host);
    }
    Ok(descriptor)
}

/// Executes the `kvm-args` command. Touches nothing on the host.
///
/// # Errors
///
/// Returns an error if a network value is malformed or incomplete.
pub fn execute(args: &KvmArgsArgs) -> anyhow::Result<()> {
    let descriptors = args
        .nets
        .iter()
        .enumerate()
        .map(|(i, value)| parse_descriptor(i, value))
        .collect::<anyhow::Result<Vec<_>>>()?;
    let built = kvm_net_args(&descriptors)?;

    if args.json {
        let doc = serde_json::json!({
            "hypervisor": built.hypervisor,
            "kernel": built.kernel,
        });
        println!("{}", serde_json::to_string_pretty(&doc)?);
    } else {
        println!("{}", built.hypervisor.join(" "));
        println!("{}", built.kernel.join(" "));
    }
    Ok(())
}
