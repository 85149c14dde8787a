//! In-process fakes shared by unit tests.

use std::net::Ipv4Addr;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU8, Ordering};

use ipnet::Ipv4Net;
use podnet_core::masquerade::{MasqRule, Masquerader};

use super::error::{NetworkError, Result};
use super::plugin::{PluginCommand, PluginInvoker, PluginRequest};
use super::result::{Dns, PluginResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub command: PluginCommand,
    pub network: String,
    pub container_if: String,
}

impl Call {
    pub fn add(network: &str, container_if: &str) -> Self {
        Self {
            command: PluginCommand::Add,
            network: network.into(),
            container_if: container_if.into(),
        }
    }

    pub fn del(network: &str, container_if: &str) -> Self {
        Self {
            command: PluginCommand::Del,
            ..Self::add(network, container_if)
        }
    }
}

/// Hands out `10.88.<n>.2/24` per ADD, or the same address every time.
#[derive(Default)]
pub struct FakeInvoker {
    calls: Mutex<Vec<Call>>,
    next_subnet: AtomicU8,
    fixed_ip: bool,
    fail_del: bool,
    fail_add_on: Option<String>,
}

impl FakeInvoker {
    pub fn with_fixed_ip() -> Self {
        Self {
            fixed_ip: true,
            ..Self::default()
        }
    }

    pub fn failing_del() -> Self {
        Self {
            fail_del: true,
            ..Self::default()
        }
    }

    /// Makes ADD fail for `network`.
    pub fn fail_add_on(mut self, network: &str) -> Self {
        self.fail_add_on = Some(network.to_string());
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn log(&self, command: PluginCommand, request: &PluginRequest<'_>) {
        self.calls.lock().unwrap().push(Call {
            command,
            network: request.network.name().to_string(),
            container_if: request.container_if.to_string(),
        });
    }
}

impl PluginInvoker for FakeInvoker {
    fn add(&self, request: &PluginRequest<'_>) -> Result<PluginResult> {
        self.log(PluginCommand::Add, request);
        if self.fail_add_on.as_deref() == Some(request.network.name()) {
            return Err(NetworkError::PluginExecution {
                plugin: request.network.plugin_type().to_string(),
                network: request.network.name().to_string(),
                exit_code: Some(1),
                plugin_code: None,
                message: "link already exists".into(),
            });
        }
        let subnet = if self.fixed_ip {
            1
        } else {
            self.next_subnet.fetch_add(1, Ordering::SeqCst) + 1
        };
        Ok(PluginResult {
            ip: Ipv4Net::new(Ipv4Addr::new(10, 88, subnet, 2), 24).unwrap(),
            gateway: Some(Ipv4Addr::new(10, 88, subnet, 1)),
            routes: Vec::new(),
            dns: Dns::default(),
        })
    }

    fn del(&self, request: &PluginRequest<'_>) -> Result<()> {
        self.log(PluginCommand::Del, request);
        if self.fail_del {
            return Err(NetworkError::PluginExecution {
                plugin: request.network.plugin_type().to_string(),
                network: request.network.name().to_string(),
                exit_code: Some(1),
                plugin_code: None,
                message: "device busy".into(),
            });
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeMasquerader {
    rules: Mutex<Vec<MasqRule>>,
}

impl FakeMasquerader {
    pub fn installed(&self) -> Vec<MasqRule> {
        self.rules.lock().unwrap().clone()
    }
}

impl Masquerader for FakeMasquerader {
    fn install(&self, rule: &MasqRule) -> podnet_common::error::Result<()> {
        self.rules.lock().unwrap().push(rule.clone());
        Ok(())
    }

    fn remove(&self, rule: &MasqRule) -> podnet_common::error::Result<()> {
        self.rules.lock().unwrap().retain(|r| r.chain != rule.chain);
        Ok(())
    }
}
