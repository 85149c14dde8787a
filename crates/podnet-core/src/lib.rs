//! # podnet-core
//!
//! Low-level host networking primitives for the podnet runtime.
//!
//! This crate provides safe abstractions over:
//! - **Interfaces**: kernel interface-name limits and deterministic naming.
//! - **Namespaces**: handles to a pod's network namespace.
//! - **Masquerade**: per-attachment NAT chains managed through `iptables`.
//! - **Processes**: liveness probing against the host process table.
//!
//! All host commands and system calls are wrapped with error mapping into
//! [`podnet_common::error::PodnetError`].

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

mod digest;
pub mod interface;
pub mod masquerade;
pub mod namespace;
pub mod process;
