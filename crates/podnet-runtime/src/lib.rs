//! Pod network provisioning for the podnet runtime.
//!
//! Turns a pod's declarative network attachments into host-side
//! networking (namespace backend) or hypervisor and guest-kernel
//! arguments (KVM backend), and reverses it again on teardown.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod engine;
pub mod network;
pub mod state;
