// Copyright takubokudori.
// This source code is licensed under the MIT or Apache-2.0 license.
//!
//! # vboxmcp
//! An MCP server exposing hypervisor management as typed tools.
//!
//! # Supported backends
//!
//! - VirtualBox
//!     - [VBoxManage](https://www.virtualbox.org/manual/ch08.html)
//! - Hyper-V
//!     - [Hyper-V cmdlets](https://docs.microsoft.com/en-us/powershell/module/hyper-v/?view=win10-ps)
//!
//! Clients speak newline-delimited JSON-RPC 2.0 over stdio and invoke
//! tools (`vm_management`, `snapshot_management`, ...) whose actions are
//! translated into hypervisor CLI invocations.
//!
//! # License
//! This software is released under the MIT or Apache-2.0 License, see LICENSE-MIT or LICENSE-APACHE.
#[macro_use]
pub mod types;

pub mod config;
pub mod exec;
pub mod hyperv;
pub mod manager;
pub mod ops;
pub mod registry;
pub mod server;
pub mod tools;
pub mod virtualbox;
