// Copyright takubokudori.
// This source code is licensed under the MIT or Apache-2.0 license.
//! The tool surface: five multiplexed tools, each routing on `action`.
//!
//! The multiplexed shape keeps the advertised tool count small for
//! clients with tool limits; each action keeps its own schema and the
//! action set of a tool is closed.
use crate::registry::ToolRegistry;

mod network;
mod snapshot;
mod storage;
mod system;
mod vm;

pub fn build_registry(degraded: bool) -> ToolRegistry {
    ToolRegistry::new(
        vec![
            vm::descriptor(),
            snapshot::descriptor(),
            storage::descriptor(),
            network::descriptor(),
            system::descriptor(),
        ],
        degraded,
    )
}
