// Copyright takubokudori.
// This source code is licensed under the MIT or Apache-2.0 license.
//! Hyper-V backend.
pub mod hypervcmd;

pub use hypervcmd::HyperVCmd;
