// Copyright takubokudori.
// This source code is licensed under the MIT or Apache-2.0 license.
//! VirtualBox backend.
pub mod parse;
pub mod vboxmanage;

pub use vboxmanage::VBoxManage;
