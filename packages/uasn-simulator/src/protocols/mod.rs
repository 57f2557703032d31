//! The localization protocols hosted on the simulation kernel.
//!
//! Each protocol is an independent [`crate::node::Node`] implementation
//! built on the collector substrate. They share the acoustic message
//! grammar but never each other's state.

pub mod lsls;
pub mod lst;
pub mod rls;
pub mod ups;

pub use lsls::LslsNode;
pub use lst::LstNode;
pub use rls::RlsNode;
pub use ups::{UpsAnchor, UpsMaster, UpsSensor};
