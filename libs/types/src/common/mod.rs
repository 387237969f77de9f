//! Common types shared across the protocol and runtime layers

pub mod errors;
pub mod identifiers;
