//! Network Address Module
//!
//! Address parsing/validation and CIDR prefix containment.

pub mod address;
pub mod cidr;

pub use address::*;
pub use cidr::*;
