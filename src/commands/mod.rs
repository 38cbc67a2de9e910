//! Typed host command definitions.
//!
//! Each submodule groups commands by the tool family they drive.

pub mod disk;
pub mod service;
