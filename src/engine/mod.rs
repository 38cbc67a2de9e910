//! Engine modules: pure translation from provisioned storage to generated files.
//!
//! Nothing here touches the host except [`artifacts::ArtifactWriter`]. Layout
//! and rendering are deterministic so `plan` output matches what `deploy` writes.

pub mod artifacts;
pub mod layout;
pub mod unit;
