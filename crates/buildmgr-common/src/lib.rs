//! Shared domain types for buildmgr.
//!
//! Pure data: no database, process or network code lives here. The main crate
//! persists these types and drives their transitions.

pub mod record;
pub mod status;

pub use record::{ActiveProcessRecord, Artifact, BuildRecord, LaunchDescriptor, process_name};
pub use status::{BuildPatch, BuildState, BuildStatus, StateError};
