//! CLI command implementations.
//!
//! | Module   | Commands handled  |
//! |----------|-------------------|
//! | `serve`  | `Serve`           |
//! | `builds` | `Builds`, `Show`  |
//! | `init`   | `Init`            |

pub mod builds;
pub mod init;
pub mod serve;

pub use builds::{cmd_builds, cmd_show};
pub use init::cmd_init;
pub use serve::cmd_serve;
