//! CLI command implementations.
//!
//! | Module   | Commands handled |
//! |----------|------------------|
//! | `save`   | `Save`           |
//! | `watch`  | `Watch`          |
//! | `config` | `Config`         |

pub mod config;
pub mod save;
pub mod watch;

pub use config::cmd_config;
pub use save::cmd_save;
pub use watch::{WatchArgs, cmd_watch};
