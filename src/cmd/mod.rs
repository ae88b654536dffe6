//! CLI command implementations.
//!
//! | Module   | Commands handled     |
//! |----------|----------------------|
//! | `serve`  | `Serve`              |
//! | `store`  | `InitDb`, `Prune`    |
//! | `status` | `Status`             |
//! | `config` | `Config`             |

pub mod config;
pub mod serve;
pub mod status;
pub mod store;

pub use config::cmd_config;
pub use serve::cmd_serve;
pub use status::cmd_status;
pub use store::{cmd_init_db, cmd_prune};
