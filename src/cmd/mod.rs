//! CLI command implementations.
//!
//! | Module    | Commands handled                                   |
//! |-----------|----------------------------------------------------|
//! | `serve`   | `Serve`                                            |
//! | `run`     | `Run`                                              |
//! | `inspect` | `Status`, `Healing`, `Logs`, `InitDb`, `Scenarios` |
//! | `config`  | `Config`                                           |

pub mod config;
pub mod inspect;
pub mod run;
pub mod serve;

pub use config::cmd_config;
pub use inspect::{cmd_healing, cmd_init_db, cmd_logs, cmd_scenarios, cmd_status};
pub use run::cmd_run;
pub use serve::cmd_serve;
