//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module          | Commands handled                                   |
//! |-----------------|-----------------------------------------------------|
//! | `project`       | `Init`                                             |
//! | `run`           | `Run`, `Serve`                                     |
//! | `status`        | `Status`, `Stuck`                                  |
//! | `control`       | `Pause`, `Resume`, `Stop`, `Reset`                 |
//! | `report`        | `Report`, `Revive`, `Worker`                       |
//! | `config`        | `Config`                                           |

pub mod config;
pub mod control;
pub mod project;
pub mod report;
pub mod run;
pub mod status;

pub use config::cmd_config;
pub use control::{cmd_pause, cmd_reset, cmd_resume, cmd_stop};
pub use project::cmd_init;
pub use report::{cmd_report, cmd_revive, cmd_worker};
pub use run::{cmd_run, cmd_serve};
pub use status::{cmd_status, cmd_stuck};
