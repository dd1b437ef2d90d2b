//! CLI command implementations.
//!
//! | Module    | Commands handled                 |
//! |-----------|----------------------------------|
//! | `run`     | `Run`                            |
//! | `status`  | `Status`                         |
//! | `audit`   | `Audit`                          |
//! | `feature` | `Feature attempt`, `Feature pass`|
//! | `gates`   | `Gates`                          |
//! | `config`  | `Config`                         |

pub mod audit;
pub mod config;
pub mod feature;
pub mod gates;
pub mod run;
pub mod status;

pub use audit::cmd_audit;
pub use config::cmd_config;
pub use feature::cmd_feature;
pub use gates::cmd_gates;
pub use run::cmd_run;
pub use status::cmd_status;

use crucible::iteration::StopReason;
use std::process::ExitCode;

/// How a command ended, mapped onto the process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrucibleExit {
    Success,
    /// Quality gates or requirements unmet
    Unmet,
    /// Lock held, agent missing, build crashed or timed out
    Operational,
}

impl CrucibleExit {
    pub fn code(self) -> u8 {
        match self {
            CrucibleExit::Success => 0,
            CrucibleExit::Unmet => 1,
            CrucibleExit::Operational => 2,
        }
    }
}

impl From<StopReason> for CrucibleExit {
    fn from(reason: StopReason) -> Self {
        match reason.exit_code() {
            0 => CrucibleExit::Success,
            1 => CrucibleExit::Unmet,
            _ => CrucibleExit::Operational,
        }
    }
}

impl From<CrucibleExit> for ExitCode {
    fn from(exit: CrucibleExit) -> Self {
        ExitCode::from(exit.code())
    }
}
