use serde::{Deserialize, Serialize};

/// Outcome of a load job or of a whole scheduler run.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitCode {
    Success,              // Work was done and committed
    OperationNotRequired, // Nothing to do (or nothing more to do)
    Abort,                // Hard stop requested externally
    Error,                // Structural failure; cause surfaced separately
}

impl ExitCode {
    pub fn full_name(&self) -> &'static str {
        match self {
            ExitCode::Success => "Success",
            ExitCode::OperationNotRequired => "OperationNotRequired",
            ExitCode::Abort => "Abort",
            ExitCode::Error => "Error",
        }
    }

    /// Process exit status used by the CLI
    pub fn process_status(&self) -> i32 {
        match self {
            ExitCode::Success | ExitCode::OperationNotRequired => 0,
            ExitCode::Error => 1,
            ExitCode::Abort => 2,
        }
    }
}

impl std::fmt::Display for ExitCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.full_name())
    }
}
