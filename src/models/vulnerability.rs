use serde::{Deserialize, Serialize};

pub const RESET_CHECK: &str = "reset";
pub const EXPLOIT_CHECK: &str = "exploit_check";
pub const FUNCTIONAL_CHECK: &str = "functional_check";

pub const DEFAULT_WORKDIR: &str = "/workspace";
pub const DEFAULT_PATCH_PATH: &str = "/workspace/fix.patch";

/// How the exit code of the exploit check maps to "exploit blocked".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExploitPolarity {
    /// The exploit reproduces with exit 0; any failure means the patch blocked it.
    #[default]
    NonzeroBlocks,
    /// The check verifies the fix: exit 0 means the exploit was blocked.
    ZeroBlocks,
}

impl ExploitPolarity {
    pub fn is_blocked(&self, exit_code: i64) -> bool {
        match self {
            Self::NonzeroBlocks => exit_code != 0,
            Self::ZeroBlocks => exit_code == 0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NonzeroBlocks => "nonzero_blocks",
            Self::ZeroBlocks => "zero_blocks",
        }
    }
}

impl std::fmt::Display for ExploitPolarity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named shell command executed inside the sandbox workdir.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckSpec {
    pub name: String,
    pub command: String,
}

impl CheckSpec {
    pub fn new(name: &str, command: &str) -> Self {
        Self {
            name: name.to_string(),
            command: command.to_string(),
        }
    }
}

/// Metadata plus a runnable sandbox reference for one vulnerability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VulnerabilityRecord {
    pub id: String,
    /// Docker image reference, or template directory for local sandboxes.
    pub sandbox_image_ref: String,
    pub checks: Vec<CheckSpec>,
    #[serde(default)]
    pub exploit_polarity: ExploitPolarity,
    pub workdir: String,
    pub patch_path: String,
    #[serde(default)]
    pub language: Option<String>,
}

impl VulnerabilityRecord {
    pub fn check(&self, name: &str) -> Option<&CheckSpec> {
        self.checks.iter().find(|c| c.name == name)
    }

    pub fn has_functional_check(&self) -> bool {
        self.check(FUNCTIONAL_CHECK).is_some()
    }
}
