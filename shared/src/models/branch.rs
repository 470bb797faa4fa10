//! Branch and branch user models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Restaurant branch name (backend enum `branch_name`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BranchName {
    Cardiff,
    Wembley,
}

impl BranchName {
    pub const ALL: [BranchName; 2] = [BranchName::Cardiff, BranchName::Wembley];

    pub fn as_str(&self) -> &'static str {
        match self {
            BranchName::Cardiff => "Cardiff",
            BranchName::Wembley => "Wembley",
        }
    }
}

impl fmt::Display for BranchName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown branch name
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown branch: {0}")]
pub struct UnknownBranch(pub String);

impl FromStr for BranchName {
    type Err = UnknownBranch;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BranchName::ALL
            .into_iter()
            .find(|b| b.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| UnknownBranch(s.to_string()))
    }
}

/// Branch entity (reference data, read-only from the client)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Branch {
    pub id: String,
    pub name: BranchName,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

/// Staff profile bound to an auth identity (`id` = auth user id)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchUser {
    pub id: String,
    pub branch_id: String,
    #[serde(default)]
    pub full_name: Option<String>,
    pub role: String,
    pub is_active: bool,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

impl BranchUser {
    /// Name shown in the settings screen, falling back to the role
    pub fn display_name(&self) -> &str {
        self.full_name.as_deref().unwrap_or(&self.role)
    }
}
