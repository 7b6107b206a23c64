//! Build environment the requester runs in.

use dlc_core::ticket_name::ticket_name_prefix;
use uuid::Uuid;

/// CI variables that shape ticket names and the response queue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildEnv {
    /// `PR_NUMBER`, e.g. `pr/1234`.
    pub pr_number: Option<String>,
    /// `CODEBUILD_BUILD_ID`, e.g. `project:uuid`.
    pub build_id: Option<String>,
    /// `CODEBUILD_RESOLVED_SOURCE_VERSION`.
    pub commit: Option<String>,
}

impl BuildEnv {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        Self {
            pr_number: non_empty("PR_NUMBER"),
            build_id: non_empty("CODEBUILD_BUILD_ID"),
            commit: non_empty("CODEBUILD_RESOLVED_SOURCE_VERSION"),
        }
    }

    pub fn ticket_prefix(&self) -> String {
        ticket_name_prefix(self.pr_number.as_deref())
    }

    /// Identity of this requester: the build id's suffix, or a random id
    /// when not running inside a build.
    pub fn requester_id(&self) -> String {
        let from_build = self
            .build_id
            .as_deref()
            .and_then(|id| id.rsplit(':').next())
            .map(|suffix| {
                suffix
                    .chars()
                    .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
                    .collect::<String>()
            })
            .filter(|s| !s.is_empty());
        from_build.unwrap_or_else(|| Uuid::new_v4().simple().to_string()[..16].to_string())
    }
}
