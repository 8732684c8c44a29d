use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::errors::{NavError, NavResult};

/// One phase of the navigation goal. Each stage has its own subgoal text,
/// URL success pattern, and retry budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Search,
    OpenRepo,
    OpenReleases,
    Extract,
}

impl Stage {
    pub const ORDER: [Stage; 4] = [
        Stage::Search,
        Stage::OpenRepo,
        Stage::OpenReleases,
        Stage::Extract,
    ];

    pub fn next(self) -> Option<Stage> {
        match self {
            Stage::Search => Some(Stage::OpenRepo),
            Stage::OpenRepo => Some(Stage::OpenReleases),
            Stage::OpenReleases => Some(Stage::Extract),
            Stage::Extract => None,
        }
    }

    fn index(self) -> usize {
        match self {
            Stage::Search => 0,
            Stage::OpenRepo => 1,
            Stage::OpenReleases => 2,
            Stage::Extract => 3,
        }
    }

    pub fn is_at_or_after(self, other: Stage) -> bool {
        self.index() >= other.index()
    }

    /// Only the search-results phase may fall back to region exploration:
    /// its click target (the result card) is the one the model boxes
    /// coarsely.
    pub fn allows_exploration(self) -> bool {
        matches!(self, Stage::OpenRepo)
    }

    /// What the vision model is asked to accomplish while this stage is
    /// active.
    pub fn subgoal(self, target_repo: &str) -> String {
        match self {
            Stage::Search => {
                format!("Find the search input, click it, and search for {target_repo}.")
            }
            Stage::OpenRepo => format!(
                "You are on GitHub search results. Find the FIRST result card for \
                 \"{target_repo}\" and return a coarse bbox around the entire card \
                 (the rounded rectangle containing avatar, title and description). \
                 Do NOT return a tight link bbox."
            ),
            Stage::OpenReleases => "Find and click the Releases section in the right sidebar. \
                 If Releases is not visible, scroll down until it appears, then click it."
                .to_string(),
            Stage::Extract => "Ensure the latest release card is visible and readable.".to_string(),
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::Search => write!(f, "search"),
            Stage::OpenRepo => write!(f, "open_repo"),
            Stage::OpenReleases => write!(f, "open_releases"),
            Stage::Extract => write!(f, "extract"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    InProgress,
    Succeeded,
    Failed,
}

/// Per-stage progress record, created when the loop enters the stage and
/// terminal once `Succeeded` or `Failed`.
#[derive(Debug, Clone, Serialize)]
pub struct StageResult {
    pub stage: Stage,
    pub status: StageStatus,
    pub attempts: u32,
}

impl StageResult {
    pub fn enter(stage: Stage) -> Self {
        Self {
            stage,
            status: StageStatus::InProgress,
            attempts: 0,
        }
    }
}

/// URL success patterns for the run's target repository, compiled once per
/// run. Detection is URL-heuristic only; no page semantics.
pub struct TargetPatterns {
    target_repo: String,
    repo_path: Regex,
}

impl TargetPatterns {
    pub fn for_repo(target_repo: &str) -> NavResult<Self> {
        let repo_path = Regex::new(&format!(
            r"(?i)/{}(?:[/?#]|$)",
            regex::escape(target_repo)
        ))
        .map_err(|e| NavError::Config(format!("bad repo pattern for `{target_repo}`: {e}")))?;
        Ok(Self {
            target_repo: target_repo.to_string(),
            repo_path,
        })
    }

    pub fn target_repo(&self) -> &str {
        &self.target_repo
    }

    /// True when the repository page (or anything under it) is open.
    pub fn repo_reached(&self, url: &str) -> bool {
        self.repo_path.is_match(url)
    }

    /// Whether `url` proves the given stage's goal has been achieved.
    pub fn stage_reached(&self, stage: Stage, url: &str) -> bool {
        match stage {
            Stage::Search => url.contains("/search"),
            Stage::OpenRepo => self.repo_reached(url),
            Stage::OpenReleases => url.contains("/releases"),
            // Extract has no URL signal; it completes via the model call.
            Stage::Extract => false,
        }
    }

    /// The furthest stage (at or after `current`) whose pattern `url`
    /// satisfies. Lets a single navigation jump multiple stages, e.g. a
    /// search that lands directly on the repository page.
    pub fn furthest_reached(&self, current: Stage, url: &str) -> Option<Stage> {
        Stage::ORDER
            .iter()
            .rev()
            .copied()
            .find(|s| s.is_at_or_after(current) && self.stage_reached(*s, url))
    }
}
