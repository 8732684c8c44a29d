use async_trait::async_trait;
use serde_json::Value;

use crate::agent_engine::stage::Stage;
use crate::errors::NavResult;
use crate::vision::types::ReleaseRecord;

/// The vision oracle the navigation loop consults. Implementations are
/// single-shot request/response; the loop owns all retry and validation
/// policy around them.
#[async_trait]
pub trait VisionProvider: Send + Sync {
    /// Asks for the next UI action given the screenshot and the stage
    /// subgoal. Returns the model's raw JSON payload; schema validation is
    /// deliberately the caller's job, since model output is unreliable.
    async fn decide(&self, screenshot: &[u8], subgoal: &str, stage: Stage) -> NavResult<Value>;

    /// Reads the latest-release fields off the final screenshot.
    async fn extract(&self, screenshot: &[u8], repo: &str) -> NavResult<ReleaseRecord>;
}
