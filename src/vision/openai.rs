use async_trait::async_trait;
use base64::Engine as _;
use serde_json::Value;

use crate::agent_engine::stage::Stage;
use crate::errors::{NavError, NavResult};
use crate::vision::provider::VisionProvider;
use crate::vision::types::ReleaseRecord;

const NAV_SYSTEM_PROMPT: &str = "\
You are a vision navigation agent. Use ONLY the screenshot to decide the next \
UI action. Return STRICT JSON matching the action schema. No prose. \
Choose large, unambiguous targets. If a search box is present, click it and \
type. If you need to scroll, return type=scroll with direction and amount.";

const EXTRACT_SYSTEM_PROMPT: &str = "\
You are a vision extraction agent. Use ONLY the screenshot to read the latest \
release info. Return STRICT JSON with keys: version, tag, author. No prose.";

/// In-call attempts before the endpoint is declared unusable for this call.
const CALL_ATTEMPTS: u32 = 3;

/// OpenAI-compatible chat-completions client carrying the screenshot as a
/// base64 data URL.
pub struct OpenAiVision {
    client: reqwest::Client,
    api_base: String,
    api_key: String,
    model: String,
}

impl OpenAiVision {
    pub fn new(api_base: String, api_key: String, model: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_base,
            api_key,
            model,
        }
    }

    async fn call_json(&self, system: &str, user: &str, png: &[u8]) -> NavResult<Value> {
        let data_url = format!(
            "data:image/png;base64,{}",
            base64::engine::general_purpose::STANDARD.encode(png)
        );

        let mut system = system.to_string();
        let mut last_err = String::new();
        for attempt in 1..=CALL_ATTEMPTS {
            let body = serde_json::json!({
                "model": self.model,
                "messages": [
                    {"role": "system", "content": system},
                    {"role": "user", "content": [
                        {"type": "text", "text": user},
                        {"type": "image_url", "image_url": {"url": data_url}},
                    ]},
                ],
                "temperature": 0,
            });

            tracing::debug!(
                model = %self.model,
                attempt,
                prompt_len = user.len(),
                image_kb = png.len() / 1024,
                "sending vision request"
            );

            let response = self
                .client
                .post(&self.api_base)
                .bearer_auth(&self.api_key)
                .json(&body)
                .send()
                .await?;

            if !response.status().is_success() {
                let status = response.status();
                let err_body = response.text().await.unwrap_or_default();
                return Err(NavError::Vision(format!("{status}: {err_body}")));
            }

            let json: Value = response.json().await?;
            let content = json["choices"][0]["message"]["content"]
                .as_str()
                .unwrap_or_default();

            match parse_strict_json(content) {
                Ok(payload) => return Ok(payload),
                Err(reason) => {
                    tracing::warn!(attempt, reason = %reason, "vision output not valid JSON");
                    last_err = reason;
                    // Same nudge the endpoint understands on re-prompt.
                    system.push_str(" Return valid JSON only.");
                }
            }
        }

        Err(NavError::Vision(format!(
            "no valid JSON after {CALL_ATTEMPTS} attempts: {last_err}"
        )))
    }
}

#[async_trait]
impl VisionProvider for OpenAiVision {
    async fn decide(&self, screenshot: &[u8], subgoal: &str, stage: Stage) -> NavResult<Value> {
        let user = format!(
            "Stage: {stage}. Subgoal: {subgoal} \
             Return JSON: {{type, reason, bbox?, text?, scroll?}}. \
             bbox uses pixel coordinates [x_min, y_min, x_max, y_max] in the screenshot."
        );
        self.call_json(NAV_SYSTEM_PROMPT, &user, screenshot).await
    }

    async fn extract(&self, screenshot: &[u8], repo: &str) -> NavResult<ReleaseRecord> {
        let user = format!("Repository: {repo}. Extract the latest release info from the page.");
        let payload = self
            .call_json(EXTRACT_SYSTEM_PROMPT, &user, screenshot)
            .await?;
        let record: ReleaseRecord = serde_json::from_value(payload)
            .map_err(|e| NavError::Vision(format!("release payload did not deserialize: {e}")))?;
        Ok(record)
    }
}

/// Strips the markdown fences models wrap JSON in despite instructions, then
/// parses.
fn parse_strict_json(content: &str) -> Result<Value, String> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Err("empty model output".into());
    }
    let unfenced = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    let unfenced = unfenced.strip_suffix("```").unwrap_or(unfenced).trim();
    serde_json::from_str(unfenced).map_err(|e| format!("{e}: {:.120}", unfenced))
}
