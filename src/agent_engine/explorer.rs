use serde::{Deserialize, Serialize};

use crate::agent_engine::progress::{Fingerprint, Progress};
use crate::agent_engine::stage::TargetPatterns;
use crate::browser::driver::BrowserDriver;
use crate::errors::NavResult;
use crate::trace::TraceWriter;
use crate::vision::types::BoundingBox;

/// Deterministic fallback for a coarse, low-confidence bounding box: the
/// true clickable target is assumed to lie inside the box, so probe it with
/// a fixed grid of clicks, shrinking toward the top-left after each
/// fruitless round (result-card titles and links conventionally sit there).
/// No selectors, no randomness.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExplorerConfig {
    /// Candidate grid is `grid_size × grid_size` per round.
    pub grid_size: u32,
    pub round_budget: u32,
    /// Boxes shrunk below this edge length are not worth probing.
    pub min_box_px: u32,
}

impl Default for ExplorerConfig {
    fn default() -> Self {
        Self {
            grid_size: 3,
            round_budget: 3,
            min_box_px: 20,
        }
    }
}

/// Live state of one exploration; created on entry, destroyed on exit.
#[derive(Debug, Clone)]
pub struct ExplorationState {
    pub current_box: BoundingBox,
    pub round: u32,
    pub grid_size: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExplorationOutcome {
    Succeeded,
    Failed,
}

#[derive(Debug, Clone)]
pub struct Exploration {
    pub outcome: ExplorationOutcome,
    /// Fingerprint of the last observation taken, so the caller's stall
    /// detection stays continuous.
    pub last_fingerprint: Fingerprint,
    pub rounds: u32,
    pub clicks: u32,
}

/// Probes `start_box` until a click lands on the target repository link or
/// the round budget runs out. Succeeds immediately when a click both changes
/// the URL and matches the repository pattern.
pub async fn explore(
    driver: &dyn BrowserDriver,
    patterns: &TargetPatterns,
    start_box: BoundingBox,
    cfg: &ExplorerConfig,
    origin: Fingerprint,
    trace: &TraceWriter,
    step: u32,
) -> NavResult<Exploration> {
    let viewport = driver.viewport();
    let mut state = ExplorationState {
        current_box: start_box.clamp_to(viewport),
        round: 0,
        grid_size: cfg.grid_size.max(1),
    };
    let mut last_fp = origin;
    let mut clicks = 0u32;

    while state.round < cfg.round_budget {
        if state.current_box.width() < cfg.min_box_px
            || state.current_box.height() < cfg.min_box_px
        {
            tracing::info!(
                round = state.round,
                bbox = ?state.current_box,
                "exploration box degenerated below the clickable minimum"
            );
            break;
        }

        let points = state.current_box.grid_points(state.grid_size);
        tracing::info!(
            round = state.round,
            bbox = ?state.current_box,
            candidates = points.len(),
            "exploration round"
        );
        trace.save_json(
            step,
            &format!("explore_round_{}", state.round),
            &serde_json::json!({
                "box": state.current_box,
                "points": points,
            }),
        );

        for (px, py) in points {
            driver.click(px, py).await?;
            clicks += 1;

            let obs = driver.capture().await?;
            let fp = Fingerprint::of(&obs);
            let progress = Progress::classify(Some(&last_fp), &fp);
            let hit = progress == Progress::Progressed && patterns.repo_reached(&obs.url);
            tracing::debug!(x = px, y = py, url = %obs.url, ?progress, hit, "exploration click");
            last_fp = fp;

            if hit {
                tracing::info!(round = state.round, clicks, url = %obs.url, "exploration succeeded");
                return Ok(Exploration {
                    outcome: ExplorationOutcome::Succeeded,
                    last_fingerprint: last_fp,
                    rounds: state.round + 1,
                    clicks,
                });
            }
        }

        state.current_box = state.current_box.top_left_quadrant();
        state.round += 1;
    }

    tracing::warn!(rounds = state.round, clicks, "exploration exhausted its round budget");
    Ok(Exploration {
        outcome: ExplorationOutcome::Failed,
        last_fingerprint: last_fp,
        rounds: state.round,
        clicks,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::Mutex;

    use crate::errors::NavResult;
    use crate::vision::types::{Observation, ScrollDirection};

    /// Browser where clicking inside `target` navigates to the repo page
    /// and everything else is inert.
    struct FakeBrowser {
        target: Option<BoundingBox>,
        url: Mutex<String>,
        clicks: Mutex<Vec<(u32, u32)>>,
    }

    impl FakeBrowser {
        fn new(target: Option<BoundingBox>) -> Self {
            Self {
                target,
                url: Mutex::new("https://github.com/search?q=openclaw".into()),
                clicks: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl BrowserDriver for FakeBrowser {
        async fn capture(&self) -> NavResult<Observation> {
            let url = self.url.lock().unwrap().clone();
            Ok(Observation {
                screenshot: url.clone().into_bytes(),
                title: String::new(),
                url,
                captured_at: Utc::now(),
            })
        }

        async fn click(&self, x: u32, y: u32) -> NavResult<()> {
            self.clicks.lock().unwrap().push((x, y));
            if let Some(target) = &self.target {
                if target.contains(x, y) {
                    *self.url.lock().unwrap() =
                        "https://github.com/openclaw/openclaw".into();
                }
            }
            Ok(())
        }

        async fn type_text(&self, _text: &str) -> NavResult<()> {
            Ok(())
        }

        async fn press_key(&self, _key: &str) -> NavResult<()> {
            Ok(())
        }

        async fn scroll(&self, _direction: ScrollDirection, _amount: u32) -> NavResult<()> {
            Ok(())
        }

        async fn go_back(&self) -> NavResult<()> {
            Ok(())
        }

        fn viewport(&self) -> (u32, u32) {
            (1280, 720)
        }
    }

    fn patterns() -> TargetPatterns {
        TargetPatterns::for_repo("openclaw/openclaw").unwrap()
    }

    async fn run_explore(browser: &FakeBrowser, start: BoundingBox, cfg: &ExplorerConfig) -> Exploration {
        let obs = browser.capture().await.unwrap();
        let origin = Fingerprint::of(&obs);
        explore(
            browser,
            &patterns(),
            start,
            cfg,
            origin,
            &TraceWriter::disabled(),
            1,
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn finds_target_in_top_left_after_shrinking() {
        // Target only clickable near the original top-left corner: missed by
        // the full-box cell centers, hit after the first quadrant shrink.
        let start = BoundingBox::new(200, 100, 1000, 500);
        let target = BoundingBox::new(200, 100, 280, 150);
        let browser = FakeBrowser::new(Some(target));

        let result = run_explore(&browser, start, &ExplorerConfig::default()).await;
        assert_eq!(result.outcome, ExplorationOutcome::Succeeded);
        assert!(result.rounds <= 3);
        assert_eq!(
            *browser.url.lock().unwrap(),
            "https://github.com/openclaw/openclaw"
        );
    }

    #[tokio::test]
    async fn first_round_hit_stops_immediately() {
        let start = BoundingBox::new(0, 0, 900, 300);
        // Covers the center of the whole start box.
        let target = BoundingBox::new(400, 100, 500, 200);
        let browser = FakeBrowser::new(Some(target));

        let result = run_explore(&browser, start, &ExplorerConfig::default()).await;
        assert_eq!(result.outcome, ExplorationOutcome::Succeeded);
        assert_eq!(result.rounds, 1);
        // Row-major order: the hit is candidate (450, 150), index 4 of 9.
        assert_eq!(browser.clicks.lock().unwrap().len(), 5);
    }

    #[tokio::test]
    async fn unreachable_target_fails_after_full_budget() {
        let browser = FakeBrowser::new(None);
        let cfg = ExplorerConfig::default();
        let start = BoundingBox::new(0, 0, 1200, 700);

        let result = run_explore(&browser, start, &cfg).await;
        assert_eq!(result.outcome, ExplorationOutcome::Failed);
        assert_eq!(result.rounds, cfg.round_budget);
        // grid_size² candidate clicks per round, every round.
        assert_eq!(
            browser.clicks.lock().unwrap().len() as u32,
            cfg.round_budget * cfg.grid_size * cfg.grid_size
        );
    }

    #[tokio::test]
    async fn degenerate_box_fails_without_clicking() {
        let browser = FakeBrowser::new(None);
        let result = run_explore(
            &browser,
            BoundingBox::new(10, 10, 25, 18),
            &ExplorerConfig::default(),
        )
        .await;
        assert_eq!(result.outcome, ExplorationOutcome::Failed);
        assert!(browser.clicks.lock().unwrap().is_empty());
    }
}
