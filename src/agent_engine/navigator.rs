use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::agent_engine::explorer::{self, ExplorationOutcome, ExplorerConfig};
use crate::agent_engine::progress::{Fingerprint, Progress};
use crate::agent_engine::stage::{Stage, StageResult, StageStatus, TargetPatterns};
use crate::browser::driver::BrowserDriver;
use crate::config::AppConfig;
use crate::errors::{NavError, NavResult};
use crate::trace::TraceWriter;
use crate::vision::provider::VisionProvider;
use crate::vision::types::{validate_action, Action, BoundingBox, Observation, ReleaseRecord, ScrollDirection};

#[derive(Debug, Clone)]
pub struct NavigatorConfig {
    pub target_repo: String,
    pub step_budget: u32,
    pub stall_budget: u32,
    pub explorer: ExplorerConfig,
    pub call_timeout: Duration,
}

impl NavigatorConfig {
    pub fn from_app(cfg: &AppConfig) -> Self {
        Self {
            target_repo: cfg.run.target_repo.clone(),
            step_budget: cfg.run.step_budget,
            stall_budget: cfg.run.stall_budget,
            explorer: ExplorerConfig {
                grid_size: cfg.run.grid_size,
                round_budget: cfg.run.round_budget,
                ..ExplorerConfig::default()
            },
            call_timeout: Duration::from_secs(cfg.run.call_timeout_secs),
        }
    }
}

impl Default for NavigatorConfig {
    fn default() -> Self {
        Self::from_app(&AppConfig::default())
    }
}

/// Structured outcome of a run: the release record, or the stage and error
/// kind the run died at, always with the iteration count. The run never
/// hangs and never panics its way out.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub repository: String,
    pub latest_release: Option<ReleaseRecord>,
    pub failure: Option<RunFailure>,
    pub steps: u32,
    pub stages: Vec<StageResult>,
}

impl RunReport {
    pub fn succeeded(&self) -> bool {
        self.failure.is_none()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunFailure {
    pub stage: Stage,
    pub kind: String,
    pub message: String,
}

enum ActOutcome {
    Acted,
    /// Region exploration clicked through to the repository; the stage has
    /// already been advanced and `prev_fp` updated.
    ExplorerResolved,
    ExplorerExhausted,
}

/// The observe→decide→act→validate state machine. Owns the browser session,
/// the fingerprint history and all retry/stall budgets for one run; drives
/// the vision oracle defensively, never trusting its output unvalidated.
pub struct Navigator {
    driver: Arc<dyn BrowserDriver>,
    vision: Arc<dyn VisionProvider>,
    patterns: TargetPatterns,
    cfg: NavigatorConfig,
    trace: TraceWriter,
    cancel: Arc<AtomicBool>,

    // ── Per-run mutable state ─────────────────────────────────────────────
    prev_fp: Option<Fingerprint>,
    steps: u32,
    stall_count: u32,
    recovery_spent: bool,
    /// Box of the last direct result-card click, kept so a fruitless click
    /// can be retried as a region exploration.
    pending_explore: Option<BoundingBox>,
    stages: Vec<StageResult>,
}

impl Navigator {
    pub fn new(
        driver: Arc<dyn BrowserDriver>,
        vision: Arc<dyn VisionProvider>,
        cfg: NavigatorConfig,
        trace: TraceWriter,
        cancel: Arc<AtomicBool>,
    ) -> NavResult<Self> {
        let patterns = TargetPatterns::for_repo(&cfg.target_repo)?;
        Ok(Self {
            driver,
            vision,
            patterns,
            cfg,
            trace,
            cancel,
            prev_fp: None,
            steps: 0,
            stall_count: 0,
            recovery_spent: false,
            pending_explore: None,
            stages: Vec::new(),
        })
    }

    pub async fn run(mut self) -> RunReport {
        tracing::info!(
            repo = %self.cfg.target_repo,
            step_budget = self.cfg.step_budget,
            stall_budget = self.cfg.stall_budget,
            "navigation run started"
        );
        let mut stage = Stage::Search;
        self.enter_stage(stage);

        loop {
            // Single cancellation point, checked before anything is in flight.
            if self.cancel.load(Ordering::Relaxed) {
                return self.fail(stage, &NavError::Cancelled);
            }
            if self.steps >= self.cfg.step_budget {
                let err = NavError::StepBudgetExceeded { steps: self.steps };
                return self.fail(stage, &err);
            }

            // ── Observe ───────────────────────────────────────────────────
            let obs = match self.observe().await {
                Ok(obs) => obs,
                Err(e) => return self.fail(stage, &e),
            };
            let fp = Fingerprint::of(&obs);
            let progress = Progress::classify(self.prev_fp.as_ref(), &fp);
            tracing::debug!(stage = %stage, url = %obs.url, ?progress, step = self.steps + 1, "observed");
            self.bump_attempts();

            // ── Validate progress of the previous action ──────────────────
            match progress {
                Progress::Progressed => {
                    self.stall_count = 0;
                    self.pending_explore = None;
                    self.advance_through(&mut stage, &obs.url);
                }
                Progress::Changed => {
                    // Partial credit: the page redrew without navigating.
                    self.stall_count = 0;
                }
                Progress::Stalled => {
                    self.stall_count += 1;
                    tracing::debug!(
                        stage = %stage,
                        count = self.stall_count,
                        budget = self.cfg.stall_budget,
                        "stalled"
                    );
                    if self.stall_count > self.cfg.stall_budget {
                        if self.recovery_spent {
                            let err = NavError::StallExhausted {
                                stage,
                                attempts: self.current_attempts(),
                            };
                            return self.fail(stage, &err);
                        }
                        self.recovery_spent = true;
                        match self.recover(stage, &fp).await {
                            Ok(Some(recovered)) => {
                                self.stall_count = 0;
                                self.prev_fp = Some(recovered);
                                self.steps += 1;
                                continue;
                            }
                            Ok(None) => {
                                let err = NavError::StallExhausted {
                                    stage,
                                    attempts: self.current_attempts(),
                                };
                                return self.fail(stage, &err);
                            }
                            Err(e) => return self.fail(stage, &e),
                        }
                    }
                }
            }

            // ── Extract is terminal: one model call, no more navigation ───
            if stage == Stage::Extract {
                return match self.run_extract(&obs).await {
                    Ok(record) => self.done(record),
                    Err(e) => self.fail(stage, &e),
                };
            }

            // A direct result-card click gets one attempt; if it did not
            // progress, resolve the same box by exploration instead of
            // asking the model again.
            if !matches!(progress, Progress::Progressed) && stage.allows_exploration() {
                if let Some(bbox) = self.pending_explore.take() {
                    match self.explore_region(&mut stage, bbox, fp).await {
                        Ok(ActOutcome::ExplorerResolved) => {
                            self.write_trace(&obs, None, stage);
                            self.steps += 1;
                            continue;
                        }
                        Ok(_) => {
                            let err = NavError::StallExhausted {
                                stage,
                                attempts: self.current_attempts(),
                            };
                            return self.fail(stage, &err);
                        }
                        Err(e) => return self.fail(stage, &e),
                    }
                }
            }

            // ── Decide ────────────────────────────────────────────────────
            let raw = match self.decide(stage, &obs).await {
                Ok(raw) => raw,
                Err(e) => return self.fail(stage, &e),
            };

            // ── Validate the model's action ───────────────────────────────
            let action = match validate_action(&raw, self.driver.viewport()) {
                Ok(action) => action,
                Err(schema) => {
                    // Model output is unreliable by assumption; a malformed
                    // action is a stall, not a crash.
                    tracing::warn!(stage = %stage, error = %schema, "model action rejected");
                    self.stall_count += 1;
                    self.trace.save_json(
                        self.steps + 1,
                        "rejected_action",
                        &serde_json::json!({ "raw": raw, "error": schema.to_string() }),
                    );
                    self.prev_fp = Some(fp);
                    self.steps += 1;
                    continue;
                }
            };
            tracing::info!(stage = %stage, action = ?action, step = self.steps + 1, "acting");

            // ── Act ───────────────────────────────────────────────────────
            match self.act(&mut stage, &action, &fp).await {
                Ok(ActOutcome::Acted) => {
                    self.write_trace(&obs, Some(&action), stage);
                    self.prev_fp = Some(fp);
                    self.steps += 1;
                }
                Ok(ActOutcome::ExplorerResolved) => {
                    self.write_trace(&obs, Some(&action), stage);
                    self.steps += 1;
                }
                Ok(ActOutcome::ExplorerExhausted) => {
                    let err = NavError::StallExhausted {
                        stage,
                        attempts: self.current_attempts(),
                    };
                    return self.fail(stage, &err);
                }
                Err(e) => return self.fail(stage, &e),
            }
        }
    }

    // ── Stage bookkeeping ─────────────────────────────────────────────────

    fn enter_stage(&mut self, stage: Stage) {
        self.stages.push(StageResult::enter(stage));
    }

    fn complete_current(&mut self, status: StageStatus) {
        if let Some(cur) = self.stages.last_mut() {
            if cur.status == StageStatus::InProgress {
                cur.status = status;
            }
        }
    }

    fn bump_attempts(&mut self) {
        if let Some(cur) = self.stages.last_mut() {
            cur.attempts += 1;
        }
    }

    fn current_attempts(&self) -> u32 {
        self.stages.last().map(|s| s.attempts).unwrap_or(0)
    }

    fn reset_stage_counters(&mut self) {
        self.stall_count = 0;
        self.recovery_spent = false;
        self.pending_explore = None;
    }

    /// Advances past every stage whose URL pattern the new page satisfies.
    /// A single navigation may jump several stages (a search that lands
    /// directly on the repository page).
    fn advance_through(&mut self, stage: &mut Stage, url: &str) {
        let Some(furthest) = self.patterns.furthest_reached(*stage, url) else {
            return;
        };
        let mut s = *stage;
        loop {
            self.complete_current(StageStatus::Succeeded);
            tracing::info!(stage = %s, url = %url, "stage succeeded");
            let Some(next) = s.next() else { break };
            self.enter_stage(next);
            *stage = next;
            if s == furthest {
                break;
            }
            s = next;
        }
        self.reset_stage_counters();
    }

    // ── Collaborator calls (timeout + one retry each) ─────────────────────

    async fn with_retry<T, F, Fut>(&self, what: &'static str, mut call: F) -> NavResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = NavResult<T>>,
    {
        match tokio::time::timeout(self.cfg.call_timeout, call()).await {
            Ok(Ok(v)) => return Ok(v),
            Ok(Err(e)) => {
                tracing::warn!(call = what, error = %e, "collaborator call failed; retrying once")
            }
            Err(_) => tracing::warn!(call = what, "collaborator call timed out; retrying once"),
        }
        match tokio::time::timeout(self.cfg.call_timeout, call()).await {
            Ok(result) => result,
            Err(_) => Err(NavError::Driver(format!("{what} timed out after retry"))),
        }
    }

    /// No observation means no loop: a capture that fails past its retry is
    /// a lost browser session, fatal for the run.
    async fn observe(&self) -> NavResult<Observation> {
        let driver = Arc::clone(&self.driver);
        self.with_retry("capture", move || {
            let driver = Arc::clone(&driver);
            async move { driver.capture().await }
        })
        .await
        .map_err(|e| NavError::Fatal(format!("browser session lost: {e}")))
    }

    async fn decide(&self, stage: Stage, obs: &Observation) -> NavResult<serde_json::Value> {
        let mut subgoal = stage.subgoal(&self.cfg.target_repo);
        if self.stall_count > 0 {
            subgoal.push_str(
                " The previous attempt did not change the page. Return a corrected \
                 bbox or a different action for the current screenshot.",
            );
        }
        let vision = Arc::clone(&self.vision);
        let screenshot = obs.screenshot.clone();
        let subgoal_owned = subgoal;
        self.with_retry("decide", move || {
            let vision = Arc::clone(&vision);
            let screenshot = screenshot.clone();
            let subgoal = subgoal_owned.clone();
            async move { vision.decide(&screenshot, &subgoal, stage).await }
        })
        .await
        .map_err(|e| NavError::Fatal(format!("vision provider unreachable: {e}")))
    }

    async fn run_extract(&mut self, obs: &Observation) -> NavResult<ReleaseRecord> {
        let vision = Arc::clone(&self.vision);
        let screenshot = obs.screenshot.clone();
        let repo = self.cfg.target_repo.clone();
        let mut record = self
            .with_retry("extract", move || {
                let vision = Arc::clone(&vision);
                let screenshot = screenshot.clone();
                let repo = repo.clone();
                async move { vision.extract(&screenshot, &repo).await }
            })
            .await?;
        record.repository = self.cfg.target_repo.clone();

        self.trace.save_screenshot(self.steps + 1, &obs.screenshot);
        self.trace.save_json(
            self.steps + 1,
            "extract",
            &serde_json::to_value(&record).unwrap_or_default(),
        );
        self.steps += 1;
        Ok(record)
    }

    // ── Action execution ──────────────────────────────────────────────────

    async fn act(
        &mut self,
        stage: &mut Stage,
        action: &Action,
        fp: &Fingerprint,
    ) -> NavResult<ActOutcome> {
        match action {
            Action::Click { bbox } => {
                let viewport = self.driver.viewport();
                if stage.allows_exploration() && bbox.is_coarse(viewport) {
                    tracing::info!(bbox = ?bbox, "coarse box; resolving via region exploration");
                    return self.explore_region(stage, *bbox, *fp).await;
                }
                let (cx, cy) = bbox.center();
                self.driver_click(cx, cy).await?;
                if stage.allows_exploration() {
                    self.pending_explore = Some(*bbox);
                }
                Ok(ActOutcome::Acted)
            }
            Action::Type { bbox, text } => {
                let (cx, cy) = bbox.center();
                self.driver_click(cx, cy).await?;
                let driver = Arc::clone(&self.driver);
                let text_owned = text.clone();
                self.with_retry("type_text", move || {
                    let driver = Arc::clone(&driver);
                    let text = text_owned.clone();
                    async move { driver.type_text(&text).await }
                })
                .await?;
                let driver = Arc::clone(&self.driver);
                self.with_retry("press_key", move || {
                    let driver = Arc::clone(&driver);
                    async move { driver.press_key("Enter").await }
                })
                .await?;
                Ok(ActOutcome::Acted)
            }
            Action::Scroll { direction, amount } => {
                let driver = Arc::clone(&self.driver);
                let (direction, amount) = (*direction, *amount);
                self.with_retry("scroll", move || {
                    let driver = Arc::clone(&driver);
                    async move { driver.scroll(direction, amount).await }
                })
                .await?;
                Ok(ActOutcome::Acted)
            }
            Action::Back => {
                let driver = Arc::clone(&self.driver);
                self.with_retry("go_back", move || {
                    let driver = Arc::clone(&driver);
                    async move { driver.go_back().await }
                })
                .await?;
                Ok(ActOutcome::Acted)
            }
            Action::Done => {
                // Valid but inert outside Extract; the URL decides whether
                // the stage actually completed.
                tracing::debug!(stage = %stage, "model reported done; no browser action");
                Ok(ActOutcome::Acted)
            }
        }
    }

    async fn driver_click(&self, x: u32, y: u32) -> NavResult<()> {
        let driver = Arc::clone(&self.driver);
        self.with_retry("click", move || {
            let driver = Arc::clone(&driver);
            async move { driver.click(x, y).await }
        })
        .await
    }

    async fn explore_region(
        &mut self,
        stage: &mut Stage,
        bbox: BoundingBox,
        fp: Fingerprint,
    ) -> NavResult<ActOutcome> {
        let exploration = explorer::explore(
            self.driver.as_ref(),
            &self.patterns,
            bbox,
            &self.cfg.explorer,
            fp,
            &self.trace,
            self.steps + 1,
        )
        .await?;
        self.prev_fp = Some(exploration.last_fingerprint);
        match exploration.outcome {
            ExplorationOutcome::Succeeded => {
                self.complete_current(StageStatus::Succeeded);
                tracing::info!(stage = %stage, clicks = exploration.clicks, "stage succeeded via region exploration");
                if let Some(next) = stage.next() {
                    self.enter_stage(next);
                    *stage = next;
                }
                self.reset_stage_counters();
                Ok(ActOutcome::ExplorerResolved)
            }
            ExplorationOutcome::Failed => Ok(ActOutcome::ExplorerExhausted),
        }
    }

    /// One recovery episode per stage: scroll down, and if the page still
    /// does not move, go back. Either unstick resets the stall counter; a
    /// fruitless episode ends the stage.
    async fn recover(&mut self, stage: Stage, fp: &Fingerprint) -> NavResult<Option<Fingerprint>> {
        tracing::info!(stage = %stage, "stall budget exhausted; recovery scroll");
        let driver = Arc::clone(&self.driver);
        self.with_retry("scroll", move || {
            let driver = Arc::clone(&driver);
            async move { driver.scroll(ScrollDirection::Down, 500).await }
        })
        .await?;
        let obs = self.observe().await?;
        let after_scroll = Fingerprint::of(&obs);
        if Progress::classify(Some(fp), &after_scroll) != Progress::Stalled {
            tracing::info!(stage = %stage, "recovery scroll moved the page");
            return Ok(Some(after_scroll));
        }

        tracing::info!(stage = %stage, "still stalled; recovery back");
        let driver = Arc::clone(&self.driver);
        self.with_retry("go_back", move || {
            let driver = Arc::clone(&driver);
            async move { driver.go_back().await }
        })
        .await?;
        let obs = self.observe().await?;
        let after_back = Fingerprint::of(&obs);
        if Progress::classify(Some(&after_scroll), &after_back) != Progress::Stalled {
            tracing::info!(stage = %stage, "recovery back moved the page");
            return Ok(Some(after_back));
        }
        Ok(None)
    }

    // ── Reporting ─────────────────────────────────────────────────────────

    fn write_trace(&self, obs: &Observation, action: Option<&Action>, stage: Stage) {
        let step = self.steps + 1;
        self.trace.save_screenshot(step, &obs.screenshot);
        self.trace.save_json(
            step,
            "observation",
            &serde_json::json!({
                "url": obs.url,
                "title": obs.title,
                "stage": stage.to_string(),
                "captured_at": obs.captured_at.to_rfc3339(),
            }),
        );
        if let Some(action) = action {
            self.trace.save_json(
                step,
                "action",
                &serde_json::to_value(action).unwrap_or_default(),
            );
        }
    }

    fn done(mut self, record: ReleaseRecord) -> RunReport {
        self.complete_current(StageStatus::Succeeded);
        tracing::info!(
            version = ?record.version,
            tag = ?record.tag,
            author = ?record.author,
            steps = self.steps,
            "run complete"
        );
        let report = RunReport {
            repository: self.cfg.target_repo.clone(),
            latest_release: Some(record),
            failure: None,
            steps: self.steps,
            stages: self.stages,
        };
        self.trace
            .save_result(&serde_json::to_value(&report).unwrap_or_default());
        report
    }

    fn fail(mut self, stage: Stage, err: &NavError) -> RunReport {
        self.complete_current(StageStatus::Failed);
        tracing::error!(stage = %stage, kind = err.kind(), error = %err, steps = self.steps, "run aborted");
        let report = RunReport {
            repository: self.cfg.target_repo.clone(),
            latest_release: None,
            failure: Some(RunFailure {
                stage,
                kind: err.kind().to_string(),
                message: err.to_string(),
            }),
            steps: self.steps,
            stages: self.stages,
        };
        self.trace
            .save_result(&serde_json::to_value(&report).unwrap_or_default());
        report
    }
}
