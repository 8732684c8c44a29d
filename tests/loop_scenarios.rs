//! End-to-end state-machine scenarios: the full navigator loop driven by
//! scripted browser and vision collaborators, no real Chrome, no network.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};

use releye::agent_engine::navigator::{Navigator, NavigatorConfig, RunReport};
use releye::agent_engine::stage::{Stage, StageStatus};
use releye::browser::driver::BrowserDriver;
use releye::errors::NavResult;
use releye::trace::TraceWriter;
use releye::vision::provider::VisionProvider;
use releye::vision::types::{BoundingBox, Observation, ReleaseRecord, ScrollDirection};

const HOME: &str = "https://github.com";
const SEARCH: &str = "https://github.com/search?q=openclaw%2Fopenclaw&type=repositories";
const REPO: &str = "https://github.com/openclaw/openclaw";
const RELEASES: &str = "https://github.com/openclaw/openclaw/releases";

fn shot(url: &str, tag: u32) -> Vec<u8> {
    // Not a real PNG: the fingerprint falls back to byte hashing, which is
    // exactly what these scripts need to control stall vs change.
    format!("{url}#frame{tag}").into_bytes()
}

// ── Scripted browser: capture() replays a fixed observation sequence ─────────

struct QueueBrowser {
    queue: Mutex<VecDeque<(String, u32)>>,
    last: Mutex<(String, u32)>,
    clicks: AtomicU32,
    scrolls: AtomicU32,
    backs: AtomicU32,
    typed: Mutex<Vec<String>>,
}

impl QueueBrowser {
    fn scripted(entries: &[(&str, u32)]) -> Self {
        Self {
            queue: Mutex::new(
                entries
                    .iter()
                    .map(|(url, tag)| (url.to_string(), *tag))
                    .collect(),
            ),
            last: Mutex::new((HOME.to_string(), 0)),
            clicks: AtomicU32::new(0),
            scrolls: AtomicU32::new(0),
            backs: AtomicU32::new(0),
            typed: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl BrowserDriver for QueueBrowser {
    async fn capture(&self) -> NavResult<Observation> {
        let (url, tag) = {
            let mut queue = self.queue.lock().unwrap();
            match queue.pop_front() {
                Some(entry) => {
                    *self.last.lock().unwrap() = entry.clone();
                    entry
                }
                // Page stops moving once the script runs out.
                None => self.last.lock().unwrap().clone(),
            }
        };
        Ok(Observation {
            screenshot: shot(&url, tag),
            title: String::new(),
            url,
            captured_at: Utc::now(),
        })
    }

    async fn click(&self, _x: u32, _y: u32) -> NavResult<()> {
        self.clicks.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn type_text(&self, text: &str) -> NavResult<()> {
        self.typed.lock().unwrap().push(text.to_string());
        Ok(())
    }

    async fn press_key(&self, _key: &str) -> NavResult<()> {
        Ok(())
    }

    async fn scroll(&self, _direction: ScrollDirection, _amount: u32) -> NavResult<()> {
        self.scrolls.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn go_back(&self) -> NavResult<()> {
        self.backs.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn viewport(&self) -> (u32, u32) {
        (1280, 720)
    }
}

// ── Scripted vision: one canned decision per stage ───────────────────────────

struct ScriptedVision {
    record: ReleaseRecord,
    extract_calls: AtomicU32,
    open_repo_decision: Value,
}

impl ScriptedVision {
    fn new() -> Self {
        Self {
            record: sample_record(),
            extract_calls: AtomicU32::new(0),
            // Small box: a direct, non-coarse click.
            open_repo_decision: json!({"type": "click", "bbox": [400, 200, 500, 230]}),
        }
    }
}

fn sample_record() -> ReleaseRecord {
    ReleaseRecord {
        repository: String::new(),
        version: Some("v2.1.0".into()),
        tag: Some("v2.1.0".into()),
        author: Some("octocat".into()),
    }
}

#[async_trait]
impl VisionProvider for ScriptedVision {
    async fn decide(&self, _screenshot: &[u8], _subgoal: &str, stage: Stage) -> NavResult<Value> {
        Ok(match stage {
            Stage::Search => {
                json!({"type": "type", "bbox": [500, 10, 780, 40], "text": "openclaw/openclaw"})
            }
            Stage::OpenRepo => self.open_repo_decision.clone(),
            Stage::OpenReleases => json!({"type": "click", "bbox": [1000, 300, 1100, 320]}),
            Stage::Extract => json!({"type": "done"}),
        })
    }

    async fn extract(&self, _screenshot: &[u8], _repo: &str) -> NavResult<ReleaseRecord> {
        self.extract_calls.fetch_add(1, Ordering::Relaxed);
        Ok(self.record.clone())
    }
}

async fn run_navigator(
    browser: Arc<dyn BrowserDriver>,
    vision: Arc<dyn VisionProvider>,
    cfg: NavigatorConfig,
    trace: TraceWriter,
) -> RunReport {
    Navigator::new(browser, vision, cfg, trace, Arc::new(AtomicBool::new(false)))
        .unwrap()
        .run()
        .await
}

// ── Scenario A: happy path through every stage ───────────────────────────────

#[tokio::test]
async fn scenario_a_search_stalls_then_full_run_succeeds() {
    let browser = Arc::new(QueueBrowser::scripted(&[
        (HOME, 0),
        (HOME, 0),
        (HOME, 0),
        (SEARCH, 0),
        (REPO, 0),
        (RELEASES, 0),
    ]));
    let vision = Arc::new(ScriptedVision::new());

    let report = run_navigator(
        browser.clone(),
        vision.clone(),
        NavigatorConfig::default(),
        TraceWriter::disabled(),
    )
    .await;

    assert!(report.succeeded(), "failure: {:?}", report.failure);
    let mut expected = sample_record();
    expected.repository = "openclaw/openclaw".into();
    assert_eq!(report.latest_release, Some(expected));
    assert_eq!(vision.extract_calls.load(Ordering::Relaxed), 1);
    assert_eq!(report.steps, 6);

    let statuses: Vec<(Stage, StageStatus)> =
        report.stages.iter().map(|s| (s.stage, s.status)).collect();
    assert_eq!(
        statuses,
        vec![
            (Stage::Search, StageStatus::Succeeded),
            (Stage::OpenRepo, StageStatus::Succeeded),
            (Stage::OpenReleases, StageStatus::Succeeded),
            (Stage::Extract, StageStatus::Succeeded),
        ]
    );
}

// ── Scenario B: stall exhaustion with fruitless recovery ─────────────────────

#[tokio::test]
async fn scenario_b_search_stall_exhaustion_aborts() {
    // Only one observation ever: the page never moves, recovery included.
    let browser = Arc::new(QueueBrowser::scripted(&[(HOME, 0)]));
    let vision = Arc::new(ScriptedVision::new());

    let report = run_navigator(
        browser.clone(),
        vision,
        NavigatorConfig::default(),
        TraceWriter::disabled(),
    )
    .await;

    let failure = report.failure.expect("run must abort");
    assert_eq!(failure.kind, "stall_exhausted");
    assert_eq!(failure.stage, Stage::Search);
    // stall_budget stalls, then exactly one recovery episode: scroll, back.
    assert_eq!(report.steps, NavigatorConfig::default().stall_budget + 1);
    assert_eq!(browser.scrolls.load(Ordering::Relaxed), 1);
    assert_eq!(browser.backs.load(Ordering::Relaxed), 1);
}

// ── Recovery that works resets the stall counter ─────────────────────────────

#[tokio::test]
async fn recovery_scroll_unsticks_and_run_completes() {
    let browser = Arc::new(QueueBrowser::scripted(&[
        (HOME, 0),
        (HOME, 0),
        (HOME, 0),
        (HOME, 0),
        (HOME, 0),
        // Observation taken right after the recovery scroll: same URL,
        // different pixels.
        (HOME, 1),
        (SEARCH, 0),
        (REPO, 0),
        (RELEASES, 0),
    ]));
    let vision = Arc::new(ScriptedVision::new());

    let report = run_navigator(
        browser.clone(),
        vision,
        NavigatorConfig::default(),
        TraceWriter::disabled(),
    )
    .await;

    assert!(report.succeeded(), "failure: {:?}", report.failure);
    assert_eq!(browser.scrolls.load(Ordering::Relaxed), 1);
    assert_eq!(browser.backs.load(Ordering::Relaxed), 0);
}

// ── Scenario C: global step budget wins over per-stage counters ──────────────

#[tokio::test]
async fn scenario_c_step_budget_aborts_mid_stage() {
    let browser = Arc::new(QueueBrowser::scripted(&[
        (HOME, 0),
        (SEARCH, 0),
        (REPO, 0),
        // Then the repo page forever: OpenReleases never completes.
    ]));
    let vision = Arc::new(ScriptedVision::new());
    let cfg = NavigatorConfig {
        step_budget: 6,
        ..NavigatorConfig::default()
    };

    let report = run_navigator(browser, vision, cfg, TraceWriter::disabled()).await;

    let failure = report.failure.expect("run must abort");
    assert_eq!(failure.kind, "step_budget_exceeded");
    assert_eq!(failure.stage, Stage::OpenReleases);
    assert_eq!(report.steps, 6);
}

// ── Malformed model output is a stall, never a crash ─────────────────────────

struct GarbageVision;

#[async_trait]
impl VisionProvider for GarbageVision {
    async fn decide(&self, _screenshot: &[u8], _subgoal: &str, _stage: Stage) -> NavResult<Value> {
        Ok(json!({"type": "hover", "bbox": [10, 10, 40, 40]}))
    }

    async fn extract(&self, _screenshot: &[u8], _repo: &str) -> NavResult<ReleaseRecord> {
        Ok(ReleaseRecord::default())
    }
}

#[tokio::test]
async fn schema_violations_count_as_stalls_and_abort_cleanly() {
    let browser = Arc::new(QueueBrowser::scripted(&[(HOME, 0)]));

    let report = run_navigator(
        browser.clone(),
        Arc::new(GarbageVision),
        NavigatorConfig::default(),
        TraceWriter::disabled(),
    )
    .await;

    let failure = report.failure.expect("run must abort");
    assert_eq!(failure.kind, "stall_exhausted");
    // Rejected actions are never executed.
    assert_eq!(browser.clicks.load(Ordering::Relaxed), 0);
}

// ── Coarse result-card click resolved by region exploration ──────────────────

/// Browser with just enough page semantics for the full pipeline: typing a
/// search navigates to the results page, clicking the card's real link opens
/// the repo, clicking the releases link opens releases.
struct CardBrowser {
    url: Mutex<String>,
    card_link: BoundingBox,
    releases_link: BoundingBox,
    clicks: AtomicU32,
}

impl CardBrowser {
    fn new() -> Self {
        Self {
            url: Mutex::new(HOME.to_string()),
            // The clickable title link sits in the card's top-left region.
            card_link: BoundingBox::new(250, 130, 350, 160),
            releases_link: BoundingBox::new(1000, 300, 1100, 320),
            clicks: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl BrowserDriver for CardBrowser {
    async fn capture(&self) -> NavResult<Observation> {
        let url = self.url.lock().unwrap().clone();
        Ok(Observation {
            screenshot: shot(&url, 0),
            title: String::new(),
            url,
            captured_at: Utc::now(),
        })
    }

    async fn click(&self, x: u32, y: u32) -> NavResult<()> {
        self.clicks.fetch_add(1, Ordering::Relaxed);
        let mut url = self.url.lock().unwrap();
        if url.contains("/search") && self.card_link.contains(x, y) {
            *url = REPO.to_string();
        } else if *url == REPO && self.releases_link.contains(x, y) {
            *url = RELEASES.to_string();
        }
        Ok(())
    }

    async fn type_text(&self, _text: &str) -> NavResult<()> {
        Ok(())
    }

    async fn press_key(&self, key: &str) -> NavResult<()> {
        let mut url = self.url.lock().unwrap();
        if key == "Enter" && *url == HOME {
            *url = SEARCH.to_string();
        }
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

#[tokio::test]
async fn coarse_card_box_is_resolved_by_exploration() {
    let browser = Arc::new(CardBrowser::new());
    let vision = Arc::new(ScriptedVision {
        record: sample_record(),
        extract_calls: AtomicU32::new(0),
        // The whole result card: far too big to click in one shot.
        open_repo_decision: json!({"type": "click", "bbox": [200, 100, 1000, 500]}),
    });

    let report = run_navigator(
        browser.clone(),
        vision.clone(),
        NavigatorConfig::default(),
        TraceWriter::disabled(),
    )
    .await;

    assert!(report.succeeded(), "failure: {:?}", report.failure);
    assert_eq!(vision.extract_calls.load(Ordering::Relaxed), 1);
    // Type's focus click, then a full 3x3 exploration round plus the
    // round-two hit, then the releases link.
    assert_eq!(browser.clicks.load(Ordering::Relaxed), 12);
    assert_eq!(*browser.url.lock().unwrap(), RELEASES);
}

// ── Trace artifacts: one observation/action pair per completed iteration ─────

#[tokio::test]
async fn trace_emits_artifacts_in_step_order() {
    let tmp = tempfile::tempdir().unwrap();
    let trace = TraceWriter::create(tmp.path());
    let run_dir = trace.run_dir().unwrap().to_path_buf();

    let browser = Arc::new(QueueBrowser::scripted(&[
        (HOME, 0),
        (SEARCH, 0),
        (REPO, 0),
        (RELEASES, 0),
    ]));
    let vision = Arc::new(ScriptedVision::new());

    let report = run_navigator(browser, vision, NavigatorConfig::default(), trace).await;
    assert!(report.succeeded(), "failure: {:?}", report.failure);
    assert_eq!(report.steps, 4);

    for step in 1..=3u32 {
        assert!(run_dir.join(format!("step_{step:02}.png")).exists());
        assert!(run_dir.join(format!("step_{step:02}_observation.json")).exists());
        assert!(run_dir.join(format!("step_{step:02}_action.json")).exists());
    }
    // The extract iteration saves the screenshot and the extracted record.
    assert!(run_dir.join("step_04.png").exists());
    assert!(run_dir.join("step_04_extract.json").exists());
    assert!(run_dir.join("result.json").exists());
}
