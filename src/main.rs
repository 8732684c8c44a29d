use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;

use releye::agent_engine::navigator::{Navigator, NavigatorConfig};
use releye::browser::cdp::CdpBrowser;
use releye::config;
use releye::trace::TraceWriter;
use releye::vision::openai::OpenAiVision;

/// Vision-driven GitHub release navigator: drives a browser purely from
/// screenshots and reports the target repository's latest release.
#[derive(Parser, Debug)]
#[command(name = "releye", version, about)]
struct Cli {
    /// Target repository as owner/repo.
    #[arg(long)]
    repo: Option<String>,

    /// Start URL.
    #[arg(long)]
    url: Option<String>,

    /// Write the final report JSON to this file as well as stdout.
    #[arg(long)]
    out: Option<PathBuf>,

    /// Run the browser with a visible window.
    #[arg(long)]
    headed: bool,

    /// Global iteration budget.
    #[arg(long)]
    max_steps: Option<u32>,

    /// Per-stage stall budget.
    #[arg(long)]
    max_retries: Option<u32>,

    /// Vision model name.
    #[arg(long)]
    model: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    // Load .env if present (ignore error if not found).
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let mut app_config = match config::load_config() {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::error!(error = %e, "failed to load config");
            return ExitCode::FAILURE;
        }
    };

    // CLI flags override config file values.
    if let Some(repo) = cli.repo {
        app_config.run.target_repo = repo;
    }
    if let Some(url) = cli.url {
        app_config.run.start_url = url;
    }
    if let Some(max_steps) = cli.max_steps {
        app_config.run.step_budget = max_steps;
    }
    if let Some(max_retries) = cli.max_retries {
        app_config.run.stall_budget = max_retries;
    }
    if let Some(model) = cli.model {
        app_config.vision.model = model;
    }
    if cli.headed {
        app_config.browser.headless = false;
    }

    let Some(api_key) = app_config.vision.resolve_api_key() else {
        tracing::error!("no vision API key: set OPENAI_API_KEY or [vision].api_key in config.toml");
        return ExitCode::FAILURE;
    };

    let browser = match CdpBrowser::launch(&app_config.browser).await {
        Ok(browser) => browser,
        Err(e) => {
            tracing::error!(error = %e, "browser launch failed");
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = browser.goto(&app_config.run.start_url).await {
        tracing::error!(url = %app_config.run.start_url, error = %e, "initial navigation failed");
        return ExitCode::FAILURE;
    }

    let vision = OpenAiVision::new(
        app_config.vision.api_base.clone(),
        api_key,
        app_config.vision.model.clone(),
    );

    let trace = if app_config.trace.enabled {
        TraceWriter::create(std::path::Path::new(&app_config.trace.base_dir))
    } else {
        TraceWriter::disabled()
    };

    // Ctrl-C requests cancellation; the loop aborts cleanly at its next
    // iteration boundary, never mid-action.
    let cancel = Arc::new(AtomicBool::new(false));
    {
        let cancel = Arc::clone(&cancel);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("ctrl-c received; cancelling after the current step");
                cancel.store(true, Ordering::Relaxed);
            }
        });
    }

    let navigator = match Navigator::new(
        Arc::new(browser),
        Arc::new(vision),
        NavigatorConfig::from_app(&app_config),
        trace,
        cancel,
    ) {
        Ok(nav) => nav,
        Err(e) => {
            tracing::error!(error = %e, "navigator setup failed");
            return ExitCode::FAILURE;
        }
    };

    let report = navigator.run().await;

    let rendered = match serde_json::to_string_pretty(&report) {
        Ok(json) => json,
        Err(e) => {
            tracing::error!(error = %e, "report serialization failed");
            return ExitCode::FAILURE;
        }
    };
    println!("{rendered}");
    if let Some(out) = cli.out {
        if let Err(e) = std::fs::write(&out, &rendered) {
            tracing::error!(path = %out.display(), error = %e, "failed to write report file");
        }
    }

    if report.succeeded() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
