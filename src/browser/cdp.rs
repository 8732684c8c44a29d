use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig as ChromeConfig};
use chromiumoxide::cdp::browser_protocol::input::{
    DispatchKeyEventParams, DispatchKeyEventType, DispatchMouseEventParams,
    DispatchMouseEventType, MouseButton,
};
use chromiumoxide::cdp::browser_protocol::page::CaptureScreenshotFormat;
use chromiumoxide::page::ScreenshotParams;
use chromiumoxide::Page;
use futures_util::StreamExt;
use tokio::task::JoinHandle;

use crate::browser::driver::BrowserDriver;
use crate::config::BrowserConfig;
use crate::errors::{NavError, NavResult};
use crate::vision::types::{Observation, ScrollDirection};

/// Real browser session over the Chrome DevTools Protocol. One page, one
/// session, owned by the navigation loop for the whole run.
pub struct CdpBrowser {
    page: Page,
    /// Owns the Chrome child process; kept alive for the session.
    _browser: Browser,
    /// Drives the CDP websocket until the browser goes away.
    _handler_task: JoinHandle<()>,
    viewport: (u32, u32),
    action_delay: Duration,
}

impl CdpBrowser {
    pub async fn launch(cfg: &BrowserConfig) -> NavResult<Self> {
        let mut builder = ChromeConfig::builder()
            .no_sandbox()
            .window_size(cfg.viewport_width, cfg.viewport_height);
        if !cfg.headless {
            builder = builder.with_head();
        }
        if let Some(path) = &cfg.chrome_executable {
            builder = builder.chrome_executable(path);
        }
        let chrome_config = builder
            .build()
            .map_err(|e| NavError::Driver(format!("browser config: {e}")))?;

        tracing::info!(
            headless = cfg.headless,
            viewport = %format!("{}x{}", cfg.viewport_width, cfg.viewport_height),
            "launching chrome"
        );
        let (browser, mut handler) = Browser::launch(chrome_config)
            .await
            .map_err(|e| NavError::Driver(format!("chrome launch: {e}")))?;

        let handler_task = tokio::spawn(async move { while handler.next().await.is_some() {} });

        let page = browser
            .new_page("about:blank")
            .await
            .map_err(|e| NavError::Driver(format!("new page: {e}")))?;

        Ok(Self {
            page,
            _browser: browser,
            _handler_task: handler_task,
            viewport: (cfg.viewport_width, cfg.viewport_height),
            action_delay: Duration::from_millis(cfg.action_delay_ms),
        })
    }

    /// Initial navigation to the run's start URL. The loop itself never
    /// navigates by URL; this is setup, done once by the caller.
    pub async fn goto(&self, url: &str) -> NavResult<()> {
        self.page
            .goto(url)
            .await
            .map_err(|e| NavError::Driver(format!("goto {url}: {e}")))?;
        let _ = self.page.wait_for_navigation().await;
        self.settle().await;
        Ok(())
    }

    async fn settle(&self) {
        tokio::time::sleep(self.action_delay).await;
    }

    async fn dispatch_key(&self, params: DispatchKeyEventParams) -> NavResult<()> {
        self.page
            .execute(params)
            .await
            .map_err(|e| NavError::Driver(format!("key event: {e}")))?;
        Ok(())
    }
}

#[async_trait]
impl BrowserDriver for CdpBrowser {
    async fn capture(&self) -> NavResult<Observation> {
        let url = self
            .page
            .url()
            .await
            .map_err(|e| NavError::Driver(format!("read url: {e}")))?
            .unwrap_or_default();
        let title = self.page.get_title().await.ok().flatten().unwrap_or_default();

        let params = ScreenshotParams::builder()
            .format(CaptureScreenshotFormat::Png)
            .full_page(false)
            .build();
        let screenshot = self
            .page
            .screenshot(params)
            .await
            .map_err(|e| NavError::Driver(format!("screenshot: {e}")))?;

        Ok(Observation {
            url,
            title,
            screenshot,
            captured_at: chrono::Utc::now(),
        })
    }

    async fn click(&self, x: u32, y: u32) -> NavResult<()> {
        let (x, y) = (x as f64, y as f64);

        let move_params = DispatchMouseEventParams::builder()
            .r#type(DispatchMouseEventType::MouseMoved)
            .x(x)
            .y(y)
            .build()
            .map_err(NavError::Driver)?;
        self.page
            .execute(move_params)
            .await
            .map_err(|e| NavError::Driver(format!("mouse move: {e}")))?;

        let down = DispatchMouseEventParams::builder()
            .r#type(DispatchMouseEventType::MousePressed)
            .x(x)
            .y(y)
            .button(MouseButton::Left)
            .click_count(1)
            .build()
            .map_err(NavError::Driver)?;
        self.page
            .execute(down)
            .await
            .map_err(|e| NavError::Driver(format!("mouse down: {e}")))?;

        // Real clicks are not instantaneous; some widgets ignore 0ms ones.
        tokio::time::sleep(Duration::from_millis(40)).await;

        let up = DispatchMouseEventParams::builder()
            .r#type(DispatchMouseEventType::MouseReleased)
            .x(x)
            .y(y)
            .button(MouseButton::Left)
            .click_count(1)
            .build()
            .map_err(NavError::Driver)?;
        self.page
            .execute(up)
            .await
            .map_err(|e| NavError::Driver(format!("mouse up: {e}")))?;

        self.settle().await;
        Ok(())
    }

    async fn type_text(&self, text: &str) -> NavResult<()> {
        for ch in text.chars() {
            if ch == '\n' {
                self.press_key("Enter").await?;
                continue;
            }
            let params = DispatchKeyEventParams::builder()
                .r#type(DispatchKeyEventType::Char)
                .text(ch.to_string())
                .build()
                .map_err(NavError::Driver)?;
            self.dispatch_key(params).await?;
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        self.settle().await;
        Ok(())
    }

    async fn press_key(&self, key: &str) -> NavResult<()> {
        // Key name → (code, char text, virtual key code). Unknown keys go
        // through with just the name.
        let (code, text, vk) = match key {
            "Enter" => ("Enter", Some("\r"), Some(13)),
            "Tab" => ("Tab", Some("\t"), Some(9)),
            "Escape" => ("Escape", None, Some(27)),
            "Backspace" => ("Backspace", None, Some(8)),
            "Delete" => ("Delete", None, Some(46)),
            "ArrowUp" => ("ArrowUp", None, Some(38)),
            "ArrowDown" => ("ArrowDown", None, Some(40)),
            "PageUp" => ("PageUp", None, Some(33)),
            "PageDown" => ("PageDown", None, Some(34)),
            "Home" => ("Home", None, Some(36)),
            "End" => ("End", None, Some(35)),
            _ => (key, None, None),
        };

        let mut down = DispatchKeyEventParams::builder()
            .r#type(DispatchKeyEventType::KeyDown)
            .key(key.to_string())
            .code(code.to_string());
        if let Some(vk) = vk {
            down = down
                .windows_virtual_key_code(vk)
                .native_virtual_key_code(vk);
        }
        self.dispatch_key(down.build().map_err(NavError::Driver)?).await?;

        if let Some(text) = text {
            let char_event = DispatchKeyEventParams::builder()
                .r#type(DispatchKeyEventType::Char)
                .key(key.to_string())
                .code(code.to_string())
                .text(text.to_string())
                .build()
                .map_err(NavError::Driver)?;
            self.dispatch_key(char_event).await?;
        }

        let mut up = DispatchKeyEventParams::builder()
            .r#type(DispatchKeyEventType::KeyUp)
            .key(key.to_string())
            .code(code.to_string());
        if let Some(vk) = vk {
            up = up.windows_virtual_key_code(vk).native_virtual_key_code(vk);
        }
        self.dispatch_key(up.build().map_err(NavError::Driver)?).await?;

        self.settle().await;
        Ok(())
    }

    async fn scroll(&self, direction: ScrollDirection, amount: u32) -> NavResult<()> {
        let delta = match direction {
            ScrollDirection::Down => amount as i64,
            ScrollDirection::Up => -(amount as i64),
        };
        self.page
            .evaluate(format!("window.scrollBy(0, {delta})"))
            .await
            .map_err(|e| NavError::Driver(format!("scroll: {e}")))?;
        self.settle().await;
        Ok(())
    }

    async fn go_back(&self) -> NavResult<()> {
        self.page
            .evaluate("window.history.back()")
            .await
            .map_err(|e| NavError::Driver(format!("history back: {e}")))?;
        let _ = self.page.wait_for_navigation().await;
        self.settle().await;
        Ok(())
    }

    fn viewport(&self) -> (u32, u32) {
        self.viewport
    }
}
