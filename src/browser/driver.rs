use async_trait::async_trait;

use crate::errors::NavResult;
use crate::vision::types::{Observation, ScrollDirection};

/// The narrow surface the navigation loop needs from a browser session.
/// Every call blocks until the browser has processed it; failures are
/// `NavError::Driver` and the loop owns the retry policy.
#[async_trait]
pub trait BrowserDriver: Send + Sync {
    /// Fresh snapshot of the current page: URL, title, viewport screenshot.
    async fn capture(&self) -> NavResult<Observation>;

    /// Move the mouse to the point and click it.
    async fn click(&self, x: u32, y: u32) -> NavResult<()>;

    /// Type into whatever currently has focus (i.e. the last-clicked target).
    async fn type_text(&self, text: &str) -> NavResult<()>;

    async fn press_key(&self, key: &str) -> NavResult<()>;

    async fn scroll(&self, direction: ScrollDirection, amount: u32) -> NavResult<()>;

    async fn go_back(&self) -> NavResult<()>;

    fn viewport(&self) -> (u32, u32);
}
