use std::path::{Path, PathBuf};
use std::time::Duration;

use chromiumoxide::cdp::browser_protocol::page::CaptureScreenshotFormat;
use chromiumoxide::page::ScreenshotParams;
use chromiumoxide::{Browser, BrowserConfig, Page};
use futures::StreamExt;
use hubsnap_core::AppError;
use hubsnap_core::pool::DriverFactory;

/// One headless Chromium process driven over the Chrome DevTools
/// Protocol. Each pool slot owns its own process, so a crashed renderer
/// only costs one slot.
pub struct BrowserDriver {
    browser: Browser,
    handler_task: tokio::task::JoinHandle<()>,
    timeout: Duration,
}

impl BrowserDriver {
    /// Open `url` in a new tab and wait for `<body>` to render.
    /// The caller closes the page via [`Self::close_page`].
    pub async fn open(&self, url: &str) -> Result<Page, AppError> {
        let timeout = self.timeout;
        let result = tokio::time::timeout(timeout, async {
            let page = self
                .browser
                .new_page(url)
                .await
                .map_err(|e| AppError::Scrape(format!("Failed to navigate to {url}: {e}")))?;

            // Minimal signal that the page rendered its main content.
            page.find_element("body")
                .await
                .map_err(|e| AppError::Scrape(format!("Page did not render body: {e}")))?;

            Ok::<Page, AppError>(page)
        })
        .await;

        match result {
            Ok(inner) => inner,
            Err(_) => Err(AppError::Timeout(timeout.as_secs())),
        }
    }

    /// Fetch the fully rendered DOM of `url`, closing the tab afterwards.
    pub async fn fetch(&self, url: &str) -> Result<String, AppError> {
        let page = self.open(url).await?;
        let html = page
            .content()
            .await
            .map_err(|e| AppError::Scrape(format!("Failed to read page content: {e}")));
        Self::close_page(page).await;
        html
    }

    /// Full-page PNG screenshot of an open page.
    pub async fn screenshot(&self, page: &Page, path: &Path) -> Result<(), AppError> {
        page.save_screenshot(
            ScreenshotParams::builder()
                .format(CaptureScreenshotFormat::Png)
                .full_page(true)
                .build(),
            path,
        )
        .await
        .map_err(|e| AppError::Scrape(format!("Screenshot failed: {e}")))?;
        Ok(())
    }

    pub async fn close_page(page: Page) {
        let _ = page.close().await;
    }
}

/// Launches and supervises [`BrowserDriver`]s for the pool.
#[derive(Debug, Clone)]
pub struct BrowserDriverFactory {
    timeout: Duration,
}

impl Default for BrowserDriverFactory {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
        }
    }
}

impl BrowserDriverFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Navigation timeout per page load.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Tries to locate the real Chrome/Chromium binary.
    ///
    /// Snap-packaged Chromium exposes a wrapper that strips standard
    /// Chrome CLI flags, breaking headless mode, so the real binary
    /// inside the snap is preferred, then well-known system paths. An
    /// explicit `CHROME_BIN` override wins. `None` lets chromiumoxide
    /// do its own lookup.
    fn find_chrome_binary() -> Option<PathBuf> {
        if let Ok(p) = std::env::var("CHROME_BIN") {
            let path = PathBuf::from(&p);
            if path.exists() {
                return Some(path);
            }
        }

        let candidates: &[&str] = &[
            // Snap (Ubuntu default)
            "/snap/chromium/current/usr/lib/chromium-browser/chrome",
            // Flatpak
            "/var/lib/flatpak/exports/bin/org.chromium.Chromium",
            // Common apt / manual installs
            "/usr/bin/google-chrome-stable",
            "/usr/bin/google-chrome",
            "/usr/bin/chromium",
            "/usr/bin/chromium-browser",
        ];
        candidates.iter().map(PathBuf::from).find(|p| p.exists())
    }
}

impl DriverFactory for BrowserDriverFactory {
    type Driver = BrowserDriver;

    async fn create(&self) -> Result<BrowserDriver, AppError> {
        let mut builder = BrowserConfig::builder().no_sandbox().disable_default_args();

        if let Some(bin) = Self::find_chrome_binary() {
            tracing::info!("Using Chrome binary: {}", bin.display());
            builder = builder.chrome_executable(bin);
        }

        let config = builder
            .arg("--headless=new")
            .arg("--disable-gpu")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-extensions")
            .arg("--disable-popup-blocking")
            .arg("--disable-translate")
            .arg("--no-first-run")
            .build()
            .map_err(|e| AppError::Browser(format!("Browser config error: {e}")))?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| AppError::Browser(format!("Failed to launch browser: {e}")))?;

        // The CDP handler must be polled continuously for the connection to work.
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    tracing::warn!("Browser CDP handler error: {event:?}");
                    break;
                }
            }
        });

        Ok(BrowserDriver {
            browser,
            handler_task,
            timeout: self.timeout,
        })
    }

    async fn probe(&self, driver: &mut BrowserDriver) -> bool {
        driver.browser.version().await.is_ok()
    }

    async fn teardown(&self, mut driver: BrowserDriver) -> Result<(), AppError> {
        let close = driver
            .browser
            .close()
            .await
            .map_err(|e| AppError::Browser(format!("Browser close failed: {e}")));
        let _ = driver.browser.wait().await;
        driver.handler_task.abort();
        close.map(|_| ())
    }
}
