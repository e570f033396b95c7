//! Chrome as the host: one session tab, an injected agent per document.

pub mod agent;
pub mod host;
pub mod page;

use std::ffi::OsStr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use headless_chrome::{Browser, LaunchOptions, Tab};
use tracing::{info, warn};

pub use host::ChromeHost;
pub use page::ChromePage;

#[derive(Debug, Clone)]
pub struct BrowserOptions {
    /// DevTools endpoint of an already running Chrome, e.g. `http://127.0.0.1:9222`.
    pub debug_url: Option<String>,
    pub headless: bool,
    pub chrome_path: Option<PathBuf>,
    /// Persistent profile for a launched Chrome.
    pub profile_dir: PathBuf,
}

/// Browser session. Created once, the first tab is the guided one.
pub struct BrowserSession {
    _browser: Browser,
    pub tab: Arc<Tab>,
}

impl BrowserSession {
    pub fn launch(options: &BrowserOptions) -> Result<Self> {
        if let Some(url) = &options.debug_url {
            info!(%url, "attaching to running chrome");
            match Browser::connect(url.clone()) {
                Ok(browser) => {
                    let tab = first_tab(&browser)?;
                    return Ok(Self {
                        _browser: browser,
                        tab,
                    });
                }
                Err(e) => warn!(%url, "could not attach, launching instead: {}", e),
            }
        }

        std::fs::create_dir_all(&options.profile_dir).with_context(|| {
            format!("creating chrome profile at {}", options.profile_dir.display())
        })?;

        let launch = LaunchOptions {
            headless: options.headless,
            path: options.chrome_path.clone(),
            user_data_dir: Some(options.profile_dir.clone()),
            args: vec![
                OsStr::new("--no-first-run"),
                OsStr::new("--no-default-browser-check"),
                OsStr::new("--disable-infobars"),
                OsStr::new("--password-store=basic"),
            ],
            idle_browser_timeout: Duration::from_secs(60 * 60 * 24),
            ..Default::default()
        };

        info!(profile = %options.profile_dir.display(), "launching chrome");
        let browser = Browser::new(launch).map_err(|e| anyhow!("browser launch failed: {}", e))?;
        let tab = first_tab(&browser)?;
        info!("chrome ready");

        Ok(Self {
            _browser: browser,
            tab,
        })
    }
}

fn first_tab(browser: &Browser) -> Result<Arc<Tab>> {
    let existing = {
        let tabs = browser
            .get_tabs()
            .lock()
            .map_err(|_| anyhow!("tab list lock poisoned"))?;
        tabs.first().cloned()
    };
    match existing {
        Some(tab) => Ok(tab),
        None => browser.new_tab().context("opening a tab"),
    }
}
