pub mod error;

pub use error::{RenderError, Result};

use std::ffi::OsStr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use headless_chrome::browser::tab::RequestPausedDecision;
use headless_chrome::browser::transport::{SessionId, Transport};
use headless_chrome::protocol::cdp::Fetch::{
    events::RequestPausedEvent, FailRequest, RequestPattern, RequestStage,
};
use headless_chrome::protocol::cdp::Network::{ErrorReason, ResourceType};
use headless_chrome::{Browser, LaunchOptions, Tab};
use tracing::{debug, info};

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/129.0.0.0 Safari/537.36";

/// One Chromium process shared by all sessions of one site run.
/// Sessions are independent tabs with their own navigation state.
pub struct RenderClient {
    browser: Browser,
    default_timeout: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct RenderOptions {
    /// Explicit Chromium binary; falls back to the crate's own lookup.
    pub chrome_bin: Option<PathBuf>,
    /// Per-operation timeout applied to every session. Default 60s.
    pub timeout: Option<Duration>,
}

impl RenderClient {
    pub fn launch(options: RenderOptions) -> Result<Self> {
        let launch = LaunchOptions {
            headless: true,
            window_size: Some((1280, 800)),
            path: options.chrome_bin.clone(),
            // The pool outlives individual runs; don't let an idle browser
            // tear itself down underneath a warm detail session.
            idle_browser_timeout: Duration::from_secs(4 * 3600),
            args: vec![
                OsStr::new("--no-sandbox"),
                OsStr::new("--disable-gpu"),
                OsStr::new("--disable-dev-shm-usage"),
                OsStr::new("--disable-notifications"),
                OsStr::new("--mute-audio"),
                OsStr::new("--lang=en-US,en"),
            ],
            ..Default::default()
        };

        let browser = Browser::new(launch).map_err(|e| RenderError::Launch(e.to_string()))?;
        info!("Chromium launched");

        Ok(Self {
            browser,
            default_timeout: options.timeout.unwrap_or(Duration::from_secs(60)),
        })
    }

    /// Open a fresh tab with the crawler user agent and timeouts applied.
    pub fn new_session(&self) -> Result<RenderSession> {
        let tab = self.browser.new_tab()?;
        tab.set_default_timeout(self.default_timeout);
        tab.set_user_agent(USER_AGENT, Some("en-US,en;q=0.9"), None)?;
        Ok(RenderSession { tab })
    }
}

/// A stateful rendering session: one tab, one cookie/navigation context.
pub struct RenderSession {
    tab: Arc<Tab>,
}

impl RenderSession {
    /// Abort stylesheet/font/media/image requests before they are fetched.
    /// Listing pages only need the DOM; skipping assets cuts page time
    /// substantially on image-heavy auction grids.
    pub fn block_heavy_resources(&self) -> Result<()> {
        let patterns = vec![RequestPattern {
            url_pattern: Some("*".to_string()),
            resource_Type: None,
            request_stage: Some(RequestStage::Request),
        }];
        self.tab.enable_fetch(Some(&patterns), None)?;

        let interceptor = Arc::new(
            |_transport: Arc<Transport>, _session_id: SessionId, event: RequestPausedEvent| {
                let blocked = matches!(
                    event.params.resource_Type,
                    ResourceType::Stylesheet
                        | ResourceType::Font
                        | ResourceType::Media
                        | ResourceType::Image
                );
                if blocked {
                    RequestPausedDecision::Fail(FailRequest {
                        request_id: event.params.request_id,
                        error_reason: ErrorReason::BlockedByClient,
                    })
                } else {
                    RequestPausedDecision::Continue(None)
                }
            },
        );
        self.tab.enable_request_interception(interceptor)?;
        Ok(())
    }

    /// Navigate and wait for the load to settle.
    pub fn navigate(&self, url: &str) -> Result<()> {
        debug!(url, "Navigating");
        self.tab
            .navigate_to(url)
            .and_then(|t| t.wait_until_navigated())
            .map_err(|e| RenderError::Navigation {
                url: url.to_string(),
                message: e.to_string(),
            })?;
        Ok(())
    }

    /// URL after redirects; the login flow compares this against the login
    /// page URL to detect an already-authenticated session.
    pub fn current_url(&self) -> String {
        self.tab.get_url()
    }

    /// Full serialized DOM of the current page.
    pub fn content(&self) -> Result<String> {
        Ok(self.tab.get_content()?)
    }

    /// Focus a field and type into it.
    pub fn fill(&self, selector: &str, text: &str) -> Result<()> {
        let field = self
            .tab
            .wait_for_element(selector)
            .map_err(|_| RenderError::ElementNotFound(selector.to_string()))?;
        field.click()?;
        self.tab.type_str(text)?;
        Ok(())
    }

    /// Click an element and wait for the resulting navigation.
    pub fn click_and_navigate(&self, selector: &str) -> Result<()> {
        let button = self
            .tab
            .wait_for_element(selector)
            .map_err(|_| RenderError::ElementNotFound(selector.to_string()))?;
        button.click()?;
        self.tab.wait_until_navigated()?;
        Ok(())
    }

    /// Click an element if it is present; used for post-login interstitials.
    pub fn click_if_present(&self, selector: &str) -> Result<bool> {
        match self.tab.find_element(selector) {
            Ok(button) => {
                button.click()?;
                Ok(true)
            }
            Err(_) => Ok(false),
        }
    }

    /// Wait until a selector matches, up to `timeout`. Returns whether it
    /// appeared; absence is a condition, not an error.
    pub fn wait_for(&self, selector: &str, timeout: Duration) -> bool {
        self.tab
            .wait_for_element_with_custom_timeout(selector, timeout)
            .is_ok()
    }

    /// Text content of the first match, if any.
    pub fn query_text(&self, selector: &str) -> Option<String> {
        let element = self.tab.find_element(selector).ok()?;
        let text = element.get_inner_text().ok()?;
        let trimmed = text.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    }
}
