use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lotharvest_common::HarvestError;
use render_client::RenderSession;
use tracing::debug;

pub const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/129.0.0.0 Safari/537.36";

/// Uniform page access over the two transport kinds. A failed operation
/// returns an error for that unit only; the underlying session stays
/// usable.
#[async_trait]
pub trait PageTransport: Send + Sync {
    /// Navigate to or GET a URL and return the resulting document.
    async fn fetch(&self, url: &str) -> Result<String, HarvestError>;

    /// Submit a form and return the resulting document. For HTTP sessions
    /// the fields are form names; for rendering sessions they are input
    /// selectors.
    async fn submit_form(
        &self,
        url: &str,
        fields: &[(String, String)],
    ) -> Result<String, HarvestError>;
}

/// Lower-level request surface shared by the plain HTTP session and the
/// proxy-bound clients: status-aware GET and form POST. Login flows need
/// the status codes the `PageTransport` surface hides.
#[async_trait]
pub trait WireClient: Send + Sync {
    async fn get(&self, url: &str) -> Result<(u16, String), HarvestError>;

    async fn post_form(
        &self,
        url: &str,
        fields: &[(String, String)],
        referer: Option<&str>,
    ) -> Result<(u16, String), HarvestError>;
}

// --- HTTP session ---

/// Cookie-jar-backed HTTP session. One per listing/detail session on
/// non-proxied sites; reqwest's jar carries the login cookies.
pub struct HttpSession {
    client: reqwest::Client,
    jar: Arc<reqwest::cookie::Jar>,
}

impl HttpSession {
    pub fn new(timeout: Duration) -> Result<Self, HarvestError> {
        let jar = Arc::new(reqwest::cookie::Jar::default());
        let client = reqwest::Client::builder()
            .cookie_provider(jar.clone())
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|e| HarvestError::Transport(e.to_string()))?;
        Ok(Self { client, jar })
    }

    /// Seed a preference cookie (page size, language) before the first
    /// listing request.
    pub fn seed_cookie(&self, base_url: &str, cookie: &str) {
        if let Ok(url) = base_url.parse::<url::Url>() {
            self.jar.add_cookie_str(cookie, &url);
        }
    }
}

#[async_trait]
impl WireClient for HttpSession {
    async fn get(&self, url: &str) -> Result<(u16, String), HarvestError> {
        let response = self
            .client
            .get(url)
            .header("Accept-Language", "en-US,en;q=0.9")
            .send()
            .await
            .map_err(|e| HarvestError::Transport(e.to_string()))?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| HarvestError::Transport(e.to_string()))?;
        Ok((status, body))
    }

    async fn post_form(
        &self,
        url: &str,
        fields: &[(String, String)],
        referer: Option<&str>,
    ) -> Result<(u16, String), HarvestError> {
        let mut request = self
            .client
            .post(url)
            .header("Accept-Language", "en-US,en;q=0.9")
            .form(fields);
        if let Some(referer) = referer {
            request = request.header("Referer", referer);
        }

        let response = request
            .send()
            .await
            .map_err(|e| HarvestError::Transport(e.to_string()))?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| HarvestError::Transport(e.to_string()))?;
        Ok((status, body))
    }
}

#[async_trait]
impl PageTransport for HttpSession {
    async fn fetch(&self, url: &str) -> Result<String, HarvestError> {
        let (status, body) = WireClient::get(self, url).await?;
        if status >= 400 {
            return Err(HarvestError::Transport(format!("{url} returned {status}")));
        }
        Ok(body)
    }

    async fn submit_form(
        &self,
        url: &str,
        fields: &[(String, String)],
    ) -> Result<String, HarvestError> {
        let (status, body) = self.post_form(url, fields, None).await?;
        if status >= 400 {
            return Err(HarvestError::Transport(format!(
                "form post to {url} returned {status}"
            )));
        }
        Ok(body)
    }
}

// --- Rendering session transport ---

/// Rendering-engine transport. Chromium calls are blocking, so each
/// operation hops to the blocking pool; the tab itself survives failures
/// and keeps its navigation/cookie state.
pub struct RenderTransport {
    session: Arc<RenderSession>,
    submit_selector: String,
}

impl RenderTransport {
    pub fn new(session: Arc<RenderSession>, submit_selector: &str) -> Self {
        Self {
            session,
            submit_selector: submit_selector.to_string(),
        }
    }

    pub fn session(&self) -> Arc<RenderSession> {
        self.session.clone()
    }
}

#[async_trait]
impl PageTransport for RenderTransport {
    async fn fetch(&self, url: &str) -> Result<String, HarvestError> {
        let session = self.session.clone();
        let url = url.to_string();
        tokio::task::spawn_blocking(move || {
            session.navigate(&url)?;
            session.content()
        })
        .await
        .map_err(|e| HarvestError::Transport(e.to_string()))?
        .map_err(|e| HarvestError::Transport(e.to_string()))
    }

    async fn submit_form(
        &self,
        url: &str,
        fields: &[(String, String)],
    ) -> Result<String, HarvestError> {
        let session = self.session.clone();
        let url = url.to_string();
        let submit = self.submit_selector.clone();
        let fields = fields.to_vec();
        tokio::task::spawn_blocking(move || {
            session.navigate(&url)?;
            for (selector, value) in &fields {
                session.fill(selector, value)?;
            }
            session.click_and_navigate(&submit)?;
            session.content()
        })
        .await
        .map_err(|e| HarvestError::Transport(e.to_string()))?
        .map_err(|e| HarvestError::Transport(e.to_string()))
    }
}

/// Pull a hidden-input value (e.g. a CSRF token) out of a login page.
pub fn input_value(html: &str, selector: &str) -> Option<String> {
    let document = scraper::Html::parse_document(html);
    let selector = scraper::Selector::parse(selector).ok()?;
    let element = document.select(&selector).next()?;
    let value = element.value().attr("value")?.to_string();
    debug!(len = value.len(), "Extracted hidden input value");
    (!value.is_empty()).then_some(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pulls_csrf_token_from_login_page() {
        let html = r#"<form><input type="hidden" name="_csrfToken" value="tok-123"></form>"#;
        assert_eq!(
            input_value(html, r#"input[name="_csrfToken"]"#),
            Some("tok-123".to_string())
        );
    }

    #[test]
    fn missing_token_yields_none() {
        let html = "<form><input name='other' value='x'></form>";
        assert_eq!(input_value(html, r#"input[name="_csrfToken"]"#), None);
    }
}
