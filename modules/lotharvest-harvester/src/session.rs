use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::try_join_all;
use lotharvest_common::config::Credentials;
use lotharvest_common::{Config, HarvestError};
use render_client::{RenderClient, RenderOptions, RenderSession};
use tracing::{debug, info};

use crate::profiles::{LoginProfile, SiteProfile, TransportKind};
use crate::proxy::{ClientLogin, ProxyClient, ProxyRotator, RotatingTransport};
use crate::retry::RetryPolicy;
use crate::traits::SessionProvider;
use crate::transport::{input_value, HttpSession, PageTransport, RenderTransport, WireClient};

/// Cached login checks stay valid this long; inside the window repeated
/// `ensure_logged_in` calls don't touch the site.
const LOGIN_CHECK_INTERVAL: Duration = Duration::from_secs(5 * 60);

fn render_err(err: render_client::RenderError) -> HarvestError {
    HarvestError::Transport(err.to_string())
}

// ---------------------------------------------------------------------------
// Form login flow (HTTP sessions and proxy clients)
// ---------------------------------------------------------------------------

/// Credential-form login over any wire client. Fetches the login page for
/// a CSRF token when the site uses one, posts the form, then verifies the
/// configured check URLs all answer 200.
pub struct FormLoginFlow {
    profile: &'static SiteProfile,
    credentials: Credentials,
}

impl FormLoginFlow {
    pub fn new(profile: &'static SiteProfile, credentials: Credentials) -> Self {
        Self {
            profile,
            credentials,
        }
    }

    /// Whether the session behind `wire` is currently authenticated.
    pub async fn check(&self, wire: &dyn WireClient) -> bool {
        let LoginProfile::Form { check_urls, .. } = self.profile.login else {
            return false;
        };
        for url in check_urls {
            match wire.get(url).await {
                Ok((200, _)) => {}
                _ => return false,
            }
        }
        true
    }

    pub async fn login_via(&self, wire: &dyn WireClient) -> Result<(), HarvestError> {
        let LoginProfile::Form {
            page_url,
            post_url,
            user_field,
            password_field,
            extra_fields,
            csrf_selector,
            ..
        } = self.profile.login
        else {
            return Err(HarvestError::Transport(
                "form login invoked for a rendered-login site".to_string(),
            ));
        };

        if self.check(wire).await {
            debug!(site = self.profile.site_id, "Already logged in, session is valid");
            return Ok(());
        }

        info!(site = self.profile.site_id, "Logging in");
        let (status, body) = wire.get(page_url).await?;
        if status >= 400 {
            return Err(HarvestError::Transport(format!(
                "login page returned {status}"
            )));
        }

        let mut fields = vec![
            (user_field.to_string(), self.credentials.user_id.clone()),
            (password_field.to_string(), self.credentials.password.clone()),
        ];
        for (name, value) in extra_fields {
            fields.push((name.to_string(), value.to_string()));
        }
        if let Some((selector, field_name)) = csrf_selector {
            let token = input_value(&body, selector).ok_or_else(|| {
                HarvestError::Transport("CSRF token not found on login page".to_string())
            })?;
            fields.push((field_name.to_string(), token));
        }

        let (status, _) = wire.post_form(post_url, &fields, Some(page_url)).await?;
        if status >= 400 {
            return Err(HarvestError::Transport(format!(
                "login post returned {status}"
            )));
        }

        if !self.check(wire).await {
            return Err(HarvestError::Transport(
                "login verification failed".to_string(),
            ));
        }

        info!(site = self.profile.site_id, "Login successful");
        Ok(())
    }
}

#[async_trait]
impl ClientLogin for FormLoginFlow {
    async fn login(&self, client: &ProxyClient) -> Result<(), HarvestError> {
        self.login_via(client).await?;
        if let LoginProfile::Form { seed_cookies, .. } = self.profile.login {
            if let Ok(base) = url::Url::parse(self.profile.base_url) {
                for cookie in seed_cookies {
                    client.cookies().seed(&base, cookie);
                }
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Rendered login flow
// ---------------------------------------------------------------------------

/// Interactive login in a rendering session. Navigating to the login URL
/// while already authenticated redirects elsewhere; that short-circuits
/// the form entirely.
fn rendered_login(
    session: &RenderSession,
    profile: &SiteProfile,
    credentials: &Credentials,
) -> Result<(), HarvestError> {
    let LoginProfile::Rendered {
        page_url,
        user_selector,
        password_selector,
        submit_selector,
        interstitial_selector,
    } = profile.login
    else {
        return Err(HarvestError::Transport(
            "rendered login invoked for a form-login site".to_string(),
        ));
    };

    session
        .navigate(page_url)
        .map_err(render_err)?;

    if session.current_url().trim_end_matches('/') != page_url.trim_end_matches('/') {
        debug!(site = profile.site_id, "Already logged in, skipping login form");
        return Ok(());
    }

    session
        .fill(user_selector, &credentials.user_id)
        .and_then(|()| session.fill(password_selector, &credentials.password))
        .and_then(|()| session.click_and_navigate(submit_selector))
        .map_err(render_err)?;

    if let Some(selector) = interstitial_selector {
        let _ = session.click_if_present(selector);
    }

    if session.current_url().trim_end_matches('/') == page_url.trim_end_matches('/') {
        return Err(HarvestError::Transport(
            "still on the login page after submitting credentials".to_string(),
        ));
    }

    info!(site = profile.site_id, "Login successful");
    Ok(())
}

// ---------------------------------------------------------------------------
// Session manager
// ---------------------------------------------------------------------------

enum ListingHandle {
    Http(Arc<HttpSession>),
    Rendered(Arc<RenderTransport>),
    Rotating(Arc<RotatingTransport>),
}

impl ListingHandle {
    fn as_transport(&self) -> Arc<dyn PageTransport> {
        match self {
            ListingHandle::Http(t) => t.clone(),
            ListingHandle::Rendered(t) => t.clone(),
            ListingHandle::Rotating(t) => t.clone(),
        }
    }
}

struct DetailPool {
    transports: Vec<Arc<dyn PageTransport>>,
    logged_in_at: Instant,
}

/// Owns the login/session lifecycle for one site: a listing session plus
/// a small detail pool recycled as a group when its shared TTL lapses.
pub struct SessionManager {
    profile: &'static SiteProfile,
    credentials: Credentials,
    chrome_bin: Option<PathBuf>,
    rotator: Option<Arc<ProxyRotator>>,
    render: tokio::sync::Mutex<Option<Arc<RenderClient>>>,
    listing: tokio::sync::Mutex<Option<ListingHandle>>,
    details: tokio::sync::Mutex<Option<DetailPool>>,
    login_retry: RetryPolicy,
    check_cache: std::sync::Mutex<Option<(Instant, bool)>>,
}

impl SessionManager {
    pub fn new(
        profile: &'static SiteProfile,
        credentials: Credentials,
        config: &Config,
    ) -> Result<Self, HarvestError> {
        let rotator = if profile.use_proxies {
            Some(Arc::new(ProxyRotator::new(
                &config.proxies,
                profile.page_timeout(),
            )?))
        } else {
            None
        };

        Ok(Self {
            profile,
            credentials,
            chrome_bin: config.chrome_bin.clone().map(PathBuf::from),
            rotator,
            render: tokio::sync::Mutex::new(None),
            listing: tokio::sync::Mutex::new(None),
            details: tokio::sync::Mutex::new(None),
            // Login is expensive; one attempt, then the site run aborts.
            login_retry: RetryPolicy::once(),
            check_cache: std::sync::Mutex::new(None),
        })
    }

    pub fn rotator(&self) -> Option<Arc<ProxyRotator>> {
        self.rotator.clone()
    }

    fn session_error(&self, err: HarvestError) -> HarvestError {
        match err {
            fatal @ HarvestError::Session { .. } => fatal,
            other => HarvestError::session(self.profile.site_id, other.to_string()),
        }
    }

    async fn render_client(&self) -> Result<Arc<RenderClient>, HarvestError> {
        let mut guard = self.render.lock().await;
        if let Some(client) = guard.as_ref() {
            return Ok(client.clone());
        }

        let options = RenderOptions {
            chrome_bin: self.chrome_bin.clone(),
            timeout: Some(self.profile.page_timeout()),
        };
        let client = tokio::task::spawn_blocking(move || RenderClient::launch(options))
            .await
            .map_err(|e| HarvestError::Transport(e.to_string()))?
            .map_err(|e| HarvestError::Transport(e.to_string()))?;

        let client = Arc::new(client);
        *guard = Some(client.clone());
        Ok(client)
    }

    async fn open_rendered(&self, block_assets: bool) -> Result<Arc<RenderSession>, HarvestError> {
        let client = self.render_client().await?;
        let session = tokio::task::spawn_blocking(move || {
            let session = client.new_session()?;
            if block_assets {
                session.block_heavy_resources()?;
            }
            Ok::<_, render_client::RenderError>(session)
        })
        .await
        .map_err(|e| HarvestError::Transport(e.to_string()))?
        .map_err(render_err)?;
        Ok(Arc::new(session))
    }

    async fn login_rendered(&self, session: Arc<RenderSession>) -> Result<(), HarvestError> {
        let profile = self.profile;
        let credentials = self.credentials.clone();
        self.login_retry
            .run_or_abort("rendered login", move || {
                let session = session.clone();
                let credentials = credentials.clone();
                async move {
                    tokio::task::spawn_blocking(move || {
                        rendered_login(&session, profile, &credentials)
                    })
                    .await
                    .map_err(|e| HarvestError::Transport(e.to_string()))?
                }
            })
            .await
    }

    async fn create_listing(&self) -> Result<ListingHandle, HarvestError> {
        match (self.profile.transport, self.rotator.as_ref()) {
            (TransportKind::Rendered, _) => {
                let session = self.open_rendered(true).await?;
                self.login_rendered(session.clone()).await?;
                let submit = match self.profile.login {
                    LoginProfile::Rendered {
                        submit_selector, ..
                    } => submit_selector,
                    LoginProfile::Form { .. } => "",
                };
                Ok(ListingHandle::Rendered(Arc::new(RenderTransport::new(
                    session, submit,
                ))))
            }
            (TransportKind::Http, Some(rotator)) => {
                let flow = Arc::new(FormLoginFlow::new(self.profile, self.credentials.clone()));
                // The direct client logs in eagerly so credential problems
                // surface as a session failure, not mid-crawl.
                let direct = rotator.clients()[0].clone();
                let eager = flow.clone();
                self.login_retry
                    .run_or_abort("login", move || {
                        let flow = eager.clone();
                        let direct = direct.clone();
                        async move { flow.login(&direct).await }
                    })
                    .await?;
                rotator.clients()[0].mark_logged_in();

                Ok(ListingHandle::Rotating(Arc::new(RotatingTransport::new(
                    rotator.clone(),
                    flow,
                    self.profile.session_ttl(),
                ))))
            }
            (TransportKind::Http, None) => {
                let session = Arc::new(HttpSession::new(self.profile.page_timeout())?);
                let flow = FormLoginFlow::new(self.profile, self.credentials.clone());
                self.login_retry
                    .run_or_abort("login", || flow.login_via(&*session))
                    .await?;
                if let LoginProfile::Form { seed_cookies, .. } = self.profile.login {
                    for cookie in seed_cookies {
                        session.seed_cookie(self.profile.base_url, cookie);
                    }
                }
                Ok(ListingHandle::Http(session))
            }
        }
    }

    async fn create_detail_transport(&self) -> Result<Arc<dyn PageTransport>, HarvestError> {
        match self.profile.transport {
            TransportKind::Rendered => {
                let session = self.open_rendered(false).await?;
                self.login_rendered(session.clone()).await?;
                let submit = match self.profile.login {
                    LoginProfile::Rendered {
                        submit_selector, ..
                    } => submit_selector,
                    LoginProfile::Form { .. } => "",
                };
                Ok(Arc::new(RenderTransport::new(session, submit)) as Arc<dyn PageTransport>)
            }
            TransportKind::Http => {
                let session = Arc::new(HttpSession::new(self.profile.page_timeout())?);
                let flow = FormLoginFlow::new(self.profile, self.credentials.clone());
                self.login_retry
                    .run_or_abort("detail login", || flow.login_via(&*session))
                    .await?;
                Ok(session as Arc<dyn PageTransport>)
            }
        }
    }

    /// Refresh the listing session's authenticated state, using the cached
    /// check when it is fresh enough.
    pub async fn ensure_logged_in(&self) -> Result<bool, HarvestError> {
        let guard = self.listing.lock().await;
        let Some(handle) = guard.as_ref() else {
            return Ok(false);
        };

        let cached = {
            let cache = self.check_cache.lock().expect("check cache poisoned");
            cache.and_then(|(at, ok)| (at.elapsed() < LOGIN_CHECK_INTERVAL && ok).then_some(ok))
        };
        if let Some(ok) = cached {
            debug!(site = self.profile.site_id, "Using cached login check result");
            return Ok(ok);
        }

        let ok = match handle {
            ListingHandle::Http(session) => {
                let flow = FormLoginFlow::new(self.profile, self.credentials.clone());
                flow.check(&**session).await
            }
            // Rendered and rotating sessions re-authenticate on use; their
            // TTLs govern recycling instead of a check endpoint.
            ListingHandle::Rendered(_) | ListingHandle::Rotating(_) => true,
        };

        let mut cache = self.check_cache.lock().expect("check cache poisoned");
        *cache = Some((Instant::now(), ok));
        Ok(ok)
    }

    /// Drop the listing session and cached check so the next acquisition
    /// starts from a clean login.
    pub async fn invalidate(&self) {
        let mut guard = self.listing.lock().await;
        *guard = None;
        let mut cache = self.check_cache.lock().expect("check cache poisoned");
        *cache = None;
    }
}

#[async_trait]
impl SessionProvider for SessionManager {
    async fn listing_transport(&self) -> Result<Arc<dyn PageTransport>, HarvestError> {
        let mut guard = self.listing.lock().await;
        if let Some(handle) = guard.as_ref() {
            return Ok(handle.as_transport());
        }

        let handle = self
            .create_listing()
            .await
            .map_err(|e| self.session_error(e))?;
        let transport = handle.as_transport();
        *guard = Some(handle);
        Ok(transport)
    }

    async fn detail_transport(&self, slot: usize) -> Result<Arc<dyn PageTransport>, HarvestError> {
        let mut guard = self.details.lock().await;

        let expired = guard
            .as_ref()
            .map(|pool| pool.logged_in_at.elapsed() >= self.profile.session_ttl())
            .unwrap_or(true);

        if expired {
            // Recycle as a group: every slot is discarded and relogged
            // together so pool members stay time-aligned.
            *guard = None;
            info!(
                site = self.profile.site_id,
                size = self.profile.detail_pool_size,
                "Recreating detail session pool"
            );
            let transports = try_join_all(
                (0..self.profile.detail_pool_size.max(1))
                    .map(|_| self.create_detail_transport()),
            )
            .await
            .map_err(|e| self.session_error(e))?;

            *guard = Some(DetailPool {
                transports,
                logged_in_at: Instant::now(),
            });
        }

        let pool = guard.as_ref().expect("detail pool just created");
        Ok(pool.transports[slot % pool.transports.len()].clone())
    }

    async fn close_listing(&self) {
        self.invalidate().await;
        debug!(site = self.profile.site_id, "Listing session closed");
    }
}
