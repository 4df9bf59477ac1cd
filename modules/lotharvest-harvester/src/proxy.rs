use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use lotharvest_common::config::ProxyDescriptor;
use lotharvest_common::HarvestError;
use reqwest::header::{ACCEPT_LANGUAGE, COOKIE, LOCATION, SET_COOKIE};
use reqwest::redirect::Policy;
use reqwest::Method;
use tracing::{debug, info};
use url::Url;

use crate::cookies::SessionCookies;
use crate::transport::{PageTransport, WireClient, USER_AGENT};

const MAX_REDIRECTS: usize = 5;

/// One egress identity: a proxy-bound (or direct) HTTP client with its own
/// explicit cookie store and login state. Created once at startup, never
/// destroyed during a run.
pub struct ProxyClient {
    pub index: usize,
    label: String,
    client: reqwest::Client,
    cookies: SessionCookies,
    logged_in_at: Mutex<Option<Instant>>,
}

impl ProxyClient {
    fn build(index: usize, proxy: Option<&ProxyDescriptor>, timeout: Duration) -> Result<Self, HarvestError> {
        let mut builder = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            // Redirects are followed manually so every hop's Set-Cookie is
            // absorbed into the explicit store.
            .redirect(Policy::none());

        let label = match proxy {
            Some(descriptor) => {
                builder = builder.proxy(
                    reqwest::Proxy::all(descriptor.url())
                        .map_err(|e| HarvestError::Transport(e.to_string()))?,
                );
                format!("proxy({})", descriptor.host)
            }
            None => "direct".to_string(),
        };

        Ok(Self {
            index,
            label,
            client: builder
                .build()
                .map_err(|e| HarvestError::Transport(e.to_string()))?,
            cookies: SessionCookies::new(),
            logged_in_at: Mutex::new(None),
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn cookies(&self) -> &SessionCookies {
        &self.cookies
    }

    pub fn needs_login(&self, ttl: Duration) -> bool {
        let guard = self.logged_in_at.lock().expect("login state poisoned");
        match *guard {
            Some(at) => at.elapsed() >= ttl,
            None => true,
        }
    }

    pub fn mark_logged_in(&self) {
        let mut guard = self.logged_in_at.lock().expect("login state poisoned");
        *guard = Some(Instant::now());
    }

    /// Issue one request, attaching cookies before every hop and absorbing
    /// `Set-Cookie` after every response, following redirects as GET.
    async fn request(
        &self,
        method: Method,
        url: &str,
        form: Option<&[(String, String)]>,
        referer: Option<&str>,
    ) -> Result<(u16, String), HarvestError> {
        let mut current =
            Url::parse(url).map_err(|e| HarvestError::Transport(format!("{url}: {e}")))?;
        let mut method = method;
        let mut form = form.map(|fields| fields.to_vec());

        for _ in 0..=MAX_REDIRECTS {
            let mut request = self
                .client
                .request(method.clone(), current.clone())
                .header(ACCEPT_LANGUAGE, "en-US,en;q=0.9");

            if let Some(header) = self.cookies.attach(&current) {
                request = request.header(COOKIE, header);
            }
            if let Some(fields) = &form {
                request = request.form(fields.as_slice());
                if let Some(referer) = referer {
                    request = request.header("Referer", referer);
                }
            }

            let response = request
                .send()
                .await
                .map_err(|e| HarvestError::Transport(e.to_string()))?;

            self.cookies.absorb(
                &current,
                response
                    .headers()
                    .get_all(SET_COOKIE)
                    .iter()
                    .filter_map(|v| v.to_str().ok()),
            );

            let status = response.status();
            if status.is_redirection() {
                let Some(location) = response
                    .headers()
                    .get(LOCATION)
                    .and_then(|v| v.to_str().ok())
                else {
                    return Ok((status.as_u16(), String::new()));
                };
                current = current
                    .join(location)
                    .map_err(|e| HarvestError::Transport(format!("bad redirect: {e}")))?;
                debug!(client = %self.label, to = %current, "Following redirect");
                method = Method::GET;
                form = None;
                continue;
            }

            let body = response
                .text()
                .await
                .map_err(|e| HarvestError::Transport(e.to_string()))?;
            return Ok((status.as_u16(), body));
        }

        Err(HarvestError::Transport(format!(
            "{url}: more than {MAX_REDIRECTS} redirects"
        )))
    }
}

#[async_trait]
impl WireClient for ProxyClient {
    async fn get(&self, url: &str) -> Result<(u16, String), HarvestError> {
        self.request(Method::GET, url, None, None).await
    }

    async fn post_form(
        &self,
        url: &str,
        fields: &[(String, String)],
        referer: Option<&str>,
    ) -> Result<(u16, String), HarvestError> {
        self.request(Method::POST, url, Some(fields), referer).await
    }
}

// --- Rotator ---

/// Round-robin pool over all egress identities. Index 0 is always the
/// direct (no-proxy) client.
pub struct ProxyRotator {
    clients: Vec<Arc<ProxyClient>>,
    cursor: AtomicUsize,
}

impl ProxyRotator {
    pub fn new(proxies: &[ProxyDescriptor], timeout: Duration) -> Result<Self, HarvestError> {
        let mut clients = vec![Arc::new(ProxyClient::build(0, None, timeout)?)];
        for (i, descriptor) in proxies.iter().enumerate() {
            clients.push(Arc::new(ProxyClient::build(i + 1, Some(descriptor), timeout)?));
        }
        info!(clients = clients.len(), "Proxy rotator ready");
        Ok(Self {
            clients,
            cursor: AtomicUsize::new(0),
        })
    }

    pub fn next_client(&self) -> Arc<ProxyClient> {
        let i = self.cursor.fetch_add(1, Ordering::Relaxed) % self.clients.len();
        self.clients[i].clone()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn clients(&self) -> &[Arc<ProxyClient>] {
        &self.clients
    }
}

// --- Rotating transport ---

/// Performs a login against one specific egress client. Idempotent; a
/// redundant login is harmless.
#[async_trait]
pub trait ClientLogin: Send + Sync {
    async fn login(&self, client: &ProxyClient) -> Result<(), HarvestError>;
}

/// PageTransport that spreads fetches over the rotator, logging each
/// client in on first use or TTL expiry.
pub struct RotatingTransport {
    rotator: Arc<ProxyRotator>,
    login: Arc<dyn ClientLogin>,
    ttl: Duration,
}

impl RotatingTransport {
    pub fn new(rotator: Arc<ProxyRotator>, login: Arc<dyn ClientLogin>, ttl: Duration) -> Self {
        Self { rotator, login, ttl }
    }
}

#[async_trait]
impl PageTransport for RotatingTransport {
    async fn fetch(&self, url: &str) -> Result<String, HarvestError> {
        let client = self.rotator.next_client();
        if client.needs_login(self.ttl) {
            self.login.login(&client).await?;
            client.mark_logged_in();
        }

        let (status, body) = client.get(url).await?;
        if status >= 400 {
            return Err(HarvestError::Transport(format!(
                "{url} returned {status} via {}",
                client.label()
            )));
        }
        Ok(body)
    }

    async fn submit_form(
        &self,
        url: &str,
        fields: &[(String, String)],
    ) -> Result<String, HarvestError> {
        let client = self.rotator.next_client();
        if client.needs_login(self.ttl) {
            self.login.login(&client).await?;
            client.mark_logged_in();
        }

        let (status, body) = client.post_form(url, fields, None).await?;
        if status >= 400 {
            return Err(HarvestError::Transport(format!(
                "form post to {url} returned {status} via {}",
                client.label()
            )));
        }
        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptors(n: usize) -> Vec<ProxyDescriptor> {
        (0..n)
            .map(|i| ProxyDescriptor {
                host: format!("10.0.0.{}", i + 1),
                port: 3128,
            })
            .collect()
    }

    #[test]
    fn direct_client_is_index_zero() {
        let rotator = ProxyRotator::new(&descriptors(2), Duration::from_secs(5)).unwrap();
        assert_eq!(rotator.len(), 3);
        assert_eq!(rotator.clients()[0].label(), "direct");
    }

    #[test]
    fn rotation_is_round_robin() {
        let rotator = ProxyRotator::new(&descriptors(2), Duration::from_secs(5)).unwrap();
        let order: Vec<usize> = (0..7).map(|_| rotator.next_client().index).collect();
        assert_eq!(order, vec![0, 1, 2, 0, 1, 2, 0]);
    }

    #[test]
    fn fresh_client_needs_login_until_marked() {
        let rotator = ProxyRotator::new(&[], Duration::from_secs(5)).unwrap();
        let client = rotator.next_client();
        let ttl = Duration::from_secs(3600);

        assert!(client.needs_login(ttl));
        client.mark_logged_in();
        assert!(!client.needs_login(ttl));
        assert!(client.needs_login(Duration::ZERO));
    }
}
