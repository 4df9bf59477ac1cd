use std::sync::Mutex;

use cookie_store::CookieStore;
use tracing::debug;
use url::Url;

/// Explicit cookie jar for proxy-bound clients.
///
/// Proxy transports do not share the host client's implicit cookie
/// handling, so session state lives here as a value object with two
/// explicit steps: attach current cookies before a request, absorb
/// `Set-Cookie` values after the response. Each egress identity owns its
/// own store; concurrent requests on different identities never see each
/// other's session.
#[derive(Default)]
pub struct SessionCookies {
    store: Mutex<CookieStore>,
}

impl SessionCookies {
    pub fn new() -> Self {
        Self::default()
    }

    /// `Cookie` header value for a request to `url`, or `None` when the
    /// store holds nothing applicable.
    pub fn attach(&self, url: &Url) -> Option<String> {
        let store = self.store.lock().expect("cookie store poisoned");
        let header = store
            .get_request_values(url)
            .map(|(name, value)| format!("{name}={value}"))
            .collect::<Vec<_>>()
            .join("; ");
        (!header.is_empty()).then_some(header)
    }

    /// Absorb one response's `Set-Cookie` header values. Malformed cookies
    /// are skipped; the rest of the response still counts.
    pub fn absorb<'a>(&self, url: &Url, set_cookie_values: impl Iterator<Item = &'a str>) {
        let mut store = self.store.lock().expect("cookie store poisoned");
        for value in set_cookie_values {
            if let Err(err) = store.parse(value, url) {
                debug!(%url, error = %err, "Ignoring unparseable Set-Cookie value");
            }
        }
    }

    /// Seed a cookie directly, for sites that expect preference cookies
    /// (result page size, language) to exist before the first listing
    /// request.
    pub fn seed(&self, url: &Url, cookie: &str) {
        let mut store = self.store.lock().expect("cookie store poisoned");
        if let Err(err) = store.parse(cookie, url) {
            debug!(%url, cookie, error = %err, "Failed to seed cookie");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn site_url() -> Url {
        Url::parse("https://auctions.example.com/client/items").unwrap()
    }

    #[test]
    fn absorbed_cookies_attach_to_later_requests() {
        let cookies = SessionCookies::new();
        let url = site_url();

        assert_eq!(cookies.attach(&url), None);

        cookies.absorb(
            &url,
            ["session_id=abc123; Path=/", "lang=en; Path=/"].into_iter(),
        );

        let header = cookies.attach(&url).unwrap();
        assert!(header.contains("session_id=abc123"));
        assert!(header.contains("lang=en"));
    }

    #[test]
    fn malformed_set_cookie_is_skipped() {
        let cookies = SessionCookies::new();
        let url = site_url();

        cookies.absorb(&url, ["", "valid=1; Path=/"].into_iter());

        let header = cookies.attach(&url).unwrap();
        assert_eq!(header, "valid=1");
    }

    #[test]
    fn stores_are_not_shared_between_identities() {
        let url = site_url();
        let first = SessionCookies::new();
        let second = SessionCookies::new();

        first.absorb(&url, ["session_id=first; Path=/"].into_iter());

        assert!(first.attach(&url).is_some());
        assert_eq!(second.attach(&url), None);
    }
}
