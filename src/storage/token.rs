use anyhow::Result;
use reqwest::Client;
use std::future::Future;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use super::http::request_token;

/// Tokens are refreshed this long before they actually expire.
const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

#[derive(Debug)]
struct Cached<T> {
    value: T,
    expires_at: Instant,
}

/// Per-backend credential cache. The lock is held across a refresh so
/// concurrent uploads trigger at most one re-authentication.
#[derive(Debug)]
pub struct TokenCache<T = String> {
    inner: Mutex<Option<Cached<T>>>,
}

impl<T> Default for TokenCache<T> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(None),
        }
    }
}

impl<T: Clone> TokenCache<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get_or_refresh<F, Fut>(&self, refresh: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(T, Duration)>>,
    {
        let mut guard = self.inner.lock().await;
        if let Some(cached) = guard.as_ref() {
            if Instant::now() < cached.expires_at {
                return Ok(cached.value.clone());
            }
        }
        let (value, lifetime) = refresh().await?;
        let usable = lifetime.saturating_sub(EXPIRY_MARGIN).max(Duration::from_secs(1));
        *guard = Some(Cached {
            value: value.clone(),
            expires_at: Instant::now() + usable,
        });
        Ok(value)
    }

    pub async fn invalidate(&self) {
        *self.inner.lock().await = None;
    }
}

/// OAuth2 refresh-token grant.
#[derive(Debug, Clone)]
pub struct RefreshGrant {
    pub token_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub refresh_token: String,
    pub scope: Option<String>,
}

/// Bearer credentials for the OAuth backends: a refresh grant when one is
/// configured, otherwise a long-lived access token.
#[derive(Debug)]
pub struct BearerAuth {
    client: Client,
    static_token: Option<String>,
    grant: Option<RefreshGrant>,
    cache: TokenCache,
}

impl BearerAuth {
    pub fn new(client: Client, static_token: Option<String>, grant: Option<RefreshGrant>) -> Result<Self> {
        if static_token.is_none() && grant.is_none() {
            anyhow::bail!("missing required setting 'access_token' or 'refresh_token'");
        }
        Ok(Self {
            client,
            static_token,
            grant,
            cache: TokenCache::new(),
        })
    }

    pub async fn token(&self) -> Result<String> {
        let Some(grant) = &self.grant else {
            return self
                .static_token
                .clone()
                .ok_or_else(|| anyhow::anyhow!("no access token configured"));
        };
        self.cache
            .get_or_refresh(|| async {
                let mut form = vec![
                    ("grant_type", "refresh_token"),
                    ("refresh_token", grant.refresh_token.as_str()),
                    ("client_id", grant.client_id.as_str()),
                    ("client_secret", grant.client_secret.as_str()),
                ];
                if let Some(scope) = &grant.scope {
                    form.push(("scope", scope.as_str()));
                }
                request_token(&self.client, &grant.token_url, &form).await
            })
            .await
    }

    /// Drops a cached token after the server rejected it.
    pub async fn invalidate(&self) {
        self.cache.invalidate().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_token_is_reused_until_invalidated() -> anyhow::Result<()> {
        let cache: TokenCache = TokenCache::new();
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let refresh = move || async move {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, anyhow::Error>((format!("token-{}", n), Duration::from_secs(3600)))
        };

        assert_eq!(cache.get_or_refresh(refresh).await?, "token-0");
        assert_eq!(cache.get_or_refresh(refresh).await?, "token-0");
        cache.invalidate().await;
        assert_eq!(cache.get_or_refresh(refresh).await?, "token-1");
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_refresh_grant_is_exchanged_once() -> anyhow::Result<()> {
        use wiremock::matchers::{body_string_contains, method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth2/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "fresh",
                "expires_in": 3600
            })))
            .expect(1)
            .mount(&server)
            .await;

        let auth = BearerAuth::new(
            Client::new(),
            None,
            Some(RefreshGrant {
                token_url: format!("{}/oauth2/token", server.uri()),
                client_id: "id".into(),
                client_secret: "secret".into(),
                refresh_token: "r1".into(),
                scope: None,
            }),
        )?;
        assert_eq!(auth.token().await?, "fresh");
        assert_eq!(auth.token().await?, "fresh");
        Ok(())
    }

    #[test]
    fn test_bearer_auth_needs_credentials() {
        assert!(BearerAuth::new(Client::new(), None, None).is_err());
    }
}
