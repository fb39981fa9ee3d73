//! Rotating client identities (user agent, proxy endpoint, cookies).
//!
//! The pool is process-wide and outlives individual runs. Fetches only ever
//! read identities through [`IdentityPool::next`]; the set itself is swapped
//! by the refresh routine under the same short-held lock.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Desktop browser user agents used when none are configured.
pub const DEFAULT_USER_AGENTS: [&str; 5] = [
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:89.0) Gecko/20100101 Firefox/89.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/14.1.1 Safari/605.1.15",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Edge/91.0.864.59",
];

/// A cookie sent with every request whose host matches `domain`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityCookie {
    pub name: String,
    pub value: String,
    /// Host suffix the cookie is scoped to. `None` sends it everywhere.
    #[serde(default)]
    pub domain: Option<String>,
}

impl IdentityCookie {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            domain: None,
        }
    }

    pub fn scoped_to(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    fn applies_to(&self, host: &str) -> bool {
        match &self.domain {
            None => true,
            Some(domain) => {
                let domain = domain.trim_start_matches('.');
                host == domain || host.ends_with(&format!(".{domain}"))
            }
        }
    }
}

/// One client persona presented to target servers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    pub user_agent: String,
    pub proxy: Option<String>,
    pub cookies: Vec<IdentityCookie>,
}

impl ClientIdentity {
    pub fn new(user_agent: impl Into<String>) -> Self {
        Self {
            user_agent: user_agent.into(),
            proxy: None,
            cookies: Vec::new(),
        }
    }

    pub fn with_proxy(mut self, proxy: impl Into<String>) -> Self {
        self.proxy = Some(proxy.into());
        self
    }

    pub fn with_cookies(mut self, cookies: Vec<IdentityCookie>) -> Self {
        self.cookies = cookies;
        self
    }

    /// Render the `Cookie` header value for `host`, if any cookie applies.
    pub fn cookie_header(&self, host: &str) -> Option<String> {
        let pairs: Vec<String> = self
            .cookies
            .iter()
            .filter(|c| c.applies_to(host))
            .map(|c| format!("{}={}", c.name, c.value))
            .collect();

        if pairs.is_empty() {
            None
        } else {
            Some(pairs.join("; "))
        }
    }
}

/// Combine user agents and proxies round-robin into identities.
///
/// Produces `max(user_agents, proxies)` identities so every value of the
/// longer list is used; all identities share the same cookie set.
pub fn build_identities(
    user_agents: &[String],
    proxies: &[String],
    cookies: &[IdentityCookie],
) -> Vec<ClientIdentity> {
    if user_agents.is_empty() {
        return Vec::new();
    }

    let count = user_agents.len().max(proxies.len());
    (0..count)
        .map(|i| {
            let mut identity = ClientIdentity::new(user_agents[i % user_agents.len()].clone())
                .with_cookies(cookies.to_vec());
            if !proxies.is_empty() {
                identity.proxy = Some(proxies[i % proxies.len()].clone());
            }
            identity
        })
        .collect()
}

#[derive(Debug)]
struct PoolInner {
    identities: Vec<Arc<ClientIdentity>>,
    cursor: usize,
}

/// Round-robin identity pool. Cloning yields another handle to the same pool.
#[derive(Debug, Clone)]
pub struct IdentityPool {
    inner: Arc<Mutex<PoolInner>>,
}

impl IdentityPool {
    /// Create a pool. An empty set falls back to [`DEFAULT_USER_AGENTS`].
    pub fn new(identities: Vec<ClientIdentity>) -> Self {
        let identities = if identities.is_empty() {
            Self::default_identities()
        } else {
            identities
        };

        Self {
            inner: Arc::new(Mutex::new(PoolInner {
                identities: identities.into_iter().map(Arc::new).collect(),
                cursor: 0,
            })),
        }
    }

    fn default_identities() -> Vec<ClientIdentity> {
        DEFAULT_USER_AGENTS
            .iter()
            .map(|ua| ClientIdentity::new(*ua))
            .collect()
    }

    /// Acquires the pool lock, recovering from poison if necessary.
    fn lock_inner(&self) -> MutexGuard<'_, PoolInner> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned identity pool mutex");
            poisoned.into_inner()
        })
    }

    /// Next identity in rotation order.
    pub fn next(&self) -> Arc<ClientIdentity> {
        let mut inner = self.lock_inner();
        let index = inner.cursor % inner.identities.len();
        inner.cursor = (index + 1) % inner.identities.len();
        Arc::clone(&inner.identities[index])
    }

    /// Swap in a new identity set. Empty sets are ignored.
    pub fn replace(&self, identities: Vec<ClientIdentity>) -> bool {
        if identities.is_empty() {
            tracing::warn!("Identity refresh produced no identities, keeping current set");
            return false;
        }

        let mut inner = self.lock_inner();
        inner.identities = identities.into_iter().map(Arc::new).collect();
        inner.cursor %= inner.identities.len();
        true
    }

    pub fn len(&self) -> usize {
        self.lock_inner().identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for IdentityPool {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

/// Supplies the identity set on each refresh.
pub trait IdentitySource: Send + Sync + 'static {
    fn load(&self) -> Vec<ClientIdentity>;
}

/// Identity source backed by a fixed, configured set.
#[derive(Debug, Clone)]
pub struct StaticIdentitySource {
    identities: Vec<ClientIdentity>,
}

impl StaticIdentitySource {
    pub fn new(identities: Vec<ClientIdentity>) -> Self {
        Self { identities }
    }
}

impl IdentitySource for StaticIdentitySource {
    fn load(&self) -> Vec<ClientIdentity> {
        self.identities.clone()
    }
}

/// Periodically reload the pool from `source` until `cancel` fires.
pub fn spawn_refresh<S: IdentitySource>(
    pool: IdentityPool,
    source: S,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick completes immediately; the pool is already loaded.
        ticker.tick().await;

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let identities = source.load();
                    let count = identities.len();
                    if pool.replace(identities) {
                        tracing::debug!(%count, "Identity pool refreshed");
                    }
                }
            }
        }
        tracing::debug!("Identity refresh stopped");
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    fn uas(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("agent-{i}")).collect()
    }

    #[test]
    fn rotation_visits_every_identity() {
        let pool = IdentityPool::new(build_identities(&uas(3), &[], &[]));
        let seen: Vec<String> = (0..6).map(|_| pool.next().user_agent.clone()).collect();
        assert_eq!(
            seen,
            vec!["agent-0", "agent-1", "agent-2", "agent-0", "agent-1", "agent-2"]
        );
    }

    #[test]
    fn empty_pool_falls_back_to_default_agents() {
        let pool = IdentityPool::default();
        assert_eq!(pool.len(), DEFAULT_USER_AGENTS.len());
        let seen: HashSet<String> = (0..10).map(|_| pool.next().user_agent.clone()).collect();
        assert_eq!(seen.len(), DEFAULT_USER_AGENTS.len());
    }

    #[test]
    fn build_identities_cycles_shorter_list() {
        let proxies = vec!["http://p1:8080".to_string(), "http://p2:8080".to_string()];
        let ids = build_identities(&uas(3), &proxies, &[]);
        assert_eq!(ids.len(), 3);
        assert_eq!(ids[0].proxy.as_deref(), Some("http://p1:8080"));
        assert_eq!(ids[1].proxy.as_deref(), Some("http://p2:8080"));
        assert_eq!(ids[2].proxy.as_deref(), Some("http://p1:8080"));

        let ids = build_identities(&uas(1), &proxies, &[]);
        assert_eq!(ids.len(), 2);
        assert!(ids.iter().all(|i| i.user_agent == "agent-0"));
    }

    #[test]
    fn replace_swaps_set_and_ignores_empty() {
        let pool = IdentityPool::new(build_identities(&uas(2), &[], &[]));
        pool.next();
        assert!(!pool.replace(Vec::new()));
        assert_eq!(pool.len(), 2);

        assert!(pool.replace(vec![ClientIdentity::new("fresh")]));
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.next().user_agent, "fresh");
        assert_eq!(pool.next().user_agent, "fresh");
    }

    #[test]
    fn cookie_header_respects_domain_scope() {
        let identity = ClientIdentity::new("ua").with_cookies(vec![
            IdentityCookie::new("cookie_consent", "accepted"),
            IdentityCookie::new("A1", "abc").scoped_to(".example.com"),
        ]);

        assert_eq!(
            identity.cookie_header("news.example.com").as_deref(),
            Some("cookie_consent=accepted; A1=abc")
        );
        assert_eq!(
            identity.cookie_header("example.com").as_deref(),
            Some("cookie_consent=accepted; A1=abc")
        );
        assert_eq!(
            identity.cookie_header("notexample.com").as_deref(),
            Some("cookie_consent=accepted")
        );
        assert_eq!(ClientIdentity::new("ua").cookie_header("example.com"), None);
    }

    #[tokio::test]
    async fn refresh_task_reloads_until_cancelled() {
        let pool = IdentityPool::new(vec![ClientIdentity::new("old")]);
        let source = StaticIdentitySource::new(vec![
            ClientIdentity::new("new-a"),
            ClientIdentity::new("new-b"),
        ]);
        let cancel = CancellationToken::new();

        let handle = spawn_refresh(pool.clone(), source, Duration::from_millis(20), cancel.clone());
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(pool.len(), 2);

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("refresh task should stop on cancel")
            .unwrap();
    }
}
