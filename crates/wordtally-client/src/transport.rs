use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use reqwest::Client;
use reqwest::header::{
    ACCEPT, ACCEPT_LANGUAGE, CACHE_CONTROL, COOKIE, UPGRADE_INSECURE_REQUESTS, USER_AGENT,
};
use url::Url;
use wordtally_core::error::{AppError, FetchFailure};
use wordtally_core::identity::ClientIdentity;
use wordtally_core::traits::{Transport, TransportResponse};

const BROWSER_ACCEPT: &str =
    "text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,image/apng,*/*;q=0.8";

/// HTTP transport using reqwest.
///
/// Sends exactly one GET per call, presenting the given identity's user
/// agent and cookies alongside a browser-like header set. One client is
/// kept per proxy endpoint (plus one direct client), built on first use
/// and shared by every clone of the transport.
#[derive(Clone)]
pub struct ReqwestTransport {
    timeout: Duration,
    clients: Arc<Mutex<HashMap<Option<String>, Client>>>,
}

impl ReqwestTransport {
    /// Creates a transport; the direct client is built eagerly so that TLS
    /// or resolver problems surface at startup.
    pub fn new(timeout: Duration) -> Result<Self, AppError> {
        let direct = build_client(timeout, None).map_err(|e| AppError::HttpError(e.to_string()))?;

        let mut clients = HashMap::new();
        clients.insert(None, direct);

        Ok(Self {
            timeout,
            clients: Arc::new(Mutex::new(clients)),
        })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Number of distinct clients built so far.
    pub fn client_count(&self) -> usize {
        self.lock_clients().len()
    }

    fn lock_clients(&self) -> MutexGuard<'_, HashMap<Option<String>, Client>> {
        self.clients.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned client cache mutex");
            poisoned.into_inner()
        })
    }

    fn client_for(&self, proxy: Option<&str>) -> Result<Client, FetchFailure> {
        let key = proxy.map(str::to_string);
        let mut clients = self.lock_clients();
        if let Some(client) = clients.get(&key) {
            return Ok(client.clone());
        }

        let client = build_client(self.timeout, proxy).map_err(|e| {
            FetchFailure::Connect(format!(
                "cannot use proxy {}: {e}",
                proxy.unwrap_or("<direct>")
            ))
        })?;
        tracing::debug!(proxy = proxy.unwrap_or("<direct>"), "Built HTTP client");
        clients.insert(key, client.clone());
        Ok(client)
    }
}

fn build_client(timeout: Duration, proxy: Option<&str>) -> Result<Client, reqwest::Error> {
    let builder = Client::builder().timeout(timeout);
    let builder = match proxy {
        Some(endpoint) => builder.proxy(reqwest::Proxy::all(endpoint)?),
        None => builder.no_proxy(),
    };
    builder.build()
}

/// Map a reqwest error onto the attempt-level failure classes.
fn classify_error(e: &reqwest::Error) -> FetchFailure {
    if e.is_timeout() {
        FetchFailure::Timeout
    } else if e.is_connect() {
        FetchFailure::Connect(e.to_string())
    } else if e.is_body() || e.is_decode() {
        FetchFailure::Malformed(e.to_string())
    } else {
        FetchFailure::Connect(e.to_string())
    }
}

impl Transport for ReqwestTransport {
    async fn send(
        &self,
        url: &Url,
        identity: &ClientIdentity,
    ) -> Result<TransportResponse, FetchFailure> {
        let client = self.client_for(identity.proxy.as_deref())?;

        let mut request = client
            .get(url.clone())
            .header(USER_AGENT, identity.user_agent.as_str())
            .header(ACCEPT, BROWSER_ACCEPT)
            .header(ACCEPT_LANGUAGE, "en-US,en;q=0.9")
            .header(UPGRADE_INSECURE_REQUESTS, "1")
            .header("Sec-Fetch-Dest", "document")
            .header("Sec-Fetch-Mode", "navigate")
            .header("Sec-Fetch-Site", "none")
            .header("Sec-Fetch-User", "?1")
            .header(CACHE_CONTROL, "max-age=0");

        if let Some(cookies) = url.host_str().and_then(|host| identity.cookie_header(host)) {
            request = request.header(COOKIE, cookies);
        }

        let response = request.send().await.map_err(|e| classify_error(&e))?;
        let status = response.status().as_u16();

        if !response.status().is_success() {
            return Ok(TransportResponse {
                status,
                body: Vec::new(),
            });
        }

        let body = response.bytes().await.map_err(|e| {
            if e.is_timeout() {
                FetchFailure::Timeout
            } else {
                FetchFailure::Malformed(format!("failed to read response body: {e}"))
            }
        })?;

        Ok(TransportResponse {
            status,
            body: body.to_vec(),
        })
    }
}
