use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use rand::seq::SliceRandom;
use reqwest::{header, StatusCode, Url};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info_span, Instrument};

/// Desktop browser identities rotated per request.
pub const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Safari/605.1.15",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:125.0) Gecko/20100101 Firefox/125.0",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 14.4; rv:124.0) Gecko/20100101 Firefox/124.0",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36 Edg/124.0.2478.51",
];

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("proxy `{reference}` is not usable: {reason}")]
    Proxy { reference: String, reason: String },
}

impl FetchError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, FetchError::Request(err) if err.is_timeout())
    }
}

/// Credentials for a region's outbound proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyCredentials {
    pub username: String,
    pub password: String,
    pub host: String,
    pub port: u16,
}

impl ProxyCredentials {
    /// `proxy-canada` reads `PROXY_CANADA_USERNAME`, `PROXY_CANADA_PASSWORD`,
    /// `PROXY_CANADA_HOST` and `PROXY_CANADA_PORT`.
    pub fn from_env(reference: &str) -> Result<Self, FetchError> {
        Self::from_lookup(reference, |key| std::env::var(key).ok())
    }

    pub fn from_lookup(
        reference: &str,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, FetchError> {
        let prefix = env_prefix(reference);
        let read = |suffix: &str| {
            lookup(&format!("{prefix}_{suffix}"))
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let unusable = |reason: String| FetchError::Proxy {
            reference: reference.to_string(),
            reason,
        };

        let host = read("HOST").ok_or_else(|| unusable(format!("{prefix}_HOST is not set")))?;
        let port = read("PORT")
            .ok_or_else(|| unusable(format!("{prefix}_PORT is not set")))?
            .parse::<u16>()
            .map_err(|e| unusable(format!("{prefix}_PORT: {e}")))?;

        Ok(Self {
            username: read("USERNAME").unwrap_or_default(),
            password: read("PASSWORD").unwrap_or_default(),
            host,
            port,
        })
    }

    /// Proxy URL with basic-auth credentials embedded in the userinfo part.
    pub fn proxy_url(&self) -> Result<Url, String> {
        let mut url = Url::parse(&format!("http://{}:{}", self.host, self.port))
            .map_err(|e| e.to_string())?;
        if !self.username.is_empty() {
            url.set_username(&self.username)
                .map_err(|_| "username cannot be embedded".to_string())?;
            url.set_password(Some(&self.password))
                .map_err(|_| "password cannot be embedded".to_string())?;
        }
        Ok(url)
    }
}

fn env_prefix(reference: &str) -> String {
    reference
        .trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect()
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agents: Vec<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(15),
            user_agents: USER_AGENTS.iter().map(ToString::to_string).collect(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub user_agent: String,
    pub body: String,
}

/// Anything that can produce the raw text of a page.
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn fetch_page(&self, url: &str, proxy: Option<&str>) -> Result<String, FetchError>;
}

/// Single-shot page fetcher. No retries: a failed fetch aborts the caller's run.
#[derive(Debug)]
pub struct HttpFetcher {
    config: HttpClientConfig,
    direct: reqwest::Client,
    proxied: Mutex<HashMap<String, reqwest::Client>>,
}

impl HttpFetcher {
    pub fn new(mut config: HttpClientConfig) -> anyhow::Result<Self> {
        if config.user_agents.is_empty() {
            config.user_agents = HttpClientConfig::default().user_agents;
        }
        let direct = client_builder(&config)
            .build()
            .map_err(|e| anyhow::anyhow!("building reqwest client: {e}"))?;
        Ok(Self {
            config,
            direct,
            proxied: Mutex::new(HashMap::new()),
        })
    }

    pub fn pick_user_agent(&self) -> &str {
        self.config
            .user_agents
            .choose(&mut rand::thread_rng())
            .map(String::as_str)
            .unwrap_or(USER_AGENTS[0])
    }

    async fn client_for(&self, proxy: Option<&str>) -> Result<reqwest::Client, FetchError> {
        let Some(reference) = proxy else {
            return Ok(self.direct.clone());
        };

        let mut clients = self.proxied.lock().await;
        if let Some(client) = clients.get(reference) {
            return Ok(client.clone());
        }

        let creds = ProxyCredentials::from_env(reference)?;
        let unusable = |reason: String| FetchError::Proxy {
            reference: reference.to_string(),
            reason,
        };
        let url = creds.proxy_url().map_err(unusable)?;
        let proxy = reqwest::Proxy::all(url).map_err(|e| unusable(e.to_string()))?;
        let client = client_builder(&self.config)
            .proxy(proxy)
            .build()
            .map_err(|e| unusable(e.to_string()))?;
        clients.insert(reference.to_string(), client.clone());
        Ok(client)
    }

    pub async fn fetch(&self, url: &str, proxy: Option<&str>) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", url, proxy = proxy.unwrap_or("direct"));
        self.fetch_inner(url, proxy).instrument(span).await
    }

    async fn fetch_inner(&self, url: &str, proxy: Option<&str>) -> Result<FetchedResponse, FetchError> {
        let client = self.client_for(proxy).await?;
        let user_agent = self.pick_user_agent().to_string();
        let resp = client
            .get(url)
            .header(header::USER_AGENT, &user_agent)
            .send()
            .await?;

        let status = resp.status();
        let final_url = resp.url().to_string();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }

        let body = resp.text().await?;
        debug!(status = status.as_u16(), bytes = body.len(), "fetched page");
        Ok(FetchedResponse {
            status,
            final_url,
            user_agent,
            body,
        })
    }
}

#[async_trait]
impl PageSource for HttpFetcher {
    async fn fetch_page(&self, url: &str, proxy: Option<&str>) -> Result<String, FetchError> {
        Ok(self.fetch(url, proxy).await?.body)
    }
}

fn client_builder(config: &HttpClientConfig) -> reqwest::ClientBuilder {
    reqwest::Client::builder()
        .gzip(true)
        .brotli(true)
        .timeout(config.timeout)
}
