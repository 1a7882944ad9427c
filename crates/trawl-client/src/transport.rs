use std::collections::BTreeMap;
use std::net::IpAddr;
use std::time::Duration;

use reqwest::Client;
use trawl_core::error::AppError;
use trawl_core::models::{ApiRequest, ApiResponse, Method};
use trawl_core::traits::Transport;
use url::Url;

/// HTTP transport using reqwest.
///
/// Relative paths are joined onto the configured base URL; absolute URLs
/// (artifact locators) are used as given. Every reply, including non-2xx,
/// is returned as an [`ApiResponse`] for the core to classify.
///
/// By default, SSRF protection is **enabled**: requests whose host resolves
/// to a private/reserved IP range are refused. Locators come from a third
/// party, so keep it on unless you control the remote.
#[derive(Clone)]
pub struct ReqwestTransport {
    client: Client,
    base_url: Option<Url>,
    timeout: Duration,
    ssrf_protection: bool,
}

impl ReqwestTransport {
    pub fn new() -> Result<Self, AppError> {
        Self::with_timeout(Duration::from_secs(30))
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self, AppError> {
        let client = Client::builder()
            .user_agent(concat!("trawl/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::ConfigError(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: None,
            timeout,
            ssrf_protection: true,
        })
    }

    /// Resolve relative request paths against `base`.
    pub fn with_base_url(mut self, base: &str) -> Result<Self, AppError> {
        let mut url =
            Url::parse(base).map_err(|e| AppError::ConfigError(format!("Invalid base URL: {e}")))?;
        if !url.path().ends_with('/') {
            let path = format!("{}/", url.path());
            url.set_path(&path);
        }
        self.base_url = Some(url);
        Ok(self)
    }

    /// Disable SSRF protection, allowing requests to private/reserved IPs.
    pub fn allow_private_urls(mut self) -> Self {
        self.ssrf_protection = false;
        self
    }

    fn resolve(&self, request: &ApiRequest) -> Result<Url, AppError> {
        let mut url = match Url::parse(&request.path) {
            Ok(url) => url,
            Err(url::ParseError::RelativeUrlWithoutBase) => {
                let base = self.base_url.as_ref().ok_or_else(|| AppError::PermanentFailure {
                    status: None,
                    message: format!("Relative path '{}' but no base URL", request.path),
                })?;
                base.join(request.path.trim_start_matches('/'))
                    .map_err(|e| invalid_url(&request.path, e))?
            }
            Err(e) => return Err(invalid_url(&request.path, e)),
        };

        if !request.params.is_empty() {
            url.query_pairs_mut().extend_pairs(request.params.iter());
        }
        Ok(url)
    }

    fn map_send_error(&self, e: reqwest::Error) -> AppError {
        if e.is_timeout() {
            AppError::Timeout(self.timeout)
        } else if e.is_connect() {
            AppError::NetworkError(format!("Connection failed: {e}"))
        } else {
            AppError::NetworkError(e.to_string())
        }
    }
}

impl Transport for ReqwestTransport {
    async fn request(&self, request: &ApiRequest) -> Result<ApiResponse, AppError> {
        let url = self.resolve(request)?;
        if self.ssrf_protection {
            validate_url(&url).await?;
        }

        let method = match request.method {
            Method::Get => reqwest::Method::GET,
        };
        let mut builder = self.client.request(method, url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder.send().await.map_err(|e| self.map_send_error(e))?;

        let status = response.status().as_u16();
        let headers: BTreeMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
            })
            .collect();
        let body = response
            .bytes()
            .await
            .map_err(|e| self.map_send_error(e))?
            .to_vec();

        tracing::trace!(status, bytes = body.len(), path = %request.path, "Response received");
        Ok(ApiResponse {
            status,
            headers,
            body,
        })
    }
}

fn invalid_url(path: &str, e: url::ParseError) -> AppError {
    AppError::PermanentFailure {
        status: None,
        message: format!("Invalid URL '{path}': {e}"),
    }
}

// ---------------------------------------------------------------------------
// SSRF protection
// ---------------------------------------------------------------------------

fn blocked(message: String) -> AppError {
    AppError::PermanentFailure {
        status: None,
        message,
    }
}

/// Refuse non-http(s) schemes and hosts that resolve to private ranges.
async fn validate_url(url: &Url) -> Result<(), AppError> {
    match url.scheme() {
        "http" | "https" => {}
        scheme => {
            return Err(blocked(format!(
                "URL scheme '{scheme}' is not allowed (only http/https)"
            )));
        }
    }

    let host = url
        .host_str()
        .ok_or_else(|| blocked("URL has no host".to_string()))?;
    let bare_host = host.trim_start_matches('[').trim_end_matches(']');

    if let Ok(ip) = bare_host.parse::<IpAddr>() {
        if is_private_ip(ip) {
            return Err(blocked(format!(
                "SSRF blocked: {host} is a private/reserved IP"
            )));
        }
        return Ok(());
    }

    let port = url.port_or_known_default().unwrap_or(80);
    let addrs: Vec<_> = tokio::net::lookup_host((bare_host, port))
        .await
        .map_err(|e| AppError::NetworkError(format!("DNS resolution failed for {host}: {e}")))?
        .collect();

    if addrs.is_empty() {
        return Err(AppError::NetworkError(format!(
            "DNS resolution returned no addresses for {host}"
        )));
    }

    if let Some(private) = addrs.iter().find(|a| is_private_ip(a.ip())) {
        return Err(blocked(format!(
            "SSRF blocked: {host} resolves to private/reserved IP {}",
            private.ip()
        )));
    }

    Ok(())
}

/// Check if an IP address is in a private/reserved/link-local range.
fn is_private_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            let [a, b, ..] = v4.octets();
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local() // includes cloud metadata
                || v4.is_unspecified()
                || v4.is_broadcast()
                || v4.is_documentation()
                || (a == 100 && (b & 0xC0) == 64) // CGN
        }
        IpAddr::V6(v6) => {
            let first = v6.segments()[0];
            v6.is_loopback()
                || v6.is_unspecified()
                || (first & 0xFFC0) == 0xFE80
                || (first & 0xFE00) == 0xFC00
                || v6
                    .to_ipv4_mapped()
                    .is_some_and(|v4| is_private_ip(IpAddr::V4(v4)))
        }
    }
}
