//! SSRF-safe outbound fetch.
//!
//! [`safe_fetch`] is the only sanctioned path for the runtime to make an
//! outbound HTTP call: it resolves DNS before connecting, rejects private or
//! reserved target addresses, enforces a per-host rate limit, caps response
//! size and wall-clock time, and re-validates every redirect hop against the
//! same rules. [`is_browser_navigation_allowed`] applies the identical
//! decision to a URL a browser-automation collaborator is about to navigate
//! to, without performing the fetch itself.
//!
//! Callers never see response headers; only status and (possibly truncated)
//! body content are surfaced.

use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use reqwest::{Client, Url};
use tokio::sync::RwLock;

/// Fixed, non-identifying user agent sent on every outbound request.
const USER_AGENT: &str = "agentcore-fetcher/1.0";

/// Why a fetch or navigation was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    SchemeForbidden,
    HostPrivate,
    HostDenylisted,
    RateLimited,
    SizeExceeded,
    Timeout,
    InvalidUrl,
    ResolutionFailed,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RejectReason::SchemeForbidden => "scheme_forbidden",
            RejectReason::HostPrivate => "host_private",
            RejectReason::HostDenylisted => "host_denylisted",
            RejectReason::RateLimited => "rate_limited",
            RejectReason::SizeExceeded => "size_exceeded",
            RejectReason::Timeout => "timeout",
            RejectReason::InvalidUrl => "invalid_url",
            RejectReason::ResolutionFailed => "resolution_failed",
        };
        write!(f, "{}", s)
    }
}

/// Options controlling one [`safe_fetch`] call.
#[derive(Debug, Clone)]
pub struct FetchOptions {
    pub method: FetchMethod,
    pub body: Option<String>,
    pub timeout: Duration,
    pub max_response_size: usize,
    pub max_redirects: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchMethod {
    Get,
    Post,
}

impl Default for FetchOptions {
    fn default() -> Self {
        FetchOptions {
            method: FetchMethod::Get,
            body: None,
            timeout: Duration::from_secs(10),
            max_response_size: 1024 * 1024,
            max_redirects: 5,
        }
    }
}

/// Result of a [`safe_fetch`] call. `safe=false` means the request never
/// reached (or was aborted at) the network; `reason` names the rejected rule.
#[derive(Debug, Clone)]
pub struct FetchOutcome {
    pub safe: bool,
    pub status: Option<u16>,
    pub content: Option<String>,
    pub truncated: bool,
    pub reason: Option<RejectReason>,
}

impl FetchOutcome {
    fn rejected(reason: RejectReason) -> Self {
        FetchOutcome { safe: false, status: None, content: None, truncated: false, reason: Some(reason) }
    }
}

struct RateBucket {
    tokens: f64,
    last_refill: Instant,
}

/// Per-host token-bucket rate limiter plus a configurable denylist, shared by
/// every [`safe_fetch`] and [`is_browser_navigation_allowed`] call on this
/// runtime instance.
pub struct NetworkSafety {
    client: Client,
    denied_hosts: RwLock<Vec<String>>,
    buckets: RwLock<HashMap<String, RateBucket>>,
    tokens_per_window: f64,
    window: Duration,
    rejection_count: AtomicU64,
}

impl NetworkSafety {
    pub fn new(tokens_per_window: f64, window: Duration) -> Self {
        NetworkSafety {
            client: Client::builder().user_agent(USER_AGENT).redirect(reqwest::redirect::Policy::none()).build().unwrap_or_default(),
            denied_hosts: RwLock::new(Vec::new()),
            buckets: RwLock::new(HashMap::new()),
            tokens_per_window,
            window,
            rejection_count: AtomicU64::new(0),
        }
    }

    pub async fn deny_host(&self, host: &str) {
        self.denied_hosts.write().await.push(host.to_lowercase());
    }

    /// Total number of rejected fetch/navigation attempts since startup.
    pub fn rejection_count(&self) -> u64 {
        self.rejection_count.load(Ordering::Relaxed)
    }

    async fn is_denylisted(&self, host: &str) -> bool {
        self.denied_hosts.read().await.iter().any(|h| h == host)
    }

    async fn check_rate_limit(&self, host: &str) -> bool {
        let mut buckets = self.buckets.write().await;
        let now = Instant::now();
        let bucket = buckets.entry(host.to_string()).or_insert_with(|| RateBucket {
            tokens: self.tokens_per_window,
            last_refill: now,
        });

        let elapsed = now.duration_since(bucket.last_refill);
        if elapsed >= self.window {
            let windows_passed = elapsed.as_secs_f64() / self.window.as_secs_f64();
            bucket.tokens = (bucket.tokens + windows_passed * self.tokens_per_window).min(self.tokens_per_window);
            bucket.last_refill = now;
        }

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    async fn validate_url(&self, url: &Url) -> Result<(), RejectReason> {
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(RejectReason::SchemeForbidden);
        }
        let host = url.host_str().ok_or(RejectReason::InvalidUrl)?;

        if self.is_denylisted(host).await {
            return Err(RejectReason::HostDenylisted);
        }

        resolve_and_check(host).await?;

        if !self.check_rate_limit(host).await {
            return Err(RejectReason::RateLimited);
        }

        Ok(())
    }

    /// SSRF-safe outbound fetch. See module docs for the full rejection policy.
    pub async fn safe_fetch(&self, url: &str, opts: &FetchOptions) -> FetchOutcome {
        let mut current = match Url::parse(url) {
            Ok(u) => u,
            Err(_) => {
                self.rejection_count.fetch_add(1, Ordering::Relaxed);
                return FetchOutcome::rejected(RejectReason::InvalidUrl);
            }
        };

        for _ in 0..=opts.max_redirects {
            if let Err(reason) = self.validate_url(&current).await {
                self.rejection_count.fetch_add(1, Ordering::Relaxed);
                return FetchOutcome::rejected(reason);
            }

            let mut req = match opts.method {
                FetchMethod::Get => self.client.get(current.clone()),
                FetchMethod::Post => self.client.post(current.clone()),
            };
            if let Some(body) = &opts.body {
                req = req.body(body.clone());
            }

            let response = match req.timeout(opts.timeout).send().await {
                Ok(r) => r,
                Err(e) if e.is_timeout() => {
                    self.rejection_count.fetch_add(1, Ordering::Relaxed);
                    return FetchOutcome::rejected(RejectReason::Timeout);
                }
                Err(_) => {
                    self.rejection_count.fetch_add(1, Ordering::Relaxed);
                    return FetchOutcome::rejected(RejectReason::ResolutionFailed);
                }
            };

            if response.status().is_redirection() {
                if let Some(location) = response.headers().get(reqwest::header::LOCATION) {
                    if let Ok(loc_str) = location.to_str() {
                        if let Ok(next) = current.join(loc_str) {
                            current = next;
                            continue;
                        }
                    }
                }
                return FetchOutcome::rejected(RejectReason::InvalidUrl);
            }

            let status = response.status().as_u16();
            return self.drain_body(response, opts.max_response_size, status).await;
        }

        self.rejection_count.fetch_add(1, Ordering::Relaxed);
        FetchOutcome::rejected(RejectReason::InvalidUrl)
    }

    async fn drain_body(&self, response: reqwest::Response, cap: usize, status: u16) -> FetchOutcome {
        use futures_util::StreamExt;
        let mut stream = response.bytes_stream();
        let mut buf: Vec<u8> = Vec::new();
        let mut truncated = false;
        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(c) => c,
                Err(_) => return FetchOutcome::rejected(RejectReason::Timeout),
            };
            if buf.len() + chunk.len() > cap {
                let remaining = cap.saturating_sub(buf.len());
                buf.extend_from_slice(&chunk[..remaining.min(chunk.len())]);
                truncated = true;
                break;
            }
            buf.extend_from_slice(&chunk);
        }
        FetchOutcome {
            safe: true,
            status: Some(status),
            content: Some(String::from_utf8_lossy(&buf).into_owned()),
            truncated,
            reason: None,
        }
    }

    /// Applies the same rejection policy as [`Self::safe_fetch`] without
    /// performing the navigation itself, for a browser-automation collaborator.
    pub async fn is_browser_navigation_allowed(&self, url: &str) -> Result<(), RejectReason> {
        let parsed = Url::parse(url).map_err(|_| RejectReason::InvalidUrl)?;
        self.validate_url(&parsed).await
    }
}

/// Returns `true` if `ip` is globally routable (i.e. not loopback,
/// link-local, RFC-1918 private, unique-local, or CGNAT).
fn is_public_ip(ip: IpAddr) -> bool {
    !is_reserved_ip(ip)
}

/// Reserved ranges that must never be reachable from an agent-driven fetch.
///
/// - IPv4 loopback:    127.0.0.0/8
/// - IPv4 link-local:  169.254.0.0/16 (cloud metadata services)
/// - IPv4 RFC-1918:    10.0.0.0/8, 172.16.0.0/12, 192.168.0.0/16
/// - IPv4 CGNAT:       100.64.0.0/10
/// - IPv6 loopback:    ::1
/// - IPv6 unspecified: ::
/// - IPv6 link-local:  fe80::/10
/// - IPv6 unique-local: fc00::/7
fn is_reserved_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            if o[0] == 127 {
                return true;
            }
            if o[0] == 169 && o[1] == 254 {
                return true;
            }
            if o[0] == 10 {
                return true;
            }
            if o[0] == 172 && (16..=31).contains(&o[1]) {
                return true;
            }
            if o[0] == 192 && o[1] == 168 {
                return true;
            }
            if o[0] == 100 && (64..=127).contains(&o[1]) {
                return true;
            }
            false
        }
        IpAddr::V6(v6) => {
            if v6.is_loopback() || v6.is_unspecified() {
                return true;
            }
            let segments = v6.segments();
            if (segments[0] & 0xffc0) == 0xfe80 {
                return true;
            }
            if (segments[0] & 0xfe00) == 0xfc00 {
                return true;
            }
            false
        }
    }
}

/// Resolve `host` to IP addresses and reject if *any* resolved address is
/// reserved. DNS resolution runs on a blocking thread so the executor is
/// never stalled; resolution failure is also a rejection.
async fn resolve_and_check(host: &str) -> Result<(), RejectReason> {
    let host_owned = host.to_string();
    let addrs = tokio::task::spawn_blocking(move || {
        use std::net::ToSocketAddrs;
        format!("{}:80", host_owned).to_socket_addrs()
    })
    .await
    .map_err(|_| RejectReason::ResolutionFailed)?
    .map_err(|_| RejectReason::ResolutionFailed)?;

    let mut any = false;
    for addr in addrs {
        any = true;
        if !is_public_ip(addr.ip()) {
            return Err(RejectReason::HostPrivate);
        }
    }
    if !any {
        return Err(RejectReason::ResolutionFailed);
    }
    Ok(())
}
