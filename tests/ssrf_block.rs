//! End-to-end: outbound fetch refuses every address class an SSRF attempt
//! would target (loopback, link-local cloud-metadata, RFC-1918 private),
//! a denylisted host, and a non-HTTP scheme, all via the one sanctioned
//! fetch path.

use std::time::Duration;

use agentcore::core::network_safety::{FetchMethod, FetchOptions, NetworkSafety, RejectReason};

fn opts() -> FetchOptions {
    FetchOptions {
        method: FetchMethod::Get,
        body: None,
        timeout: Duration::from_secs(2),
        max_response_size: 4096,
        max_redirects: 2,
    }
}

#[tokio::test]
async fn loopback_target_is_rejected_before_any_socket_is_opened() {
    let ns = NetworkSafety::new(100.0, Duration::from_secs(60));
    let outcome = ns.safe_fetch("http://127.0.0.1:9999/admin", &opts()).await;
    assert!(!outcome.safe);
    assert_eq!(outcome.reason, Some(RejectReason::HostPrivate));
}

#[tokio::test]
async fn cloud_metadata_link_local_address_is_rejected() {
    let ns = NetworkSafety::new(100.0, Duration::from_secs(60));
    let outcome = ns.safe_fetch("http://169.254.169.254/latest/meta-data/", &opts()).await;
    assert!(!outcome.safe);
    assert_eq!(outcome.reason, Some(RejectReason::HostPrivate));
}

#[tokio::test]
async fn rfc1918_private_address_is_rejected() {
    let ns = NetworkSafety::new(100.0, Duration::from_secs(60));
    let outcome = ns.safe_fetch("http://10.0.0.1/", &opts()).await;
    assert!(!outcome.safe);
    assert_eq!(outcome.reason, Some(RejectReason::HostPrivate));
}

#[tokio::test]
async fn explicitly_denylisted_host_is_rejected_ahead_of_dns() {
    let ns = NetworkSafety::new(100.0, Duration::from_secs(60));
    ns.deny_host("evil.example.com").await;
    let outcome = ns.safe_fetch("https://evil.example.com/", &opts()).await;
    assert!(!outcome.safe);
    assert_eq!(outcome.reason, Some(RejectReason::HostDenylisted));
}

#[tokio::test]
async fn non_http_scheme_is_rejected_without_resolving_the_host() {
    let ns = NetworkSafety::new(100.0, Duration::from_secs(60));
    let outcome = ns.safe_fetch("file:///etc/passwd", &opts()).await;
    assert!(!outcome.safe);
    assert_eq!(outcome.reason, Some(RejectReason::SchemeForbidden));
}

#[tokio::test]
async fn rejection_count_accumulates_across_distinct_rejections() {
    let ns = NetworkSafety::new(100.0, Duration::from_secs(60));
    ns.safe_fetch("http://127.0.0.1/", &opts()).await;
    ns.safe_fetch("ftp://example.com/", &opts()).await;
    assert_eq!(ns.rejection_count(), 2);
}
