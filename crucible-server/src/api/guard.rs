//! Ingress guard for spawn-capable routes.
//!
//! When public spawning is off, execute requests are admitted only when the
//! `Host` header or the peer address matches an allowlist entry. Loopback
//! callers are always admitted so health probes and sidecars keep working.

use std::net::SocketAddr;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tracing::warn;

use super::AppState;

/// Admission policy, derived from configuration at startup.
#[derive(Debug, Clone, Default)]
pub struct IngressGuard {
    pub public_spawn_enabled: bool,
    pub host_allowlist: Vec<String>,
    pub ip_allowlist: Vec<String>,
}

impl IngressGuard {
    /// Decide admission from the request's host header and peer address.
    #[must_use]
    pub fn admits(&self, host: Option<&str>, peer: Option<SocketAddr>) -> bool {
        if self.public_spawn_enabled {
            return true;
        }
        if let Some(host) = host {
            // Strip any port from the header value.
            let bare = host.rsplit_once(':').map_or(host, |(h, _)| h);
            if bare == "localhost"
                || bare == "127.0.0.1"
                || bare == "[::1]"
                || self.host_allowlist.iter().any(|allowed| allowed == bare)
            {
                return true;
            }
        }
        if let Some(peer) = peer {
            let ip = peer.ip();
            if ip.is_loopback() || self.ip_allowlist.iter().any(|allowed| {
                allowed.parse::<std::net::IpAddr>().is_ok_and(|a| a == ip)
            }) {
                return true;
            }
        }
        false
    }
}

/// Axum middleware applying the guard to the wrapped routes.
pub async fn ingress_guard(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let host = request
        .headers()
        .get(axum::http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0);

    if state.guard.admits(host.as_deref(), peer) {
        next.run(request).await
    } else {
        warn!(host = ?host, peer = ?peer, "spawn request refused by ingress guard");
        (
            StatusCode::FORBIDDEN,
            axum::Json(serde_json::json!({
                "error": "public spawning is disabled",
                "kind": "Forbidden",
            })),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guard(hosts: &[&str], ips: &[&str]) -> IngressGuard {
        IngressGuard {
            public_spawn_enabled: false,
            host_allowlist: hosts.iter().map(|s| (*s).to_owned()).collect(),
            ip_allowlist: ips.iter().map(|s| (*s).to_owned()).collect(),
        }
    }

    #[test]
    fn public_spawn_admits_everyone() {
        let guard = IngressGuard {
            public_spawn_enabled: true,
            ..IngressGuard::default()
        };
        assert!(guard.admits(None, None));
    }

    #[test]
    fn loopback_is_always_admitted() {
        let guard = guard(&[], &[]);
        assert!(guard.admits(Some("localhost:50081"), None));
        assert!(guard.admits(Some("127.0.0.1"), None));
        assert!(guard.admits(None, Some("127.0.0.1:9999".parse().unwrap())));
    }

    #[test]
    fn allowlists_admit_matches_only() {
        let guard = guard(&["broker.internal"], &["10.0.0.7"]);
        assert!(guard.admits(Some("broker.internal:443"), None));
        assert!(!guard.admits(Some("evil.example.com"), None));
        assert!(guard.admits(None, Some("10.0.0.7:1234".parse().unwrap())));
        assert!(!guard.admits(None, Some("10.0.0.8:1234".parse().unwrap())));
        assert!(!guard.admits(None, None));
    }
}
