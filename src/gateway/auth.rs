//! Bearer authentication, token policies, and the IP allowlist.
//!
//! Every client-facing route sits behind this middleware. Missing bearer is
//! 401, unknown token 403. The matched token's policy object (when the
//! operator configured one) is attached as a request extension so downstream
//! handlers can honour per-token overrides without re-parsing anything. The
//! IP allowlist (global or per-token) accepts plain IPs and CIDR prefixes;
//! unparseable allowlists fail closed.

use std::{
    net::{IpAddr, SocketAddr},
    sync::Arc,
};

use axum::{
    extract::{ConnectInfo, Request, State},
    http::header,
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde_json::Value;

use crate::{context::GatewayContext, error::GatewayError};

/// The authenticated bearer token, attached for rate limiting.
#[derive(Clone, Debug)]
pub struct BearerToken(pub String);

/// The matched per-token policy (if any), attached for downstream overrides.
#[derive(Clone, Debug)]
pub struct TokenPolicy(pub Option<Value>);

/// Pull the bearer token out of an `Authorization` header value.
pub fn bearer_from_headers(headers: &axum::http::HeaderMap) -> Option<String> {
    let auth = headers.get(header::AUTHORIZATION)?.to_str().ok()?.trim();
    let (scheme, token) = auth.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

/// Axum middleware enforcing bearer auth + IP allowlist on every request.
pub async fn auth_middleware(
    State(ctx): State<Arc<GatewayContext>>,
    mut req: Request,
    next: Next,
) -> Response {
    let Some(token) = bearer_from_headers(req.headers()) else {
        return GatewayError::Unauthorized("Missing bearer token".into()).into_response();
    };

    if !ctx.token_is_valid(&token) {
        return GatewayError::Forbidden("Invalid bearer token".into()).into_response();
    }

    // Strict mode: a configured-but-broken policy file must not silently
    // grant default policy.
    if ctx.settings.gateway_token_policies_strict && ctx.token_policies_invalid() {
        return GatewayError::Internal(anyhow::anyhow!("token policy config invalid"))
            .into_response();
    }

    let policy = ctx.token_policy(&token).cloned();

    // IP allowlist: per-token override first, then the global setting.
    let allowlist = policy
        .as_ref()
        .and_then(|p| p.get("ip_allowlist"))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .unwrap_or_else(|| ctx.settings.ip_allowlist.trim().to_string());

    if !allowlist.is_empty() {
        let peer = req
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|c| c.0.ip());
        let allowed = peer.map(|ip| ip_allowed(ip, &allowlist)).unwrap_or(false);
        if !allowed {
            return GatewayError::Forbidden("Client IP not allowed".into()).into_response();
        }
    }

    req.extensions_mut().insert(BearerToken(token));
    req.extensions_mut().insert(TokenPolicy(policy));
    next.run(req).await
}

/// Check one IP against a comma-separated list of IPs and CIDR prefixes.
/// An allowlist that parses to nothing matches nothing (fail closed).
fn ip_allowed(ip: IpAddr, raw_allowlist: &str) -> bool {
    let networks: Vec<(IpAddr, u8)> =
        raw_allowlist.split(',').filter_map(parse_network).collect();
    if networks.is_empty() {
        return false;
    }
    networks.iter().any(|(net, prefix)| ip_in_network(ip, *net, *prefix))
}

/// Parse `"10.0.0.0/8"` or a bare IP (treated as /32 or /128).
fn parse_network(part: &str) -> Option<(IpAddr, u8)> {
    let part = part.trim();
    if part.is_empty() {
        return None;
    }
    match part.split_once('/') {
        Some((addr, prefix)) => {
            let addr: IpAddr = addr.trim().parse().ok()?;
            let prefix: u8 = prefix.trim().parse().ok()?;
            let max = match addr {
                IpAddr::V4(_) => 32,
                IpAddr::V6(_) => 128,
            };
            (prefix <= max).then_some((addr, prefix))
        }
        None => {
            let addr: IpAddr = part.parse().ok()?;
            let prefix = match addr {
                IpAddr::V4(_) => 32,
                IpAddr::V6(_) => 128,
            };
            Some((addr, prefix))
        }
    }
}

fn ip_in_network(ip: IpAddr, network: IpAddr, prefix: u8) -> bool {
    match (ip, network) {
        (IpAddr::V4(ip), IpAddr::V4(net)) => {
            if prefix == 0 {
                return true;
            }
            let shift = 32 - prefix as u32;
            (u32::from(ip) >> shift) == (u32::from(net) >> shift)
        }
        (IpAddr::V6(ip), IpAddr::V6(net)) => {
            if prefix == 0 {
                return true;
            }
            let shift = 128 - prefix as u32;
            (u128::from(ip) >> shift) == (u128::from(net) >> shift)
        }
        _ => false,
    }
}
