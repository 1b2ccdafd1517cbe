use std::net::{IpAddr, SocketAddr};

use axum::http::HeaderMap;

const FORWARDED_FOR: &str = "x-forwarded-for";

/// Hops listed in `X-Forwarded-For`, nearest client first.
pub(crate) fn forwarded_chain(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all(FORWARDED_FOR)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(str::trim)
        .filter(|hop| !hop.is_empty())
        .map(str::to_string)
        .collect()
}

/// The address used to identify a client for rate limiting and logs. The
/// forwarded header is only honoured when the operator trusts the proxy.
pub(crate) fn client_ip(headers: &HeaderMap, peer: SocketAddr, trust_proxy_headers: bool) -> IpAddr {
    if trust_proxy_headers {
        if let Some(ip) = forwarded_chain(headers)
            .first()
            .and_then(|hop| hop.parse::<IpAddr>().ok())
        {
            return ip;
        }
    }
    peer.ip()
}
