use std::net::SocketAddr;

use axum::extract::{ConnectInfo, State};
use axum::http::HeaderMap;
use axum::Json;
use serde::Serialize;

use protocol::catalog::{self, CatalogEntry};

use crate::app::AppState;
use crate::config::SiteSettings;
use crate::identity::{client_ip, forwarded_chain};

/// Everything the page renderer needs besides the probe socket.
#[derive(Debug, Serialize)]
pub(crate) struct PageInfo {
    #[serde(flatten)]
    site: SiteSettings,
    client_ip: String,
    forwarded_for: Vec<String>,
    test_files: Vec<TestFile>,
}

#[derive(Debug, Serialize)]
struct TestFile {
    #[serde(flatten)]
    entry: CatalogEntry,
    path: String,
}

pub(crate) async fn page_info(
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Json<PageInfo> {
    Json(PageInfo {
        site: state.site.as_ref().clone(),
        client_ip: client_ip(&headers, peer, state.trust_proxy_headers).to_string(),
        forwarded_for: forwarded_chain(&headers),
        test_files: catalog::FILE_SIZES
            .iter()
            .map(|entry| TestFile {
                entry: *entry,
                path: entry.path(),
            })
            .collect(),
    })
}
