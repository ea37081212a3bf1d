//! Shared helpers for the provider integration tests.

#![allow(dead_code)]

use axum::extract::DefaultBodyLimit;
use axum::Router;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::net::TcpListener;

pub const MIB: usize = 1024 * 1024;

/// Serve `router` on an ephemeral local port and return its base URL.
pub async fn serve(router: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = router.layer(DefaultBodyLimit::disable());
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{}", addr)
}

/// Deterministic, non-repeating-per-chunk content of `len` bytes.
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

pub fn write_file(dir: &Path, name: &str, len: usize) -> (PathBuf, Vec<u8>) {
    let data = pattern(len);
    let path = dir.join(name);
    std::fs::write(&path, &data).unwrap();
    (path, data)
}

pub fn query_map(query: Option<&str>) -> BTreeMap<String, String> {
    url::form_urlencoded::parse(query.unwrap_or("").as_bytes())
        .into_owned()
        .collect()
}

/// `(start, end_inclusive, total)` from `Content-Range: bytes a-b/total`.
pub fn parse_content_range(value: &str) -> (u64, u64, u64) {
    let rest = value.strip_prefix("bytes ").unwrap();
    let (range, total) = rest.split_once('/').unwrap();
    let (start, end) = range.split_once('-').unwrap();
    (
        start.parse().unwrap(),
        end.parse().unwrap(),
        total.parse().unwrap(),
    )
}

pub fn bearer(headers: &axum::http::HeaderMap) -> Option<String> {
    headers
        .get(axum::http::header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::to_string)
}
