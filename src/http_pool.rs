//! Shared, base-URL-keyed HTTP client pool.
//!
//! Adapted from `cloudllm::http_client_pool`: a global cache of
//! `reqwest::Client`s so the MCP bridge and the LLM provider adapter reuse
//! connections instead of paying DNS/TLS setup per call.

use std::time::Duration;

use dashmap::DashMap;
use once_cell::sync::Lazy;

static CLIENT_POOL: Lazy<DashMap<String, reqwest::Client>> = Lazy::new(DashMap::new);

/// Returns a cloned client sharing the connection pool for `base_url`,
/// creating one on first use.
pub fn get_or_create_client(base_url: &str) -> reqwest::Client {
    CLIENT_POOL
        .entry(base_url.to_string())
        .or_insert_with(create_pooled_client)
        .clone()
}

fn create_pooled_client() -> reqwest::Client {
    reqwest::ClientBuilder::new()
        .pool_max_idle_per_host(100)
        .pool_idle_timeout(Some(Duration::from_secs(90)))
        .tcp_keepalive(Some(Duration::from_secs(60)))
        .connect_timeout(Duration::from_secs(30))
        .build()
        .expect("failed to build pooled HTTP client")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reuses_client_for_same_base_url() {
        let url = "https://kb.example.internal";
        let _c1 = get_or_create_client(url);
        let _c2 = get_or_create_client(url);
        assert!(CLIENT_POOL.contains_key(url));
    }

    #[test]
    fn separate_base_urls_get_separate_entries() {
        let a = "https://mcp-a.example.internal";
        let b = "https://mcp-b.example.internal";
        let _ = get_or_create_client(a);
        let _ = get_or_create_client(b);
        assert!(CLIENT_POOL.contains_key(a));
        assert!(CLIENT_POOL.contains_key(b));
    }
}
