//! Fetching candidate proxies from plain-text list sources.

use crate::error::SourceError;
use crate::proxy::ProxyAddress;

use async_trait::async_trait;
use log::{info, warn};
use reqwest::Client;
use std::collections::HashSet;
use std::time::Duration;

/// Anything that can produce a fresh set of candidate proxies.
#[async_trait]
pub trait CandidateSource: Send + Sync {
    /// Fetch the current candidate set. Never fails; an empty set means nothing was found.
    async fn fetch_candidates(&self) -> HashSet<ProxyAddress>;
}

/// Merges and deduplicates the proxy lists of every configured source.
pub struct SourceAggregator {
    sources: Vec<String>,
    client: Client,
}

impl SourceAggregator {
    /// Create an aggregator over URLs or file paths.
    pub fn new(sources: Vec<String>, timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|e| {
                warn!("Failed to build list client, using defaults: {}", e);
                Client::new()
            });
        Self { sources, client }
    }

    pub fn sources(&self) -> &[String] {
        &self.sources
    }

    /// Fetch and parse a list of proxies from a URL or file path.
    async fn fetch_source(&self, source: &str) -> Result<Vec<ProxyAddress>, SourceError> {
        if source.starts_with("http://") || source.starts_with("https://") {
            let response = self.client.get(source).send().await?;
            let status = response.status();
            if !status.is_success() {
                return Err(SourceError::Status(status.as_u16()));
            }
            let content = response.text().await?;
            Ok(parse_proxy_list(&content))
        } else {
            let content = tokio::fs::read_to_string(source).await?;
            Ok(parse_proxy_list(&content))
        }
    }
}

#[async_trait]
impl CandidateSource for SourceAggregator {
    async fn fetch_candidates(&self) -> HashSet<ProxyAddress> {
        let results = futures::future::join_all(
            self.sources.iter().map(|source| async move { (source, self.fetch_source(source).await) }),
        )
        .await;

        let mut all_proxies = HashSet::new();
        for (source, result) in results {
            match result {
                Ok(source_proxies) => {
                    info!("Fetched {} proxies from {}", source_proxies.len(), source);
                    all_proxies.extend(source_proxies);
                }
                Err(e) => {
                    warn!("Failed to fetch proxies from {}: {}", source, e);
                }
            }
        }

        if all_proxies.is_empty() {
            warn!("No proxies fetched from any of {} sources", self.sources.len());
        } else {
            info!("Found {} unique candidate proxies", all_proxies.len());
        }
        all_proxies
    }
}

/// Parse `host:port` lines, skipping blanks, comments and malformed entries.
pub(crate) fn parse_proxy_list(content: &str) -> Vec<ProxyAddress> {
    content
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                return None;
            }
            let line = ["http://", "https://", "socks5://", "socks4://"]
                .iter()
                .find_map(|prefix| line.strip_prefix(prefix))
                .unwrap_or(line);
            line.parse().ok()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn temp_list(name: &str, content: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("resilient-fetch-{}-{}.txt", name, std::process::id()));
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn parse_skips_junk_and_strips_schemes() {
        let content = "# free list\n1.2.3.4:8080\n\n  socks5://5.6.7.8:1080 \nnot a proxy\n9.9.9.9\nhttp://1.2.3.4:8080\n";
        let parsed: Vec<String> = parse_proxy_list(content)
            .into_iter()
            .map(|p| p.as_str().to_string())
            .collect();
        assert_eq!(parsed, vec!["1.2.3.4:8080", "5.6.7.8:1080", "1.2.3.4:8080"]);
    }

    #[tokio::test]
    async fn merges_and_dedups_sources_and_tolerates_failures() {
        let a = temp_list("merge-a", "1.1.1.1:80\n2.2.2.2:80\n");
        let b = temp_list("merge-b", "2.2.2.2:80\n3.3.3.3:3128\n");
        let missing = std::env::temp_dir().join("resilient-fetch-does-not-exist.txt");

        let aggregator = SourceAggregator::new(
            vec![
                a.display().to_string(),
                missing.display().to_string(),
                b.display().to_string(),
            ],
            Duration::from_secs(1),
        );
        let candidates = aggregator.fetch_candidates().await;

        let _ = std::fs::remove_file(&a);
        let _ = std::fs::remove_file(&b);

        assert_eq!(candidates.len(), 3);
        assert!(candidates.contains(&"3.3.3.3:3128".parse().unwrap()));
    }

    #[tokio::test]
    async fn all_sources_failing_yields_empty_set() {
        let aggregator = SourceAggregator::new(
            vec![
                "/nonexistent/resilient-fetch/one.txt".to_string(),
                "http://127.0.0.1:1/list.txt".to_string(),
            ],
            Duration::from_secs(1),
        );
        assert!(aggregator.fetch_candidates().await.is_empty());
    }
}
