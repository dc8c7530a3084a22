//! Per-attempt execution contexts and session material.
//!
//! Every attempt gets its own [`AttemptContext`] with a freshly built client,
//! so cookies, connections and proxy settings never leak from one path to the next.

use crate::config::FetchConfig;
use crate::error::SessionError;
use crate::proxy::{ExecutionPath, ProxyScheme};

use async_trait::async_trait;
use log::{debug, warn};
use reqwest::header::{HeaderMap, HeaderValue, COOKIE};
use reqwest::Client;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Authentication material attached to one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionMaterial {
    /// Value of the `Cookie` header.
    pub cookie_header: String,
}

/// Supplies session material for each attempt.
#[async_trait]
pub trait SessionLoader: Send + Sync {
    /// `Ok(None)` means no material is configured.
    async fn load(&self) -> Result<Option<SessionMaterial>, SessionError>;
}

/// Loads cookies from a Netscape-format cookie file.
pub struct CookieFileLoader {
    explicit: Option<PathBuf>,
    candidates: Vec<PathBuf>,
}

impl CookieFileLoader {
    /// Use `explicit` when it exists, otherwise the first existing well-known location.
    pub fn new(explicit: Option<PathBuf>) -> Self {
        let mut candidates = vec![PathBuf::from("cookies.txt")];
        if let Some(home) = std::env::var_os("HOME") {
            candidates.push(Path::new(&home).join("Downloads").join("cookies-youtube-com.txt"));
        }
        candidates.push(PathBuf::from("/app/cookies.txt"));
        Self { explicit, candidates }
    }

    /// Only ever look at `path`.
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self {
            explicit: Some(path.into()),
            candidates: Vec::new(),
        }
    }

    fn locate(&self) -> Option<&Path> {
        self.explicit
            .iter()
            .chain(self.candidates.iter())
            .map(PathBuf::as_path)
            .find(|p| p.is_file())
    }
}

#[async_trait]
impl SessionLoader for CookieFileLoader {
    async fn load(&self) -> Result<Option<SessionMaterial>, SessionError> {
        let Some(path) = self.locate() else {
            return Ok(None);
        };
        let content = tokio::fs::read_to_string(path).await.map_err(|source| SessionError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let cookie_header = parse_netscape_cookies(&content);
        if cookie_header.is_empty() {
            return Ok(None);
        }
        Ok(Some(SessionMaterial { cookie_header }))
    }
}

/// Turn a Netscape cookie file into a `name=value; ...` header value.
pub(crate) fn parse_netscape_cookies(content: &str) -> String {
    content
        .lines()
        .filter_map(|line| {
            let line = line.trim_end_matches(['\r', '\n']);
            let line = match line.strip_prefix("#HttpOnly_") {
                Some(rest) => rest,
                None if line.starts_with('#') || line.trim().is_empty() => return None,
                None => line,
            };
            let fields: Vec<&str> = line.split('\t').collect();
            if fields.len() < 7 || fields[5].is_empty() {
                return None;
            }
            Some(format!("{}={}", fields[5], fields[6]))
        })
        .collect::<Vec<_>>()
        .join("; ")
}

/// The isolated outbound session of a single attempt.
pub struct AttemptContext {
    path: ExecutionPath,
    client: Client,
    authenticated: bool,
}

impl AttemptContext {
    pub fn path(&self) -> &ExecutionPath {
        &self.path
    }

    /// Client routed through this attempt's path.
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Whether session material was attached.
    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }
}

/// Builds a fresh [`AttemptContext`] for every attempt.
pub struct SessionFactory {
    scheme: ProxyScheme,
    timeout: Duration,
    user_agent: String,
    loader: Option<Arc<dyn SessionLoader>>,
}

impl SessionFactory {
    /// Factory using the configured cookie file (or discovered one).
    pub fn new(config: &FetchConfig) -> Self {
        Self::with_loader(
            config,
            Some(Arc::new(CookieFileLoader::new(config.cookie_file.clone()))),
        )
    }

    pub fn with_loader(config: &FetchConfig, loader: Option<Arc<dyn SessionLoader>>) -> Self {
        Self {
            scheme: config.proxy_scheme,
            timeout: config.attempt_timeout,
            user_agent: config.user_agent.clone(),
            loader,
        }
    }

    pub fn scheme(&self) -> ProxyScheme {
        self.scheme
    }

    /// Build the context for one attempt through `path`.
    ///
    /// Session material that fails to load is logged and skipped.
    pub async fn context_for(&self, path: &ExecutionPath) -> Result<AttemptContext, reqwest::Error> {
        let mut headers = HeaderMap::new();
        let mut authenticated = false;
        if let Some(loader) = &self.loader {
            match loader.load().await {
                Ok(Some(material)) => match HeaderValue::from_str(&material.cookie_header) {
                    Ok(value) => {
                        headers.insert(COOKIE, value);
                        authenticated = true;
                    }
                    Err(e) => warn!("{}", SessionError::InvalidHeader(e.to_string())),
                },
                Ok(None) => debug!("No session material for attempt via {}", path),
                Err(e) => warn!("Proceeding without session material: {}", e),
            }
        }

        let mut builder = Client::builder()
            .timeout(self.timeout)
            .user_agent(self.user_agent.as_str())
            .default_headers(headers)
            .pool_max_idle_per_host(0);
        builder = match path {
            ExecutionPath::Proxy(addr) => builder.proxy(addr.to_reqwest_proxy(self.scheme)?),
            ExecutionPath::Direct => builder.no_proxy(),
        };

        Ok(AttemptContext {
            path: path.clone(),
            client: builder.build()?,
            authenticated,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingLoader;

    #[async_trait]
    impl SessionLoader for FailingLoader {
        async fn load(&self) -> Result<Option<SessionMaterial>, SessionError> {
            Err(SessionError::Read {
                path: "cookies.txt".into(),
                source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
            })
        }
    }

    const COOKIES: &str = "# Netscape HTTP Cookie File\n\
        .youtube.com\tTRUE\t/\tTRUE\t0\tPREF\tf6=40000000\n\
        #HttpOnly_.youtube.com\tTRUE\t/\tTRUE\t0\tSID\tabc123\n\
        \n\
        broken line\n";

    #[test]
    fn parses_netscape_cookie_file() {
        assert_eq!(parse_netscape_cookies(COOKIES), "PREF=f6=40000000; SID=abc123");
        assert_eq!(parse_netscape_cookies("# only comments\n"), "");
    }

    #[tokio::test]
    async fn cookie_file_loader_reads_explicit_path() {
        let path = std::env::temp_dir().join(format!("resilient-fetch-cookies-{}.txt", std::process::id()));
        std::fs::write(&path, COOKIES).unwrap();
        let material = CookieFileLoader::with_path(&path).load().await.unwrap();
        let _ = std::fs::remove_file(&path);

        assert_eq!(material.unwrap().cookie_header, "PREF=f6=40000000; SID=abc123");
        assert!(CookieFileLoader::with_path("/nonexistent/cookies.txt").load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn loader_failure_is_not_fatal() {
        let config = FetchConfig::default();
        let factory = SessionFactory::with_loader(&config, Some(Arc::new(FailingLoader)));
        let ctx = factory.context_for(&ExecutionPath::Direct).await.unwrap();
        assert!(!ctx.is_authenticated());
        assert!(ctx.path().is_direct());
    }

    #[tokio::test]
    async fn builds_proxied_context() {
        let config = FetchConfig::default();
        let factory = SessionFactory::with_loader(&config, None);
        let path = ExecutionPath::Proxy("10.1.2.3:8080".parse().unwrap());
        let ctx = factory.context_for(&path).await.unwrap();
        assert_eq!(ctx.path(), &path);
    }
}
