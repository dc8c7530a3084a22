//! Configuration for the proxy pool and retry orchestrator.

use crate::proxy::ProxyScheme;

use log::warn;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Plain-text proxy lists, one `host:port` per line.
pub const DEFAULT_SOURCES: &[&str] = &[
    "https://api.proxyscrape.com/v4/free-proxy-list/get?request=display_proxies&protocol=http&proxy_format=ipport&format=text",
    "https://cdn.jsdelivr.net/gh/proxifly/free-proxy-list@main/proxies/protocols/http/data.txt",
    "https://cdn.jsdelivr.net/gh/TheSpeedX/PROXY-List@master/http.txt",
];

/// A public video known to carry captions, used as the validation target.
pub const DEFAULT_VALIDATION_VIDEO_ID: &str = "dQw4w9WgXcQ";

const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
    (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

/// Configuration for the proxy pool, its maintainer and the retry orchestrator.
#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// Source URLs or file paths to fetch proxy lists from.
    pub sources: Vec<String>,
    /// Protocol spoken by the listed proxies.
    pub proxy_scheme: ProxyScheme,
    /// Maximum number of validated proxies kept ready.
    pub ready_capacity: usize,
    /// Below this many ready proxies the maintainer validates a new batch.
    pub low_water_mark: usize,
    /// How often the raw candidate list is refetched.
    pub refresh_interval: Duration,
    /// Maximum candidates validated per batch.
    pub validation_batch_size: usize,
    /// Validations running at the same time within a batch.
    pub validation_concurrency: usize,
    /// Upper bound on validation attempts per second, process-wide.
    pub validations_per_second: u32,
    /// Timeout for a single validation attempt.
    pub validation_timeout: Duration,
    /// Video used as the known-good validation target.
    pub validation_video_id: String,
    /// Attempts per fetch, including the final direct attempt.
    pub max_attempts: usize,
    /// Timeout for a single fetch attempt.
    pub attempt_timeout: Duration,
    /// Timeout for fetching one proxy list.
    pub list_fetch_timeout: Duration,
    /// Interval between maintainer cycles.
    pub maintenance_interval: Duration,
    /// Delay before the first maintainer cycle.
    pub startup_delay: Duration,
    /// Sleep after a maintainer cycle crashed.
    pub error_backoff: Duration,
    /// Minimum gap between a cycle and one woken early by a refill request.
    pub refill_cooldown: Duration,
    /// Cookie file to load session material from; discovered when unset.
    pub cookie_file: Option<PathBuf>,
    /// User agent sent on every attempt.
    pub user_agent: String,
}

impl FetchConfig {
    /// Create a new configuration builder.
    pub fn builder() -> FetchConfigBuilder {
        FetchConfigBuilder::new()
    }

    /// Defaults overlaid with whatever is set in the environment.
    pub fn from_env() -> Self {
        FetchConfigBuilder::from_env().build()
    }
}

impl Default for FetchConfig {
    fn default() -> Self {
        FetchConfigBuilder::new().build()
    }
}

/// Builder for `FetchConfig`.
#[derive(Debug, Clone, Default)]
pub struct FetchConfigBuilder {
    sources: Option<Vec<String>>,
    proxy_scheme: Option<ProxyScheme>,
    ready_capacity: Option<usize>,
    low_water_mark: Option<usize>,
    refresh_interval: Option<Duration>,
    validation_batch_size: Option<usize>,
    validation_concurrency: Option<usize>,
    validations_per_second: Option<u32>,
    validation_timeout: Option<Duration>,
    validation_video_id: Option<String>,
    max_attempts: Option<usize>,
    attempt_timeout: Option<Duration>,
    list_fetch_timeout: Option<Duration>,
    maintenance_interval: Option<Duration>,
    startup_delay: Option<Duration>,
    error_backoff: Option<Duration>,
    refill_cooldown: Option<Duration>,
    cookie_file: Option<PathBuf>,
    user_agent: Option<String>,
}

impl FetchConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a builder seeded from environment variables.
    ///
    /// Unset variables keep their defaults; malformed ones are logged and ignored.
    pub fn from_env() -> Self {
        let mut builder = Self::new();
        if let Ok(raw) = std::env::var("PROXY_SOURCES") {
            let sources: Vec<String> = raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
            if !sources.is_empty() {
                builder.sources = Some(sources);
            }
        }
        builder.proxy_scheme = env_parse("PROXY_SCHEME");
        builder.ready_capacity = env_parse("READY_POOL_CAPACITY");
        builder.low_water_mark = env_parse("READY_POOL_LOW_WATER");
        builder.refresh_interval = env_parse("PROXY_REFRESH_INTERVAL_SECS").map(Duration::from_secs);
        builder.validation_batch_size = env_parse("VALIDATION_BATCH_SIZE");
        builder.validation_concurrency = env_parse("VALIDATION_CONCURRENCY");
        builder.validations_per_second = env_parse("VALIDATIONS_PER_SECOND");
        builder.validation_video_id = env_parse("VALIDATION_VIDEO_ID");
        builder.max_attempts = env_parse("FETCH_MAX_ATTEMPTS");
        builder.attempt_timeout = env_parse("FETCH_ATTEMPT_TIMEOUT_SECS").map(Duration::from_secs);
        builder.maintenance_interval = env_parse("POOL_TICK_SECS").map(Duration::from_secs);
        builder.refill_cooldown = env_parse("POOL_REFILL_COOLDOWN_SECS").map(Duration::from_secs);
        builder.cookie_file = std::env::var_os("YT_COOKIE_FILE").map(PathBuf::from);
        builder
    }

    /// Set the source URLs or file paths to fetch proxy lists from.
    pub fn sources(mut self, sources: Vec<impl Into<String>>) -> Self {
        self.sources = Some(sources.into_iter().map(Into::into).collect());
        self
    }

    /// Set the protocol spoken by the listed proxies.
    pub fn proxy_scheme(mut self, scheme: ProxyScheme) -> Self {
        self.proxy_scheme = Some(scheme);
        self
    }

    /// Set the ready pool capacity.
    pub fn ready_capacity(mut self, capacity: usize) -> Self {
        self.ready_capacity = Some(capacity);
        self
    }

    /// Set the ready pool low-water mark.
    pub fn low_water_mark(mut self, mark: usize) -> Self {
        self.low_water_mark = Some(mark);
        self
    }

    /// Set how often the raw candidate list is refetched.
    pub fn refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = Some(interval);
        self
    }

    /// Set the number of candidates validated per batch.
    pub fn validation_batch_size(mut self, size: usize) -> Self {
        self.validation_batch_size = Some(size);
        self
    }

    /// Set how many validations of a batch run at the same time.
    pub fn validation_concurrency(mut self, concurrency: usize) -> Self {
        self.validation_concurrency = Some(concurrency);
        self
    }

    /// Set the process-wide validation rate.
    pub fn validations_per_second(mut self, rps: u32) -> Self {
        self.validations_per_second = Some(rps);
        self
    }

    /// Set the timeout for a single validation attempt.
    pub fn validation_timeout(mut self, timeout: Duration) -> Self {
        self.validation_timeout = Some(timeout);
        self
    }

    /// Set the video used as validation target.
    pub fn validation_video_id(mut self, video_id: impl Into<String>) -> Self {
        self.validation_video_id = Some(video_id.into());
        self
    }

    /// Set the number of attempts per fetch, including the direct fallback.
    pub fn max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    /// Set the timeout for a single fetch attempt.
    pub fn attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = Some(timeout);
        self
    }

    /// Set the timeout for fetching one proxy list.
    pub fn list_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.list_fetch_timeout = Some(timeout);
        self
    }

    /// Set the interval between maintainer cycles.
    pub fn maintenance_interval(mut self, interval: Duration) -> Self {
        self.maintenance_interval = Some(interval);
        self
    }

    /// Set the delay before the first maintainer cycle.
    pub fn startup_delay(mut self, delay: Duration) -> Self {
        self.startup_delay = Some(delay);
        self
    }

    /// Set the back-off after a crashed maintainer cycle.
    pub fn error_backoff(mut self, backoff: Duration) -> Self {
        self.error_backoff = Some(backoff);
        self
    }

    /// Set the minimum gap before a refill request may wake the maintainer.
    pub fn refill_cooldown(mut self, cooldown: Duration) -> Self {
        self.refill_cooldown = Some(cooldown);
        self
    }

    /// Set the cookie file to load session material from.
    pub fn cookie_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.cookie_file = Some(path.into());
        self
    }

    /// Set the user agent sent on every attempt.
    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    /// Build the configuration.
    pub fn build(self) -> FetchConfig {
        let ready_capacity = self.ready_capacity.unwrap_or(30).max(1);
        FetchConfig {
            sources: self
                .sources
                .unwrap_or_else(|| DEFAULT_SOURCES.iter().map(|s| s.to_string()).collect()),
            proxy_scheme: self.proxy_scheme.unwrap_or(ProxyScheme::Http),
            ready_capacity,
            low_water_mark: self.low_water_mark.unwrap_or(8).min(ready_capacity),
            refresh_interval: self.refresh_interval.unwrap_or(Duration::from_secs(45 * 60)),
            validation_batch_size: self.validation_batch_size.unwrap_or(30).max(1),
            validation_concurrency: self.validation_concurrency.unwrap_or(10).max(1),
            validations_per_second: self.validations_per_second.unwrap_or(5).max(1),
            validation_timeout: self.validation_timeout.unwrap_or(Duration::from_secs(10)),
            validation_video_id: self
                .validation_video_id
                .unwrap_or_else(|| DEFAULT_VALIDATION_VIDEO_ID.to_string()),
            max_attempts: self.max_attempts.unwrap_or(4).max(1),
            attempt_timeout: self.attempt_timeout.unwrap_or(Duration::from_secs(20)),
            list_fetch_timeout: self.list_fetch_timeout.unwrap_or(Duration::from_secs(15)),
            maintenance_interval: self.maintenance_interval.unwrap_or(Duration::from_secs(30)),
            startup_delay: self.startup_delay.unwrap_or(Duration::from_secs(5)),
            error_backoff: self.error_backoff.unwrap_or(Duration::from_secs(120)),
            refill_cooldown: self.refill_cooldown.unwrap_or(Duration::from_secs(5)),
            cookie_file: self.cookie_file,
            user_agent: self.user_agent.unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
        }
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("Ignoring malformed {}={:?}", key, raw);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_usable() {
        let config = FetchConfig::default();
        assert_eq!(config.ready_capacity, 30);
        assert_eq!(config.low_water_mark, 8);
        assert_eq!(config.validation_batch_size, 30);
        assert_eq!(config.max_attempts, 4);
        assert_eq!(config.refresh_interval, Duration::from_secs(2700));
        assert_eq!(config.refill_cooldown, Duration::from_secs(5));
        assert_eq!(config.sources.len(), DEFAULT_SOURCES.len());
        assert_eq!(config.proxy_scheme, ProxyScheme::Http);
        assert!(config.cookie_file.is_none());
    }

    #[test]
    fn build_clamps_degenerate_values() {
        let config = FetchConfig::builder()
            .ready_capacity(0)
            .low_water_mark(50)
            .max_attempts(0)
            .validation_batch_size(0)
            .validation_concurrency(0)
            .build();
        assert_eq!(config.ready_capacity, 1);
        assert_eq!(config.low_water_mark, 1);
        assert_eq!(config.max_attempts, 1);
        assert_eq!(config.validation_batch_size, 1);
        assert_eq!(config.validation_concurrency, 1);
    }

    #[test]
    fn env_overlay() {
        std::env::set_var("READY_POOL_CAPACITY", "12");
        std::env::set_var("FETCH_MAX_ATTEMPTS", "not-a-number");
        std::env::set_var("PROXY_SOURCES", " /tmp/a.txt, ,https://example.com/list.txt ");
        std::env::set_var("PROXY_SCHEME", "socks5");

        let config = FetchConfig::from_env();

        std::env::remove_var("READY_POOL_CAPACITY");
        std::env::remove_var("FETCH_MAX_ATTEMPTS");
        std::env::remove_var("PROXY_SOURCES");
        std::env::remove_var("PROXY_SCHEME");

        assert_eq!(config.ready_capacity, 12);
        assert_eq!(config.max_attempts, 4);
        assert_eq!(config.sources, vec!["/tmp/a.txt", "https://example.com/list.txt"]);
        assert_eq!(config.proxy_scheme, ProxyScheme::Socks5);
    }
}
