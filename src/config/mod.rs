//! TOML configuration: what to crawl, how wide, and how to talk HTTP.

use std::path::Path;

use regex::Regex;
use serde::Deserialize;
use url::Url;

use crate::{ConfigError, UrlError};

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub crawler: CrawlerConfig,
    #[serde(default)]
    pub http: HttpConfig,
}

/// Crawl behavior configuration
#[derive(Debug, Clone, Deserialize)]
pub struct CrawlerConfig {
    /// Absolute URL the crawl starts from
    #[serde(rename = "seed-url")]
    pub seed_url: String,

    /// egrep-style pattern searched for on every fetched page
    #[serde(rename = "grep-pattern")]
    pub grep_pattern: String,

    /// Ceiling on child URLs spawned across the whole tree
    #[serde(rename = "max-links", default = "default_max_links")]
    pub max_links: usize,

    /// Worker pool size
    #[serde(default = "default_threads")]
    pub threads: usize,

    /// Ceiling on live nodes per crawl tree
    #[serde(rename = "max-nodes", default = "default_max_nodes")]
    pub max_nodes: u32,
}

/// HTTP client configuration
#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    #[serde(rename = "user-agent", default = "default_user_agent")]
    pub user_agent: String,

    /// Whole-request timeout; workers block on I/O, so this is also the
    /// upper bound on how long one job can occupy its thread.
    #[serde(rename = "timeout-secs", default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        HttpConfig {
            user_agent: default_user_agent(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_max_links() -> usize {
    4096
}

fn default_threads() -> usize {
    4
}

fn default_max_nodes() -> u32 {
    8192
}

fn default_user_agent() -> String {
    format!("pagegrep/{}", env!("CARGO_PKG_VERSION"))
}

fn default_timeout_secs() -> u64 {
    30
}

/// Loads, parses and validates a configuration file.
///
/// # Arguments
///
/// * `path` - Path to the TOML configuration file
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    let config: Config = toml::from_str(&content)?;
    validate(&config)?;
    Ok(config)
}

/// Checks the values a crawl cannot start with.
pub fn validate(config: &Config) -> Result<(), ConfigError> {
    validate_seed_url(&config.crawler.seed_url)?;

    if config.crawler.grep_pattern.is_empty() {
        return Err(ConfigError::Validation(
            "grep-pattern must not be empty".to_string(),
        ));
    }
    Regex::new(&config.crawler.grep_pattern)?;

    if config.crawler.threads == 0 {
        return Err(ConfigError::Validation(
            "threads must be at least 1".to_string(),
        ));
    }
    if config.crawler.max_links == 0 {
        return Err(ConfigError::Validation(
            "max-links must be at least 1".to_string(),
        ));
    }
    if config.crawler.max_nodes == 0 {
        return Err(ConfigError::Validation(
            "max-nodes must be at least 1".to_string(),
        ));
    }
    Ok(())
}

fn validate_seed_url(seed: &str) -> Result<(), UrlError> {
    let parsed = Url::parse(seed).map_err(|e| UrlError::Parse(e.to_string()))?;
    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        return Err(UrlError::InvalidScheme(parsed.scheme().to_string()));
    }
    if parsed.host_str().is_none() {
        return Err(UrlError::MissingHost);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn create_temp_config(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_load_valid_config() {
        let file = create_temp_config(
            r#"
[crawler]
seed-url = "https://example.com/"
grep-pattern = "rust"
max-links = 128
threads = 8
max-nodes = 256

[http]
user-agent = "TestBot/1.0"
timeout-secs = 5
"#,
        );
        let config = load_config(file.path()).unwrap();
        assert_eq!(config.crawler.seed_url, "https://example.com/");
        assert_eq!(config.crawler.grep_pattern, "rust");
        assert_eq!(config.crawler.max_links, 128);
        assert_eq!(config.crawler.threads, 8);
        assert_eq!(config.crawler.max_nodes, 256);
        assert_eq!(config.http.user_agent, "TestBot/1.0");
        assert_eq!(config.http.timeout_secs, 5);
    }

    #[test]
    fn test_defaults_applied() {
        let file = create_temp_config(
            r#"
[crawler]
seed-url = "http://example.com/"
grep-pattern = "x"
"#,
        );
        let config = load_config(file.path()).unwrap();
        assert_eq!(config.crawler.max_links, 4096);
        assert_eq!(config.crawler.threads, 4);
        assert_eq!(config.crawler.max_nodes, 8192);
        assert_eq!(config.http.timeout_secs, 30);
        assert!(config.http.user_agent.starts_with("pagegrep/"));
    }

    #[test]
    fn test_load_config_with_invalid_path() {
        let result = load_config(Path::new("/nonexistent/config.toml"));
        assert!(matches!(result, Err(ConfigError::Io(_))));
    }

    #[test]
    fn test_load_config_with_invalid_toml() {
        let file = create_temp_config("this is not valid TOML {{{");
        assert!(matches!(load_config(file.path()), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_rejects_relative_seed_url() {
        let file = create_temp_config(
            r#"
[crawler]
seed-url = "/just/a/path"
grep-pattern = "x"
"#,
        );
        assert!(matches!(load_config(file.path()), Err(ConfigError::Seed(_))));
    }

    #[test]
    fn test_rejects_non_http_scheme() {
        let file = create_temp_config(
            r#"
[crawler]
seed-url = "ftp://example.com/"
grep-pattern = "x"
"#,
        );
        assert!(matches!(
            load_config(file.path()),
            Err(ConfigError::Seed(UrlError::InvalidScheme(_)))
        ));
    }

    #[test]
    fn test_rejects_bad_pattern() {
        let file = create_temp_config(
            r#"
[crawler]
seed-url = "http://example.com/"
grep-pattern = "unclosed ["
"#,
        );
        assert!(matches!(
            load_config(file.path()),
            Err(ConfigError::Pattern(_))
        ));
    }

    #[test]
    fn test_rejects_zero_threads() {
        let file = create_temp_config(
            r#"
[crawler]
seed-url = "http://example.com/"
grep-pattern = "x"
threads = 0
"#,
        );
        assert!(matches!(
            load_config(file.path()),
            Err(ConfigError::Validation(_))
        ));
    }
}
