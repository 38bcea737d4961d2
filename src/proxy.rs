//! HTTP(S) proxy settings propagated into the cluster.

use camino::Utf8PathBuf;
use thiserror::Error;

use crate::host_fs::{self, FsError};

/// Hosts that always bypass the proxy.
pub const DEFAULT_NO_PROXIES: [&str; 2] = ["127.0.0.1", "localhost"];

/// Cluster-internal destinations that bypass the proxy inside the VM.
pub const INTERNAL_NO_PROXY: &str = ".cluster.local,.svc,10.128.0.0/14,172.30.0.0/16";

/// Errors raised while building a [`ProxyConfig`].
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ProxyError {
    /// Raised for `https://` proxy URLs.
    #[error("proxy URL '{url}' is invalid: https is not supported")]
    HttpsUnsupported {
        /// Rejected URL.
        url: String,
    },
    /// Raised for URLs without the `http://` scheme.
    #[error("proxy URL '{url}' is invalid: it must start with http://")]
    MissingScheme {
        /// Rejected URL.
        url: String,
    },
    /// Raised when the proxy CA bundle cannot be read.
    #[error(transparent)]
    CaFile(#[from] FsError),
}

/// Validates a proxy URL. Empty values are accepted and mean "no proxy".
///
/// # Errors
///
/// Returns [`ProxyError`] for `https://` URLs or URLs without a scheme.
pub fn validate_proxy_url(url: &str) -> Result<(), ProxyError> {
    if url.is_empty() {
        return Ok(());
    }
    if url.starts_with("https://") {
        return Err(ProxyError::HttpsUnsupported {
            url: url.to_owned(),
        });
    }
    if !url.starts_with("http://") {
        return Err(ProxyError::MissingScheme {
            url: url.to_owned(),
        });
    }
    Ok(())
}

/// Validated proxy configuration.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ProxyConfig {
    /// Proxy for plain HTTP traffic.
    pub http_proxy: String,
    /// Proxy for HTTPS traffic.
    pub https_proxy: String,
    /// Hosts that bypass the proxy, excluding the defaults.
    pub no_proxy: Vec<String>,
    /// PEM bundle trusted for the proxy, already read from disk.
    pub proxy_ca_cert: String,
    /// Location the CA bundle was read from.
    pub proxy_ca_file: Option<Utf8PathBuf>,
}

fn env_proxy(lower: &str, upper: &str) -> String {
    std::env::var(lower)
        .ok()
        .filter(|value| !value.is_empty())
        .or_else(|| std::env::var(upper).ok())
        .unwrap_or_default()
}

impl ProxyConfig {
    /// Builds a configuration, falling back to `http_proxy`/`HTTP_PROXY`,
    /// `https_proxy`/`HTTPS_PROXY`, and `no_proxy`/`NO_PROXY` when the
    /// explicit values are empty.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError`] when a URL is invalid or the CA file cannot be
    /// read.
    pub fn new(
        http_proxy: &str,
        https_proxy: &str,
        no_proxy: &str,
        proxy_ca_file: Option<Utf8PathBuf>,
    ) -> Result<Self, ProxyError> {
        let http = if http_proxy.is_empty() {
            env_proxy("http_proxy", "HTTP_PROXY")
        } else {
            http_proxy.to_owned()
        };
        let https = if https_proxy.is_empty() {
            env_proxy("https_proxy", "HTTPS_PROXY")
        } else {
            https_proxy.to_owned()
        };
        let bypass = if no_proxy.is_empty() {
            env_proxy("no_proxy", "NO_PROXY")
        } else {
            no_proxy.to_owned()
        };
        validate_proxy_url(&http)?;
        validate_proxy_url(&https)?;

        let proxy_ca_cert = match &proxy_ca_file {
            Some(path) => host_fs::read_to_string(path)?.trim_end().to_owned(),
            None => String::new(),
        };

        let mut config = Self {
            http_proxy: http,
            https_proxy: https,
            no_proxy: Vec::new(),
            proxy_ca_cert,
            proxy_ca_file,
        };
        config.add_no_proxy(&bypass);
        Ok(config)
    }

    /// Appends comma-separated hosts to the bypass list, ignoring blanks,
    /// defaults, and duplicates.
    pub fn add_no_proxy(&mut self, hosts: &str) {
        for host in hosts.split(',').map(str::trim).filter(|h| !h.is_empty()) {
            let known = DEFAULT_NO_PROXIES.contains(&host)
                || self.no_proxy.iter().any(|existing| existing == host);
            if !known {
                self.no_proxy.push(host.to_owned());
            }
        }
    }

    /// Comma-separated bypass list starting with the default hosts.
    #[must_use]
    pub fn no_proxy_string(&self) -> String {
        DEFAULT_NO_PROXIES
            .iter()
            .copied()
            .chain(self.no_proxy.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Returns `true` when either proxy URL is set.
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        !self.http_proxy.is_empty() || !self.https_proxy.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::EnvGuard;
    use rstest::rstest;

    #[rstest]
    #[case("", true)]
    #[case("http://proxy.example:3128", true)]
    #[case("https://proxy.example:3128", false)]
    #[case("proxy.example:3128", false)]
    fn validates_proxy_urls(#[case] url: &str, #[case] valid: bool) {
        assert_eq!(validate_proxy_url(url).is_ok(), valid);
    }

    #[test]
    fn https_error_names_the_reason() {
        let err = validate_proxy_url("https://p").expect_err("https rejected");
        assert!(err.to_string().contains("https is not supported"));
    }

    #[test]
    fn no_proxy_string_starts_with_defaults_and_dedupes() {
        let _env = EnvGuard::set_vars(&[("no_proxy", ""), ("NO_PROXY", "")]);
        let config = ProxyConfig::new(
            "http://proxy:3128",
            "",
            "localhost, .example.com,.example.com",
            None,
        )
        .expect("valid config");

        assert_eq!(config.no_proxy_string(), "127.0.0.1,localhost,.example.com");
        assert!(config.is_enabled());
    }

    #[test]
    fn falls_back_to_environment() {
        let _env = EnvGuard::set_vars(&[
            ("http_proxy", ""),
            ("HTTP_PROXY", "http://env-proxy:8080"),
            ("https_proxy", ""),
            ("HTTPS_PROXY", ""),
            ("no_proxy", ""),
            ("NO_PROXY", ""),
        ]);

        let config = ProxyConfig::new("", "", "", None).expect("valid config");

        assert_eq!(config.http_proxy, "http://env-proxy:8080");
        assert!(config.https_proxy.is_empty());
    }

    #[test]
    fn disabled_without_urls() {
        assert!(!ProxyConfig::default().is_enabled());
    }
}
