//! Listen addresses for supervised servers

use std::net::TcpListener;

use reqwest::Url;

use crate::error::{ProcessError, Result};

/// Host and port a supervised server listens on
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ListenAddr {
    /// Host name or IP
    pub address: String,
    /// Port as a decimal string
    pub port: String,
}

impl ListenAddr {
    /// Create a listen address
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port: port.to_string(),
        }
    }

    /// Pick a free port on `host` by binding port 0 and releasing it
    pub fn suggest(host: &str) -> Result<Self> {
        let host = if host.is_empty() { "127.0.0.1" } else { host };
        let listener = TcpListener::bind((host, 0))
            .map_err(|e| ProcessError::config(format!("no free port on {host}: {e}")))?;
        let port = listener
            .local_addr()
            .map_err(|e| ProcessError::config(format!("no free port on {host}: {e}")))?
            .port();
        Ok(Self::new(host, port))
    }

    /// `host:port`, bracketing IPv6 literals
    pub fn host_port(&self) -> String {
        if self.address.contains(':') && !self.address.starts_with('[') {
            format!("[{}]:{}", self.address, self.port)
        } else {
            format!("{}:{}", self.address, self.port)
        }
    }

    /// Numeric port
    pub fn port_number(&self) -> Result<u16> {
        self.port
            .parse()
            .map_err(|_| ProcessError::config(format!("invalid port {:?}", self.port)))
    }

    /// URL for `path` on this address
    pub fn url(&self, scheme: &str, path: &str) -> Result<Url> {
        let path = path.trim_start_matches('/');
        Url::parse(&format!("{scheme}://{}/{path}", self.host_port()))
            .map_err(|e| ProcessError::config(format!("invalid url for {}: {e}", self.host_port())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suggested_port_is_nonzero() {
        let addr = ListenAddr::suggest("127.0.0.1").unwrap();
        assert_eq!(addr.address, "127.0.0.1");
        assert_ne!(addr.port_number().unwrap(), 0);
    }

    #[test]
    fn url_joins_scheme_host_and_path() {
        let addr = ListenAddr::new("localhost", 6443);
        assert_eq!(
            addr.url("https", "/healthz").unwrap().as_str(),
            "https://localhost:6443/healthz"
        );
    }

    #[test]
    fn ipv6_hosts_are_bracketed() {
        let addr = ListenAddr::new("::1", 2379);
        assert_eq!(addr.host_port(), "[::1]:2379");
    }
}
