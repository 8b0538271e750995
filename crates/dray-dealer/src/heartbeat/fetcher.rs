//! Candidate host fetchers.
//!
//! A fetcher returns the raw `host:port` candidates for one service; the
//! collector is responsible for probing them. Two variants exist: a local
//! file with one host per line, and an HTTP resource serving the same
//! format.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::config::{AutodiscoveryConfig, DiscoveryKind, DEFAULT_CONTROL_PORT};
use crate::error::DealerError;

pub enum HostsFetcher {
    File { path: std::path::PathBuf },
    Http { url: String },
}

impl HostsFetcher {
    pub fn from_config(discovery: &AutodiscoveryConfig) -> Result<Self, DealerError> {
        match discovery.kind {
            DiscoveryKind::File => Ok(HostsFetcher::File {
                path: discovery.source.clone().into(),
            }),
            DiscoveryKind::Http => Ok(HostsFetcher::Http {
                url: discovery.source.clone(),
            }),
            DiscoveryKind::Multicast => Err(DealerError::Resolver(
                "multicast autodiscovery is not supported".into(),
            )),
        }
    }

    /// Fetch the current candidate list. Lines are `host[:port]`; blank
    /// lines and `#` comments are ignored and the default control port is
    /// filled in where missing.
    pub async fn fetch(&self) -> Result<Vec<String>, DealerError> {
        let body = match self {
            HostsFetcher::File { path } => tokio::fs::read_to_string(path)
                .await
                .map_err(|e| DealerError::Resolver(format!("{}: {}", path.display(), e)))?,
            HostsFetcher::Http { url } => http_get(url).await?,
        };
        Ok(parse_hosts(&body))
    }
}

fn parse_hosts(body: &str) -> Vec<String> {
    body.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| {
            if line.contains(':') {
                line.to_owned()
            } else {
                format!("{}:{}", line, DEFAULT_CONTROL_PORT)
            }
        })
        .collect()
}

/// Minimal HTTP/1.0 GET. Discovery bodies are tiny line lists; anything
/// fancier belongs to the resource serving them.
async fn http_get(url: &str) -> Result<String, DealerError> {
    let rest = url
        .strip_prefix("http://")
        .ok_or_else(|| DealerError::Resolver(format!("unsupported url '{}'", url)))?;
    let (authority, path) = match rest.find('/') {
        Some(idx) => (&rest[..idx], &rest[idx..]),
        None => (rest, "/"),
    };
    let address = if authority.contains(':') {
        authority.to_owned()
    } else {
        format!("{}:80", authority)
    };

    let mut stream = TcpStream::connect(&address)
        .await
        .map_err(|e| DealerError::Resolver(format!("{}: {}", address, e)))?;
    let request = format!(
        "GET {} HTTP/1.0\r\nHost: {}\r\nConnection: close\r\n\r\n",
        path, authority
    );
    stream
        .write_all(request.as_bytes())
        .await
        .map_err(|e| DealerError::Resolver(e.to_string()))?;

    let mut response = Vec::new();
    stream
        .read_to_end(&mut response)
        .await
        .map_err(|e| DealerError::Resolver(e.to_string()))?;
    let response = String::from_utf8_lossy(&response);

    let (head, body) = response
        .split_once("\r\n\r\n")
        .ok_or_else(|| DealerError::Resolver("truncated http response".into()))?;
    let status = head.lines().next().unwrap_or_default();
    if !status.contains(" 200 ") {
        return Err(DealerError::Resolver(format!(
            "'{}' answered '{}'",
            url, status
        )));
    }
    Ok(body.to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn host_lines_get_the_default_port() {
        let hosts = parse_hosts("10.0.0.1\n# comment\n\n10.0.0.2:6000\n");
        assert_eq!(hosts, vec!["10.0.0.1:5555", "10.0.0.2:6000"]);
    }

    #[tokio::test]
    async fn file_fetcher_reads_hosts() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "127.0.0.1:9001").unwrap();
        writeln!(file, "# down for maintenance").unwrap();
        writeln!(file, "127.0.0.2").unwrap();

        let fetcher = HostsFetcher::File {
            path: file.path().to_owned(),
        };
        let hosts = fetcher.fetch().await.unwrap();
        assert_eq!(hosts, vec!["127.0.0.1:9001", "127.0.0.2:5555"]);
    }

    #[tokio::test]
    async fn missing_file_is_a_resolver_error() {
        let fetcher = HostsFetcher::File {
            path: "/nonexistent/dray-hosts".into(),
        };
        assert!(fetcher.fetch().await.is_err());
    }

    #[test]
    fn multicast_is_rejected() {
        let discovery = AutodiscoveryConfig {
            source: "226.1.1.1".into(),
            kind: DiscoveryKind::Multicast,
        };
        assert!(HostsFetcher::from_config(&discovery).is_err());
    }
}
