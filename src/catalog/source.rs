// SPDX-License-Identifier: PMPL-1.0-or-later

//! Catalog location resolution.
//!
//! A location hint is tried as a filesystem path, then as an http(s) URL that
//! answers a probe, then as the name of a catalog compiled into the binary.

use crate::error::ChaosError;
use anyhow::{anyhow, Context, Result};
use reqwest::Url;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

const EMBEDDED_PREFIXES: [&str; 2] = ["embedded:", "classpath:"];

static EMBEDDED: &[(&str, &str)] = &[(
    "instance_catalog.example.json",
    include_str!("../../resources/instance_catalog.example.json"),
)];

#[derive(Debug, Clone)]
pub enum CatalogSource {
    File(PathBuf),
    Url(Url),
    Embedded {
        name: &'static str,
        content: &'static str,
    },
}

impl CatalogSource {
    pub fn resolve(hint: &str, timeout: Duration) -> std::result::Result<Self, ChaosError> {
        info!(location = hint, "configuring instance catalog location");

        if Path::new(hint).exists() {
            return Ok(CatalogSource::File(PathBuf::from(hint)));
        }

        if let Some(url) = probe_url(hint, timeout) {
            return Ok(CatalogSource::Url(url));
        }

        if let Some((name, content)) = embedded(hint) {
            return Ok(CatalogSource::Embedded { name, content });
        }

        Err(ChaosError::CatalogUnresolved(hint.to_string()))
    }

    /// Fetch the raw document. Every call goes back to the source.
    pub fn read(&self, timeout: Duration) -> Result<String> {
        match self {
            CatalogSource::File(path) => fs::read_to_string(path)
                .with_context(|| format!("reading catalog {}", path.display())),
            CatalogSource::Url(url) => {
                let response = http_client(timeout)?
                    .get(url.clone())
                    .send()
                    .with_context(|| format!("fetching catalog {}", url))?
                    .error_for_status()
                    .with_context(|| format!("fetching catalog {}", url))?;
                response
                    .text()
                    .with_context(|| format!("reading catalog body from {}", url))
            }
            CatalogSource::Embedded { content, .. } => Ok((*content).to_string()),
        }
    }
}

impl fmt::Display for CatalogSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CatalogSource::File(path) => write!(f, "file:{}", path.display()),
            CatalogSource::Url(url) => write!(f, "{}", url),
            CatalogSource::Embedded { name, .. } => write!(f, "embedded:{}", name),
        }
    }
}

fn http_client(timeout: Duration) -> Result<reqwest::blocking::Client> {
    reqwest::blocking::Client::builder()
        .timeout(timeout)
        .connect_timeout(timeout)
        .build()
        .map_err(|err| anyhow!("building http client: {}", err))
}

fn probe_url(hint: &str, timeout: Duration) -> Option<Url> {
    let url = Url::parse(hint).ok()?;
    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }
    let client = match http_client(timeout) {
        Ok(client) => client,
        Err(err) => {
            warn!(url = %url, error = %err, "cannot probe catalog url");
            return None;
        }
    };
    // Any response means the host is there; status is checked on read.
    match client.head(url.clone()).send() {
        Ok(_) => Some(url),
        Err(err) => {
            warn!(url = %url, error = %err, "catalog url parsed, but could not connect");
            None
        }
    }
}

fn embedded(hint: &str) -> Option<(&'static str, &'static str)> {
    let name = EMBEDDED_PREFIXES
        .iter()
        .find_map(|prefix| hint.strip_prefix(prefix))
        .unwrap_or(hint)
        .trim_start_matches('/');
    EMBEDDED
        .iter()
        .find(|(candidate, _)| *candidate == name)
        .copied()
}

/// Names of catalogs compiled into the binary.
pub fn embedded_names() -> impl Iterator<Item = &'static str> {
    EMBEDDED.iter().map(|(name, _)| *name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{InstanceCatalog, JsonInstanceCatalog};
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::sync::atomic::{AtomicU16, Ordering};
    use std::sync::Arc;
    use std::thread;
    use tempfile::TempDir;

    const PROBE: Duration = Duration::from_millis(500);

    /// Minimal HTTP/1.1 server answering HEAD and GET for any path with the
    /// bundled two-group catalog, or an empty body under any other status.
    fn serve_catalog(status: Arc<AtomicU16>) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().expect("addr").port();
        thread::spawn(move || {
            for stream in listener.incoming().flatten() {
                answer(stream, status.load(Ordering::SeqCst));
            }
        });
        port
    }

    fn answer(mut stream: TcpStream, status: u16) {
        let mut request: Vec<u8> = Vec::new();
        let mut buf = [0u8; 1024];
        while !request.windows(4).any(|w| w == b"\r\n\r\n") {
            match stream.read(&mut buf) {
                Ok(0) | Err(_) => return,
                Ok(n) => request.extend_from_slice(&buf[..n]),
            }
        }
        let body = if status == 200 { EMBEDDED[0].1 } else { "" };
        let reason = if status == 200 { "OK" } else { "Service Unavailable" };
        let mut response = format!("HTTP/1.1 {} {}\r\n", status, reason);
        response.push_str("Content-Type: application/json\r\nConnection: close\r\n");
        response.push_str(&format!("Content-Length: {}\r\n\r\n", body.len()));
        if !request.starts_with(b"HEAD") {
            response.push_str(body);
        }
        let _ = stream.write_all(response.as_bytes());
    }

    #[test]
    fn existing_file_wins() {
        let dir = TempDir::new().expect("tempdir should create");
        let path = dir.path().join("catalog.json");
        fs::write(&path, "[]").expect("catalog should write");
        let source = CatalogSource::resolve(&path.to_string_lossy(), PROBE).expect("resolves");
        assert!(matches!(source, CatalogSource::File(_)));
        assert_eq!(source.read(PROBE).expect("reads"), "[]");
    }

    #[test]
    fn embedded_lookup_accepts_prefixes() {
        for hint in [
            "instance_catalog.example.json",
            "classpath:instance_catalog.example.json",
            "embedded:/instance_catalog.example.json",
        ] {
            let source = CatalogSource::resolve(hint, PROBE).expect("embedded resolves");
            assert!(matches!(source, CatalogSource::Embedded { .. }), "{}", hint);
        }
    }

    #[test]
    fn nothing_resolves() {
        let err = CatalogSource::resolve("no/such/catalog.json", PROBE).unwrap_err();
        assert!(matches!(err, ChaosError::CatalogUnresolved(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn unreachable_url_is_not_resolved() {
        // port 9 on localhost is closed in any sane test environment
        let err = CatalogSource::resolve("http://127.0.0.1:9/catalog.json", PROBE).unwrap_err();
        assert!(matches!(err, ChaosError::CatalogUnresolved(_)));
    }

    #[test]
    fn http_catalog_resolves_and_loads() {
        let status = Arc::new(AtomicU16::new(200));
        let port = serve_catalog(status.clone());
        let location = format!("http://127.0.0.1:{}/catalog.json", port);

        let source = CatalogSource::resolve(&location, PROBE).expect("url resolves");
        assert!(matches!(source, CatalogSource::Url(_)));
        assert!(source.read(PROBE).expect("reads").contains("appServers"));

        let catalog = JsonInstanceCatalog::new(&location).expect("catalog resolves");
        assert!(matches!(catalog.source(), CatalogSource::Url(_)));
        let groups = catalog.instance_groups();
        assert_eq!(groups.len(), 2);

        // the server starts failing: no groups, but the last index is kept
        status.store(503, Ordering::SeqCst);
        assert!(source.read(PROBE).is_err());
        assert!(catalog.instance_groups().is_empty());
        assert!(catalog.instance("instance4").is_some());
    }

    #[test]
    fn embedded_names_lists_bundled_catalogs() {
        assert!(embedded_names().any(|name| name == "instance_catalog.example.json"));
    }
}
