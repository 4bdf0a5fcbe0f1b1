//! WebSocket URL parsing

use url::Url;

use crate::websocket::Error;

/// Parsed parts of a `ws:`/`wss:` URL, in the form the transport stack
/// consumes them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WsUrl {
    /// `ws` or `wss`.
    pub scheme: String,
    /// Host to resolve, IPv6 brackets stripped.
    pub hostname: String,
    /// Port as a string, defaulted to 80/443 by scheme.
    pub service: String,
    /// Value for the `Host` header: `host:port` when the URL carried an
    /// explicit port, bare host otherwise. IPv6 brackets are kept.
    pub host: String,
    /// Request path including the query string, `/` when absent.
    pub path: String,
}

impl WsUrl {
    /// Parse a WebSocket URL.
    ///
    /// The scheme defaults to `ws` when absent and must otherwise be `ws`
    /// or `wss`. The host is mandatory. Fragments are discarded.
    pub fn parse(input: &str) -> Result<Self, Error> {
        // A bare "host/path" input re-parses with the default scheme.
        let parsed = if input.contains("://") {
            Url::parse(input)
        } else {
            Url::parse(&format!("ws://{input}"))
        }
        .map_err(|e| Error::InvalidUrl(format!("{input}: {e}")))?;

        let scheme = parsed.scheme().to_string();
        if scheme != "ws" && scheme != "wss" {
            return Err(Error::InvalidScheme(scheme));
        }

        let raw_host = parsed
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| Error::InvalidUrl(format!("{input}: missing host")))?
            .to_string();

        let (service, host) = match parsed.port() {
            Some(port) => (port.to_string(), format!("{raw_host}:{port}")),
            None => {
                let default = if scheme == "ws" { "80" } else { "443" };
                (default.to_string(), raw_host.clone())
            }
        };

        let hostname = raw_host
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();

        let mut path = parsed.path().to_string();
        if path.is_empty() {
            path.push('/');
        }
        if let Some(query) = parsed.query() {
            if !query.is_empty() {
                path.push('?');
                path.push_str(query);
            }
        }

        Ok(Self {
            scheme,
            hostname,
            service,
            host,
            path,
        })
    }

    pub fn is_secure(&self) -> bool {
        self.scheme == "wss"
    }
}
