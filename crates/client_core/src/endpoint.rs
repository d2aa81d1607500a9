use std::fmt;

use thiserror::Error;
use url::Url;

use crate::socket_io::HANDSHAKE_QUERY;

pub const DEFAULT_PORT: u16 = 5000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EndpointError {
    #[error("invalid server url {0:?}: {1}")]
    Parse(String, String),
    #[error("server url must start with http:// or https://, got {0:?}")]
    Scheme(String),
    #[error("server url {0:?} has no host")]
    MissingHost(String),
}

/// Base address of the collaborator. Every component receives one of these at
/// construction; nothing reads the address from ambient state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    base: Url,
}

impl Endpoint {
    pub fn parse(raw: &str) -> Result<Self, EndpointError> {
        let raw = raw.trim();
        let base =
            Url::parse(raw).map_err(|err| EndpointError::Parse(raw.to_string(), err.to_string()))?;
        if base.scheme() != "http" && base.scheme() != "https" {
            return Err(EndpointError::Scheme(raw.to_string()));
        }
        if base.host_str().map_or(true, str::is_empty) {
            return Err(EndpointError::MissingHost(raw.to_string()));
        }
        Ok(Self { base })
    }

    pub fn from_host(host: &str, port: u16) -> Result<Self, EndpointError> {
        Self::parse(&format!("http://{}:{port}", host.trim()))
    }

    fn prefix(&self) -> &str {
        self.base.as_str().trim_end_matches('/')
    }

    /// Absolute URL of a REST route such as `/api/students`.
    pub fn rest(&self, path: &str) -> String {
        format!("{}/{}", self.prefix(), path.trim_start_matches('/'))
    }

    /// Websocket URL of the collaborator's Socket.IO endpoint.
    pub fn live_url(&self) -> Url {
        let mut url = self.base.clone();
        let scheme = if self.base.scheme() == "https" {
            "wss"
        } else {
            "ws"
        };
        // http(s) -> ws(s) is always a permitted scheme change.
        let _ = url.set_scheme(scheme);
        let path = format!("{}/socket.io/", self.base.path().trim_end_matches('/'));
        url.set_path(&path);
        url.set_query(Some(HANDSHAKE_QUERY));
        url
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_and_port_build_rest_and_live_urls() {
        let endpoint = Endpoint::from_host("192.168.43.41", DEFAULT_PORT).expect("endpoint");
        assert_eq!(
            endpoint.rest("/api/students"),
            "http://192.168.43.41:5000/api/students"
        );
        assert_eq!(
            endpoint.live_url().as_str(),
            "ws://192.168.43.41:5000/socket.io/?EIO=4&transport=websocket"
        );
    }

    #[test]
    fn https_maps_to_wss_and_keeps_path_prefix() {
        let endpoint = Endpoint::parse("https://kiosk.example.org/console/").expect("endpoint");
        assert_eq!(
            endpoint.rest("api/unassigned-cards"),
            "https://kiosk.example.org/console/api/unassigned-cards"
        );
        assert_eq!(
            endpoint.live_url().as_str(),
            "wss://kiosk.example.org/console/socket.io/?EIO=4&transport=websocket"
        );
    }

    #[test]
    fn rejects_non_http_schemes() {
        assert!(matches!(
            Endpoint::parse("ftp://kiosk"),
            Err(EndpointError::Scheme(_))
        ));
        assert!(matches!(
            Endpoint::parse("not a url"),
            Err(EndpointError::Parse(_, _))
        ));
    }
}
