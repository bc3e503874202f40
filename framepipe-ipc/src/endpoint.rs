// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("invalid endpoint '{0}': expected tcp://host:port or ipc://path")]
pub struct EndpointParseError(pub String);

/// A channel endpoint. `tcp://host:port` binds or connects over TCP,
/// `ipc://path` over a Unix domain socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Tcp(String),
    Ipc(PathBuf),
}

impl Endpoint {
    pub fn parse(uri: &str) -> Result<Endpoint, EndpointParseError> {
        if let Some(addr) = uri.strip_prefix("tcp://") {
            if addr.rsplit_once(':').is_none() {
                return Err(EndpointParseError(uri.to_string()));
            }
            // A wildcard bind address in the zmq style
            let addr = addr.replacen('*', "0.0.0.0", 1);
            return Ok(Endpoint::Tcp(addr));
        }
        if let Some(path) = uri.strip_prefix("ipc://") {
            if path.is_empty() {
                return Err(EndpointParseError(uri.to_string()));
            }
            return Ok(Endpoint::Ipc(PathBuf::from(path)));
        }
        Err(EndpointParseError(uri.to_string()))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp(addr) => write!(f, "tcp://{addr}"),
            Endpoint::Ipc(path) => write!(f, "ipc://{}", path.display()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_tcp() {
        assert_eq!(
            Endpoint::parse("tcp://127.0.0.1:5000").unwrap(),
            Endpoint::Tcp("127.0.0.1:5000".to_string())
        );
        assert_eq!(
            Endpoint::parse("tcp://*:5558").unwrap(),
            Endpoint::Tcp("0.0.0.0:5558".to_string())
        );
    }

    #[test]
    fn parse_ipc() {
        assert_eq!(
            Endpoint::parse("ipc:///tmp/fp_ctrl.sock").unwrap(),
            Endpoint::Ipc(PathBuf::from("/tmp/fp_ctrl.sock"))
        );
    }

    #[test]
    fn rejects_malformed() {
        assert!(Endpoint::parse("inproc://x").is_err());
        assert!(Endpoint::parse("tcp://nohostport").is_err());
        assert!(Endpoint::parse("ipc://").is_err());
    }
}
