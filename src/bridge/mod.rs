//! HTTP-to-SOCKS5 bridging proxies.
//!
//! Plain HTTP listeners that relay each request through a daemon's SOCKS5
//! port, letting clients without native SOCKS support use the fleet. The
//! request bytes are forwarded verbatim; only the request line is parsed,
//! and only far enough to extract the target host. No CONNECT/HTTPS
//! tunneling.

mod rotating;
mod single;

pub use rotating::RotatingBridgeProxy;
pub use single::BridgeProxy;

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_socks::tcp::Socks5Stream;
use tracing::{debug, warn};

use crate::config::{BridgeAddr, SocksEndpoint};
use crate::error::{FleetError, Result};
use crate::recv::read_until_short;

/// Read size on both relay legs; a shorter chunk ends the message.
const BRIDGE_CHUNK: usize = 1024;

/// Per-read timeout on both relay legs.
const RELAY_TIMEOUT: Duration = Duration::from_secs(10);

/// Bind the bridge listener: an explicit address, or an ephemeral
/// loopback port for [`BridgeAddr::Auto`].
pub(crate) async fn bind_listener(addr: Option<&BridgeAddr>) -> Result<(TcpListener, SocketAddr)> {
    let requested = match addr {
        None | Some(BridgeAddr::Auto) => SocketAddr::from(([127, 0, 0, 1], 0)),
        Some(BridgeAddr::Explicit(addr)) => *addr,
    };
    let listener = TcpListener::bind(requested).await?;
    let local_addr = listener.local_addr()?;
    Ok((listener, local_addr))
}

/// Extract the target host and port from an HTTP request.
///
/// Only absolute `http://` request targets are accepted; anything else
/// (origin-form targets, other schemes, CONNECT) is rejected so the
/// caller closes the connection without forwarding.
pub(crate) fn parse_target(request: &str) -> Result<(String, u16)> {
    let line = request.lines().next().ok_or(FleetError::UnknownProtocol)?;
    let mut parts = line.split_whitespace();
    let _method = parts.next().ok_or(FleetError::UnknownProtocol)?;
    let uri = parts.next().ok_or(FleetError::UnknownProtocol)?;

    let rest = uri.strip_prefix("http://").ok_or(FleetError::UnknownProtocol)?;
    let authority = rest.split('/').next().unwrap_or("");
    if authority.is_empty() {
        return Err(FleetError::UnknownProtocol);
    }

    // Bracketed IPv6 authority.
    if let Some(inner) = authority.strip_prefix('[') {
        if let Some((host, port)) = inner.split_once("]:") {
            let port = port.parse().map_err(|_| {
                FleetError::InvalidAddress(format!("bad port in '{}'", authority))
            })?;
            return Ok((host.to_string(), port));
        }
        return Ok((inner.trim_end_matches(']').to_string(), 80));
    }

    match authority.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() => {
            let port = port.parse().map_err(|_| {
                FleetError::InvalidAddress(format!("bad port in '{}'", authority))
            })?;
            Ok((host.to_string(), port))
        }
        _ => Ok((authority.to_string(), 80)),
    }
}

/// Forward raw request bytes through the SOCKS5 endpoint and collect the
/// backend's raw response.
pub(crate) async fn relay_through(
    socks: &SocksEndpoint,
    host: &str,
    port: u16,
    raw_request: &[u8],
) -> Result<Vec<u8>> {
    let mut upstream = Socks5Stream::connect((socks.host.as_str(), socks.port), (host, port))
        .await
        .map_err(|e| {
            FleetError::SocksConnectFailed(format!("{}:{} via {}: {}", host, port, socks, e))
        })?;

    upstream
        .write_all(raw_request)
        .await
        .map_err(|e| FleetError::Relay(format!("send to {}: {}", host, e)))?;

    let response = read_until_short(&mut upstream, BRIDGE_CHUNK, RELAY_TIMEOUT, None)
        .await
        .map_err(|e| FleetError::Relay(format!("receive from {}: {}", host, e)))?
        .ok_or_else(|| FleetError::Relay(format!("no response from {}", host)))?;

    Ok(response)
}

/// Serve one accepted client connection through the given SOCKS endpoint.
///
/// Every failure is logged and ends with the connection dropped; nothing
/// escapes to the accept loop.
pub(crate) async fn handle_connection(mut client: TcpStream, socks: SocksEndpoint, name: &str) {
    let raw = match read_until_short(&mut client, BRIDGE_CHUNK, RELAY_TIMEOUT, None).await {
        Ok(Some(raw)) => raw,
        Ok(None) => return,
        Err(e) => {
            debug!(bridge = name, error = %e, "client read failed");
            return;
        }
    };

    let request = String::from_utf8_lossy(&raw).to_string();
    let (host, port) = match parse_target(&request) {
        Ok(target) => target,
        Err(e) => {
            debug!(bridge = name, error = %e, "rejecting request");
            return;
        }
    };

    debug!(bridge = name, target = %host, backend = %socks, "relaying request");
    match relay_through(&socks, &host, port, &raw).await {
        Ok(response) => {
            if let Err(e) = client.write_all(&response).await {
                debug!(bridge = name, error = %e, "client write failed");
            }
        }
        Err(e) => {
            warn!(bridge = name, target = %host, error = %e, "relay failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_target_absolute_http() {
        assert_eq!(
            parse_target("GET http://example.invalid/ HTTP/1.1\r\nHost: example.invalid\r\n\r\n")
                .unwrap(),
            ("example.invalid".to_string(), 80)
        );
        assert_eq!(
            parse_target("GET http://example.invalid HTTP/1.1\r\n\r\n").unwrap(),
            ("example.invalid".to_string(), 80)
        );
        assert_eq!(
            parse_target("POST http://example.invalid:8080/api HTTP/1.1\r\n\r\n").unwrap(),
            ("example.invalid".to_string(), 8080)
        );
        assert_eq!(
            parse_target("GET http://[::1]:8080/ HTTP/1.1\r\n\r\n").unwrap(),
            ("::1".to_string(), 8080)
        );
    }

    #[test]
    fn test_parse_target_rejects_non_http() {
        for request in [
            "",
            "GET / HTTP/1.1\r\nHost: example.invalid\r\n\r\n",
            "GET https://example.invalid/ HTTP/1.1\r\n\r\n",
            "CONNECT example.invalid:443 HTTP/1.1\r\n\r\n",
            "GET http:/// HTTP/1.1\r\n\r\n",
            "GET\r\n\r\n",
        ] {
            assert!(parse_target(request).is_err(), "request: {:?}", request);
        }
    }

    #[test]
    fn test_parse_target_rejects_bad_port() {
        let err = parse_target("GET http://example.invalid:notaport/ HTTP/1.1\r\n\r\n").unwrap_err();
        assert!(matches!(err, FleetError::InvalidAddress(_)));
    }
}
