//! Egress address probing.
//!
//! Relays a minimal HTTP request through a daemon's SOCKS5 endpoint to an
//! address-echo service and extracts the externally visible address from
//! the response body.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio_socks::tcp::Socks5Stream;
use tracing::debug;

use crate::config::SocksEndpoint;
use crate::error::{FleetError, Result};
use crate::recv::read_until_short;

/// Read size for probe responses; a shorter chunk ends the response.
const PROBE_CHUNK: usize = 512;

/// Per-read timeout on the probe connection.
const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// Address-echo services, tried in order.
const PROBE_SERVICES: [&str; 2] = ["api.ipify.org", "checkip.amazonaws.com"];

/// Capability for observing the externally visible address behind a
/// SOCKS5 endpoint.
#[async_trait]
pub trait EgressProbe: Send + Sync {
    /// Probe the endpoint, returning the observed address or
    /// [`FleetError::EgressUnavailable`].
    async fn probe(&self, endpoint: &SocksEndpoint) -> Result<String>;
}

/// Production probe: one-shot HTTP GET through the SOCKS5 endpoint, with
/// a second echo service as fallback.
#[derive(Debug, Default, Clone)]
pub struct SocksIpProbe;

#[async_trait]
impl EgressProbe for SocksIpProbe {
    async fn probe(&self, endpoint: &SocksEndpoint) -> Result<String> {
        for service in PROBE_SERVICES {
            match fetch_via(endpoint, service).await {
                Ok(address) => return Ok(address),
                Err(e) => {
                    debug!(service, error = %e, "address probe attempt failed");
                }
            }
        }
        Err(FleetError::EgressUnavailable)
    }
}

async fn fetch_via(
    endpoint: &SocksEndpoint,
    service: &str,
) -> std::result::Result<String, anyhow::Error> {
    let mut stream =
        Socks5Stream::connect((endpoint.host.as_str(), endpoint.port), (service, 80)).await?;

    let request = format!(
        "GET / HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
        service
    );
    stream.write_all(request.as_bytes()).await?;

    let raw = read_until_short(&mut stream, PROBE_CHUNK, PROBE_TIMEOUT, None)
        .await?
        .ok_or_else(|| anyhow::anyhow!("empty response from {}", service))?;

    let text = String::from_utf8_lossy(&raw);
    extract_address(&text).ok_or_else(|| anyhow::anyhow!("no address in response from {}", service))
}

/// The echo services return the caller's address as the last line of the
/// response body.
fn extract_address(response: &str) -> Option<String> {
    let candidate = response
        .rsplit("\r\n")
        .flat_map(|l| l.rsplit('\n'))
        .map(str::trim)
        .find(|l| !l.is_empty())?;

    // Reject header-only responses.
    candidate.parse::<std::net::IpAddr>().ok()?;
    Some(candidate.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    #[test]
    fn test_extract_address() {
        let response = "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\n\r\n93.184.216.34\n";
        assert_eq!(
            extract_address(response),
            Some("93.184.216.34".to_string())
        );

        let no_newline = "HTTP/1.1 200 OK\r\n\r\n2001:db8::1";
        assert_eq!(extract_address(no_newline), Some("2001:db8::1".to_string()));

        // The address is the last non-empty line, not the first.
        let chunked = "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\n\r\nignored\n198.51.100.7\n\n";
        assert_eq!(extract_address(chunked), Some("198.51.100.7".to_string()));

        // Header-only responses carry no address.
        assert_eq!(extract_address("HTTP/1.1 502 Bad Gateway\r\n\r\n"), None);
        assert_eq!(extract_address(""), None);
    }

    /// Minimal SOCKS5 server (no auth, domain targets) that answers any
    /// tunneled HTTP request with the given body.
    async fn spawn_fake_socks_echo(body: &'static str) -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut client, _)) = listener.accept().await {
                tokio::spawn(async move {
                    // Greeting: VER, NMETHODS, METHODS...
                    let mut header = [0u8; 2];
                    client.read_exact(&mut header).await.unwrap();
                    assert_eq!(header[0], 0x05);
                    let mut methods = vec![0u8; header[1] as usize];
                    client.read_exact(&mut methods).await.unwrap();
                    assert!(methods.contains(&0x00));
                    client.write_all(&[0x05, 0x00]).await.unwrap();

                    // CONNECT request with a domain target.
                    let mut req_head = [0u8; 4];
                    client.read_exact(&mut req_head).await.unwrap();
                    assert_eq!(req_head[1], 0x01); // CMD=CONNECT
                    assert_eq!(req_head[3], 0x03); // ATYP=DOMAIN
                    let mut len = [0u8; 1];
                    client.read_exact(&mut len).await.unwrap();
                    let mut name = vec![0u8; len[0] as usize];
                    client.read_exact(&mut name).await.unwrap();
                    let mut port = [0u8; 2];
                    client.read_exact(&mut port).await.unwrap();

                    // Success with bind addr 0.0.0.0:0.
                    client
                        .write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                        .await
                        .unwrap();

                    // Serve the tunneled HTTP exchange ourselves.
                    let mut buf = vec![0u8; 2048];
                    let n = client.read(&mut buf).await.unwrap();
                    let request = String::from_utf8_lossy(&buf[..n]);
                    assert!(request.starts_with("GET / HTTP/1.1\r\n"));

                    let response = format!(
                        "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\n\r\n{}",
                        body
                    );
                    client.write_all(response.as_bytes()).await.unwrap();
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn probe_returns_address_through_socks() {
        let socks = spawn_fake_socks_echo("198.51.100.7\n").await;
        let endpoint = SocksEndpoint::new(socks.ip().to_string(), socks.port());

        let address = SocksIpProbe.probe(&endpoint).await.unwrap();
        assert_eq!(address, "198.51.100.7");
    }

    #[tokio::test]
    async fn probe_unreachable_endpoint_is_unavailable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let endpoint = SocksEndpoint::new(addr.ip().to_string(), addr.port());
        let err = SocksIpProbe.probe(&endpoint).await.unwrap_err();
        assert!(matches!(err, FleetError::EgressUnavailable));
    }
}
