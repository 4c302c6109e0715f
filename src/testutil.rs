//! Shared fakes for in-crate tests: a loopback control server speaking the
//! line protocol, a scripted egress probe, and config builders.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use crate::config::{ControlAddr, InstanceConfig, InstanceTiming, SocksEndpoint};
use crate::error::{FleetError, Result};
use crate::probe::EgressProbe;

/// Fake control server state shared with the test body.
pub(crate) struct FakeControl {
    pub addr: SocketAddr,
    /// Bootstrap progress reported to GETINFO queries.
    pub progress: Arc<AtomicU32>,
    /// Number of NEWNYM signals received.
    pub newnym_count: Arc<AtomicUsize>,
}

/// Spawn a loopback control server that answers AUTHENTICATE, GETINFO
/// bootstrap queries and SIGNAL commands. Serves any number of
/// connections until dropped with the runtime.
pub(crate) async fn spawn_fake_control() -> FakeControl {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let progress = Arc::new(AtomicU32::new(0));
    let newnym_count = Arc::new(AtomicUsize::new(0));

    let srv_progress = progress.clone();
    let srv_newnym = newnym_count.clone();
    tokio::spawn(async move {
        loop {
            let (mut stream, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let progress = srv_progress.clone();
            let newnym = srv_newnym.clone();
            tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                loop {
                    let n = match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => n,
                    };
                    let request = String::from_utf8_lossy(&buf[..n]);
                    let reply = if request.starts_with("AUTHENTICATE") {
                        "250 OK\r\n".to_string()
                    } else if request.starts_with("GETINFO status/bootstrap-phase") {
                        format!(
                            "250-status/bootstrap-phase=NOTICE BOOTSTRAP PROGRESS={} TAG=x SUMMARY=\"x\"\r\n250 OK\r\n",
                            progress.load(Ordering::SeqCst)
                        )
                    } else if request.starts_with("SIGNAL NEWNYM") {
                        newnym.fetch_add(1, Ordering::SeqCst);
                        "250 OK\r\n".to_string()
                    } else if request.starts_with("SIGNAL") {
                        "250 OK\r\n".to_string()
                    } else {
                        "510 Unrecognized command\r\n".to_string()
                    };
                    if stream.write_all(reply.as_bytes()).await.is_err() {
                        return;
                    }
                }
            });
        }
    });

    FakeControl {
        addr,
        progress,
        newnym_count,
    }
}

/// Spawn a working loopback SOCKS5 proxy (no auth) that dials the
/// requested target and relays bidirectionally. Returns its address and
/// a counter of accepted connections.
pub(crate) async fn spawn_socks_proxy() -> (SocketAddr, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let connections = Arc::new(AtomicUsize::new(0));

    let counter = connections.clone();
    tokio::spawn(async move {
        while let Ok((mut client, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let mut header = [0u8; 2];
                if client.read_exact(&mut header).await.is_err() {
                    return;
                }
                let mut methods = vec![0u8; header[1] as usize];
                client.read_exact(&mut methods).await.unwrap();
                client.write_all(&[0x05, 0x00]).await.unwrap();

                let mut req = [0u8; 4];
                client.read_exact(&mut req).await.unwrap();
                let target = match req[3] {
                    0x01 => {
                        let mut ip = [0u8; 4];
                        client.read_exact(&mut ip).await.unwrap();
                        let mut port = [0u8; 2];
                        client.read_exact(&mut port).await.unwrap();
                        format!(
                            "{}:{}",
                            std::net::Ipv4Addr::from(ip),
                            u16::from_be_bytes(port)
                        )
                    }
                    0x03 => {
                        let mut len = [0u8; 1];
                        client.read_exact(&mut len).await.unwrap();
                        let mut name = vec![0u8; len[0] as usize];
                        client.read_exact(&mut name).await.unwrap();
                        let mut port = [0u8; 2];
                        client.read_exact(&mut port).await.unwrap();
                        format!(
                            "{}:{}",
                            String::from_utf8_lossy(&name),
                            u16::from_be_bytes(port)
                        )
                    }
                    _ => return,
                };

                let mut upstream = match tokio::net::TcpStream::connect(&target).await {
                    Ok(stream) => stream,
                    Err(_) => {
                        let _ = client
                            .write_all(&[0x05, 0x04, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                            .await;
                        return;
                    }
                };
                client
                    .write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                    .await
                    .unwrap();
                let _ = tokio::io::copy_bidirectional(&mut client, &mut upstream).await;
            });
        }
    });

    (addr, connections)
}

/// Spawn an HTTP backend that records every raw request and answers each
/// with the fixed response bytes, closing the connection afterwards.
pub(crate) async fn spawn_http_backend(
    response: &'static [u8],
) -> (SocketAddr, Arc<Mutex<Vec<Vec<u8>>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let requests = Arc::new(Mutex::new(Vec::new()));

    let log = requests.clone();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let log = log.clone();
            tokio::spawn(async move {
                let raw = crate::recv::read_until_short(
                    &mut stream,
                    1024,
                    Duration::from_secs(1),
                    None,
                )
                .await
                .unwrap();
                if let Some(raw) = raw {
                    log.lock().push(raw);
                    stream.write_all(response).await.unwrap();
                }
            });
        }
    });

    (addr, requests)
}

/// Unique temp path for per-test log files.
pub(crate) fn temp_path(tag: &str) -> PathBuf {
    static COUNTER: AtomicUsize = AtomicUsize::new(0);
    let n = COUNTER.fetch_add(1, Ordering::SeqCst);
    std::env::temp_dir().join(format!("torfleet-test-{}-{}-{}", std::process::id(), tag, n))
}

/// Instance config wired to a fake control server, with short timings.
pub(crate) fn test_config(name: &str, control: SocketAddr) -> InstanceConfig {
    InstanceConfig {
        name: name.to_string(),
        control_addr: ControlAddr::Tcp(control),
        torrc: temp_path(&format!("{}-torrc", name)),
        data_dir: std::env::temp_dir(),
        log_file: temp_path(&format!("{}-log", name)),
        control_log_file: temp_path(&format!("{}-ctrl-log", name)),
        local_socks: Some(9050),
        out_socks: None,
        bridge: None,
        print_log: false,
        // `true` accepts and ignores the -f argument, standing in for a
        // daemon the tests never talk to.
        daemon_binary: "true".to_string(),
        timing: InstanceTiming {
            retry_pause: Duration::from_millis(20),
            idle_pause: Duration::from_millis(20),
            recv_timeout: Duration::from_millis(300),
            shutdown_grace: Duration::from_millis(200),
        },
    }
}

/// Probe returning a scripted sequence of addresses after a fixed delay.
pub(crate) struct StubProbe {
    addresses: Mutex<VecDeque<String>>,
    delay: Duration,
    pub calls: AtomicUsize,
}

impl StubProbe {
    pub fn new(addresses: &[&str], delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            addresses: Mutex::new(addresses.iter().map(|s| s.to_string()).collect()),
            delay,
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl EgressProbe for StubProbe {
    async fn probe(&self, _endpoint: &SocksEndpoint) -> Result<String> {
        tokio::time::sleep(self.delay).await;
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut addresses = self.addresses.lock();
        if addresses.len() > 1 {
            Ok(addresses.pop_front().unwrap())
        } else {
            addresses
                .front()
                .cloned()
                .ok_or(FleetError::EgressUnavailable)
        }
    }
}
