//! End-to-end tunnel tests: edge, local client, and HTTP traffic over real
//! sockets on ephemeral ports.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use russh::keys::ssh_key::private::Ed25519Keypair;
use russh::keys::{PrivateKey, PrivateKeyWithHashAlg, PublicKey};
use russh::ChannelMsg;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout};

use burrow_client::Local;
use burrow_edge::{EdgeConfig, EdgeServer};

fn fresh_key() -> PrivateKey {
    PrivateKey::from(Ed25519Keypair::from_seed(
        &ChaCha20Rng::try_from_os_rng().unwrap().random(),
    ))
}

async fn start_edge(host_key: &PrivateKey, client_key: PublicKey) -> (SocketAddr, SocketAddr) {
    let edge = EdgeServer::bind(EdgeConfig {
        ssh_addr: "127.0.0.1:0".parse().unwrap(),
        http_addr: "127.0.0.1:0".parse().unwrap(),
        host_key: host_key.clone(),
        client_key,
    })
    .await
    .expect("edge should bind ephemeral ports");

    let addrs = (edge.ssh_addr(), edge.http_addr());
    tokio::spawn(edge.run());
    addrs
}

/// Minimal HTTP upstream: reads one request, answers with a fixed body.
async fn spawn_upstream(body: &'static str) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                let _ = socket.read(&mut buf).await;
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = socket.write_all(response.as_bytes()).await;
            });
        }
    });

    port
}

async fn http_request(addr: SocketAddr, request: &str) -> Vec<u8> {
    let mut socket = TcpStream::connect(addr).await.unwrap();
    socket.write_all(request.as_bytes()).await.unwrap();

    let mut response = Vec::new();
    timeout(Duration::from_secs(5), socket.read_to_end(&mut response))
        .await
        .expect("edge should close the connection")
        .unwrap();
    response
}

async fn http_get(addr: SocketAddr, host: &str) -> Vec<u8> {
    let request = format!("GET / HTTP/1.1\r\nHost: {host}\r\nConnection: close\r\n\r\n");
    http_request(addr, &request).await
}

#[tokio::test(flavor = "multi_thread")]
async fn request_round_trips_through_a_bound_tunnel() {
    let host_key = fresh_key();
    let client_key = fresh_key();
    let (ssh_addr, http_addr) =
        start_edge(&host_key, client_key.public_key().clone()).await;

    let upstream_port = spawn_upstream("ok").await;

    let mut local = Local::open(ssh_addr, host_key.public_key().clone(), client_key)
        .await
        .unwrap();
    local.bind("svc", upstream_port).await.unwrap();

    let response = http_get(http_addr, "svc.example.com").await;
    assert_eq!(response, b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok");
}

#[tokio::test(flavor = "multi_thread")]
async fn host_matching_ignores_case_and_port_suffix() {
    let host_key = fresh_key();
    let client_key = fresh_key();
    let (ssh_addr, http_addr) =
        start_edge(&host_key, client_key.public_key().clone()).await;

    let upstream_port = spawn_upstream("ok").await;

    let mut local = Local::open(ssh_addr, host_key.public_key().clone(), client_key)
        .await
        .unwrap();
    local.bind("svc", upstream_port).await.unwrap();

    // Port suffix in the Host value is discarded; name comparison is
    // case-insensitive; so is the header field name.
    let response = http_get(http_addr, "SVC.Example.COM:8080").await;
    assert!(response.starts_with(b"HTTP/1.1 200 OK"));

    let request = "GET / HTTP/1.1\r\nhOsT: svc.example.com\r\n\r\n";
    let response = http_request(http_addr, request).await;
    assert!(response.starts_with(b"HTTP/1.1 200 OK"));
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_host_gets_a_silent_close() {
    let host_key = fresh_key();
    let client_key = fresh_key();
    let (_ssh_addr, http_addr) =
        start_edge(&host_key, client_key.public_key().clone()).await;

    let response = http_get(http_addr, "nope.example.com").await;
    assert!(response.is_empty(), "no bytes expected, got {response:?}");
}

#[tokio::test(flavor = "multi_thread")]
async fn duplicate_bind_is_refused_and_first_binder_keeps_routing() {
    let host_key = fresh_key();
    let client_key = fresh_key();
    let (ssh_addr, http_addr) =
        start_edge(&host_key, client_key.public_key().clone()).await;

    let port_a = spawn_upstream("from-a").await;
    let port_b = spawn_upstream("from-b").await;

    let mut local_a = Local::open(
        ssh_addr,
        host_key.public_key().clone(),
        client_key.clone(),
    )
    .await
    .unwrap();
    local_a.bind("dup", port_a).await.unwrap();

    let mut local_b = Local::open(ssh_addr, host_key.public_key().clone(), client_key)
        .await
        .unwrap();
    assert!(local_b.bind("dup", port_b).await.is_err());

    let response = http_get(http_addr, "dup.example.com").await;
    let body = String::from_utf8(response).unwrap();
    assert!(body.ends_with("from-a"), "expected first binder, got: {body}");
}

#[tokio::test(flavor = "multi_thread")]
async fn closed_connection_frees_its_names() {
    let host_key = fresh_key();
    let client_key = fresh_key();
    let (ssh_addr, _http_addr) =
        start_edge(&host_key, client_key.public_key().clone()).await;

    let upstream_port = spawn_upstream("ok").await;

    let mut local_a = Local::open(
        ssh_addr,
        host_key.public_key().clone(),
        client_key.clone(),
    )
    .await
    .unwrap();
    local_a.bind("a", upstream_port).await.unwrap();
    local_a.close().await.unwrap();

    // The purge races with our reconnect; retry binding until it lands.
    let mut local_b = Local::open(ssh_addr, host_key.public_key().clone(), client_key)
        .await
        .unwrap();
    let mut bound = false;
    for _ in 0..50 {
        if local_b.bind("a", upstream_port).await.is_ok() {
            bound = true;
            break;
        }
        sleep(Duration::from_millis(100)).await;
    }
    assert!(bound, "name should be bindable after its owner disconnected");
}

#[tokio::test(flavor = "multi_thread")]
async fn unbind_frees_the_name_for_other_connections() {
    let host_key = fresh_key();
    let client_key = fresh_key();
    let (ssh_addr, _http_addr) =
        start_edge(&host_key, client_key.public_key().clone()).await;

    let mut local_a = Local::open(
        ssh_addr,
        host_key.public_key().clone(),
        client_key.clone(),
    )
    .await
    .unwrap();
    local_a.bind("swap", 9000).await.unwrap();

    let mut local_b = Local::open(ssh_addr, host_key.public_key().clone(), client_key)
        .await
        .unwrap();
    assert!(local_b.bind("swap", 9001).await.is_err());

    local_a.unbind("swap").await.unwrap();
    local_b.bind("swap", 9001).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn wrong_client_key_is_rejected_at_handshake() {
    let host_key = fresh_key();
    let client_key = fresh_key();
    let (ssh_addr, _http_addr) =
        start_edge(&host_key, client_key.public_key().clone()).await;

    let imposter = fresh_key();
    let result = Local::open(ssh_addr, host_key.public_key().clone(), imposter).await;
    assert!(result.is_err());
}

#[tokio::test(flavor = "multi_thread")]
async fn wrong_host_key_fails_the_dial() {
    let host_key = fresh_key();
    let client_key = fresh_key();
    let (ssh_addr, _http_addr) =
        start_edge(&host_key, client_key.public_key().clone()).await;

    let not_the_edge = fresh_key();
    let result = Local::open(ssh_addr, not_the_edge.public_key().clone(), client_key).await;
    assert!(result.is_err());
}

#[tokio::test(flavor = "multi_thread")]
async fn dead_upstream_means_a_clean_close_for_the_http_client() {
    let host_key = fresh_key();
    let client_key = fresh_key();
    let (ssh_addr, http_addr) =
        start_edge(&host_key, client_key.public_key().clone()).await;

    // Grab a free port with nothing listening on it.
    let parked = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_port = parked.local_addr().unwrap().port();
    drop(parked);

    let mut local = Local::open(ssh_addr, host_key.public_key().clone(), client_key)
        .await
        .unwrap();
    local.bind("x", dead_port).await.unwrap();

    let response = http_get(http_addr, "x.example.com").await;
    assert!(response.is_empty(), "no bytes expected, got {response:?}");
}

struct EchoProbe {
    host_key: PublicKey,
}

impl russh::client::Handler for EchoProbe {
    type Error = russh::Error;

    async fn check_server_key(&mut self, key: &PublicKey) -> Result<bool, Self::Error> {
        Ok(key.key_data() == self.host_key.key_data())
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn diagnostic_shell_echoes_lines() {
    let host_key = fresh_key();
    let client_key = fresh_key();
    let (ssh_addr, _http_addr) =
        start_edge(&host_key, client_key.public_key().clone()).await;

    let probe = EchoProbe {
        host_key: host_key.public_key().clone(),
    };
    let mut handle = russh::client::connect(
        Arc::new(russh::client::Config::default()),
        ssh_addr,
        probe,
    )
    .await
    .unwrap();
    let hash_alg = handle.best_supported_rsa_hash().await.unwrap().flatten();
    let auth = handle
        .authenticate_publickey(
            "tunnel",
            PrivateKeyWithHashAlg::new(Arc::new(client_key), hash_alg),
        )
        .await
        .unwrap();
    assert!(auth.success());

    let mut channel = handle.channel_open_session().await.unwrap();
    channel.request_shell(true).await.unwrap();
    channel.data(&b"hello\r"[..]).await.unwrap();

    let mut received = String::new();
    timeout(Duration::from_secs(5), async {
        while !received.contains("\r\nhello\r\n") {
            match channel.wait().await {
                Some(ChannelMsg::Data { data }) => {
                    received.push_str(&String::from_utf8_lossy(&data));
                }
                Some(_) => {}
                None => break,
            }
        }
    })
    .await
    .expect("shell should echo the line back");
    assert!(received.starts_with("> "), "missing prompt: {received:?}");
    assert!(received.contains("\r\nhello\r\n"), "missing echo: {received:?}");
}
