//! End-to-end tests for the plaintext tunnel

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tlstunnel::{Config, ConnectionManager};

/// Bind a tunnel on an ephemeral port and start its accept loop
async fn start_tunnel(mut config: Config) -> (Arc<ConnectionManager>, SocketAddr) {
    config.tunnel.tunnel_ep = "127.0.0.1:0".to_string();
    let mut manager = ConnectionManager::new(Arc::new(config)).unwrap();
    let addr = manager.bind().await.unwrap();
    let manager = Arc::new(manager);

    let server = Arc::clone(&manager);
    tokio::spawn(async move { server.accept_connections().await });

    (manager, addr)
}

async fn spawn_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = vec![0u8; 1500];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });

    addr
}

/// A backend that reads each connection to the end and reports what it received
async fn spawn_collecting_server() -> (SocketAddr, mpsc::UnboundedReceiver<Vec<u8>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let tx = tx.clone();
            tokio::spawn(async move {
                let mut received = Vec::new();
                let _ = stream.read_to_end(&mut received).await;
                let _ = tx.send(received);
            });
        }
    });

    (addr, rx)
}

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

async fn wait_for_idle(manager: &ConnectionManager) {
    timeout(Duration::from_secs(5), async {
        while manager.get_active_connections() > 0 {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("sessions should finish");
}

/// Read until the tunnel closes the connection
async fn expect_closed(stream: &mut TcpStream) {
    let mut buf = [0u8; 64];
    let read = timeout(Duration::from_secs(5), stream.read(&mut buf))
        .await
        .expect("connection should be closed by the tunnel");
    assert!(matches!(read, Ok(0) | Err(_)), "expected close, got {:?}", read);
}

#[tokio::test]
async fn test_payload_sizes_around_buffer_size() {
    let echo = spawn_echo_server().await;
    let mut config = Config::for_remote(echo.to_string());
    config.tunnel.buffer_size = 4096;
    let (manager, tunnel) = start_tunnel(config).await;

    for len in [1usize, 4096, 10000] {
        let mut client = TcpStream::connect(tunnel).await.unwrap();
        let sent = payload(len);
        client.write_all(&sent).await.unwrap();

        let mut received = vec![0u8; len];
        timeout(Duration::from_secs(5), client.read_exact(&mut received))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, sent, "payload of {} bytes corrupted", len);
    }

    wait_for_idle(&manager).await;
}

#[tokio::test]
async fn test_chunked_writes_arrive_in_order() {
    let (backend, mut received_rx) = spawn_collecting_server().await;
    let mut config = Config::for_remote(backend.to_string());
    config.tunnel.buffer_size = 7;
    let (_manager, tunnel) = start_tunnel(config).await;

    let mut client = TcpStream::connect(tunnel).await.unwrap();
    let sent = payload(5000);
    for chunk in sent.chunks(13) {
        client.write_all(chunk).await.unwrap();
    }
    client.shutdown().await.unwrap();

    let received = timeout(Duration::from_secs(5), received_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received, sent);
}

#[tokio::test]
async fn test_remote_to_client_direction() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let backend = listener.local_addr().unwrap();
    let greeting = payload(9000);
    let expected = greeting.clone();

    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        stream.write_all(&greeting).await.unwrap();
    });

    let (_manager, tunnel) = start_tunnel(Config::for_remote(backend.to_string())).await;

    let mut client = TcpStream::connect(tunnel).await.unwrap();
    let mut received = Vec::new();
    timeout(Duration::from_secs(5), client.read_to_end(&mut received))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received, expected);
}

#[tokio::test]
async fn test_client_close_closes_remote() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let backend = listener.local_addr().unwrap();
    let (manager, tunnel) = start_tunnel(Config::for_remote(backend.to_string())).await;

    let client = TcpStream::connect(tunnel).await.unwrap();
    let (mut remote, _) = timeout(Duration::from_secs(5), listener.accept())
        .await
        .unwrap()
        .unwrap();

    drop(client);

    expect_closed(&mut remote).await;
    wait_for_idle(&manager).await;
    assert_eq!(manager.relay_engine().active_session_count(), 0);
}

#[tokio::test]
async fn test_remote_close_closes_client() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let backend = listener.local_addr().unwrap();
    let (manager, tunnel) = start_tunnel(Config::for_remote(backend.to_string())).await;

    let mut client = TcpStream::connect(tunnel).await.unwrap();
    let (remote, _) = timeout(Duration::from_secs(5), listener.accept())
        .await
        .unwrap()
        .unwrap();

    drop(remote);

    expect_closed(&mut client).await;
    wait_for_idle(&manager).await;
}

#[tokio::test]
async fn test_failed_dial_closes_inbound_without_session() {
    let unused = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let unreachable = unused.local_addr().unwrap();
    drop(unused);

    let (manager, tunnel) = start_tunnel(Config::for_remote(unreachable.to_string())).await;

    let mut client = TcpStream::connect(tunnel).await.unwrap();
    expect_closed(&mut client).await;

    wait_for_idle(&manager).await;
    let stats = manager.get_connection_stats();
    assert_eq!(stats.total_connections_served, 1);
    assert_eq!(stats.active_sessions, 0);
}

#[tokio::test]
async fn test_concurrent_sessions_are_isolated() {
    let echo = spawn_echo_server().await;
    let (manager, tunnel) = start_tunnel(Config::for_remote(echo.to_string())).await;

    let mut doomed = TcpStream::connect(tunnel).await.unwrap();
    let mut survivor = TcpStream::connect(tunnel).await.unwrap();

    for client in [&mut doomed, &mut survivor] {
        client.write_all(b"warmup").await.unwrap();
        let mut buf = [0u8; 6];
        client.read_exact(&mut buf).await.unwrap();
    }

    drop(doomed);
    sleep(Duration::from_millis(100)).await;

    for round in 0..10 {
        let message = format!("round {}", round);
        survivor.write_all(message.as_bytes()).await.unwrap();
        let mut buf = vec![0u8; message.len()];
        timeout(Duration::from_secs(5), survivor.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(buf, message.as_bytes());
    }

    assert_eq!(manager.get_active_connections(), 1);
}

#[tokio::test]
async fn test_many_concurrent_sessions() {
    let echo = spawn_echo_server().await;
    let (manager, tunnel) = start_tunnel(Config::for_remote(echo.to_string())).await;

    let mut handles = Vec::new();
    for i in 0..20usize {
        handles.push(tokio::spawn(async move {
            let mut client = TcpStream::connect(tunnel).await.unwrap();
            let sent = payload(1000 + i * 97);
            client.write_all(&sent).await.unwrap();
            let mut received = vec![0u8; sent.len()];
            client.read_exact(&mut received).await.unwrap();
            received == sent
        }));
    }

    for handle in handles {
        let ok = timeout(Duration::from_secs(10), handle).await.unwrap().unwrap();
        assert!(ok);
    }

    wait_for_idle(&manager).await;
    assert_eq!(manager.get_connection_stats().total_connections_served, 20);
}

#[tokio::test]
async fn test_admission_limit_rejects_excess_sessions() {
    let echo = spawn_echo_server().await;
    let mut config = Config::for_remote(echo.to_string());
    config.tunnel.max_connections = Some(1);
    let (manager, tunnel) = start_tunnel(config).await;

    let mut first = TcpStream::connect(tunnel).await.unwrap();
    first.write_all(b"hold").await.unwrap();
    let mut buf = [0u8; 4];
    first.read_exact(&mut buf).await.unwrap();

    let mut second = TcpStream::connect(tunnel).await.unwrap();
    expect_closed(&mut second).await;

    let stats = manager.get_connection_stats();
    assert_eq!(stats.total_connections_rejected, 1);
    assert_eq!(stats.max_connections_allowed, Some(1));
    assert_eq!(stats.active_connections, 1);
}

#[tokio::test]
async fn test_idle_timeout_closes_quiet_session() {
    let echo = spawn_echo_server().await;
    let mut config = Config::for_remote(echo.to_string());
    config.tunnel.idle_timeout = Some(Duration::from_millis(200));
    let (manager, tunnel) = start_tunnel(config).await;

    let mut client = TcpStream::connect(tunnel).await.unwrap();
    client.write_all(b"once").await.unwrap();
    let mut buf = [0u8; 4];
    client.read_exact(&mut buf).await.unwrap();

    expect_closed(&mut client).await;
    wait_for_idle(&manager).await;
}

#[tokio::test]
async fn test_graceful_shutdown_stops_accepting() {
    let echo = spawn_echo_server().await;
    let (manager, tunnel) = start_tunnel(Config::for_remote(echo.to_string())).await;

    timeout(Duration::from_secs(5), manager.shutdown())
        .await
        .unwrap()
        .unwrap();
    assert!(manager.is_shutting_down());

    sleep(Duration::from_millis(100)).await;
    assert!(TcpStream::connect(tunnel).await.is_err());
}
