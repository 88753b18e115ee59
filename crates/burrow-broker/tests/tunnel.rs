//! End-to-end tunnel scenarios: broker + agent + mock protected service.

mod common;

use burrow_agent::Tunnel;
use burrow_broker::{Broker, BrokerConfig};
use common::{read_expect, start_echo_server, start_protected_server};
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};

fn test_config() -> BrokerConfig {
    BrokerConfig {
        bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
        // Ephemeral so parallel tests never collide.
        port: 0,
        ..BrokerConfig::default()
    }
}

async fn user_connect(public_port: u16) -> TcpStream {
    TcpStream::connect(("127.0.0.1", public_port))
        .await
        .expect("user connect to public port")
}

#[tokio::test]
async fn single_message_round_trip() {
    let broker = Broker::start(test_config()).await.unwrap();
    let service_port = start_protected_server("First server").await;
    let tunnel = Tunnel::open(service_port, broker.local_addr()).await.unwrap();

    let mut user = user_connect(tunnel.public_port()).await;
    user.write_all(b"Hello world").await.unwrap();
    read_expect(&mut user, "First server: Hello world").await;

    tunnel.stop().await;
    broker.stop().await;
}

#[tokio::test]
async fn two_sequential_messages() {
    let broker = Broker::start(test_config()).await.unwrap();
    let service_port = start_protected_server("First server").await;
    let tunnel = Tunnel::open(service_port, broker.local_addr()).await.unwrap();

    let mut user = user_connect(tunnel.public_port()).await;
    user.write_all(b"Message 1").await.unwrap();
    read_expect(&mut user, "First server: Message 1").await;
    user.write_all(b"Message 2").await.unwrap();
    read_expect(&mut user, "First server: Message 2").await;

    tunnel.stop().await;
    broker.stop().await;
}

#[tokio::test]
async fn two_users_share_one_tunnel() {
    let broker = Broker::start(test_config()).await.unwrap();
    let service_port = start_protected_server("First server").await;
    let tunnel = Tunnel::open(service_port, broker.local_addr()).await.unwrap();

    let mut user0 = user_connect(tunnel.public_port()).await;
    let mut user1 = user_connect(tunnel.public_port()).await;

    user0.write_all(b"Hello from user0").await.unwrap();
    read_expect(&mut user0, "First server: Hello from user0").await;

    user1.write_all(b"Hello from user1").await.unwrap();
    read_expect(&mut user1, "First server: Hello from user1").await;

    tunnel.stop().await;
    broker.stop().await;
}

#[tokio::test]
async fn two_tunnels_reach_two_services() {
    let broker = Broker::start(test_config()).await.unwrap();
    let first_port = start_protected_server("First server").await;
    let second_port = start_protected_server("Second server").await;

    let first = Tunnel::open(first_port, broker.local_addr()).await.unwrap();
    let second = Tunnel::open(second_port, broker.local_addr()).await.unwrap();
    assert_ne!(first.public_port(), second.public_port());

    let mut user0 = user_connect(first.public_port()).await;
    user0.write_all(b"Hello from user0").await.unwrap();
    read_expect(&mut user0, "First server: Hello from user0").await;

    let mut user1 = user_connect(second.public_port()).await;
    user1.write_all(b"Hello from user1").await.unwrap();
    read_expect(&mut user1, "Second server: Hello from user1").await;

    first.stop().await;
    second.stop().await;
    broker.stop().await;
}

#[tokio::test]
async fn concurrent_users_no_crosstalk() {
    let broker = Broker::start(test_config()).await.unwrap();
    let service_port = start_protected_server("First server").await;
    let tunnel = Tunnel::open(service_port, broker.local_addr()).await.unwrap();
    let public_port = tunnel.public_port();

    let mut tasks = Vec::new();
    for user in 0..2 {
        tasks.push(tokio::spawn(async move {
            let mut conn = user_connect(public_port).await;
            for round in 0..20 {
                let msg = format!("user{user} msg{round}");
                conn.write_all(msg.as_bytes()).await.unwrap();
                read_expect(&mut conn, &format!("First server: {msg}")).await;
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    tunnel.stop().await;
    broker.stop().await;
}

#[tokio::test]
async fn large_transfer_is_delivered_in_order() {
    let broker = Broker::start(test_config()).await.unwrap();
    let service_port = start_echo_server().await;
    let tunnel = Tunnel::open(service_port, broker.local_addr()).await.unwrap();

    let payload: Vec<u8> = (0..256 * 1024).map(|i| (i % 251) as u8).collect();

    let mut user = user_connect(tunnel.public_port()).await;
    let expected = payload.clone();
    let (mut read_half, mut write_half) = user.split();

    let writer = async {
        write_half.write_all(&payload).await.unwrap();
    };
    let reader = async {
        let mut got = vec![0u8; expected.len()];
        timeout(Duration::from_secs(10), read_half.read_exact(&mut got))
            .await
            .expect("timed out reading echo")
            .unwrap();
        got
    };
    let ((), got) = tokio::join!(writer, reader);
    assert_eq!(got, expected);

    tunnel.stop().await;
    broker.stop().await;
}

#[tokio::test]
async fn agent_stops_cleanly_without_traffic() {
    let broker = Broker::start(test_config()).await.unwrap();
    let service_port = start_protected_server("First server").await;
    let tunnel = Tunnel::open(service_port, broker.local_addr()).await.unwrap();

    tunnel.stop().await;
    broker.stop().await;
}

#[tokio::test]
async fn broker_stop_is_idempotent() {
    let broker = Broker::start(test_config()).await.unwrap();
    broker.stop().await;
    broker.stop().await;
}

#[tokio::test]
async fn agent_stop_closes_user_connections() {
    let broker = Broker::start(test_config()).await.unwrap();
    let service_port = start_protected_server("First server").await;
    let tunnel = Tunnel::open(service_port, broker.local_addr()).await.unwrap();

    let mut user = user_connect(tunnel.public_port()).await;
    user.write_all(b"ping").await.unwrap();
    read_expect(&mut user, "First server: ping").await;

    tunnel.stop().await;

    let mut buf = [0u8; 16];
    let n = timeout(Duration::from_secs(1), user.read(&mut buf))
        .await
        .expect("no EOF within 1s")
        .unwrap();
    assert_eq!(n, 0);

    broker.stop().await;
}

#[tokio::test]
async fn public_port_dies_with_the_agent() {
    let broker = Broker::start(test_config()).await.unwrap();
    let service_port = start_protected_server("First server").await;
    let tunnel = Tunnel::open(service_port, broker.local_addr()).await.unwrap();
    let public_port = tunnel.public_port();

    tunnel.stop().await;
    sleep(Duration::from_millis(200)).await;

    assert!(TcpStream::connect(("127.0.0.1", public_port)).await.is_err());
    broker.stop().await;
}

#[tokio::test]
async fn broker_stop_closes_users_and_public_port() {
    let broker = Broker::start(test_config()).await.unwrap();
    let service_port = start_protected_server("First server").await;
    let tunnel = Tunnel::open(service_port, broker.local_addr()).await.unwrap();
    let public_port = tunnel.public_port();

    let mut user = user_connect(public_port).await;
    user.write_all(b"ping").await.unwrap();
    read_expect(&mut user, "First server: ping").await;

    broker.stop().await;

    let mut buf = [0u8; 16];
    let n = timeout(Duration::from_secs(1), user.read(&mut buf))
        .await
        .expect("no EOF within 1s")
        .unwrap();
    assert_eq!(n, 0);

    sleep(Duration::from_millis(200)).await;
    assert!(TcpStream::connect(("127.0.0.1", public_port)).await.is_err());
}

#[tokio::test]
async fn refused_protected_dial_closes_only_that_user() {
    let broker = Broker::start(test_config()).await.unwrap();

    // A port with nothing listening: the agent's dial will be refused.
    let placeholder = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_port = placeholder.local_addr().unwrap().port();
    drop(placeholder);

    let tunnel = Tunnel::open(dead_port, broker.local_addr()).await.unwrap();

    let mut user = user_connect(tunnel.public_port()).await;
    let mut buf = [0u8; 16];
    let n = timeout(Duration::from_secs(2), user.read(&mut buf))
        .await
        .expect("no EOF within 2s")
        .unwrap();
    assert_eq!(n, 0);

    // The tunnel itself survives a per-session dial failure.
    let mut another = user_connect(tunnel.public_port()).await;
    let n = timeout(Duration::from_secs(2), another.read(&mut buf))
        .await
        .expect("no EOF within 2s")
        .unwrap();
    assert_eq!(n, 0);

    tunnel.stop().await;
    broker.stop().await;
}
