//! Broker client against a scripted MQTT 3.1.1 server.
//!
//! The server side speaks just enough of the protocol for a clean session:
//! CONNECT/CONNACK, SUBSCRIBE/SUBACK, PINGREQ/PINGRESP and QoS 0 PUBLISH.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::{timeout, Duration, Instant};

use vigil_live::config::BrokerConfig;
use vigil_live::{BrokerClient, ConnectionState, SubscriptionError};

const CONNECT: u8 = 1;
const SUBSCRIBE: u8 = 8;
const PINGREQ: u8 = 12;

async fn listen() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("mqtt://127.0.0.1:{}", listener.local_addr().unwrap().port());
    (listener, url)
}

fn broker_config(url: String) -> BrokerConfig {
    BrokerConfig {
        url,
        reconnect_initial_ms: 10,
        reconnect_max_ms: 50,
        ..BrokerConfig::default()
    }
}

/// Read one control packet: fixed header byte and body.
async fn read_packet(stream: &mut TcpStream) -> std::io::Result<(u8, Vec<u8>)> {
    let header = stream.read_u8().await?;
    let mut len = 0usize;
    let mut shift = 0;
    loop {
        let byte = stream.read_u8().await?;
        len |= usize::from(byte & 0x7F) << shift;
        if byte & 0x80 == 0 {
            break;
        }
        shift += 7;
    }
    let mut body = vec![0; len];
    stream.read_exact(&mut body).await?;
    Ok((header, body))
}

fn encode_len(out: &mut Vec<u8>, mut len: usize) {
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if len == 0 {
            break;
        }
    }
}

fn publish_packet(topic: &str, payload: &[u8]) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&(topic.len() as u16).to_be_bytes());
    body.extend_from_slice(topic.as_bytes());
    body.extend_from_slice(payload);

    let mut packet = vec![0x30];
    encode_len(&mut packet, body.len());
    packet.extend(body);
    packet
}

/// Accept one client, acknowledge its CONNECT and answer `filters`
/// SUBSCRIBE packets. The SUBSCRIBE at `reject` gets a failure code.
async fn accept_session(
    listener: &TcpListener,
    filters: usize,
    reject: Option<usize>,
) -> (TcpStream, Vec<String>) {
    let (mut stream, _) = timeout(Duration::from_secs(5), listener.accept())
        .await
        .expect("client should connect")
        .unwrap();

    let (header, _) = read_packet(&mut stream).await.unwrap();
    assert_eq!(header >> 4, CONNECT);
    // Session present = 0, return code accepted
    stream.write_all(&[0x20, 0x02, 0x00, 0x00]).await.unwrap();

    let mut seen = Vec::new();
    while seen.len() < filters {
        let (header, body) = timeout(Duration::from_secs(5), read_packet(&mut stream))
            .await
            .expect("client should subscribe")
            .unwrap();
        match header >> 4 {
            SUBSCRIBE => {
                let len = usize::from(u16::from_be_bytes([body[2], body[3]]));
                seen.push(String::from_utf8(body[4..4 + len].to_vec()).unwrap());
                let code = if reject == Some(seen.len() - 1) { 0x80 } else { 0x00 };
                stream.write_all(&[0x90, 0x03, body[0], body[1], code]).await.unwrap();
            }
            PINGREQ => stream.write_all(&[0xD0, 0x00]).await.unwrap(),
            other => panic!("unexpected packet type {other}"),
        }
    }
    (stream, seen)
}

async fn wait_state(state: &mut watch::Receiver<ConnectionState>, want: ConnectionState) {
    timeout(Duration::from_secs(5), async {
        while *state.borrow_and_update() != want {
            state.changed().await.unwrap();
        }
    })
    .await
    .unwrap_or_else(|_| panic!("never reached {want:?}"));
}

#[tokio::test]
async fn test_publish_delivered_and_resubscribed_after_drop() {
    let (listener, url) = listen().await;
    let mut client = BrokerClient::connect(&broker_config(url)).unwrap();
    client.subscribe_topics(false).unwrap();
    let expected = client.subscriptions().to_vec();
    let mut state = client.state();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (mut inbound, handle) = client.start(shutdown_rx);

    let (mut session, filters) = accept_session(&listener, expected.len(), None).await;
    assert_eq!(filters, expected);
    wait_state(&mut state, ConnectionState::Connected).await;

    session.write_all(&publish_packet("alerts/face", b"{\"timestamp\":1}")).await.unwrap();
    let message = timeout(Duration::from_secs(2), inbound.recv())
        .await
        .expect("publish should be delivered")
        .unwrap();
    assert_eq!(message.topic, "alerts/face");
    assert_eq!(&message.payload[..], b"{\"timestamp\":1}");

    // Clean session: the broker forgot everything, so the client must resend
    drop(session);
    wait_state(&mut state, ConnectionState::Reconnecting).await;
    let (mut session, filters) = accept_session(&listener, expected.len(), None).await;
    assert_eq!(filters, expected);
    wait_state(&mut state, ConnectionState::Connected).await;

    session.write_all(&publish_packet("live_feed", &[0xFF, 0xD8])).await.unwrap();
    let message = timeout(Duration::from_secs(2), inbound.recv()).await.unwrap().unwrap();
    assert_eq!(message.topic, "live_feed");
    assert_eq!(&message.payload[..], &[0xFF, 0xD8]);

    shutdown_tx.send(true).unwrap();
    let outcome = timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
    assert_eq!(outcome, Ok(()));
    assert_eq!(*state.borrow(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_reconnect_delay_resets_after_connack() {
    let (listener, url) = listen().await;
    let config = BrokerConfig {
        reconnect_initial_ms: 100,
        reconnect_max_ms: 10_000,
        ..broker_config(url)
    };
    let mut client = BrokerClient::connect(&config).unwrap();
    client.subscribe("alerts/voice").unwrap();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (_inbound, handle) = client.start(shutdown_rx);

    // Four failed handshakes push the delay to 100 -> 200 -> 400 -> 800 -> 1600 ms
    for _ in 0..4 {
        let (stream, _) = timeout(Duration::from_secs(5), listener.accept()).await.unwrap().unwrap();
        drop(stream);
    }
    let (session, _) = accept_session(&listener, 1, None).await;

    let dropped_at = Instant::now();
    drop(session);
    let _session = accept_session(&listener, 1, None).await;
    let waited = dropped_at.elapsed();
    assert!(
        waited < Duration::from_millis(1000),
        "reconnect took {waited:?}, delay was not reset"
    );

    shutdown_tx.send(true).unwrap();
    assert_eq!(timeout(Duration::from_secs(5), handle).await.unwrap().unwrap(), Ok(()));
}

#[tokio::test]
async fn test_refused_subscription_stops_client() {
    let (listener, url) = listen().await;
    let mut client = BrokerClient::connect(&broker_config(url)).unwrap();
    client.subscribe("alerts/face").unwrap();
    client.subscribe("alerts/object").unwrap();
    let mut state = client.state();

    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let (mut inbound, handle) = client.start(shutdown_rx);

    let (_session, filters) = accept_session(&listener, 2, Some(1)).await;
    assert_eq!(filters, ["alerts/face", "alerts/object"]);

    let outcome = timeout(Duration::from_secs(5), handle)
        .await
        .expect("client should stop on its own")
        .unwrap();
    assert!(matches!(outcome, Err(SubscriptionError::Rejected { .. })));
    assert_eq!(*state.borrow_and_update(), ConnectionState::Failed);
    assert!(inbound.recv().await.is_none());
}

#[tokio::test]
async fn test_full_inbound_queue_drops_messages() {
    let (listener, url) = listen().await;
    let config = BrokerConfig {
        inbound_capacity: 1,
        ..broker_config(url)
    };
    let mut client = BrokerClient::connect(&config).unwrap();
    client.subscribe("alerts/object").unwrap();
    let mut state = client.state();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (mut inbound, handle) = client.start(shutdown_rx);

    let (mut session, _) = accept_session(&listener, 1, None).await;
    wait_state(&mut state, ConnectionState::Connected).await;

    for n in 1..=3u8 {
        session.write_all(&publish_packet("alerts/object", &[n])).await.unwrap();
    }
    // Let the client read all three while nobody consumes
    tokio::time::sleep(Duration::from_millis(200)).await;

    let first = timeout(Duration::from_secs(2), inbound.recv()).await.unwrap().unwrap();
    assert_eq!(&first.payload[..], &[1]);

    // Later traffic flows once there is room again
    session.write_all(&publish_packet("alerts/object", &[4])).await.unwrap();
    let next = timeout(Duration::from_secs(2), inbound.recv()).await.unwrap().unwrap();
    assert_eq!(&next.payload[..], &[4]);
    assert_eq!(*state.borrow(), ConnectionState::Connected);

    shutdown_tx.send(true).unwrap();
    assert_eq!(timeout(Duration::from_secs(5), handle).await.unwrap().unwrap(), Ok(()));
}
