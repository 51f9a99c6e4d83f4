use pokersync::config::{RelayConfig, SyncConfig, TransportKind};
use pokersync::protocol::Payload;
use pokersync::relay::{self, RelayHub};
use pokersync::transport::{RelayTransport, Transport, TransportEvent};
use pokersync::types::{ConnectionStatus, Ticket};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

const WAIT: Duration = Duration::from_secs(5);

async fn bind() -> (TcpListener, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

fn serve(listener: TcpListener) -> Arc<RelayHub> {
    let hub = Arc::new(RelayHub::new());
    let app = relay::router(hub.clone(), &RelayConfig::default());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    hub
}

fn client(addr: SocketAddr, id: &str) -> RelayTransport {
    let config = SyncConfig {
        transport: TransportKind::Relay,
        relay_url: format!("ws://{}/ws", addr),
        ..SyncConfig::default()
    };
    RelayTransport::new(id, config)
}

async fn wait_connected(transport: &RelayTransport) {
    let mut status = transport.status();
    tokio::time::timeout(WAIT, status.wait_for(|s| *s == ConnectionStatus::Connected))
        .await
        .expect("timed out connecting")
        .unwrap();
}

async fn wait_members(hub: &RelayHub, room: &str, count: usize) {
    tokio::time::timeout(WAIT, async {
        while hub.members(room).await.len() != count {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("timed out waiting for room members");
}

async fn next_payload<F>(rx: &mut broadcast::Receiver<TransportEvent>, mut pred: F) -> Payload
where
    F: FnMut(&Payload) -> bool,
{
    tokio::time::timeout(WAIT, async {
        loop {
            match rx.recv().await {
                Ok(TransportEvent::Message(msg)) if pred(&msg.payload) => return msg.payload,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("transport closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for message")
}

#[tokio::test]
async fn test_messages_relay_between_members() {
    let (listener, addr) = bind().await;
    let hub = serve(listener);

    let host = client(addr, "host");
    host.connect("room-1", "Host", true).await.unwrap();
    wait_connected(&host).await;
    wait_members(&hub, "room-1", 1).await;

    let participant = client(addr, "p1");
    let mut events = participant.subscribe();
    participant.connect("room-1", "P1", false).await.unwrap();
    wait_connected(&participant).await;
    wait_members(&hub, "room-1", 2).await;

    host.send(Payload::UpdateIssues {
        issues: vec![Ticket::new("PP-1", ""), Ticket::new("PP-2", "")],
        timestamp: Some(10),
        force_update: false,
    })
    .await
    .unwrap();

    let payload = next_payload(&mut events, |p| matches!(p, Payload::UpdateIssues { .. })).await;
    match payload {
        Payload::UpdateIssues { issues, timestamp, .. } => {
            assert_eq!(issues.len(), 2);
            assert_eq!(timestamp, Some(10));
        }
        other => panic!("unexpected payload {:?}", other),
    }

    participant.disconnect().await;
    host.disconnect().await;
}

#[tokio::test]
async fn test_host_failover_over_sockets() {
    let (listener, addr) = bind().await;
    let hub = serve(listener);

    let host = client(addr, "host");
    host.connect("room-f", "Host", true).await.unwrap();
    wait_members(&hub, "room-f", 1).await;

    let p1 = client(addr, "p1");
    let mut p1_events = p1.subscribe();
    p1.connect("room-f", "P1", false).await.unwrap();
    wait_members(&hub, "room-f", 2).await;

    let p2 = client(addr, "p2");
    let mut p2_events = p2.subscribe();
    p2.connect("room-f", "P2", false).await.unwrap();
    wait_members(&hub, "room-f", 3).await;

    let p1_conn = tokio::time::timeout(WAIT, async {
        loop {
            if let Some(id) = p1.server_client_id().await {
                return id;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("p1 was not welcomed");
    host.disconnect().await;

    let promoted = tokio::time::timeout(WAIT, async {
        loop {
            if let Ok(TransportEvent::RoleChanged { is_host }) = p1_events.recv().await {
                return is_host;
            }
        }
    })
    .await
    .expect("p1 was not promoted");
    assert!(promoted);

    let payload = next_payload(&mut p2_events, |p| matches!(p, Payload::NewHost { .. })).await;
    match payload {
        Payload::NewHost { client_id, display_name } => {
            assert_eq!(client_id, p1_conn);
            assert_eq!(display_name, "P1");
        }
        other => panic!("unexpected payload {:?}", other),
    }

    let members = hub.members("room-f").await;
    assert_eq!(members.len(), 2);
    assert!(members.iter().any(|m| m.client_id == p1_conn && m.is_host));

    p1.disconnect().await;
    p2.disconnect().await;
}

#[tokio::test]
async fn test_messages_sent_while_connecting_are_flushed_after_join() {
    let (listener, addr) = bind().await;

    // The socket cannot finish its handshake until the server starts accepting
    let host = client(addr, "host");
    host.connect("room-q", "Host", true).await.unwrap();
    host.send(Payload::UpdateIssues {
        issues: vec![Ticket::new("Q-1", ""), Ticket::new("Q-2", "")],
        timestamp: Some(7),
        force_update: false,
    })
    .await
    .unwrap();

    let hub = serve(listener);
    wait_connected(&host).await;
    wait_members(&hub, "room-q", 1).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    let late = client(addr, "late");
    let mut events = late.subscribe();
    late.connect("room-q", "Late", false).await.unwrap();

    // The room copy handed to joiners already holds the queued list
    let payload = next_payload(&mut events, |p| {
        matches!(p, Payload::FullState { issues, .. } if !issues.is_empty())
    })
    .await;
    match payload {
        Payload::FullState { issues, timestamp, .. } => {
            assert_eq!(issues.len(), 2);
            assert_eq!(timestamp, Some(7));
        }
        other => panic!("unexpected payload {:?}", other),
    }

    late.disconnect().await;
    host.disconnect().await;
}

#[tokio::test]
async fn test_index_is_plain_text() {
    let (listener, addr) = bind().await;
    let _hub = serve(listener);

    let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.ends_with(relay::INDEX_TEXT));
}
