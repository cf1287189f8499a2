//! Integration tests for the WebSocket transport
//!
//! Each test runs a throwaway tokio-tungstenite server on 127.0.0.1.
//!
//! ```bash
//! cargo test --test transport_integration
//! ```

use std::future::Future;
use std::time::Duration;

use breath_stream::audio::EncodedFrame;
use breath_stream::streaming::{SendOutcome, SocketTransport, TransportEvent, TransportState};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

const HANDSHAKE: &str = r#"{"uid":"guest_user_1","user_name":"Guest"}"#;

/// Accept one WebSocket client and hand it to `handler`. Returns the ws:// URL.
async fn spawn_server<F, Fut>(handler: F) -> String
where
    F: FnOnce(WebSocketStream<TcpStream>) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        handler(ws).await;
    });

    format!("ws://{}", addr)
}

async fn next_event(transport: &mut SocketTransport) -> TransportEvent {
    tokio::time::timeout(Duration::from_secs(5), transport.next_event())
        .await
        .expect("timed out waiting for transport event")
        .expect("transport event channel closed")
}

#[tokio::test]
async fn handshake_is_sent_once_before_binary_frames() {
    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel::<Message>();
    let url = spawn_server(move |mut ws| async move {
        while let Some(Ok(message)) = ws.next().await {
            let is_close = message.is_close();
            let _ = seen_tx.send(message);
            if is_close {
                break;
            }
        }
    })
    .await;

    let mut transport = SocketTransport::open(Uuid::new_v4(), &url, HANDSHAKE.to_string()).unwrap();
    assert_eq!(next_event(&mut transport).await, TransportEvent::Opened);
    assert!(transport.is_open());

    for value in [1i16, -2, 3] {
        let outcome = transport.send(&EncodedFrame::new(vec![value; 4096]));
        assert_eq!(outcome, SendOutcome::Accepted);
    }
    transport.shutdown().await;

    let mut seen = Vec::new();
    while let Some(message) = seen_rx.recv().await {
        seen.push(message);
    }

    assert_eq!(seen.len(), 5, "handshake + 3 frames + close: {:?}", seen.len());
    assert_eq!(seen[0], Message::Text(HANDSHAKE.to_string()));
    for (i, value) in [1i16, -2, 3].iter().enumerate() {
        match &seen[i + 1] {
            Message::Binary(bytes) => {
                assert_eq!(bytes.len(), 8192);
                assert_eq!(&bytes[..2], &value.to_le_bytes());
            }
            other => panic!("expected binary frame, got {:?}", other),
        }
    }
    assert!(seen[4].is_close());
    assert_eq!(
        seen.iter().filter(|m| m.is_text()).count(),
        1,
        "handshake must appear exactly once"
    );
}

#[tokio::test]
async fn inbound_text_then_remote_close() {
    let url = spawn_server(|mut ws| async move {
        // Wait for the handshake before answering
        let _ = ws.next().await;
        ws.send(Message::Text(r#"{"breath_count":2,"Noise":[]}"#.to_string()))
            .await
            .unwrap();
        ws.close(Some(CloseFrame {
            code: CloseCode::Normal,
            reason: "done".into(),
        }))
        .await
        .unwrap();
        while ws.next().await.is_some() {}
    })
    .await;

    let mut transport = SocketTransport::open(Uuid::new_v4(), &url, HANDSHAKE.to_string()).unwrap();

    assert_eq!(next_event(&mut transport).await, TransportEvent::Opened);
    assert_eq!(
        next_event(&mut transport).await,
        TransportEvent::Message(r#"{"breath_count":2,"Noise":[]}"#.to_string())
    );
    assert_eq!(
        next_event(&mut transport).await,
        TransportEvent::Closed(Some("1000 done".to_string()))
    );
    assert_eq!(transport.state(), TransportState::Closed);

    // Frames after close are discarded, not queued
    let outcome = transport.send(&EncodedFrame::new(vec![0; 16]));
    assert_eq!(outcome, SendOutcome::DiscardedNotOpen);

    transport.close();
    transport.close();
}

#[tokio::test]
async fn refused_connection_reports_failure() {
    // Reserve a port, then free it so nothing listens there
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let mut transport =
        SocketTransport::open(Uuid::new_v4(), &format!("ws://{}", addr), HANDSHAKE.to_string())
            .unwrap();

    assert!(matches!(
        next_event(&mut transport).await,
        TransportEvent::Failed(_)
    ));
    assert!(!transport.is_open());
}

#[tokio::test]
async fn invalid_url_is_rejected_up_front() {
    let result = SocketTransport::open(Uuid::new_v4(), "http://localhost", HANDSHAKE.to_string());
    assert!(result.is_err());
}
