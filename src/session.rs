//! Server side of a single WebSocket connection.
//!
//! Each connection gets a writer task draining an outbound channel into the
//! socket, while the reader loop applies client frames. The same channel is
//! what the broker holds as the connection's subscriber handle, so broadcast
//! frames and replies share one ordered path to the client.

use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{Sink, SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;

use crate::broker::{Broker, ConnectionId};
use crate::router::Router;
use crate::types::{ClientFrame, ServerFrame};

pub async fn run(socket: WebSocket, router: Arc<Router>, broker: Arc<Broker>) {
    let id = ConnectionId::new();
    info!("Connection {} opened", id.as_str());

    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = unbounded_channel::<ServerFrame>();

    let writer_id = id.clone();
    let writer = tokio::spawn(async move { forward_frames(&writer_id, &mut sink, rx).await });

    let session = Session {
        id: id.clone(),
        tx,
        router,
        broker: broker.clone(),
    };

    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Text(text)) => session.handle_text(&text),
            Ok(Message::Binary(_)) => session.reject("binary frames are not supported"),
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!("Connection {} read failed: {}", id.as_str(), e);
                break;
            }
        }
    }

    broker.unsubscribe_all(&id);
    drop(session);
    if !finish_writer(writer).await {
        debug!("Connection {} dropped frames still queued at close", id.as_str());
    }
    info!("Connection {} closed", id.as_str());
}

/// How long a closing connection may spend flushing queued frames. Sends still
/// running on their own tasks keep the channel open, so this bounds the wait.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// Serialize frames from `rx` onto `sink` until every sender is gone.
async fn forward_frames<S>(id: &ConnectionId, sink: &mut S, mut rx: UnboundedReceiver<ServerFrame>)
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    while let Some(frame) = rx.recv().await {
        let text = match serde_json::to_string(&frame) {
            Ok(text) => text,
            Err(e) => {
                warn!("Failed to serialize frame: {}", e);
                continue;
            }
        };
        if let Err(e) = sink.send(Message::Text(text)).await {
            debug!("Connection {} write failed: {}", id.as_str(), e);
            break;
        }
    }
}

/// Let the writer drain what is queued. Returns `false` if it had to be
/// aborted after `FLUSH_TIMEOUT`.
async fn finish_writer(mut writer: JoinHandle<()>) -> bool {
    match tokio::time::timeout(FLUSH_TIMEOUT, &mut writer).await {
        Ok(_) => true,
        Err(_) => {
            writer.abort();
            false
        }
    }
}

pub(crate) struct Session {
    id: ConnectionId,
    tx: UnboundedSender<ServerFrame>,
    router: Arc<Router>,
    broker: Arc<Broker>,
}

impl Session {
    pub(crate) fn handle_text(&self, text: &str) {
        let frame = match serde_json::from_str::<ClientFrame>(text) {
            Ok(frame) => frame,
            Err(e) => {
                self.reject(format!("malformed frame: {}", e));
                return;
            }
        };

        match frame {
            ClientFrame::Subscribe { destination } => {
                self.broker
                    .subscribe(&destination, self.id.clone(), self.tx.clone());
                debug!(
                    "{} now has {} subscribers",
                    destination,
                    self.broker.subscriber_count(&destination)
                );
            }
            ClientFrame::Unsubscribe { destination } => {
                self.broker.unsubscribe(&destination, &self.id);
            }
            ClientFrame::Send { destination, body } => self.spawn_send(destination, body),
        }
    }

    /// Run the destination's handler off the read loop and broadcast its reply.
    fn spawn_send(&self, destination: String, body: serde_json::Value) {
        let router = self.router.clone();
        let broker = self.broker.clone();
        let tx = self.tx.clone();
        let id = self.id.clone();

        tokio::spawn(async move {
            match router.dispatch(&destination, body).await {
                Ok(out) => {
                    broker.publish(&out.topic, out.payload);
                }
                Err(e) => {
                    warn!(
                        "Message from {} to {} failed: {:#}",
                        id.as_str(),
                        destination,
                        e
                    );
                    let _ = tx.send(ServerFrame::error(format!("{:#}", e)));
                }
            }
        });
    }

    pub(crate) fn reject(&self, message: impl Into<String>) {
        let message = message.into();
        warn!("Rejecting frame from {}: {}", self.id.as_str(), message);
        let _ = self.tx.send(ServerFrame::error(message));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::time::Instant;

    use crate::handlers::produce_greeting;
    use crate::types::HelloMessage;

    fn session(broker: Arc<Broker>) -> (Session, UnboundedReceiver<ServerFrame>) {
        delayed_session(broker, Duration::ZERO)
    }

    fn delayed_session(
        broker: Arc<Broker>,
        delay: Duration,
    ) -> (Session, UnboundedReceiver<ServerFrame>) {
        let mut router = Router::new();
        router.register("/hello", "/topic/greetings", move |msg: HelloMessage| {
            produce_greeting(msg, delay)
        });
        let (tx, rx) = unbounded_channel();
        (
            Session {
                id: ConnectionId::new(),
                tx,
                router: Arc::new(router),
                broker,
            },
            rx,
        )
    }

    async fn next(rx: &mut UnboundedReceiver<ServerFrame>) -> ServerFrame {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("channel closed")
    }

    #[tokio::test]
    async fn send_is_broadcast_to_subscribers() {
        let broker = Arc::new(Broker::new());
        let (alice, mut alice_rx) = session(broker.clone());
        let (bob, mut bob_rx) = session(broker.clone());

        alice.handle_text(r#"{"type":"subscribe","destination":"/topic/greetings"}"#);
        bob.handle_text(r#"{"type":"subscribe","destination":"/topic/greetings"}"#);
        bob.handle_text(r#"{"type":"send","destination":"/hello","body":{"name":"<b>Bob</b>"}}"#);

        let expected = ServerFrame::Message {
            destination: "/topic/greetings".to_string(),
            body: json!({ "content": "Hello, &lt;b&gt;Bob&lt;/b&gt;!" }),
        };
        assert_eq!(next(&mut alice_rx).await, expected);
        assert_eq!(next(&mut bob_rx).await, expected);
    }

    #[tokio::test]
    async fn unsubscribed_connection_gets_nothing() {
        let broker = Arc::new(Broker::new());
        let (alice, mut alice_rx) = session(broker.clone());
        let (bob, mut bob_rx) = session(broker.clone());

        alice.handle_text(r#"{"type":"subscribe","destination":"/topic/greetings"}"#);
        bob.handle_text(r#"{"type":"subscribe","destination":"/topic/greetings"}"#);
        bob.handle_text(r#"{"type":"unsubscribe","destination":"/topic/greetings"}"#);
        bob.handle_text(r#"{"type":"send","destination":"/hello","body":{"name":"x"}}"#);

        assert!(matches!(next(&mut alice_rx).await, ServerFrame::Message { .. }));
        tokio::task::yield_now().await;
        assert!(bob_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn malformed_frame_reports_error_to_sender() {
        let broker = Arc::new(Broker::new());
        let (alice, mut alice_rx) = session(broker);

        alice.handle_text("not json");
        assert!(matches!(next(&mut alice_rx).await, ServerFrame::Error { .. }));
    }

    #[tokio::test]
    async fn unknown_destination_reports_error_to_sender() {
        let broker = Arc::new(Broker::new());
        let (alice, mut alice_rx) = session(broker);

        alice.handle_text(r#"{"type":"send","destination":"/bye","body":{}}"#);
        match next(&mut alice_rx).await {
            ServerFrame::Error { message } => assert!(message.contains("/bye")),
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[tokio::test]
    async fn bad_body_reports_error_to_sender() {
        let broker = Arc::new(Broker::new());
        let (alice, mut alice_rx) = session(broker);

        alice.handle_text(r#"{"type":"send","destination":"/hello","body":{"name":7}}"#);
        match next(&mut alice_rx).await {
            ServerFrame::Error { message } => {
                assert!(message.starts_with("invalid message payload"))
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[tokio::test]
    async fn missing_or_null_name_reports_error_to_sender() {
        let broker = Arc::new(Broker::new());
        let (alice, mut alice_rx) = session(broker.clone());

        alice.handle_text(r#"{"type":"subscribe","destination":"/topic/greetings"}"#);
        for body in [r#"{}"#, r#"{"name":null}"#] {
            alice.handle_text(&format!(
                r#"{{"type":"send","destination":"/hello","body":{}}}"#,
                body
            ));
            match next(&mut alice_rx).await {
                ServerFrame::Error { message } => {
                    assert!(message.starts_with("invalid message payload"))
                }
                other => panic!("unexpected frame: {:?}", other),
            }
        }
        assert_eq!(broker.subscriber_count("/topic/greetings"), 1);
    }

    #[tokio::test]
    async fn empty_name_greets_empty_name() {
        let broker = Arc::new(Broker::new());
        let (alice, mut alice_rx) = session(broker);

        alice.handle_text(r#"{"type":"subscribe","destination":"/topic/greetings"}"#);
        alice.handle_text(r#"{"type":"send","destination":"/hello","body":{"name":""}}"#);
        match next(&mut alice_rx).await {
            ServerFrame::Message { body, .. } => {
                assert_eq!(body, json!({ "content": "Hello, !" }));
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_sends_run_concurrently_without_blocking_reads() {
        let delay = Duration::from_secs(1);
        let broker = Arc::new(Broker::new());
        let (alice, mut alice_rx) = delayed_session(broker.clone(), delay);
        let (bob, mut bob_rx) = delayed_session(broker.clone(), delay);
        let start = Instant::now();

        alice.handle_text(r#"{"type":"subscribe","destination":"/topic/greetings"}"#);
        alice.handle_text(r#"{"type":"send","destination":"/hello","body":{"name":"one"}}"#);
        alice.handle_text(r#"{"type":"send","destination":"/hello","body":{"name":"two"}}"#);
        bob.handle_text(r#"{"type":"subscribe","destination":"/topic/greetings"}"#);

        // both handlers are sleeping; bob is already in and nothing went out
        tokio::task::yield_now().await;
        assert_eq!(broker.subscriber_count("/topic/greetings"), 2);
        assert!(alice_rx.try_recv().is_err());
        assert!(bob_rx.try_recv().is_err());

        for rx in [&mut alice_rx, &mut bob_rx] {
            let mut contents = Vec::new();
            for _ in 0..2 {
                match next(rx).await {
                    ServerFrame::Message { body, .. } => contents.push(body["content"].clone()),
                    other => panic!("unexpected frame: {:?}", other),
                }
            }
            contents.sort_by_key(|c| c.to_string());
            assert_eq!(contents, vec![json!("Hello, one!"), json!("Hello, two!")]);
        }

        let elapsed = start.elapsed();
        assert!(elapsed >= delay, "finished early: {:?}", elapsed);
        assert!(elapsed < delay * 2, "sends ran one after another: {:?}", elapsed);
    }

    #[tokio::test]
    async fn writer_flushes_queued_frames_after_senders_close() {
        let id = ConnectionId::new();
        let (tx, rx) = unbounded_channel();
        tx.send(ServerFrame::error("first")).unwrap();
        tx.send(ServerFrame::error("second")).unwrap();
        drop(tx);

        let mut sink: Vec<Message> = Vec::new();
        forward_frames(&id, &mut sink, rx).await;

        let texts: Vec<String> = sink
            .into_iter()
            .map(|m| match m {
                Message::Text(text) => text,
                other => panic!("unexpected message: {:?}", other),
            })
            .collect();
        assert_eq!(
            texts,
            vec![
                r#"{"type":"error","message":"first"}"#.to_string(),
                r#"{"type":"error","message":"second"}"#.to_string(),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn finish_writer_gives_up_while_a_sender_lingers() {
        let (tx, rx) = unbounded_channel::<ServerFrame>();
        let writer = tokio::spawn(async move {
            let mut sink: Vec<Message> = Vec::new();
            forward_frames(&ConnectionId::new(), &mut sink, rx).await;
        });
        assert!(!finish_writer(writer).await);
        drop(tx);

        let (tx, rx) = unbounded_channel::<ServerFrame>();
        let writer = tokio::spawn(async move {
            let mut sink: Vec<Message> = Vec::new();
            forward_frames(&ConnectionId::new(), &mut sink, rx).await;
        });
        drop(tx);
        assert!(finish_writer(writer).await);
    }
}
