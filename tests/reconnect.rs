use futures::future::BoxFuture;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tether::envelope::encode_envelope;
use tether::tcp::{BoxedTransport, Connector};
use tether::{
    ChannelEvents, Client, ClientConfig, ConnectionConfig, EnvelopeKind, Event, EventStream,
    Result, TetherError, CLIENT_CONNECTION_ID,
};
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::time::Instant;
use tokio_stream::StreamExt;

/// Refuses the first `failures` attempts, then hands out in-memory pipes
/// whose far ends never speak unless given a greeting.
struct FlakyConnector {
    failures: AtomicU32,
    attempts: Arc<AtomicU32>,
    peers: Mutex<Vec<DuplexStream>>,
    greeting: Option<Vec<u8>>,
}

impl FlakyConnector {
    fn new(failures: u32) -> (Self, Arc<AtomicU32>) {
        let attempts = Arc::new(AtomicU32::new(0));
        let connector = Self {
            failures: AtomicU32::new(failures),
            attempts: attempts.clone(),
            peers: Mutex::new(Vec::new()),
            greeting: None,
        };
        (connector, attempts)
    }

    /// Bytes the far end writes before the connect returns
    fn with_greeting(mut self, greeting: Vec<u8>) -> Self {
        self.greeting = Some(greeting);
        self
    }
}

impl Connector for FlakyConnector {
    fn connect<'a>(
        &'a self,
        _address: &'a str,
    ) -> BoxFuture<'a, Result<(BoxedTransport, Option<SocketAddr>)>> {
        Box::pin(async move {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let refused = self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if refused {
                return Err(TetherError::Io(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    "refused",
                )));
            }
            let (near, mut far) = tokio::io::duplex(64 * 1024);
            if let Some(greeting) = &self.greeting {
                far.write_all(greeting).await?;
            }
            self.peers.lock().unwrap().push(far);
            Ok((Box::new(near) as BoxedTransport, None))
        })
    }
}

fn client(connector: FlakyConnector) -> (Client, EventStream) {
    let (events, stream) = ChannelEvents::new();
    let config = ClientConfig::new("test.invalid:1")
        .with_retry_interval(3)
        .with_connection(ConnectionConfig::default().with_keepalive(5, 15));
    let client = Client::builder(config)
        .handler(events)
        .connector(connector)
        .build()
        .unwrap();
    (client, stream)
}

#[tokio::test(start_paused = true)]
async fn connects_on_third_attempt_after_two_retry_intervals() {
    let (connector, attempts) = FlakyConnector::new(2);
    let (client, mut events) = client(connector);
    let started = Instant::now();
    client.start().await;

    let first = events.next().await.unwrap();
    assert_eq!(first, Event::Connected(CLIENT_CONNECTION_ID));
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(6), "connected after {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(7), "connected after {:?}", elapsed);
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert!(client.is_connected().await);

    // Exactly one connect: nothing else happens before the liveness window
    let more = tokio::time::timeout(Duration::from_secs(8), events.next()).await;
    assert!(more.is_err(), "unexpected event {:?}", more);
    assert_eq!(attempts.load(Ordering::SeqCst), 3);

    client.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn silent_server_triggers_reconnect() {
    let (connector, attempts) = FlakyConnector::new(0);
    let (client, mut events) = client(connector);
    let started = Instant::now();
    client.start().await;

    assert_eq!(
        events.next().await.unwrap(),
        Event::Connected(CLIENT_CONNECTION_ID)
    );
    assert_eq!(
        events.next().await.unwrap(),
        Event::Disconnected(CLIENT_CONNECTION_ID)
    );
    let dropped_at = started.elapsed();
    assert!(dropped_at >= Duration::from_secs(15), "dropped after {:?}", dropped_at);
    assert!(dropped_at < Duration::from_secs(21), "dropped after {:?}", dropped_at);

    assert_eq!(
        events.next().await.unwrap(),
        Event::Connected(CLIENT_CONNECTION_ID)
    );
    assert_eq!(attempts.load(Ordering::SeqCst), 2);

    client.shutdown().await;
    assert_eq!(
        events.next().await.unwrap(),
        Event::Disconnected(CLIENT_CONNECTION_ID)
    );
    assert!(!client.is_connected().await);
}

#[tokio::test(start_paused = true)]
async fn shutdown_stops_retrying() {
    let (connector, attempts) = FlakyConnector::new(u32::MAX);
    let (client, _events) = client(connector);
    client.start().await;

    tokio::time::sleep(Duration::from_secs(10)).await;
    client.shutdown().await;
    let seen = attempts.load(Ordering::SeqCst);
    // Attempts at 0s, 3s, 6s and 9s
    assert_eq!(seen, 4);

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(attempts.load(Ordering::SeqCst), seen);
}

#[tokio::test(start_paused = true)]
async fn connected_is_reported_before_buffered_message() {
    let greeting = encode_envelope(EnvelopeKind::Message, b"welcome", false, None).unwrap();
    let (connector, _attempts) = FlakyConnector::new(0);
    let (client, mut events) = client(connector.with_greeting(greeting.to_vec()));
    client.start().await;

    assert_eq!(
        events.next().await.unwrap(),
        Event::Connected(CLIENT_CONNECTION_ID)
    );
    assert_eq!(
        events.next().await.unwrap(),
        Event::MessageReceived {
            id: CLIENT_CONNECTION_ID,
            kind: EnvelopeKind::Message,
            encrypted: false,
            text: "welcome".into(),
        }
    );

    client.shutdown().await;
}
