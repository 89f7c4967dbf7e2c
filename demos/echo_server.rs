use std::error::Error;
use tokio_stream::StreamExt;
use tracing::{info, warn};
use tether::{ChannelEvents, Event, EnvelopeKind, Server, ServerConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    // Initialize tracing
    tracing_subscriber::fmt::init();

    // Optional TOML config path as the first argument
    let config = match std::env::args().nth(1) {
        Some(path) => ServerConfig::from_toml_file(path)?,
        None => ServerConfig::default().with_connection(
            tether::ConnectionConfig::default()
                .with_receive_dir("received")
                .with_passphrase("tether-demo"),
        ),
    };

    let (events, mut stream) = ChannelEvents::new();
    let server = Server::builder(config).handler(events).bind().await?;
    let handle = server.handle();
    info!("Echo server listening on {}", server.local_addr());

    let server_task = tokio::spawn(server.run());

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = stream.next() => match event {
                Some(Event::MessageReceived { id, kind, encrypted, text }) => {
                    let reply = format!("echo: {}", text);
                    let sent = match kind {
                        EnvelopeKind::Command => handle.send_command(id, reply, encrypted, false).await,
                        _ => handle.send_message(id, reply, encrypted, false).await,
                    };
                    if let Err(e) = sent {
                        warn!("Connection {}: echo failed: {}", id, e);
                    }
                }
                Some(Event::FileReceived { id, path }) => {
                    info!("Connection {} stored {}", id, path.display());
                    let note = format!("stored {}", path.display());
                    let _ = handle.send_message(id, note, false, false).await;
                }
                Some(Event::Connected(id)) => {
                    info!("Connection {} joined ({} live)", id, handle.connection_count().await);
                }
                Some(other) => info!("{:?}", other),
                None => break,
            },
        }
    }

    handle.shutdown();
    server_task.await??;
    Ok(())
}
