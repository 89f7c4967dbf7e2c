use std::error::Error;
use std::time::Duration;
use tracing::{info, warn};
use tether::{Client, ClientConfig, ConnectionConfig, TracingEvents};

/// Usage: client [address] [file-or-folder]
#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    // Initialize tracing
    tracing_subscriber::fmt::init();

    let mut args = std::env::args().skip(1);
    let address = args.next().unwrap_or_else(|| "127.0.0.1:7878".to_string());
    let upload = args.next();

    let config = ClientConfig::new(address)
        .with_connection(ConnectionConfig::default().with_passphrase("tether-demo"));
    let client = Client::builder(config).handler(TracingEvents).build()?;
    client.start().await;

    // The supervisor keeps retrying until the server shows up
    while !client.is_connected().await {
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    client.send_message("hello from tether", false, false).await?;
    client.send_command("status", true, false).await?;

    if let Some(path) = upload {
        let path = std::path::PathBuf::from(path);
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload".to_string());
        if path.is_dir() {
            let summary = client.send_folder(&path, &name, true).await?;
            info!("Sent {} files ({} bytes)", summary.files, summary.bytes);
        } else {
            let bytes = client.send_file(&path, &name, true).await?;
            info!("Sent {} ({} bytes)", name, bytes);
        }
    }

    info!("Press Ctrl-C to quit");
    tokio::signal::ctrl_c().await?;
    if let Err(e) = client.send_message("bye", false, true).await {
        warn!("Goodbye not sent: {}", e);
    }
    client.shutdown().await;
    Ok(())
}
