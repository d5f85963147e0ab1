//! Minimal stand-in for a real backend server.
//!
//! Accepts the same launch surface the supervisor uses for production
//! servers (`--port`, `--log-file`, `--reload`, `ENABLED_MODULES`,
//! `SERVER_INSTANCE_NAME`) and answers 200 on every module health
//! endpoint. Used by the integration tests and for demoing the manager
//! without a real application build.

use std::path::PathBuf;

use anyhow::{Context as _, Result};
use clap::Parser;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

#[derive(Parser, Debug)]
#[command(name = "backend-stub-server")]
struct Cli {
    /// Port to listen on.
    #[arg(long)]
    port: u16,

    /// Accepted for launch-surface compatibility; the stub logs to stdout,
    /// which the supervisor already points at this file.
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Accepted and ignored.
    #[arg(long)]
    reload: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let modules = std::env::var("ENABLED_MODULES").unwrap_or_default();
    let instance = std::env::var("SERVER_INSTANCE_NAME").unwrap_or_default();
    let listener = TcpListener::bind(("127.0.0.1", cli.port))
        .await
        .with_context(|| format!("binding 127.0.0.1:{}", cli.port))?;
    log::info!(
        instance = instance.as_str(),
        port = cli.port;
        "stub server up (modules: {modules})"
    );

    loop {
        let (stream, _) = listener.accept().await.context("accept failed")?;
        tokio::spawn(async move {
            let _ = handle(stream).await;
        });
    }
}

/// Reads one request and answers 200. Health checks only need the status
/// line, so the request itself is drained and ignored.
async fn handle(mut stream: TcpStream) -> Result<()> {
    let mut buf = [0u8; 4096];
    let _ = stream.read(&mut buf).await?;
    stream
        .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\nconnection: close\r\n\r\nok")
        .await?;
    stream.shutdown().await?;
    Ok(())
}
