//! remdap - a Debug Adapter Protocol server bridging editors to a remote
//! script-execution server.
//!
//! Serves DAP over TCP (server mode) or stdio (embedded mode). One client
//! connection equals one debug session.

use anyhow::Context;
use clap::Parser;
use log::{info, warn};
use std::net::SocketAddr;
use tokio::net::TcpListener;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to listen on (default: 127.0.0.1:4711)
    #[clap(long, default_value = "127.0.0.1:4711")]
    listen: String,

    /// Exit after the first debug session ends (single-client mode).
    #[clap(long)]
    oneshot: bool,

    /// Serve a single session over stdio instead of TCP (embedded mode).
    #[clap(long)]
    stdio: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    if args.stdio {
        return remdap::dap::serve(tokio::io::stdin(), tokio::io::stdout()).await;
    }

    let addr: SocketAddr = args.listen.parse().context("Invalid listen address")?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    info!(target: "dap", "remdap listening on {addr}");

    // Server mode: accept clients sequentially. One client == one debug session.
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(v) => v,
            Err(err) => {
                warn!(target: "dap", "accept failed: {err:#}");
                continue;
            }
        };
        info!(target: "dap", "DAP client connected: {peer}");
        if let Err(err) = stream.set_nodelay(true) {
            warn!(target: "dap", "nodelay: {err:#}");
        }

        let (read, write) = stream.into_split();
        if let Err(err) = remdap::dap::serve(read, write).await {
            warn!(target: "dap", "session ended with error: {err:#}");
        }

        if args.oneshot {
            break;
        }
    }
    Ok(())
}
