use std::io::{self, BufRead};
use std::sync::Arc;

use anyhow::{Context, Result};
use log::{error, info, warn};
use tokio_util::sync::CancellationToken;

use hr_bridge::prelude::*;

const DEFAULT_CONFIG: &str = "hr-bridge.json";

#[tokio::main]
async fn main() -> Result<()> {
    // ── Logging ───────────────────────────────────────────────────────────────
    // Set RUST_LOG=debug for verbose output, e.g.:
    //   RUST_LOG=hr_bridge=debug cargo run -- hr-bridge.json
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // ── Configuration ─────────────────────────────────────────────────────────
    let path = std::env::args().nth(1).unwrap_or_else(|| DEFAULT_CONFIG.into());
    let store = Arc::new(
        ConfigStore::open(&path).with_context(|| format!("loading configuration from {path}"))?,
    );
    let config = store.get();
    info!("Using configuration {path} (source '{}')", config.source);

    // ── Transports ────────────────────────────────────────────────────────────
    let cancel = CancellationToken::new();
    let mut transports: Vec<Arc<dyn GameTransport>> = Vec::new();
    let (signal_tx, mut signal_rx) = tokio::sync::mpsc::unbounded_channel();

    if config.osc.enabled {
        let osc = OscTransport::connect(&config.osc)
            .await
            .context("opening OSC sender")?;
        transports.push(Arc::new(osc));
        match spawn_avatar_listener(&config.osc, signal_tx, cancel.child_token()).await {
            Ok((addr, _task)) => info!("Listening for avatar changes on {addr}"),
            Err(e) => warn!("Avatar change listener unavailable: {e}"),
        }
    }
    if let Some(broadcast) = &config.broadcast {
        let (transport, _task) = BroadcastTransport::bind(broadcast, cancel.child_token())
            .await
            .context("binding broadcast server")?;
        transports.push(Arc::new(transport));
    }
    if transports.is_empty() {
        warn!("No transport enabled; parameters will not leave this process");
    }

    // ── Orchestrator ──────────────────────────────────────────────────────────
    let probe: Arc<dyn ProcessProbe> = if config.skip_process_check {
        Arc::new(AlwaysRunning)
    } else {
        Arc::new(SystemProbe::new())
    };
    let bridge = Orchestrator::new(Arc::clone(&store), probe, transports);

    let signal_bridge = Arc::clone(&bridge);
    tokio::spawn(async move {
        while let Some(signal) = signal_rx.recv().await {
            signal_bridge.handle_signal(signal);
        }
    });

    if config.auto_start {
        bridge.start().await;
    }

    info!("Commands (type + Enter):");
    info!("  start | stop | restart");
    info!("  start-beat | stop-beat | refresh-config");
    info!("  bias-sdk <name> | unbias-sdk | destroy-sdk <name>");
    info!("  quit\n");

    // ── Stdin command loop ────────────────────────────────────────────────────
    // Lines are read on a dedicated OS thread (to avoid holding a non-Send
    // StdinLock across await points), then relayed to the async side.
    let (line_tx, mut line_rx) = tokio::sync::mpsc::unbounded_channel::<String>();

    std::thread::spawn(move || {
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            match line {
                Ok(l) => {
                    if line_tx.send(l.trim().to_owned()).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });

    loop {
        // Once stdin closes only Ctrl-C ends the loop.
        let line = tokio::select! {
            Some(line) = line_rx.recv() => line,
            r = tokio::signal::ctrl_c() => {
                if let Err(e) = r {
                    error!("Cannot listen for Ctrl-C: {e}");
                }
                break;
            }
        };
        match line.as_str() {
            "" => continue,
            "quit" | "exit" | "q" => {
                info!("Quit requested.");
                break;
            }
            other => bridge.handle_line(other).await,
        }
    }

    bridge.shutdown().await;
    cancel.cancel();
    info!("Bridge stopped – exiting.");
    Ok(())
}
