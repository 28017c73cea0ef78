use anyhow::{bail, Context, Result};
use strata_core::{TransportFactory, TransportSelection};
use strata_transport::Transport;
use strata_wire::{BufferPool, SizeClass};
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

/// Dials the configured server, opens one tunnel and prints what comes back.
#[tokio::main]
async fn main() -> Result<()> {
    let level = match std::env::var("STRATA_LOG").as_deref() {
        Ok("trace") => Level::TRACE,
        Ok("debug") => Level::DEBUG,
        Ok("warn") => Level::WARN,
        Ok("error") => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let selection = TransportSelection::from_env().context("reading STRATA_* settings")?;
    if selection.server.is_empty() {
        bail!("STRATA_SERVER is not set");
    }
    let target = std::env::var("STRATA_TARGET").unwrap_or_else(|_| "example.com:80".to_string());
    let host = target.rsplit_once(':').map(|(host, _)| host).unwrap_or(&target);
    let request = format!("HEAD / HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n", host);

    let factory = TransportFactory::new(selection)?;
    info!("Dialling {} via {}", factory.selection().server, factory.name());
    let tunnel = factory.dial().await?;
    tunnel.connect(&target, request.as_bytes()).await?;
    let heartbeat = tunnel.start_ping(factory.heartbeat());

    let mut buf = BufferPool::global().checkout(SizeClass::Large);
    let mut total = 0;
    loop {
        let res = tokio::select! {
            res = tunnel.read(&mut buf) => res,
            _ = tokio::signal::ctrl_c() => {
                warn!("Interrupted");
                break;
            }
        };
        match res {
            Ok(0) => break,
            Ok(n) => {
                total += n;
                print!("{}", String::from_utf8_lossy(&buf[..n]));
            }
            Err(e) => {
                error!("Tunnel read failed: {}", e);
                break;
            }
        }
    }

    heartbeat.cancel();
    tunnel.close().await?;
    info!("{} bytes received from {} over {}", total, target, tunnel.transport_name());
    Ok(())
}
