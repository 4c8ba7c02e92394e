//! Central relay: a protocol-blind proxy between two bound addresses.
//!
//! Every frame received on the ingress side is forwarded, unfiltered
//! and uninspected, to every consumer attached on the egress side. N
//! producers and M consumers form a star topology around one broker;
//! all demultiplexing intelligence lives in [`Connection`].

use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use agent_wire::framing;

use crate::config::RelayConfig;
use crate::connection::Connection;
use crate::error::RelayError;

/// Capacity of the internal fan-out channel. A consumer that lags this
/// far behind loses frames rather than stalling the proxy.
const FANOUT_CAPACITY: usize = 1024;

/// The central relay process.
///
/// Stateless beyond its two bound addresses and a running flag; it
/// holds no message-level state.
pub struct Broker {
    config: RelayConfig,
    bound: Mutex<Option<(SocketAddr, SocketAddr)>>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Broker {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config,
            bound: Mutex::new(None),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Bind both addresses and spawn the proxy tasks.
    ///
    /// Port 0 binds are resolved to concrete ports, visible through
    /// [`Broker::local_addrs`] and used by [`Broker::connect`].
    pub async fn start(&self) -> Result<(), RelayError> {
        let mut bound = self.bound.lock().await;
        if bound.is_some() {
            return Err(RelayError::AlreadyRunning);
        }
        if self.cancel.is_cancelled() {
            return Err(RelayError::NotRunning);
        }

        let ingress = TcpListener::bind(&self.config.ingress_addr).await?;
        let egress = TcpListener::bind(&self.config.egress_addr).await?;
        let ingress_addr = ingress.local_addr()?;
        let egress_addr = egress.local_addr()?;

        let (fan_tx, _) = broadcast::channel::<String>(FANOUT_CAPACITY);

        let mut tasks = self.tasks.lock().await;
        tasks.push(tokio::spawn(accept_producers(
            ingress,
            fan_tx.clone(),
            self.cancel.clone(),
        )));
        tasks.push(tokio::spawn(accept_consumers(
            egress,
            fan_tx,
            self.cancel.clone(),
        )));
        *bound = Some((ingress_addr, egress_addr));
        info!(%ingress_addr, %egress_addr, "broker started");
        Ok(())
    }

    /// Stop the proxy and join its tasks.
    ///
    /// Idempotent, and safe to call even if `start` never ran. A
    /// stopped broker cannot be restarted.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            if let Err(e) = task.await {
                warn!("broker task failed during shutdown: {}", e);
            }
        }
        *self.bound.lock().await = None;
    }

    /// The addresses actually bound, once started.
    pub async fn local_addrs(&self) -> Option<(SocketAddr, SocketAddr)> {
        *self.bound.lock().await
    }

    /// A new client handle wired to this broker, with producer and
    /// consumer directions swapped relative to the broker's own binds.
    /// The connection is returned unstarted.
    pub async fn connect(&self) -> Connection {
        let config = match *self.bound.lock().await {
            Some((ingress_addr, egress_addr)) => RelayConfig {
                ingress_addr: ingress_addr.to_string(),
                egress_addr: egress_addr.to_string(),
            },
            None => self.config.clone(),
        };
        Connection::new(config)
    }
}

/// Accept producers and pump each one's frames into the fan-out.
async fn accept_producers(
    listener: TcpListener,
    fan_tx: broadcast::Sender<String>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "producer attached");
                    tokio::spawn(pump_in(stream, fan_tx.clone(), cancel.clone()));
                }
                Err(e) => warn!("ingress accept failed: {}", e),
            }
        }
    }
}

async fn pump_in(
    mut stream: TcpStream,
    fan_tx: broadcast::Sender<String>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            frame = framing::read_frame(&mut stream) => match frame {
                // A send error just means no consumer is attached yet.
                Ok(Some(text)) => {
                    let _ = fan_tx.send(text);
                }
                Ok(None) => {
                    debug!("producer detached");
                    break;
                }
                Err(e) => {
                    warn!("producer stream failed: {}", e);
                    break;
                }
            }
        }
    }
}

/// Accept consumers; each gets its own fan-out subscription from the
/// moment it attaches.
async fn accept_consumers(
    listener: TcpListener,
    fan_tx: broadcast::Sender<String>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "consumer attached");
                    let rx = fan_tx.subscribe();
                    tokio::spawn(pump_out(stream, rx, cancel.clone()));
                }
                Err(e) => warn!("egress accept failed: {}", e),
            }
        }
    }
}

async fn pump_out(
    mut stream: TcpStream,
    mut rx: broadcast::Receiver<String>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            frame = rx.recv() => match frame {
                Ok(text) => {
                    if let Err(e) = framing::write_frame(&mut stream, &text).await {
                        debug!("consumer detached: {}", e);
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "slow consumer lagged behind the proxy");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ephemeral_config() -> RelayConfig {
        RelayConfig {
            ingress_addr: "127.0.0.1:0".to_string(),
            egress_addr: "127.0.0.1:0".to_string(),
        }
    }

    #[tokio::test]
    async fn start_resolves_ephemeral_ports() {
        let broker = Broker::new(ephemeral_config());
        broker.start().await.unwrap();
        let (ingress, egress) = broker.local_addrs().await.unwrap();
        assert_ne!(ingress.port(), 0);
        assert_ne!(egress.port(), 0);
        assert_ne!(ingress.port(), egress.port());
        broker.stop().await;
    }

    #[tokio::test]
    async fn stop_without_start_is_safe() {
        let broker = Broker::new(ephemeral_config());
        broker.stop().await;
        broker.stop().await;
        assert!(broker.local_addrs().await.is_none());
    }

    #[tokio::test]
    async fn start_twice_is_a_lifecycle_error() {
        let broker = Broker::new(ephemeral_config());
        broker.start().await.unwrap();
        let err = broker.start().await.unwrap_err();
        assert!(matches!(err, RelayError::AlreadyRunning));
        broker.stop().await;
    }

    #[tokio::test]
    async fn connect_uses_resolved_addresses() {
        let broker = Broker::new(ephemeral_config());
        broker.start().await.unwrap();
        let conn = broker.connect().await;
        conn.start().await.unwrap();
        conn.stop().await;
        broker.stop().await;
    }
}
