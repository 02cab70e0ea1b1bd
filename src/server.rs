use std::future::Future;
use std::io::ErrorKind;
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::lease::{Lease, LeaseTable};
use crate::packet::{BOOTREQUEST, DhcpPacket};
use crate::persistence::{JsonFileStore, LeaseStore, Persistence};
use crate::state_machine::{self, ServerContext, ServerState};

/// Largest UDP payload, so no datagram is cut short.
const RECV_BUFFER_SIZE: usize = 65_535;
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// The DHCP server: one UDP socket, the lease table and its persistence.
///
/// Datagrams are evaluated one at a time under the table lock. Replies are
/// sent from spawned tasks after the lock is released, and every table
/// change publishes a snapshot for the background saver.
pub struct DhcpServer<S: LeaseStore = JsonFileStore> {
    context: Arc<ServerContext>,
    state: Arc<Mutex<ServerState>>,
    persistence: Arc<Persistence<S>>,
    socket: Arc<UdpSocket>,
    snapshots: watch::Sender<Vec<Lease>>,
}

impl DhcpServer<JsonFileStore> {
    /// Builds a server that keeps its leases in `config.leases_file`.
    pub async fn new(config: Config) -> Result<Self> {
        let store = JsonFileStore::new(&config.leases_file);
        Self::with_store(config, store).await
    }
}

impl<S: LeaseStore> DhcpServer<S> {
    /// Loads persisted leases, drops records outside the pool and binds the
    /// socket.
    pub async fn with_store(config: Config, store: S) -> Result<Self> {
        config.validate()?;
        let context = ServerContext::from_config(&config)?;
        let persistence = Persistence::new(store);

        let mut table = LeaseTable::from_leases(persistence.load_all().await?);
        let pruned = table.retain(|lease| {
            !lease.has_address() || context.pool.contains(lease.ip_address)
        });
        if pruned > 0 {
            info!("Dropped {} lease(s) outside the configured pool", pruned);
            persistence.save_all(&table.snapshot()).await?;
        }
        table.take_mutated();

        let socket = Arc::new(Self::create_socket(&config)?);

        info!(
            "DHCP server {} listening on {}",
            context.pool.server_address,
            socket.local_addr()?
        );
        info!(
            "IP pool: {} - {} ({} addresses), {} lease(s) loaded",
            context.pool.pool_start,
            context.pool.pool_end,
            context.pool.size(),
            table.len()
        );

        let (snapshots, _) = watch::channel(table.snapshot());

        Ok(Self {
            context: Arc::new(context),
            state: Arc::new(Mutex::new(ServerState::new(table))),
            persistence: Arc::new(persistence),
            socket,
            snapshots,
        })
    }

    fn create_socket(config: &Config) -> Result<UdpSocket> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .map_err(|error| Error::Socket(format!("Failed to create socket: {}", error)))?;

        socket
            .set_reuse_address(true)
            .map_err(|error| Error::Socket(format!("Failed to set SO_REUSEADDR: {}", error)))?;

        socket
            .set_broadcast(true)
            .map_err(|error| Error::Socket(format!("Failed to set SO_BROADCAST: {}", error)))?;

        socket
            .set_nonblocking(true)
            .map_err(|error| Error::Socket(format!("Failed to set non-blocking: {}", error)))?;

        let bind_addr = SocketAddrV4::new(config.bind_address, config.server_port);
        socket.bind(&bind_addr.into()).map_err(|error| {
            Error::Socket(format!("Failed to bind to {}: {}", bind_addr, error))
        })?;

        let std_socket: std::net::UdpSocket = socket.into();
        UdpSocket::from_std(std_socket).map_err(|error| {
            Error::Socket(format!("Failed to convert to tokio socket: {}", error))
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Copies the current lease records.
    pub async fn leases(&self) -> Vec<Lease> {
        self.state.lock().await.table.snapshot()
    }

    /// Serves until `shutdown` resolves or a fatal error occurs, then stops.
    ///
    /// Stopping flushes a final snapshot and clears the in-memory table.
    /// Fatal receive, send and persistence failures are returned.
    pub async fn run(self, shutdown: impl Future<Output = ()> + Send) -> Result<()> {
        let mut saver = tokio::spawn(save_loop(
            Arc::clone(&self.persistence),
            self.snapshots.subscribe(),
        ));
        let (fatal_tx, mut fatal_rx) = mpsc::channel::<Error>(1);

        let mut sweep_timer = tokio::time::interval(SWEEP_INTERVAL);
        sweep_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut buffer = vec![0u8; RECV_BUFFER_SIZE];
        tokio::pin!(shutdown);

        info!("DHCP server ready and listening");

        let outcome = loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested, stopping server");
                    break Ok(());
                }
                received = self.socket.recv_from(&mut buffer) => match received {
                    Ok((size, source)) => {
                        self.handle_datagram(&buffer[..size], source, &fatal_tx).await;
                    }
                    Err(error) => {
                        error!("Error receiving packet: {}", error);
                        break Err(Error::FatalNetwork(error));
                    }
                },
                _ = sweep_timer.tick() => self.sweep().await,
                saved = &mut saver => {
                    break match saved {
                        Ok(result) => result,
                        Err(join_error) => Err(Error::Io(std::io::Error::other(join_error))),
                    };
                }
                Some(error) = fatal_rx.recv() => break Err(error),
            }
        };

        saver.abort();

        let flushed = if matches!(outcome, Err(Error::Persistence { .. })) {
            Ok(())
        } else {
            self.flush_and_clear().await
        };

        match outcome {
            Err(error) => {
                error!("DHCP server stopped: {}", error);
                Err(error)
            }
            Ok(()) => flushed,
        }
    }

    async fn handle_datagram(
        &self,
        data: &[u8],
        source: SocketAddr,
        fatal: &mpsc::Sender<Error>,
    ) {
        let request = match DhcpPacket::decode(data) {
            Ok(packet) => packet,
            Err(error) => {
                warn!("Dropping datagram from {}: {}", source, error);
                return;
            }
        };

        if request.op != BOOTREQUEST {
            debug!("Ignoring non-request op {} from {}", request.op, source);
            return;
        }

        match request.message_type() {
            Some(message_type) => info!(
                "{} from {} ({})",
                message_type,
                request.format_mac(),
                source
            ),
            None => info!("BOOTP from {} ({})", request.format_mac(), source),
        }

        let outgoing = {
            let mut state = self.state.lock().await;
            let outgoing =
                state_machine::handle_packet(&mut state, &self.context, &request, Utc::now());
            self.publish_if_mutated(&mut state);
            outgoing
        };

        let Some(outgoing) = outgoing else {
            return;
        };

        let bytes = outgoing
            .packet
            .encode(self.context.pool.minimum_packet_size());
        let destination = outgoing.destination;
        let socket = Arc::clone(&self.socket);
        let fatal = fatal.clone();

        tokio::spawn(async move {
            match socket.send_to(&bytes, destination).await {
                Ok(_) => {}
                Err(error) if is_transient_send_error(&error) => {
                    warn!("Failed to send reply to {}: {}", destination, error);
                }
                Err(error) => {
                    error!("Error sending reply to {}: {}", destination, error);
                    let _ = fatal.send(Error::FatalNetwork(error)).await;
                }
            }
        });
    }

    async fn sweep(&self) {
        let mut state = self.state.lock().await;
        let outcome = state_machine::sweep(&mut state.table, &self.context.pool, Utc::now());
        if outcome.removed > 0 {
            debug!("Sweep removed {} record(s)", outcome.removed);
        }
        self.publish_if_mutated(&mut state);
    }

    fn publish_if_mutated(&self, state: &mut ServerState) {
        if state.table.take_mutated() {
            self.snapshots.send_replace(state.table.snapshot());
        }
    }

    async fn flush_and_clear(&self) -> Result<()> {
        let snapshot = {
            let mut state = self.state.lock().await;
            let snapshot = state.table.snapshot();
            state.table.clear();
            state.table.take_mutated();
            snapshot
        };

        self.persistence.save_all(&snapshot).await?;
        info!("Saved {} lease(s) on shutdown", snapshot.len());
        Ok(())
    }
}

/// Saves the most recent snapshot each time one is published.
///
/// Snapshots published while a save runs collapse into one follow-up save.
async fn save_loop<S: LeaseStore>(
    persistence: Arc<Persistence<S>>,
    mut snapshots: watch::Receiver<Vec<Lease>>,
) -> Result<()> {
    while snapshots.changed().await.is_ok() {
        let leases = snapshots.borrow_and_update().clone();
        persistence.save_all(&leases).await?;
    }
    Ok(())
}

/// Errors tied to one destination rather than to the socket.
fn is_transient_send_error(error: &std::io::Error) -> bool {
    matches!(
        error.kind(),
        ErrorKind::HostUnreachable
            | ErrorKind::NetworkUnreachable
            | ErrorKind::ConnectionRefused
            | ErrorKind::AddrNotAvailable
            | ErrorKind::PermissionDenied
    )
}
