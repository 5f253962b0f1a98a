//! Service lifecycle controller.
//!
//! Owns the registry, the worker pool and the network servers. Status moves
//! NotRunning -> Running on a successful start, or NotRunning -> SetupFailed
//! when the listener cannot bind or a configured part fails to open; a
//! failed setup leaves no part reachable through dispatch.

use std::path::Path;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response};
use once_cell::sync::OnceCell;
use prometheus::{Encoder, TextEncoder};
use tokio::net::TcpListener;
use tokio::sync::{watch, Mutex};
use tokio::time::Duration;

use crate::client::RaftClient;
use crate::config;
use crate::error::{RaftError, Result};
use crate::metrics;
use crate::raft::{Part, PartManager, PartOptions, Peer, PeerTransport, PartitionKey};
use crate::service::pb::raftex_service_server::RaftexServiceServer;
use crate::service::RaftexServiceSVC;
use crate::state_log::StateLog;
use crate::worker::WorkerPool;

const STATUS_NOT_RUNNING: i32 = 0;
const STATUS_SETUP_FAILED: i32 = 1;
const STATUS_RUNNING: i32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceStatus {
    NotRunning,
    SetupFailed,
    Running,
}

static INSTANCE: OnceCell<Mutex<Server>> = OnceCell::new();
pub fn instance() -> &'static Mutex<Server> {
    INSTANCE.get_or_init(|| Mutex::new(Server::builder()))
}

pub struct Server {
    status: Arc<AtomicI32>,
    parts: Arc<PartManager>,
    transport: Arc<RaftClient>,
    workers: Option<Arc<WorkerPool>>,
    shutdown_tx: Option<watch::Sender<bool>>,
    done_rx: Option<watch::Receiver<bool>>,
}

impl Server {
    fn builder() -> Self {
        Server {
            status: Arc::new(AtomicI32::new(STATUS_NOT_RUNNING)),
            parts: Arc::new(PartManager::new()),
            transport: Arc::new(RaftClient::new()),
            workers: None,
            shutdown_tx: None,
            done_rx: None,
        }
    }

    pub fn status(&self) -> ServiceStatus {
        match self.status.load(Ordering::SeqCst) {
            STATUS_RUNNING => ServiceStatus::Running,
            STATUS_SETUP_FAILED => ServiceStatus::SetupFailed,
            _ => ServiceStatus::NotRunning,
        }
    }

    /// Registry handle for the external partition-placement layer; part
    /// add/remove is driven from there, never by peers.
    pub fn part_manager(&self) -> Arc<PartManager> {
        Arc::clone(&self.parts)
    }

    pub async fn start(&mut self) -> anyhow::Result<()> {
        if self.status() == ServiceStatus::Running {
            return Ok(());
        }

        let cfg = config::instance().lock().unwrap().clone();

        // Bind before anything becomes reachable, so a bad address fails
        // the whole startup
        let addr: std::net::SocketAddr = match cfg.addr.parse() {
            Ok(addr) => addr,
            Err(e) => {
                self.status.store(STATUS_SETUP_FAILED, Ordering::SeqCst);
                anyhow::bail!("invalid listen address {}: {}", cfg.addr, e);
            }
        };
        let listener = match TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(e) => {
                self.status.store(STATUS_SETUP_FAILED, Ordering::SeqCst);
                anyhow::bail!("failed to bind {}: {}", cfg.addr, e);
            }
        };

        let workers = Arc::new(WorkerPool::new(cfg.worker_threads, cfg.worker_queue_depth));
        self.workers = Some(Arc::clone(&workers));

        if let Err(e) = self.setup_parts(&cfg) {
            // Nothing half-initialized may stay reachable
            self.parts.drain();
            self.status.store(STATUS_SETUP_FAILED, Ordering::SeqCst);
            anyhow::bail!("failed to set up parts: {}", e);
        }

        self.start_grpc_server(listener, workers).await;
        self.start_metrics_server(&cfg).await;

        self.status.store(STATUS_RUNNING, Ordering::SeqCst);
        log::info!("raftex service running on {}", cfg.addr);
        Ok(())
    }

    /// Idempotent; stops part timers, then drains accepted RPCs through
    /// the server's graceful shutdown.
    pub fn stop(&mut self) {
        let prev = self.status.swap(STATUS_NOT_RUNNING, Ordering::SeqCst);
        if prev != STATUS_RUNNING {
            return;
        }
        log::info!("raftex service stopping");
        self.parts.drain();
        metrics::PARTS_GAUGE.set(0.0);
        self.workers.take();
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(true);
        }
    }

    /// Blocks until the server future finished draining in-flight RPCs.
    pub async fn wait_until_stop(&mut self) {
        if let Some(mut rx) = self.done_rx.clone() {
            while !*rx.borrow() {
                if rx.changed().await.is_err() {
                    break;
                }
            }
        }
    }

    fn setup_parts(&self, cfg: &config::RuntimeConfig) -> Result<()> {
        let opts = PartOptions {
            tick_interval: Duration::from_millis(50),
            election_timeout_min: Duration::from_millis(cfg.election_timeout_min_ms),
            election_timeout_max: Duration::from_millis(
                cfg.election_timeout_max_ms.max(cfg.election_timeout_min_ms),
            ),
            heartbeat_interval: Duration::from_millis(cfg.heartbeat_interval_ms),
            snapshot_interval: Duration::from_secs(cfg.snapshot_interval_secs),
        };

        for part_cfg in &cfg.part_list {
            let key = PartitionKey::new(part_cfg.space_id, part_cfg.part_id);
            let as_learner = part_cfg.learners.contains(&cfg.id);
            if !as_learner && !part_cfg.voters.contains(&cfg.id) {
                return Err(RaftError::SetupFailed(format!(
                    "part {} does not list host {} as voter or learner",
                    key, cfg.id
                )));
            }

            let mut peers: Vec<Peer> = part_cfg
                .voters
                .iter()
                .filter(|&&id| id != cfg.id)
                .map(|&id| Peer { id, learner: false })
                .collect();
            peers.extend(
                part_cfg
                    .learners
                    .iter()
                    .filter(|&&id| id != cfg.id)
                    .map(|&id| Peer { id, learner: true }),
            );

            let wal_dir = Path::new(&cfg.wal_path)
                .join(format!("{}_{}", part_cfg.space_id, part_cfg.part_id));
            let part = Part::new(
                key,
                cfg.id,
                &peers,
                as_learner,
                wal_dir,
                Arc::clone(&self.transport) as Arc<dyn PeerTransport>,
                Box::new(StateLog::new()),
                opts.clone(),
            )?;
            part.start();
            self.parts.add_part(key, part)?;
        }
        metrics::PARTS_GAUGE.set(self.parts.part_count() as f64);
        Ok(())
    }

    async fn start_grpc_server(&mut self, listener: TcpListener, workers: Arc<WorkerPool>) {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let (done_tx, done_rx) = watch::channel(false);
        self.shutdown_tx = Some(shutdown_tx);
        self.done_rx = Some(done_rx);

        let raftex_service = RaftexServiceSVC::new(Arc::clone(&self.parts), workers);
        let incoming = tokio_stream::wrappers::TcpListenerStream::new(listener);
        tokio::spawn(async move {
            let result = tonic::transport::Server::builder()
                .add_service(RaftexServiceServer::new(raftex_service))
                .serve_with_incoming_shutdown(incoming, async move {
                    let _ = shutdown_rx.changed().await;
                })
                .await;
            if let Err(e) = result {
                log::error!("grpc server exited: {}", e);
            }
            let _ = done_tx.send(true);
        });
        log::info!("grpc server started");
    }

    async fn start_metrics_server(&mut self, cfg: &config::RuntimeConfig) {
        let addr = match cfg.metrics_addr.parse() {
            Ok(addr) => addr,
            Err(e) => {
                log::warn!("invalid metrics address {}: {}", cfg.metrics_addr, e);
                return;
            }
        };
        let make_svc = make_service_fn(move |_| {
            let registry = metrics::REGISTRY_INSTANCE.clone();
            async move {
                Ok::<_, hyper::Error>(service_fn(move |_: Request<Body>| {
                    let registry = registry.clone();
                    async move {
                        let encoder = TextEncoder::new();
                        let metric_families = registry.gather();
                        let mut buffer = Vec::new();
                        encoder.encode(&metric_families, &mut buffer).unwrap();
                        Ok::<_, hyper::Error>(Response::new(Body::from(buffer)))
                    }
                }))
            }
        });
        metrics::init_registry();
        let server = hyper::Server::bind(&addr).serve(make_svc);
        tokio::spawn(async move {
            tokio::pin!(server);
            if let Err(e) = server.await {
                log::error!("metrics server exited: {}", e);
            }
        });
        log::info!("metrics server started on {}", addr);
    }
}
