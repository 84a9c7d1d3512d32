//! Development/testing entry point for the daemon: wires an object store,
//! a [vfsd_core::server::Server] and the management RPC surface together
//! and runs them in the foreground. Not a full configuration front end —
//! just enough surface (`run`, `status`) to start a daemon instance and
//! inspect it without a real init system or privileged helper process.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tonic::transport::Server as TonicServer;
use tracing::{info, instrument};

use vfsd_core::backend::{MemoryBackend, RemoteBackend};
use vfsd_core::cache::{CacheConfig, InMemoryObjectCache};
use vfsd_core::importqueue::pool::ImporterPool;
use vfsd_core::importqueue::{BatchSizes, ImportRequestQueue};
use vfsd_core::localstore::{LocalStore, MemoryLocalStore, RedbLocalStore, SledLocalStore};
use vfsd_core::objectstore::ObjectStore;
use vfsd_core::server::Server;

use vfsd_daemon::management::ManagementService;
use vfsd_daemon::proto::management_service_server::ManagementServiceServer;
use vfsd_daemon::statedir::StateDir;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Runs the daemon in the foreground: builds the object store, starts
    /// the management RPC surface and (optionally) registers one mount.
    Run {
        /// Root of this instance's on-disk state (lock, sockets, storage,
        /// client directories).
        #[arg(long)]
        state_dir: PathBuf,

        /// Local storage engine backing the object store.
        #[arg(long, default_value = "sled")]
        storage_engine: StorageEngine,

        /// `grpc+http://...` or `grpc+unix://...` address of a remote
        /// source-control backend. When absent, an in-memory backend is
        /// used (fine for local development, returns nothing for real
        /// commits).
        #[arg(long)]
        backend_addr: Option<url::Url>,

        /// Number of importer-pool workers draining the fetch queue.
        #[arg(long, default_value_t = 4)]
        import_workers: usize,

        /// If set, registers one mount at startup: `<mount path>`.
        #[arg(long)]
        mount_path: Option<PathBuf>,

        /// Name of the client directory backing `mount_path`'s overlay,
        /// under `<state dir>/clients/<name>`.
        #[arg(long, default_value = "default")]
        client_name: String,

        /// Root id (hex) the initial mount starts checked out to. Required
        /// when `--mount-path` is given.
        #[arg(long)]
        initial_root: Option<String>,

        #[arg(long, default_value_t = false)]
        read_only: bool,

        /// Address the management gRPC surface listens on (anything
        /// `tokio-listener` accepts: `unix:/path`, `inet:host:port`, ...).
        #[arg(long, default_value = "unix:/tmp/vfsd.sock")]
        listen_address: String,

        #[cfg(feature = "fuse")]
        #[arg(long, default_value_t = default_fuse_threads())]
        fuse_threads: usize,

        #[cfg(feature = "fuse")]
        #[arg(long, default_value_t = false)]
        allow_other: bool,
    },
    /// Connects to a running daemon's management socket and prints its
    /// registered mounts.
    Status {
        #[arg(long, default_value = "grpc+unix:///tmp/vfsd.sock")]
        management_addr: url::Url,
    },
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum StorageEngine {
    Sled,
    Redb,
    Memory,
}

impl StorageEngine {
    fn as_str(self) -> &'static str {
        match self {
            StorageEngine::Sled => "sled",
            StorageEngine::Redb => "redb",
            StorageEngine::Memory => "memory",
        }
    }
}

#[cfg(feature = "fuse")]
fn default_fuse_threads() -> usize {
    std::thread::available_parallelism().map(Into::into).unwrap_or(4)
}

fn open_local_store(state_dir: &StateDir, engine: StorageEngine) -> anyhow::Result<Arc<dyn LocalStore>> {
    let dir = state_dir.storage_dir(engine.as_str());
    Ok(match engine {
        StorageEngine::Sled => Arc::new(SledLocalStore::open(&dir)?),
        StorageEngine::Redb => Arc::new(RedbLocalStore::open(&dir)?),
        StorageEngine::Memory => Arc::new(MemoryLocalStore::new()),
    })
}

fn build_backend(backend_addr: Option<&url::Url>) -> anyhow::Result<Arc<dyn RemoteBackend>> {
    match backend_addr {
        Some(url) => {
            let channel = vfsd_core::grpc_channel::from_url(url)?;
            Ok(Arc::new(vfsd_core::backend::GrpcBackend::new(channel)))
        }
        None => Ok(Arc::new(MemoryBackend::new())),
    }
}

#[instrument(skip_all, err)]
async fn run(
    state_dir: PathBuf,
    storage_engine: StorageEngine,
    backend_addr: Option<url::Url>,
    import_workers: usize,
    mount_path: Option<PathBuf>,
    client_name: String,
    initial_root: Option<String>,
    read_only: bool,
    listen_address: tokio_listener::ListenerAddress,
    #[cfg(feature = "fuse")] fuse_threads: usize,
    #[cfg(feature = "fuse")] allow_other: bool,
) -> anyhow::Result<()> {
    let state_dir = StateDir::new(state_dir);
    state_dir.ensure_dirs(storage_engine.as_str()).await?;

    let local = open_local_store(&state_dir, storage_engine)?;
    let cache = Arc::new(InMemoryObjectCache::new(CacheConfig::default()));
    let backend = build_backend(backend_addr.as_ref())?;
    let queue = ImportRequestQueue::new(BatchSizes::default());
    let pool = ImporterPool::spawn(import_workers, queue.clone(), backend.clone(), None);
    let queue_for_shutdown = queue.clone();

    let object_store = Arc::new(ObjectStore::new(local, cache, queue, backend));
    let server = Arc::new(Server::new(object_store.clone()));

    #[cfg(feature = "fuse")]
    let mut fuse_daemon = None;

    if let Some(mount_path) = mount_path.clone() {
        let _ = read_only; // kernel mount flags are a fs-layer concern, not the registry's
        let root_bytes = initial_root
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("--initial-root is required when --mount-path is set"))?
            .as_bytes()
            .to_vec();
        let initial_root = object_store.parse_root_id(&root_bytes);
        let overlay_root = state_dir.overlay_dir(&client_name);
        tokio::fs::create_dir_all(&overlay_root).await?;
        let mount = server.mount(mount_path.clone(), overlay_root, initial_root)?;
        info!(?mount_path, generation = mount.mount_generation(), "registered initial mount");

        #[cfg(feature = "fuse")]
        {
            let handle = tokio::runtime::Handle::current();
            let fs = vfsd_core::fs::VfsdFs::new(mount.clone(), handle);
            let daemon = tokio::task::spawn_blocking(move || {
                vfsd_core::fs::fuse::FuseDaemon::new(fs, &mount_path, fuse_threads, allow_other)
            })
            .await??;
            fuse_daemon = Some(daemon);
        }
    }

    let management = ManagementServiceServer::new(ManagementService::new(server.clone()));
    let listener = tokio_listener::Listener::bind(
        &listen_address,
        &tokio_listener::SystemOptions::default(),
        &tokio_listener::UserOptions::default(),
    )
    .await?;
    info!(%listen_address, "management surface listening");

    let sweep_server = server.clone();
    let sweep_handle = tokio::spawn(async move {
        sweep_server
            .run_unload_sweep(async {
                let _ = tokio::signal::ctrl_c().await;
            })
            .await;
    });

    TonicServer::builder()
        .add_service(management)
        .serve_with_incoming_shutdown(listener, async {
            let _ = tokio::signal::ctrl_c().await;
            info!("received interrupt, shutting down");
        })
        .await?;

    let _ = sweep_handle.await;
    queue_for_shutdown.stop();
    pool.join().await;
    server.shutdown();

    #[cfg(feature = "fuse")]
    if let Some(mut daemon) = fuse_daemon.take() {
        tokio::task::spawn_blocking(move || daemon.unmount()).await??;
    }

    Ok(())
}

async fn status(management_addr: url::Url) -> anyhow::Result<()> {
    let channel = vfsd_core::grpc_channel::from_url(&management_addr)?;
    let mut client = vfsd_daemon::proto::management_service_client::ManagementServiceClient::new(channel);
    let response = client
        .list_mounts(vfsd_daemon::proto::ListMountsRequest {})
        .await?
        .into_inner();
    if response.mounts.is_empty() {
        println!("no mounts registered");
    }
    for mount in response.mounts {
        println!(
            "{}\tgeneration={}\troot={}",
            mount.mount_path,
            mount.mount_generation,
            data_encoding::HEXLOWER.encode(&mount.current_root_id)
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _tracing = vfsd_telemetry::TracingBuilder::default().build()?;
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            state_dir,
            storage_engine,
            backend_addr,
            import_workers,
            mount_path,
            client_name,
            initial_root,
            read_only,
            listen_address,
            #[cfg(feature = "fuse")]
            fuse_threads,
            #[cfg(feature = "fuse")]
            allow_other,
        } => {
            run(
                state_dir,
                storage_engine,
                backend_addr,
                import_workers,
                mount_path,
                client_name,
                initial_root,
                read_only,
                listen_address,
                #[cfg(feature = "fuse")]
                fuse_threads,
                #[cfg(feature = "fuse")]
                allow_other,
            )
            .await
        }
        Commands::Status { management_addr } => status(management_addr).await,
    }
}
