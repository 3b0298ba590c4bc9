use dispatchgate::config::Config;
use dispatchgate::factory::DispatchFactory;
use dispatchgate::server::{DispatchServer, QuiesceMonitor};
use dispatchgate::tls;
use dispatchgate::vhost::VirtualHostMap;
use dispatchgate::{PKG_NAME, VERSION};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("dispatchgate=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");

    print_startup_banner(&config);

    // Write PID file if configured (with exclusive lock on Unix)
    let pid_file_path = config.server.pid_file.as_ref().map(PathBuf::from);
    let _pid_file = if let Some(ref path) = pid_file_path {
        let pid_file = write_pid_file(path)?;
        info!(path = %path.display(), "PID file written and locked");
        Some(pid_file)
    } else {
        None
    };

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Load TLS configuration if any endpoint is secure
    // Priority: file-based certs > self-signed
    let tls_acceptor = if config.endpoints.values().any(|e| e.secure) {
        let (certs, key) = match (&config.server.tls_cert, &config.server.tls_key) {
            (Some(cert_path), Some(key_path)) => {
                let certs = tls::load_certs(cert_path)?;
                let key = tls::load_key(key_path)?;
                info!(cert = %cert_path, key = %key_path, "TLS enabled with provided certificates");
                (certs, key)
            }
            _ => {
                let (certs, key) = tls::generate_self_signed_cert()?;
                warn!("TLS enabled with auto-generated self-signed certificate (not for production)");
                (certs, key)
            }
        };
        Some(tls::acceptor(certs, key)?)
    } else {
        None
    };

    // Routing and dispatcher settings
    let hosts = Arc::new(VirtualHostMap::new());
    hosts.replace_hosts(config.build_virtual_hosts()?);
    let settings = config.dispatcher_settings(hosts.clone(), &Handle::current())?;

    let monitor = QuiesceMonitor::new();
    let factory = DispatchFactory::new(Arc::new(settings), monitor.clone())
        .with_default_buffer_size(config.dispatcher.default_buffer_size);

    // One channel and one server per endpoint
    let mut server_handles = Vec::new();
    for (name, endpoint) in &config.endpoints {
        let addr: SocketAddr = format!("{}:{}", config.server.bind, endpoint.port)
            .parse()
            .map_err(|e| {
                error!(bind = %config.server.bind, port = endpoint.port, error = %e, "Invalid bind address");
                anyhow::anyhow!("Invalid bind address for endpoint '{}': {}", name, e)
            })?;

        let channel = factory.find_or_create(name, endpoint.channel_config(name));
        channel.start()?;

        let mut server = DispatchServer::new(addr, channel, shutdown_rx.clone());
        if endpoint.secure {
            let acceptor: TlsAcceptor = tls_acceptor
                .clone()
                .ok_or_else(|| anyhow::anyhow!("TLS acceptor required for endpoint '{}'", name))?;
            server = server.with_tls(acceptor);
        }

        let endpoint_name = name.clone();
        server_handles.push(tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!(endpoint = %endpoint_name, error = %e, "Dispatch server error");
            }
        }));
    }

    // Wait for shutdown signal (Ctrl+C or SIGTERM) or config reload (SIGHUP)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sighup = signal(SignalKind::hangup())?;

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received SIGINT (Ctrl+C), shutting down...");
                    break;
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down...");
                    break;
                }
                _ = sighup.recv() => {
                    info!(path = %config_path.display(), "Received SIGHUP, reloading configuration...");
                    match reload_config(&config_path, &config, &hosts, &factory) {
                        Ok(updated) => {
                            info!(channels = updated, "Configuration reloaded successfully");
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to reload configuration");
                        }
                    }
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    // Stop accepting new connections
    let _ = shutdown_tx.send(true);

    // Quiesce every channel, then stop immediately once drained or out of time
    let names = factory.channel_names();
    let grace = config.server.shutdown_grace();
    monitor.reset();
    for name in &names {
        if let Some(channel) = factory.get(name) {
            channel.stop(grace);
        }
    }
    if !grace.is_zero() {
        info!(grace_secs = grace.as_secs(), "Waiting for active connections to finish");
        if tokio::time::timeout(grace, monitor.wait_for(&names)).await.is_err() {
            warn!("Grace period expired with connections still active");
        }
    }
    for name in &names {
        if let Some(channel) = factory.get(name) {
            channel.stop(Duration::ZERO);
        }
        factory.remove(name);
    }

    // Wait for servers to stop (with timeout)
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        for handle in server_handles {
            let _ = handle.await;
        }
    })
    .await;

    // Clean up PID file
    if let Some(ref path) = pid_file_path {
        if let Err(e) = std::fs::remove_file(path) {
            warn!(path = %path.display(), error = %e, "Failed to remove PID file");
        }
    }

    info!("Shutdown complete");
    Ok(())
}

/// Apply routes, trust settings and channel configuration from `path`.
///
/// Endpoint ports, TLS and dispatcher flags other than private header
/// trust take effect on restart.
fn reload_config(
    path: &Path,
    current: &Config,
    hosts: &VirtualHostMap,
    factory: &DispatchFactory,
) -> anyhow::Result<usize> {
    let config = Config::load(path)?;
    hosts.replace_hosts(config.build_virtual_hosts()?);
    factory
        .settings()
        .trust
        .set(config.dispatcher.use_private_headers.clone());

    let mut updated = 0;
    for (name, endpoint) in &config.endpoints {
        match current.endpoints.get(name) {
            Some(running) if running.port == endpoint.port && running.secure == endpoint.secure => {
                if factory.update(name, endpoint.channel_config(name)) {
                    updated += 1;
                }
            }
            Some(_) => {
                warn!(endpoint = %name, "Endpoint port or security changed; restart to apply");
            }
            None => {
                warn!(endpoint = %name, "New endpoint ignored until restart");
            }
        }
    }
    Ok(updated)
}

/// PID file handle that maintains an exclusive lock
#[cfg(unix)]
struct PidFile {
    _file: std::fs::File,
}

#[cfg(unix)]
impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        use std::os::unix::io::AsRawFd;

        let file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        // Try to acquire exclusive lock (non-blocking)
        let fd = file.as_raw_fd();
        let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };

        if result != 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                anyhow::bail!("Another instance is already running (PID file is locked)");
            }
            return Err(err.into());
        }

        let pid = std::process::id();
        use std::io::Write;
        writeln!(&file, "{}", pid)?;

        // Keep the file handle open to maintain the lock
        Ok(Self { _file: file })
    }
}

#[cfg(not(unix))]
struct PidFile;

#[cfg(not(unix))]
impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        let pid = std::process::id();
        let mut file = std::fs::File::create(path)?;
        use std::io::Write;
        writeln!(file, "{}", pid)?;
        Ok(Self)
    }
}

fn write_pid_file(path: &Path) -> anyhow::Result<PidFile> {
    PidFile::create(path)
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting dispatcher");
    info!(
        bind = %config.server.bind,
        tls = config.server.tls_available(),
        shutdown_grace_secs = config.server.shutdown_grace_secs,
        "Server configuration"
    );
    for (name, endpoint) in &config.endpoints {
        info!(
            endpoint = %name,
            port = endpoint.port,
            secure = endpoint.secure,
            buffer_size = endpoint.buffer_size.unwrap_or(config.dispatcher.default_buffer_size),
            "Endpoint"
        );
    }
    info!(
        welcome_page = config.dispatcher.welcome_page_enabled,
        pad_not_found = config.dispatcher.pad_not_found_body,
        hsts = config.dispatcher.hsts_value.is_some(),
        private_headers = ?config.dispatcher.use_private_headers,
        executor = config.dispatcher.executor_enabled,
        max_concurrent_handlers = config.dispatcher.max_concurrent_handlers,
        "Dispatcher settings"
    );
    info!(
        virtual_hosts = ?config.virtual_hosts.keys().collect::<Vec<_>>(),
        classification_rules = config.classification.len(),
        pools = config.pools.len(),
        "Routing"
    );
}
