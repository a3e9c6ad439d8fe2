use crate::metrics::Metrics;
use crate::replicator::Replicator;
use crate::server;
use crate::settings::{ReplicatorSettings, ServerSettings, Settings};
use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// CLI arguments forwarded from `main()`.
pub struct BootstrapArgs {
    pub env_file: Option<std::path::PathBuf>,
    pub admin_listen: String,
}

/// Proxy lifecycle: settings → state → replicator → listeners → signal.
pub async fn run(args: BootstrapArgs) -> Result<()> {
    init_tracing();
    crate::proxy::health::process_start();

    // Phase 1: settings and state. View construction claims every key
    // for its environment; conflicts fail here.
    let settings = Settings::from_process_env(args.env_file.as_deref());
    let server_settings = ServerSettings::new(&settings)?;
    let replicator_settings = ReplicatorSettings::new(&settings)?;

    install_panic_hook(server_settings.exit_on_panic());

    let metrics = Metrics::install();
    let state = server::ProxyState::new(settings.clone())?;

    // Phase 2: replicator. Replication failures never take down request
    // serving, so a failed start is logged and the node runs standalone.
    let shutdown = Arc::new(Notify::new());
    let replicator = start_replicator(&settings, &replicator_settings).await;

    // Phase 3: preflight the listen sockets before accepting anything.
    let bind_addr = server_settings.bind_address_v4();
    let http_addr: SocketAddr = format!("{}:{}", bind_addr, server_settings.http_port())
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid HTTP listen address: {}", e))?;
    server::preflight_bind(http_addr)?;

    let tls_config = if server_settings.tls_enabled() {
        let config = Arc::new(server::tls::load_server_config(&server_settings)?);
        let https_addr: SocketAddr = format!("{}:{}", bind_addr, server_settings.https_port())
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid HTTPS listen address: {}", e))?;
        server::preflight_bind(https_addr)?;
        Some((https_addr, config))
    } else {
        None
    };

    // Phase 4: admin + proxy listeners.
    start_admin_server(&state, &metrics, &args.admin_listen);

    tracing::info!("server: starting proxy, listen={}", http_addr);
    let http_handle = tokio::spawn({
        let state = state.clone();
        let shutdown = shutdown.clone();
        async move { server::run_proxy_server(http_addr, state, shutdown, None).await }
    });

    let https_handle = tls_config.map(|(https_addr, config)| {
        tracing::info!("server: starting TLS proxy, listen={}", https_addr);
        tokio::spawn({
            let state = state.clone();
            let shutdown = shutdown.clone();
            async move { server::run_proxy_server(https_addr, state, shutdown, Some(config)).await }
        })
    });

    // Phase 5: block until signal, then drain.
    wait_for_shutdown(&shutdown).await;

    if let Some(ref replicator) = replicator {
        replicator.stop_in_background(std::time::Duration::from_secs(2));
    }

    if let Err(e) = http_handle.await {
        tracing::error!("server: proxy task error: {}", e);
    }
    if let Some(handle) = https_handle {
        if let Err(e) = handle.await {
            tracing::error!("server: TLS proxy task error: {}", e);
        }
    }

    tracing::info!("server: shutdown complete");
    Ok(())
}

fn init_tracing() {
    let (non_blocking, _guard) = tracing_appender::non_blocking::NonBlockingBuilder::default()
        .buffered_lines_limit(128_000)
        .lossy(true)
        .finish(std::io::stdout());

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(false)
                .json(),
        )
        .init();

    std::mem::forget(_guard);
}

/// Exit with code 1 on panic when the exit-on-panic flag is set; the
/// default hook only unwinds the offending task.
fn install_panic_hook(exit_on_panic: bool) {
    if !exit_on_panic {
        return;
    }
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        default_hook(info);
        tracing::error!("panic: exiting, info={}", info);
        std::process::exit(1);
    }));
}

async fn start_replicator(
    settings: &Arc<Settings>,
    replicator_settings: &ReplicatorSettings,
) -> Option<Arc<Replicator>> {
    if !replicator_settings.replication_enabled() {
        tracing::info!("replicator: disabled");
        return None;
    }

    let group = match replicator_settings.multicast_group().parse() {
        Ok(g) => g,
        Err(e) => {
            tracing::warn!(
                "replicator: invalid multicast group, running standalone, error={}",
                e
            );
            return None;
        }
    };

    let replicator = Arc::new(Replicator::new(
        settings.clone(),
        group,
        replicator_settings.multicast_port(),
    ));
    match replicator.start().await {
        Ok(()) => Some(replicator),
        Err(e) => {
            tracing::warn!("replicator: start failed, running standalone, error={}", e);
            None
        }
    }
}

fn start_admin_server(state: &server::ProxyState, metrics: &Metrics, admin_listen: &str) {
    let state = state.clone();
    let metrics = metrics.clone();
    let admin_addr = admin_listen.to_string();
    tokio::spawn(async move {
        if let Err(e) = server::run_admin_server(&admin_addr, state, metrics).await {
            tracing::error!("server: admin failed, error={}", e);
        }
    });
}

async fn wait_for_shutdown(shutdown: &Arc<Notify>) {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("server: received SIGINT, shutting down"),
        _ = terminate => tracing::info!("server: received SIGTERM, shutting down"),
    }

    shutdown.notify_waiters();
}
