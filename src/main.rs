use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::{watch, Semaphore};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use vanbook::config::Config;
use vanbook::engine::{BookingPolicy, Engine};
use vanbook::mailer::{self, LogTransport, Mailer};
use vanbook::notify::NotifyHub;
use vanbook::webhook::{self, SignatureVerifier, WebhookState};
use vanbook::wire::{self, VanbookFactory};
use vanbook::{compactor, observability, tls};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env()?;
    observability::init(config.metrics_port)?;
    let tls_acceptor = tls::load_tls_acceptor(&config)?;

    // Ensure data directory exists
    std::fs::create_dir_all(&config.data_dir)?;

    let hub = Arc::new(NotifyHub::new());
    let mailer = Mailer::new(config.staff_email.clone(), Arc::new(LogTransport));
    tokio::spawn(mailer::run_mailer(hub.subscribe(), mailer));

    let policy = BookingPolicy {
        min_lead_days: config.min_lead_days,
    };
    let engine = Arc::new(Engine::new(config.wal_path(), hub)?.with_policy(policy));
    tokio::spawn(compactor::run_compactor(
        engine.clone(),
        config.compact_threshold,
        Duration::from_secs(30),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let verifier = SignatureVerifier::new(&config.webhook_secret, config.webhook_tolerance_secs);
    if !verifier.is_configured() {
        warn!("VANBOOK_WEBHOOK_SECRET is empty; every payment event will be rejected");
    }
    let webhook_state = Arc::new(WebhookState {
        engine: engine.clone(),
        verifier,
    });
    let webhook_addr = format!("{}:{}", config.bind, config.webhook_port);
    let webhook_listener = TcpListener::bind(&webhook_addr).await?;
    let mut webhook_shutdown = shutdown_rx.clone();
    let webhook_server = tokio::spawn(async move {
        let serve = axum::serve(webhook_listener, webhook::router(webhook_state))
            .with_graceful_shutdown(async move {
                let _ = webhook_shutdown.changed().await;
            });
        if let Err(e) = serve.await {
            tracing::error!("webhook server error: {e}");
        }
    });

    let factory = Arc::new(VanbookFactory::new(engine.clone(), config.credentials.clone()));
    let semaphore = Arc::new(Semaphore::new(config.max_connections));

    let addr = format!("{}:{}", config.bind, config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("vanbook listening on {addr}");
    info!("  webhook: http://{webhook_addr}/webhooks/payment");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  max_connections: {}", config.max_connections);
    info!("  min_lead_days: {}", config.min_lead_days);
    info!("  tls: {}", if tls_acceptor.is_some() { "enabled" } else { "disabled" });
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    // Graceful shutdown: stop accepting on SIGTERM/ctrl-c, drain in-flight connections
    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            tokio::select! {
                _ = ctrl_c => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
        }
    };
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (socket, peer) = match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::error!("accept error: {e}");
                        continue;
                    }
                };

                let permit = match semaphore.clone().try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => {
                        warn!("connection limit reached, rejecting {peer}");
                        metrics::counter!(observability::CONNECTIONS_REJECTED_TOTAL).increment(1);
                        drop(socket);
                        continue;
                    }
                };

                info!("connection from {peer}");
                metrics::counter!(observability::CONNECTIONS_TOTAL).increment(1);
                metrics::gauge!(observability::CONNECTIONS_ACTIVE).increment(1.0);
                let factory = factory.clone();
                let tls = tls_acceptor.clone();

                tokio::spawn(async move {
                    let _permit = permit; // held until connection closes
                    if let Err(e) = wire::process_connection(socket, factory, tls).await {
                        tracing::error!("connection error from {peer}: {e}");
                    }
                    metrics::gauge!(observability::CONNECTIONS_ACTIVE).decrement(1.0);
                });
            }
            _ = &mut shutdown => {
                info!("shutdown signal received, stopping accept loop");
                break;
            }
        }
    }

    let _ = shutdown_tx.send(true);

    // Wait for in-flight connections to finish (up to 10s)
    info!("draining connections...");
    let drain_deadline = tokio::time::sleep(Duration::from_secs(10));
    tokio::pin!(drain_deadline);

    loop {
        if semaphore.available_permits() == config.max_connections {
            info!("all connections drained");
            break;
        }
        tokio::select! {
            _ = &mut drain_deadline => {
                let remaining = config.max_connections - semaphore.available_permits();
                warn!("drain timeout, {remaining} connections still open");
                break;
            }
            _ = tokio::time::sleep(Duration::from_millis(100)) => {}
        }
    }
    if tokio::time::timeout(Duration::from_secs(2), webhook_server).await.is_err() {
        warn!("webhook server did not stop in time");
    }

    info!("vanbook stopped");
    Ok(())
}
