//! Process bootstrap and the HTTP-upgrade websocket server (§4.7/C8):
//! config → logging → persistence → domain registry → periodic sync task →
//! listener, one route per the original's single upgrade endpoint.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path as AxumPath, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures::StreamExt;
use log::{info, warn};

use crate::config::Config;
use crate::domain::registry::DomainRegistry;
use crate::location::{HttpLocationAdapter, LocationAdapter, NullLocationAdapter};
use crate::net::transport::Websocket;
use crate::persistence::{MySqlPersistence, PersistenceAdapter};
use crate::session::{cleanup_session, handle_frame, handle_ping, SessionState, SharedContext};

pub async fn run(config: Config) -> anyhow::Result<()> {
    let persistence: Arc<dyn PersistenceAdapter> = Arc::new(MySqlPersistence::connect(&config.database_url)?);
    persistence.auto_migrate().await?;
    persistence.reset_all_online_false().await?;

    // The ipinfo API key is a per-deployment `Config{Key:"ipinfo"}` row, not
    // an environment variable (§4.6); it's re-read from persistence on every
    // lookup rather than cached here, so an admin can add or change it at
    // runtime without a restart.
    let location: Arc<dyn LocationAdapter> = match &config.location_fallback_path {
        Some(path) => {
            Arc::new(HttpLocationAdapter::new(persistence.clone()).load_fallback(Path::new(path)))
        }
        None => Arc::new(NullLocationAdapter),
    };

    let registry = Arc::new(DomainRegistry::new(persistence.clone()));
    let ctx = Arc::new(SharedContext { registry: registry.clone(), persistence, location });

    spawn_sync_task(registry, config.sync_interval);

    let app = Router::new().route("/:domain", get(upgrade_handler)).with_state(ctx);
    let addr: SocketAddr = config.listen_addr.parse()?;
    info!("listening on {addr}");
    axum::Server::bind(&addr).serve(app.into_make_service()).await?;
    Ok(())
}

fn spawn_sync_task(registry: Arc<DomainRegistry>, interval: std::time::Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            registry.sync().await;
        }
    });
}

async fn upgrade_handler(
    AxumPath(domain_name): AxumPath<String>,
    State(ctx): State<Arc<SharedContext>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, domain_name, ctx))
}

async fn handle_socket(socket: WebSocket, domain_name: String, ctx: Arc<SharedContext>) {
    let domain = match ctx.registry.get_domain(&domain_name).await {
        Ok(Some(domain)) => domain,
        Ok(None) => {
            warn!("rejecting connection for unknown domain {domain_name}");
            return;
        }
        Err(e) => {
            warn!("domain lookup failed for {domain_name}: {e}");
            return;
        }
    };

    let (sink, mut stream) = socket.split();
    let transport = Arc::new(Websocket::new(sink));
    let mut state = SessionState::new(domain, transport);

    while let Some(Ok(message)) = stream.next().await {
        match message {
            Message::Binary(buf) => {
                if let Err(e) = handle_frame(&mut state, &ctx, &buf).await {
                    warn!("session error on domain {domain_name}: {e}");
                    if e.is_fatal() {
                        break;
                    }
                }
            }
            Message::Ping(payload) => {
                if let Err(e) = handle_ping(&mut state, &payload).await {
                    warn!("ping handling failed on domain {domain_name}: {e}");
                    break;
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }
    cleanup_session(&state, &ctx).await;
}
