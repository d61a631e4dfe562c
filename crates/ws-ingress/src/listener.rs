use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, State};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use http::HeaderMap;
use tokio::net::TcpListener;

use crate::auth::AuthGate;
use crate::session::{self, ConnectionContext, SessionConfig};

/// WebSocket subprotocols offered back to MQTT clients.
const MQTT_SUBPROTOCOLS: [&str; 2] = ["mqtt", "mqttv3.1"];

/// Configuration for the WebSocket ingress.
pub struct IngressConfig {
    /// Address to bind the listening socket to.
    pub listen_addr: SocketAddr,
    /// Check applied to every upgrade request.
    pub auth: AuthGate,
    /// Shared by every session the ingress spawns.
    pub session: Arc<SessionConfig>,
}

/// The MQTT-over-WebSocket server.
///
/// Every upgrade request on `/` or `/mqtt` passes the [`AuthGate`] before the
/// `101 Switching Protocols` response is sent; admitted connections each run
/// their own session task. `/healthz` answers plain HTTP without auth.
pub struct Ingress {
    config: Arc<IngressConfig>,
}

impl Ingress {
    pub fn new(config: IngressConfig) -> Self {
        if !config.auth.is_enabled() {
            tracing::warn!("no OAuth authority configured; every connection will be accepted");
        }
        Self {
            config: Arc::new(config),
        }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/", get(upgrade))
            .route("/mqtt", get(upgrade))
            .route("/healthz", get(healthz))
            .with_state(Arc::clone(&self.config))
    }

    /// Bind `listen_addr` and serve until `shutdown` resolves.
    pub async fn run<F>(&self, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.config.listen_addr)
            .await
            .with_context(|| format!("failed to bind {}", self.config.listen_addr))?;
        self.serve(listener, shutdown).await
    }

    /// Serve on an already bound listener until `shutdown` resolves.
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = listener.local_addr()?;
        tracing::info!(
            %addr,
            auth = self.config.auth.is_enabled(),
            "mqtt ingress listening"
        );

        axum::serve(
            listener,
            self.router()
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown)
        .await
        .context("ingress server failed")?;

        tracing::info!("mqtt ingress stopped");
        Ok(())
    }
}

async fn upgrade(
    ws: WebSocketUpgrade,
    State(config): State<Arc<IngressConfig>>,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    let ctx = Arc::new(ConnectionContext {
        connection_id: uuid::Uuid::new_v4(),
        remote_addr,
    });

    if let Err(rejection) = config.auth.check(&headers).await {
        tracing::warn!(
            connection_id = %ctx.connection_id,
            %remote_addr,
            status = rejection.status().as_u16(),
            %rejection,
            "upgrade rejected"
        );
        return (rejection.status(), rejection.client_message()).into_response();
    }

    tracing::info!(
        connection_id = %ctx.connection_id,
        %remote_addr,
        "client connected"
    );

    let session_config = Arc::clone(&config.session);
    let failed_ctx = Arc::clone(&ctx);
    ws.protocols(MQTT_SUBPROTOCOLS)
        .on_failed_upgrade(move |err| {
            tracing::warn!(
                connection_id = %failed_ctx.connection_id,
                %err,
                "websocket upgrade failed"
            );
        })
        .on_upgrade(move |socket| session::run(socket, ctx, session_config))
}

async fn healthz() -> &'static str {
    "ok"
}
