//! Axum-based RPC server.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;

use proxy_engine::{EngineMetrics, ProxyApi};

use crate::error::RpcError;
use crate::handlers::{self, AppState};

pub struct RpcServer {
    addr: SocketAddr,
    state: Arc<AppState>,
}

impl RpcServer {
    pub fn new(addr: SocketAddr, api: Arc<ProxyApi>) -> Self {
        Self {
            addr,
            state: Arc::new(AppState { api, metrics: None }),
        }
    }

    /// Serve `GET /metrics` from `metrics`.
    pub fn with_metrics(mut self, metrics: Arc<EngineMetrics>) -> Self {
        self.state = Arc::new(AppState {
            api: Arc::clone(&self.state.api),
            metrics: Some(metrics),
        });
        self
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/health", get(handlers::health))
            .route("/metrics", get(handlers::metrics))
            .route("/v1/post_task", post(handlers::post_task))
            .route("/v1/accept_task", post(handlers::accept_task))
            .route("/v1/decline_task", post(handlers::decline_task))
            .route("/v1/start_task", post(handlers::start_task))
            .route("/v1/submit_proof", post(handlers::submit_proof))
            .route("/v1/verify_callback", post(handlers::verify_callback))
            .route("/v1/cancel_task", post(handlers::cancel_task))
            .route("/v1/heartbeat", post(handlers::heartbeat))
            .route("/v1/issue_nonce", post(handlers::issue_nonce))
            .route("/v1/retire_node", post(handlers::retire_node))
            .route("/v1/recertify_node", post(handlers::recertify_node))
            .route("/v1/tasks/:task_id", get(handlers::get_task))
            .route("/v1/nodes/:node_id", get(handlers::get_node))
            .route("/v1/nodes/:node_id/tasks", get(handlers::list_node_tasks))
            .with_state(Arc::clone(&self.state))
    }

    /// Bind the configured address. Port 0 picks a free port; the bound
    /// address is returned alongside the listener.
    pub async fn bind(&self) -> Result<(TcpListener, SocketAddr), RpcError> {
        let listener = TcpListener::bind(self.addr).await?;
        let local = listener.local_addr()?;
        Ok((listener, local))
    }

    /// Serve on `listener` until `shutdown` resolves.
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> Result<(), RpcError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if let Ok(addr) = listener.local_addr() {
            tracing::info!(%addr, "rpc server listening");
        }
        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await?;
        tracing::info!("rpc server stopped");
        Ok(())
    }

    pub async fn serve_with_shutdown<F>(&self, shutdown: F) -> Result<(), RpcError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let (listener, _) = self.bind().await?;
        self.serve(listener, shutdown).await
    }
}
