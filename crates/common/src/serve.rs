//! Shared HTTP(S) serve loop with cooperative shutdown.
//!
//! Plain listeners go through `axum::serve`; TLS listeners use a manual
//! tokio-rustls accept loop feeding hyper's auto (HTTP/1 + HTTP/2) builder.
//! Both expose the peer address to handlers via `ConnectInfo<SocketAddr>`.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{extract::ConnectInfo, Extension, Router};
use hyper_util::{
    rt::{TokioExecutor, TokioIo},
    server::conn::auto,
    service::TowerToHyperService,
};
use rustls::ServerConfig;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, info, warn};

/// Serve `router` on `listener` until `shutdown` is cancelled.
///
/// In-flight requests are allowed to finish; the returned future resolves once
/// the listener is closed and every open connection has drained.
///
/// # Errors
///
/// Returns an error if the plain-HTTP server fails.
pub async fn serve(
    listener: TcpListener,
    router: Router,
    tls: Option<Arc<ServerConfig>>,
    shutdown: CancellationToken,
) -> Result<()> {
    let addr = listener.local_addr().context("listener has no local address")?;
    match tls {
        None => {
            info!(addr = %addr, "listening (http)");
            axum::serve(
                listener,
                router.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await
            .context("http server failed")
        }
        Some(config) => {
            info!(addr = %addr, "listening (https)");
            serve_tls(listener, router, config, shutdown).await;
            Ok(())
        }
    }
}

async fn serve_tls(
    listener: TcpListener,
    router: Router,
    config: Arc<ServerConfig>,
    shutdown: CancellationToken,
) {
    let acceptor = TlsAcceptor::from(config);
    let connections = TaskTracker::new();
    loop {
        let (tcp, peer) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(error = %e, "accept error");
                    continue;
                }
            },
        };

        let acceptor = acceptor.clone();
        let app = router.clone().layer(Extension(ConnectInfo(peer)));
        let shutdown = shutdown.clone();
        connections.spawn(async move {
            let stream = match acceptor.accept(tcp).await {
                Ok(s) => s,
                Err(e) => {
                    debug!(%peer, error = %e, "TLS handshake failed");
                    return;
                }
            };

            let builder = auto::Builder::new(TokioExecutor::new());
            let conn = builder.serve_connection(TokioIo::new(stream), TowerToHyperService::new(app));
            tokio::pin!(conn);

            let result = tokio::select! {
                res = conn.as_mut() => res,
                _ = shutdown.cancelled() => {
                    conn.as_mut().graceful_shutdown();
                    conn.await
                }
            };
            if let Err(e) = result {
                debug!(%peer, error = %e, "connection closed with error");
            }
        });
    }

    connections.close();
    connections.wait().await;
    debug!("all TLS connections drained");
}
