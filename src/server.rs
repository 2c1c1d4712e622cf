//! HTTP server bootstrap: binds a listener and serves the chat router with
//! graceful shutdown tied to the coordinator's background-loop lifecycle.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;

use crate::coordinator::Coordinator;
use crate::rest_api::create_app;

/// Starts listening on `port`, returning the bound listener and chat router.
///
/// # Errors
///
/// Returns an error if the server cannot bind to the specified port.
pub async fn start_server(coordinator: Arc<Coordinator>, port: u16) -> Result<(TcpListener, SocketAddr, Router), Box<dyn std::error::Error>> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    let actual_addr = listener.local_addr()?;
    let router = create_app(coordinator);
    Ok((listener, actual_addr, router))
}

/// Start server on any available port (for testing)
///
/// # Errors
///
/// Returns an error if the server cannot bind to any available port.
#[allow(dead_code)]
pub async fn start_server_on_available_port()
-> Result<(TcpListener, SocketAddr), Box<dyn std::error::Error>> {
    let addr = SocketAddr::from(([127, 0, 0, 1], 0)); // Port 0 = OS chooses available port
    let listener = TcpListener::bind(addr).await?;
    let actual_addr = listener.local_addr()?;

    Ok((listener, actual_addr))
}

/// Serve the application on the given listener
///
/// # Errors
///
/// Returns an error if the server cannot be started or fails during operation.
pub async fn serve(listener: TcpListener, router: Router) -> Result<(), std::io::Error> {
    axum::serve(listener, router)
        .await
        .map_err(std::io::Error::other)?;
    Ok(())
}

/// Serve the application with graceful shutdown handling
///
/// # Errors
///
/// Returns an error if the server cannot be started or fails during operation.
#[allow(dead_code)]
pub async fn serve_with_graceful_shutdown(
    listener: TcpListener,
    router: Router,
    shutdown_token: tokio_util::sync::CancellationToken,
) -> Result<(), std::io::Error> {
    // Create shutdown signal handler using cancellation token
    let shutdown_signal = async move {
        shutdown_token.cancelled().await;
    };

    // Start server with graceful shutdown
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal)
        .await
        .map_err(std::io::Error::other)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoordinatorConfig;
    use tokio::time::{Duration, timeout};

    async fn test_coordinator() -> (tempfile::TempDir, Arc<Coordinator>) {
        let temp_dir = tempfile::tempdir().expect("tempdir");
        let mut config = CoordinatorConfig::development();
        config.storage_path = temp_dir.path().join("test.db");
        let coordinator = Arc::new(Coordinator::build(config).await.expect("coordinator builds"));
        (temp_dir, coordinator)
    }

    #[tokio::test]
    async fn start_server_binds_to_an_available_port() {
        let (_temp_dir, coordinator) = test_coordinator().await;
        let (listener, addr, _router) = start_server(coordinator, 0).await.unwrap();
        assert_ne!(addr.port(), 0, "should get an actual port number");
        drop(listener);
    }

    #[tokio::test]
    async fn health_endpoint_responds_over_http() {
        let (_temp_dir, coordinator) = test_coordinator().await;
        let (listener, addr, router) = start_server(coordinator, 0).await.unwrap();
        let server_handle = tokio::spawn(async move { serve(listener, router).await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let client = reqwest::Client::new();
        let response = timeout(Duration::from_secs(1), client.get(format!("http://{addr}/api/v1/health")).send()).await;
        assert!(response.is_ok());
        assert!(response.unwrap().unwrap().status().is_success());

        server_handle.abort();
    }
}
