use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use prep_events::demo::{build_router, AppState};
use prep_events::ConnectionControl;
use std::env;
use tower::Service;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_owned());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .init();

    let bind_addr = env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:9001".to_owned());

    let state = AppState::new();
    let router = build_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .expect("failed to bind");
    info!(addr = %bind_addr, "prep demo server listening");

    // `axum::serve` hides the accepted `TcpStream` behind its own listener
    // abstraction before a handler ever sees it; `send` needs a handle onto
    // the raw socket to extend its keepalive once a stream's duration is
    // negotiated, so connections are accepted and served by hand here,
    // stashing a `ConnectionControl` in the request extensions per
    // connection instead.
    let mut shutdown = std::pin::pin!(shutdown_signal());
    loop {
        let (stream, peer_addr) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(err) => {
                    warn!(error = %err, "prep demo: accept failed");
                    continue;
                }
            },
            () = &mut shutdown => break,
        };

        let connection = match ConnectionControl::capture(&stream) {
            Ok(connection) => Some(connection),
            Err(err) => {
                warn!(error = %err, %peer_addr, "prep demo: failed to capture socket handle");
                None
            }
        };

        let mut router = router.clone();
        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let service = hyper::service::service_fn(move |request: hyper::Request<hyper::body::Incoming>| {
                let mut request = request.map(axum::body::Body::new);
                if let Some(connection) = connection.clone() {
                    request.extensions_mut().insert(connection);
                }
                router.call(request)
            });
            if let Err(err) = ConnBuilder::new(TokioExecutor::new())
                .serve_connection_with_upgrades(io, service)
                .await
            {
                warn!(error = %err, %peer_addr, "prep demo: connection error");
            }
        });
    }

    info!("server shut down gracefully");
}

async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("received Ctrl+C, shutting down"); },
        _ = terminate => { info!("received SIGTERM, shutting down"); },
    }
}
