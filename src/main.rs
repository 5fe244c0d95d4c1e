use std::net::{SocketAddr, TcpListener};

use axum::{routing, Router};
use rideshare::app::AppState;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "rideshare=debug,tower_http=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let app_state = AppState::new_from_env().await.unwrap();

    app_state.run_migration().await.unwrap();

    let collections = app_state.database.list_collection_names(None).await.unwrap();
    tracing::info!(
        "connected to database {}, collections: {:?}",
        app_state.database.name(),
        collections
    );

    let auth = Router::new()
        .route(
            "/register",
            routing::post(rideshare::api::v1::auth::register),
        )
        .route("/login", routing::post(rideshare::api::v1::auth::login));

    let v1 = Router::new()
        .route("/rides", routing::post(rideshare::api::v1::ride::create))
        .route(
            "/rides/:id/complete",
            routing::post(rideshare::api::v1::ride::complete),
        )
        .route(
            "/driver/rides/requests",
            routing::get(rideshare::api::v1::ride::index_requests),
        )
        .route(
            "/driver/rides/:id/accept",
            routing::post(rideshare::api::v1::ride::accept),
        )
        .route("/user/rides", routing::get(rideshare::api::v1::ride::index));

    let app = Router::new()
        .nest("/api/auth", auth)
        .nest("/api/v1", v1)
        .with_state(app_state)
        .layer(tower_http::trace::TraceLayer::new_for_http());

    let port = std::env::var("PORT")
        .ok()
        .and_then(|it| it.parse().ok())
        .unwrap_or(8080);

    let listener = bind_with_fallback(port).unwrap();
    listener.set_nonblocking(true).unwrap();

    tracing::info!("listening on {}", listener.local_addr().unwrap());

    axum::Server::from_tcp(listener)
        .unwrap()
        .serve(app.into_make_service())
        .await
        .unwrap();
}

// Tries the configured port, then the next 20, then lets the OS pick one.
fn bind_with_fallback(port: u16) -> std::io::Result<TcpListener> {
    if port == 0 {
        return TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], 0)));
    }

    match TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], port))) {
        Ok(listener) => Ok(listener),
        Err(_) => {
            for candidate in port.saturating_add(1)..=port.saturating_add(20) {
                if let Ok(listener) = TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], candidate)))
                {
                    tracing::warn!("port {} is busy, falling back to port {}", port, candidate);
                    return Ok(listener);
                }
            }

            tracing::warn!(
                "port {} is busy and no nearby port is free, letting the OS pick one",
                port
            );
            TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], 0)))
        }
    }
}
