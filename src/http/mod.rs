//! HTTP surface: order generation and lookup, dispatch, administrative
//! overrides and artifact downloads.
pub mod handlers;
pub mod router;
pub mod types;

pub use router::create_router;
pub use types::{ApiError, AppState};

/// Bind and serve until the listener fails.
pub async fn serve(listener: tokio::net::TcpListener, state: AppState) -> anyhow::Result<()> {
    axum::serve(listener, create_router(state)).await?;
    Ok(())
}
