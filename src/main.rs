use std::time::Duration as StdDuration;

use axum::extract::FromRef;
use time::Duration;

use kassa::app::{build_app, serve};
use kassa::payments::{spawn_sweeper, SettlementProcessor};
use kassa::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let env_filter = std::env::var("RUST_LOG")
        .unwrap_or_else(|_| "kassa=debug,axum=info,tower_http=info".to_string());
    let json_logs = std::env::var("LOG_FORMAT")
        .map(|v| v == "json")
        .unwrap_or(false);

    if json_logs {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    let (state, db) = AppState::init().await?;

    sqlx::migrate!("./migrations").run(&db).await?;

    let payment = &state.config.payment;
    let _sweeper = spawn_sweeper(
        SettlementProcessor::from_ref(&state),
        Duration::hours(payment.ttl_hours),
        StdDuration::from_secs(payment.sweep_interval_secs),
    );

    serve(build_app(state)).await
}
