pub mod auth;
pub mod config;
pub mod err;
pub mod models;
pub mod session;
pub mod store;
pub mod students;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::handler::Handler;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use serde::Serialize;

use crate::auth::{CredentialVault, PasswordHashing};
use crate::config::{Config, StoreBackend};
use crate::err::{Error, Success};
use crate::session::{HmacTokenMinter, TokenMinter};
use crate::store::{MemoryRecordStore, PgRecordStore, RecordStore};
use crate::students::TeacherResolver;

pub type Payload<T> = Result<(StatusCode, Json<Success<T>>), Error>;

pub fn proceeds<V>(value: V) -> Payload<V>
where
    V: Serialize,
{
    Ok((StatusCode::OK, Json(Success::of(value))))
}

pub fn created<V>(value: V) -> Payload<V>
where
    V: Serialize,
{
    Ok((StatusCode::CREATED, Json(Success::of(value))))
}

/// Shared handles given to every handler.
#[derive(Clone)]
pub struct AppState {
    pub vault: Arc<CredentialVault>,
    pub resolver: Arc<TeacherResolver>,
    pub request_timeout: Duration,
}

impl AppState {
    pub fn new(
        store: Arc<dyn RecordStore>,
        hashing: PasswordHashing,
        minter: Arc<dyn TokenMinter>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            vault: Arc::new(CredentialVault::new(store.clone(), hashing, minter)),
            resolver: Arc::new(TeacherResolver::new(store)),
            request_timeout,
        }
    }

    /// Runs `fut` under the request deadline. On expiry the future, and any
    /// store call it is waiting on, is dropped.
    pub async fn deadline<F: Future>(&self, fut: F) -> Result<F::Output, Error> {
        tokio::time::timeout(self.request_timeout, fut)
            .await
            .map_err(|_| Error::internal("Timeout", "request deadline exceeded"))
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ping", get(ping))
        .route("/signup", post(auth::register))
        .route("/login", post(auth::login))
        .route("/logout", post(auth::logout))
        .route("/student/teachers", get(students::list_teachers))
        .fallback(err::handler404.into_service())
        .layer(Extension(state))
}

#[derive(Serialize)]
struct Pong {
    message: &'static str,
}

async fn ping() -> Json<Pong> {
    Json(Pong { message: "pong" })
}

async fn open_store(backend: &StoreBackend) -> anyhow::Result<Arc<dyn RecordStore>> {
    let store: Arc<dyn RecordStore> = match backend {
        StoreBackend::Postgres { url } => Arc::new(
            PgRecordStore::connect(url)
                .await
                .context("Could not connect to the document database")?,
        ),
        StoreBackend::Memory => {
            log::warn!("DATABASE_URL is not set, records are kept in memory only");
            Arc::new(MemoryRecordStore::new())
        }
    };
    Ok(store)
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        log::error!("Could not listen for shutdown signal: {}", err);
        return;
    }
    log::info!("Shutting down");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let config = Config::from_env()?;
    let store = open_store(&config.store).await?;

    let state = AppState::new(
        store,
        PasswordHashing::new(config.hash_rounds),
        Arc::new(HmacTokenMinter::new(&config.session_secret)),
        config.request_timeout,
    );
    let app = router(state);

    log::info!("Starting TeacherTools HTTP Server on http://{}", config.addr);
    axum::Server::bind(&config.addr)
        .serve(app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}
