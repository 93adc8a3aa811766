//! Reference plugin server used to exercise the lifecycle manager.
//!
//! The server binds the loopback address given by `HOST` and `PORT`, answers
//! `GET /health` with `200 OK`, and echoes every JSON body posted to
//! `/call`. A body of the form `{"exit": <code>}` makes the process exit with
//! that code before replying, which lets tests simulate a crash mid-call.
//! `GET /capabilities` lists the single `echo` tool.


use std::future::Future;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::num::ParseIntError;

use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{Value, json};
use thiserror::Error;
use tokio::net::TcpListener;

/// Environment variable carrying the port to bind.
pub const PORT_ENV: &str = "PORT";

/// Environment variable carrying the host to bind.
pub const HOST_ENV: &str = "HOST";

/// Errors raised while starting or running the echo server.
#[derive(Debug, Error)]
pub enum EchoError {
    /// `PORT` is not set.
    #[error("{PORT_ENV} is not set")]
    MissingPort,

    /// `PORT` is not a valid port number.
    #[error("{PORT_ENV} value '{value}' is not a port: {source}")]
    InvalidPort {
        /// Raw value.
        value: String,
        /// Parse failure.
        #[source]
        source: ParseIntError,
    },

    /// `HOST` is not an IP address.
    #[error("{HOST_ENV} value '{value}' is not an IP address")]
    InvalidHost {
        /// Raw value.
        value: String,
    },

    /// The listening socket could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Address that was requested.
        addr: SocketAddr,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// The server stopped with an I/O error.
    #[error("server failed: {0}")]
    Serve(#[source] io::Error),
}

/// Reads the bind address from the environment through `lookup`.
///
/// `HOST` defaults to `127.0.0.1`.
///
/// # Errors
///
/// Returns an [`EchoError`] when `PORT` is missing or either value is
/// malformed.
pub fn bind_address<F>(lookup: F) -> Result<SocketAddr, EchoError>
where
    F: Fn(&str) -> Option<String>,
{
    let raw_port = lookup(PORT_ENV).ok_or(EchoError::MissingPort)?;
    let port = raw_port
        .trim()
        .parse::<u16>()
        .map_err(|source| EchoError::InvalidPort {
            value: raw_port.clone(),
            source,
        })?;
    let host = lookup(HOST_ENV).map_or(Ok(IpAddr::V4(Ipv4Addr::LOCALHOST)), |value| {
        let parsed = value.trim().parse::<IpAddr>();
        parsed.map_err(|_| EchoError::InvalidHost { value })
    })?;
    Ok(SocketAddr::new(host, port))
}

/// Routes served by the plugin.
#[must_use]
pub fn router() -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/call", post(echo))
        .route("/capabilities", get(capabilities))
}

async fn capabilities() -> Json<Value> {
    Json(json!({
        "tools": [{
            "name": "echo",
            "description": "Returns the posted JSON body unchanged",
            "input_schema": {"type": "object"}
        }],
        "resources": [],
        "prompts": []
    }))
}

async fn health() -> StatusCode {
    StatusCode::OK
}

async fn echo(Json(payload): Json<Value>) -> Json<Value> {
    if let Some(code) = exit_code(&payload) {
        std::process::exit(code);
    }
    Json(payload)
}

fn exit_code(payload: &Value) -> Option<i32> {
    let code = payload.as_object()?.get("exit")?.as_i64()?;
    i32::try_from(code).ok()
}

/// Binds `addr`.
///
/// # Errors
///
/// Returns [`EchoError::Bind`] when the address is unavailable.
pub async fn bind(addr: SocketAddr) -> Result<TcpListener, EchoError> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| EchoError::Bind { addr, source })
}

/// Serves [`router`] on `listener` until `shutdown` resolves.
///
/// # Errors
///
/// Returns [`EchoError::Serve`] when the server fails.
pub async fn serve<S>(listener: TcpListener, shutdown: S) -> Result<(), EchoError>
where
    S: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, router())
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(EchoError::Serve)
}
