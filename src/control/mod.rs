//! The HTTP control plane: a thin axum adapter mapping routes 1:1 onto core
//! operations, behind a constant-time bearer-token check.

use axum::extract::{Path, Request, State};
use axum::http::{header::AUTHORIZATION, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use hyper_util::rt::TokioIo;
use hyper_util::service::TowerToHyperService;
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::client::Core;
use crate::error::{Error, Result};

/// Builds the control router for the given core.
pub fn router(core: Core) -> Router {
    let api = Router::new()
        .route("/state", get(get_state))
        .route("/server", get(get_server))
        .route("/users", get(get_users))
        .route("/users/{nick}", get(get_user))
        .route("/stats", get(get_stats))
        .route("/errors", get(get_errors))
        .route("/channels/{name}", get(get_channel))
        .route("/full-state", get(get_full_state))
        .route("/list", get(get_list))
        .route("/whois/{nick}", get(get_whois))
        .route("/join", post(post_join))
        .route("/part", post(post_part))
        .route("/send", post(post_send))
        .route("/notice", post(post_notice))
        .route("/raw", post(post_raw))
        .route("/nick", post(post_nick))
        .layer(middleware::from_fn_with_state(core.clone(), require_bearer));

    Router::new()
        .route("/health", get(get_health))
        .nest("/api", api)
        .with_state(core)
}

/// Serves the control plane until the core's stop signal fires. TLS is used
/// when configured; missing key material was already rejected at startup.
pub async fn serve(core: Core) -> Result<()> {
    let control = core.config().control.clone();
    let stop = core.stop_signal();
    let app = router(core);
    let listener = TcpListener::bind(&control.addr).await?;
    log::info!(
        "control surface listening on {} (tls: {})",
        control.addr,
        control.use_tls
    );

    if control.use_tls {
        let cert = std::fs::read(control.cert_path.as_deref().unwrap_or_default())?;
        let key = std::fs::read(control.key_path.as_deref().unwrap_or_default())?;
        let identity = native_tls::Identity::from_pkcs8(&cert, &key)?;
        let acceptor =
            tokio_native_tls::TlsAcceptor::from(native_tls::TlsAcceptor::new(identity)?);
        serve_tls(listener, app, acceptor, stop).await
    } else {
        let mut stop = stop;
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = stop.changed().await;
            })
            .await?;
        Ok(())
    }
}

async fn serve_tls(
    listener: TcpListener,
    app: Router,
    acceptor: tokio_native_tls::TlsAcceptor,
    mut stop: watch::Receiver<bool>,
) -> Result<()> {
    loop {
        tokio::select! {
            _ = stop.changed() => break,
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        log::warn!("control accept failed: {}", err);
                        continue;
                    }
                };
                let acceptor = acceptor.clone();
                let app = app.clone();
                tokio::spawn(async move {
                    let tls = match acceptor.accept(stream).await {
                        Ok(tls) => tls,
                        Err(err) => {
                            log::debug!("TLS handshake with {} failed: {}", peer, err);
                            return;
                        }
                    };
                    let service = TowerToHyperService::new(app);
                    if let Err(err) = hyper::server::conn::http1::Builder::new()
                        .serve_connection(TokioIo::new(tls), service)
                        .await
                    {
                        log::debug!("control connection to {} ended: {}", peer, err);
                    }
                });
            }
        }
    }
    Ok(())
}

/// Timing-independent byte comparison for the bearer token.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    let mut diff = a.len() ^ b.len();
    for i in 0..a.len().max(b.len()) {
        let x = a.get(i).copied().unwrap_or(0);
        let y = b.get(i).copied().unwrap_or(0);
        diff |= usize::from(x ^ y);
    }
    diff == 0
}

async fn require_bearer(State(core): State<Core>, request: Request, next: Next) -> Response {
    // No configured token means the control plane is locked shut, not open.
    let Some(expected) = core.config().control.token.clone() else {
        return unauthorized("control token is not configured");
    };
    let supplied = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .unwrap_or("");
    if !constant_time_eq(supplied.as_bytes(), expected.as_bytes()) {
        return unauthorized("invalid bearer token");
    }
    next.run(request).await
}

fn unauthorized(message: &str) -> Response {
    (StatusCode::UNAUTHORIZED, Json(json!({ "error": message }))).into_response()
}

/// Maps core errors onto HTTP statuses.
struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> ApiError {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::BadInput(_) => StatusCode::BAD_REQUEST,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::NotConnected => StatusCode::SERVICE_UNAVAILABLE,
            Error::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

type ApiResult = std::result::Result<Response, ApiError>;

async fn get_health(State(core): State<Core>) -> Response {
    Json(json!({
        "status": "ok",
        "connected": core.is_connected(),
        "nick": core.state_summary().nick,
    }))
    .into_response()
}

async fn get_state(State(core): State<Core>) -> Response {
    Json(core.state_summary()).into_response()
}

async fn get_server(State(core): State<Core>) -> Response {
    Json(core.server_info()).into_response()
}

async fn get_users(State(core): State<Core>) -> Response {
    Json(core.users()).into_response()
}

async fn get_user(State(core): State<Core>, Path(nick): Path<String>) -> ApiResult {
    Ok(Json(core.user(&nick)?).into_response())
}

async fn get_stats(State(core): State<Core>) -> Response {
    Json(core.stats()).into_response()
}

async fn get_errors(State(core): State<Core>) -> Response {
    Json(core.errors()).into_response()
}

async fn get_channel(State(core): State<Core>, Path(name): Path<String>) -> ApiResult {
    Ok(Json(core.channel(&name)?).into_response())
}

async fn get_full_state(State(core): State<Core>) -> Response {
    Json(core.full_state()).into_response()
}

async fn get_list(State(core): State<Core>) -> ApiResult {
    let outcome = core.list().await?;
    let body = json!({
        "channels": outcome.channels,
        "count": outcome.channels.len(),
    });
    if outcome.timed_out {
        let mut body = body;
        body["error"] = json!("request timed out");
        return Ok((StatusCode::GATEWAY_TIMEOUT, Json(body)).into_response());
    }
    Ok(Json(body).into_response())
}

async fn get_whois(State(core): State<Core>, Path(nick): Path<String>) -> ApiResult {
    let outcome = core.whois(&nick).await?;
    if outcome.timed_out {
        let mut body = serde_json::Value::Object(outcome.data);
        body["error"] = json!("request timed out");
        return Ok((StatusCode::GATEWAY_TIMEOUT, Json(body)).into_response());
    }
    Ok(Json(outcome.data).into_response())
}

#[derive(Deserialize)]
struct JoinBody {
    channel: String,
}

async fn post_join(State(core): State<Core>, Json(body): Json<JoinBody>) -> ApiResult {
    core.join(&body.channel).await?;
    Ok(ok_response())
}

#[derive(Deserialize)]
struct PartBody {
    channel: String,
    #[serde(default)]
    reason: Option<String>,
}

async fn post_part(State(core): State<Core>, Json(body): Json<PartBody>) -> ApiResult {
    core.part(&body.channel, body.reason.as_deref()).await?;
    Ok(ok_response())
}

#[derive(Deserialize)]
struct SendBody {
    target: String,
    message: String,
}

async fn post_send(State(core): State<Core>, Json(body): Json<SendBody>) -> ApiResult {
    core.send_privmsg(&body.target, &body.message).await?;
    Ok(ok_response())
}

async fn post_notice(State(core): State<Core>, Json(body): Json<SendBody>) -> ApiResult {
    core.send_notice(&body.target, &body.message).await?;
    Ok(ok_response())
}

#[derive(Deserialize)]
struct RawBody {
    line: String,
}

async fn post_raw(State(core): State<Core>, Json(body): Json<RawBody>) -> ApiResult {
    core.send_raw(&body.line).await?;
    Ok(ok_response())
}

#[derive(Deserialize)]
struct NickBody {
    nick: String,
}

async fn post_nick(State(core): State<Core>, Json(body): Json<NickBody>) -> ApiResult {
    core.set_nick(&body.nick).await?;
    Ok(ok_response())
}

fn ok_response() -> Response {
    Json(json!({ "status": "ok" })).into_response()
}

#[cfg(test)]
mod test {
    use super::constant_time_eq;

    #[test]
    fn constant_time_eq_semantics() {
        assert!(constant_time_eq(b"secret", b"secret"));
        assert!(!constant_time_eq(b"secret", b"secre7"));
        assert!(!constant_time_eq(b"secret", b"secret2"));
        assert!(!constant_time_eq(b"", b"x"));
        assert!(constant_time_eq(b"", b""));
    }
}
