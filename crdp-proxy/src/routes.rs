//! HTTP route handlers.

use axum::{
    Router,
    extract::{Path, State, ws::WebSocketUpgrade, ws::rejection::WebSocketUpgradeRejection},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::get,
};
use crdp_mux::{ChannelSnapshot, ErrorKind, MAX_CHANNELS, Multiplexor, MuxError};

use crate::session::Session;

async fn list_channels(State(mux): State<Multiplexor>) -> Json<Vec<ChannelSnapshot>> {
    Json(mux.snapshot())
}

/// Allocate a channel and hand the upgraded socket to a session.
///
/// Capacity is checked before the upgrade so a full proxy answers with a plain 503.
/// The session's listeners are registered before the upgrade completes, so the channel
/// is armed even if the handshake fails afterwards.
async fn open_channel(
    State(mux): State<Multiplexor>,
    Path(name): Path<String>,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    if mux.channel_count() >= MAX_CHANNELS {
        return error_response(&MuxError::TooManyChannels);
    }
    let upgrade = match upgrade {
        Ok(upgrade) => upgrade,
        Err(rejection) => return rejection.into_response(),
    };

    match mux.add_channel(name).and_then(Session::attach) {
        Ok(session) => upgrade.on_upgrade(move |socket| session.run(socket)),
        Err(e) => error_response(&e),
    }
}

fn error_response(err: &MuxError) -> Response {
    let status = match err.kind() {
        ErrorKind::Capacity => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::Closed | ErrorKind::Transport => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    tracing::warn!(error = %err, status = status.as_u16(), "Channel request rejected");
    (
        status,
        Json(serde_json::json!({
            "error": err.to_string()
        })),
    )
        .into_response()
}

pub fn routes(mux: Multiplexor) -> Router {
    Router::new()
        .route("/json/channels", get(list_channels))
        .route("/channel/{name}", get(open_channel))
        .with_state(mux)
}
