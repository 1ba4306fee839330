use std::sync::Arc;

use axum::{debug_handler, extract::State, http::{HeaderMap, StatusCode}, Json};

use crate::{
    broadcast::{Relay, RelayEnvelope, relay::RELAY_TOKEN_HEADER},
    config::Config,
};

/// Ingress for envelopes published by peer instances.
#[debug_handler(state = crate::AppState)]
pub(crate) async fn relay_ingress(
    State(relay): State<Arc<dyn Relay>>,
    State(config): State<Arc<Config>>,
    headers: HeaderMap,

    Json(envelope): Json<RelayEnvelope>,
) -> StatusCode {
    let presented = headers.get(RELAY_TOKEN_HEADER).and_then(|value| value.to_str().ok());
    if config.relay_token.is_none() || presented != config.relay_token.as_deref() {
        tracing::warn!(origin = %envelope.origin, "relay envelope with bad token rejected");
        return StatusCode::UNAUTHORIZED;
    }

    tracing::debug!(origin = %envelope.origin, message_id = envelope.message.id, "relay envelope accepted");
    relay.accept(envelope);
    StatusCode::ACCEPTED
}
