use crate::gateway::ChatGateway;
use crate::models::websocket::ServerEvent;

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{ State, RawQuery },
    extract::ws::{ Message, WebSocket, WebSocketUpgrade, rejection::WebSocketUpgradeRejection },
    http::StatusCode,
    response::{ IntoResponse, Response },
};
use tokio::sync::mpsc;

use hmac::{ Hmac, Mac };
use sha2::Sha256;
use chrono::Utc;
use url::form_urlencoded;

use log::{ info, warn, error, debug };
use futures::{ SinkExt, StreamExt };

use super::api::AppState;

type HmacSha256 = Hmac<Sha256>;

const SIGNATURE_WINDOW_SECS: i64 = 300;

fn reject(status: StatusCode, reason: &'static str) -> Response {
    (status, Body::from(reason)).into_response()
}

/// Checks the `ts`/`sig` pair: `sig` is hex(HMAC-SHA256(secret, ts)) and `ts`
/// must be within five minutes of now.
pub fn verify_signature(secret: &str, query: &str) -> Result<(), &'static str> {
    let params: HashMap<String, String> = form_urlencoded
        ::parse(query.as_bytes())
        .into_owned()
        .collect();

    let ts = params
        .get("ts")
        .or_else(|| params.get("X-Api-Ts"))
        .map(|s| s.as_str());
    let sig = params
        .get("sig")
        .or_else(|| params.get("X-Api-Sign"))
        .map(|s| s.as_str());

    let (ts, sig) = match (ts, sig) {
        (Some(ts), Some(sig)) => (ts, sig),
        _ => {
            return Err("missing ts/sig");
        }
    };

    let now = Utc::now().timestamp();
    let ts_i: i64 = ts.parse().unwrap_or(0);
    if (now - ts_i).abs() > SIGNATURE_WINDOW_SECS {
        return Err("timestamp out of range");
    }

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| "bad signature")?;
    mac.update(ts.as_bytes());
    let expected = hex::encode(mac.finalize().into_bytes());

    if expected == sig {
        Ok(())
    } else {
        Err("bad signature")
    }
}

/// Upgrade endpoint. Plain HTTP gets 426; the rate limit and optional
/// signature gate run before the 101.
pub async fn chat_upgrade_handler(
    State(state): State<AppState>,
    RawQuery(query): RawQuery,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>
) -> Response {
    let upgrade = match upgrade {
        Ok(upgrade) => upgrade,
        Err(rejection) => {
            debug!("Rejecting non-upgrade request: {}", rejection);
            return reject(StatusCode::UPGRADE_REQUIRED, "upgrade required");
        }
    };

    if state.limiter.check().is_err() {
        warn!("Rate limit exceeded, rejecting upgrade");
        return reject(StatusCode::TOO_MANY_REQUESTS, "too many connections");
    }

    if let Some(secret) = &state.api_key {
        if let Err(reason) = verify_signature(secret, query.as_deref().unwrap_or("")) {
            warn!("Upgrade rejected: {}", reason);
            return reject(StatusCode::UNAUTHORIZED, reason);
        }
    }

    let gateway = state.gateway.clone();
    upgrade.on_upgrade(move |socket| handle_connection(socket, gateway))
}

pub async fn handle_connection(websocket: WebSocket, gateway: Arc<ChatGateway>) {
    let (mut tx, mut rx) = websocket.split();
    let (outbox, mut outbox_rx) = mpsc::unbounded_channel::<ServerEvent>();
    let mut connection = gateway.open_connection(outbox);
    let id = connection.id();
    info!("New WebSocket connection: {}", id);

    let writer = tokio::spawn(async move {
        while let Some(event) = outbox_rx.recv().await {
            let json = match event.to_json() {
                Ok(json) => json,
                Err(e) => {
                    error!("Failed to encode event for {}: {}", id, e);
                    continue;
                }
            };
            if let Err(e) = tx.send(Message::Text(json.into())).await {
                warn!("Error sending to {}: {}", id, e);
                break;
            }
        }
    });

    let mut heartbeat = tokio::time::interval(gateway.config().heartbeat_interval);
    heartbeat.tick().await;

    loop {
        tokio::select! {
            _ = heartbeat.tick() => gateway.heartbeat(&connection),
            frame = rx.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    gateway.handle_frame(&mut connection, text.as_str()).await;
                }
                Some(Ok(Message::Binary(_))) => {
                    warn!("Ignoring binary frame from {}", id);
                }
                Some(Ok(Message::Close(_))) | None => {
                    info!("Connection closed: {}", id);
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    info!("Connection error for {}: {}", id, e);
                    break;
                }
            },
        }
    }

    gateway.close_connection(&mut connection).await;
    writer.abort();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(secret: &str, ts: i64) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(ts.to_string().as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    #[test]
    fn accepts_fresh_signature() {
        let ts = Utc::now().timestamp();
        let query = format!("ts={}&sig={}", ts, sign("s3cret", ts));
        assert_eq!(verify_signature("s3cret", &query), Ok(()));
    }

    #[test]
    fn rejects_stale_or_forged_signatures() {
        let stale = Utc::now().timestamp() - 3_600;
        let query = format!("ts={}&sig={}", stale, sign("s3cret", stale));
        assert_eq!(verify_signature("s3cret", &query), Err("timestamp out of range"));

        let ts = Utc::now().timestamp();
        let query = format!("ts={}&sig={}", ts, sign("other", ts));
        assert_eq!(verify_signature("s3cret", &query), Err("bad signature"));

        assert_eq!(verify_signature("s3cret", "conversationId=c1"), Err("missing ts/sig"));
    }
}
