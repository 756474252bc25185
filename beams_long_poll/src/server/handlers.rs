//! HTTP request handlers for the long-poll endpoint.

use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Query, State},
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use super::{router::MessageRouter, session::Delivery};
use crate::{message::payload_from_form, session::SessionId};

/// Query string of a poll request.
#[derive(Debug, Default, Deserialize)]
struct PollParams {
    id: Option<String>,
}

/// Query string of an emission.
#[derive(Debug, Default, Deserialize)]
struct EmissionParams {
    id: Option<String>,
    m: Option<String>,
    n: Option<String>,
}

/// Create the Axum router serving polls and emissions on the base path.
pub fn router(server: Arc<MessageRouter>) -> Router {
    let path = server.config().base_path.clone();
    Router::new()
        .route(&path, get(handle_poll).post(handle_emission))
        .with_state(server)
}

/// Handle poll requests (server → client messages).
async fn handle_poll(
    State(server): State<Arc<MessageRouter>>,
    Query(params): Query<PollParams>,
) -> Response {
    let id = session_id(params.id);
    let rx = server.poll(id.as_ref()).await;

    // A dropped sender means the session went away under us.
    let delivery = rx.await.unwrap_or(Delivery::Closed);

    let response = match delivery {
        Delivery::Batch(messages) => {
            debug!(count = messages.len(), "answering poll");
            (StatusCode::OK, Json(messages)).into_response()
        }
        Delivery::Superseded => StatusCode::CONFLICT.into_response(),
        Delivery::Closed => StatusCode::GONE.into_response(),
    };

    with_cors(&server, response)
}

/// Handle emissions (client → server messages).
async fn handle_emission(
    State(server): State<Arc<MessageRouter>>,
    Query(params): Query<EmissionParams>,
    body: Bytes,
) -> Response {
    let Some(name) = params.m.filter(|m| !m.is_empty()) else {
        warn!("emission without a message name");
        return with_cors(&server, StatusCode::BAD_REQUEST.into_response());
    };

    let id = session_id(params.id);
    let n = params.n.and_then(|n| n.parse().ok()).unwrap_or(0);
    let payload = payload_from_form(&body);

    server.receive(id.as_ref(), &name, n, payload).await;

    with_cors(
        &server,
        (StatusCode::OK, Json(json!({ "received": true }))).into_response(),
    )
}

fn session_id(raw: Option<String>) -> Option<SessionId> {
    raw.filter(|id| !id.is_empty()).map(SessionId::from)
}

fn with_cors(server: &MessageRouter, mut response: Response) -> Response {
    if server.config().allow_any_origin {
        response.headers_mut().insert(
            header::ACCESS_CONTROL_ALLOW_ORIGIN,
            HeaderValue::from_static("*"),
        );
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{message::OutboundMessage, server::ServerBuilder};
    use serde_json::Value;

    async fn body_json(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        serde_json::from_slice(&bytes).expect("json")
    }

    async fn first_poll(server: &Arc<MessageRouter>) -> SessionId {
        let response = handle_poll(State(server.clone()), Query(PollParams::default())).await;
        assert_eq!(response.status(), StatusCode::OK);
        let batch: Vec<OutboundMessage> =
            serde_json::from_value(body_json(response).await).expect("batch");
        SessionId::from(batch[0].payload["id"].as_str().expect("id"))
    }

    #[tokio::test]
    async fn poll_without_id_answers_connect() {
        let server = ServerBuilder::new().build();
        let response = handle_poll(State(server.clone()), Query(PollParams::default())).await;

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body[0][0], "connect");
        assert!(body[0][1]["id"].is_string());
    }

    #[tokio::test]
    async fn empty_id_counts_as_absent() {
        let server = ServerBuilder::new().build();
        let params = PollParams {
            id: Some(String::new()),
        };
        let response = handle_poll(State(server.clone()), Query(params)).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(server.registry().len().await, 1);
    }

    #[tokio::test]
    async fn emission_dispatches_and_acknowledges() {
        let server = ServerBuilder::new()
            .on("ping", |payload, session: Arc<crate::server::Session>, _n| async move {
                session.emit("pong", payload).await;
            })
            .build();
        let id = first_poll(&server).await;

        let params = EmissionParams {
            id: Some(id.to_string()),
            m: Some("ping".into()),
            n: Some("1".into()),
        };
        let response = handle_emission(
            State(server.clone()),
            Query(params),
            Bytes::from_static(b"d=%7B%22x%22%3A1%7D"),
        )
        .await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await, json!({ "received": true }));

        let session = server.registry().get(&id).await.expect("session");
        assert_eq!(
            session.buffered().await,
            vec![OutboundMessage::new("pong", json!({ "x": 1 }))]
        );
    }

    #[tokio::test]
    async fn malformed_sequence_number_defaults_to_zero() {
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = seen.clone();
        let server = ServerBuilder::new()
            .on("ping", move |_payload, _session, n| {
                let sink = sink.clone();
                async move { sink.lock().unwrap().push(n) }
            })
            .build();
        let id = first_poll(&server).await;

        let uri: axum::http::Uri = format!("/beam?id={id}&m=ping&n=abc").parse().expect("uri");
        let Query(params) = Query::<EmissionParams>::try_from_uri(&uri).expect("query accepted");
        let response = handle_emission(State(server), Query(params), Bytes::new()).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(*seen.lock().unwrap(), vec![0]);
    }

    #[tokio::test]
    async fn emission_without_name_is_rejected() {
        let server = ServerBuilder::new().build();
        let response = handle_emission(
            State(server),
            Query(EmissionParams::default()),
            Bytes::new(),
        )
        .await;

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn emission_for_unknown_session_still_acknowledges() {
        let server = ServerBuilder::new().build();
        let params = EmissionParams {
            id: Some("ZZZ".into()),
            m: Some("ping".into()),
            n: Some("1".into()),
        };
        let response = handle_emission(State(server.clone()), Query(params), Bytes::new()).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert!(server.registry().is_empty().await);
    }

    #[tokio::test]
    async fn superseded_poll_answers_conflict() {
        let server = ServerBuilder::new().build();
        let id = first_poll(&server).await;

        let held = tokio::spawn(handle_poll(
            State(server.clone()),
            Query(PollParams {
                id: Some(id.to_string()),
            }),
        ));
        let session = server.registry().get(&id).await.expect("session");
        while !session.has_pending().await {
            tokio::task::yield_now().await;
        }

        let (pending, _rx) = crate::server::PendingResponse::channel();
        session.wait(pending).await;

        let response = held.await.expect("task");
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn unload_answers_held_poll_with_gone() {
        let server = ServerBuilder::new().build();
        let id = first_poll(&server).await;

        let held = tokio::spawn(handle_poll(
            State(server.clone()),
            Query(PollParams {
                id: Some(id.to_string()),
            }),
        ));
        let session = server.registry().get(&id).await.expect("session");
        while !session.has_pending().await {
            tokio::task::yield_now().await;
        }

        let params = EmissionParams {
            id: Some(id.to_string()),
            m: Some("unload".into()),
            n: Some("2".into()),
        };
        handle_emission(State(server.clone()), Query(params), Bytes::new()).await;

        let response = held.await.expect("task");
        assert_eq!(response.status(), StatusCode::GONE);
    }

    #[tokio::test]
    async fn cors_header_is_opt_in() {
        let open = ServerBuilder::new().allow_any_origin(true).build();
        let response = handle_poll(State(open), Query(PollParams::default())).await;
        assert_eq!(
            response.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN),
            Some(&HeaderValue::from_static("*"))
        );

        let closed = ServerBuilder::new().build();
        let response = handle_poll(State(closed), Query(PollParams::default())).await;
        assert!(response.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN).is_none());
    }
}
