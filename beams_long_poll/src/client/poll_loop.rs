//! Background polling task for receiving server messages.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info, warn};
use url::Url;

use super::{ClientInner, http_client::HttpClient};
use crate::{error::PollError, message::OutboundMessage, reserved};

/// Run the poll loop until the client is closed.
///
/// One GET is outstanding at a time. A successful poll resets the retry
/// delay and re-polls at once; a failed poll grows the delay and waits.
/// Cancellation wins over a poll answered at the same moment, so closing
/// never reports the final poll as a failure.
pub(super) async fn poll_loop<H: HttpClient>(inner: Arc<ClientInner<H>>) {
    info!(server_url = %inner.server_url, "starting poll loop");

    loop {
        let url = inner.endpoint(inner.session_id().as_ref());

        let result = tokio::select! {
            biased;
            () = inner.cancel.cancelled() => break,
            result = poll_once(&inner.http, &url) => result,
        };

        match result {
            Ok(messages) => {
                inner.lock_retry().reset();
                inner.events.emit(reserved::OK, &Value::Null);

                debug!(count = messages.len(), "poll received messages");
                for message in messages {
                    inner.events.emit(&message.name, &message.payload);
                }
            }
            Err(e) => {
                let delay = inner.lock_retry().fail();
                warn!(error = %e, delay_ms = delay.as_millis(), "poll failed");
                inner.events.emit(reserved::FAIL, &Value::Null);

                tokio::select! {
                    () = inner.cancel.cancelled() => break,
                    () = tokio::time::sleep(delay) => {}
                }
            }
        }
    }

    info!("poll loop exited");
}

async fn poll_once<H: HttpClient>(http: &H, url: &Url) -> Result<Vec<OutboundMessage>, PollError> {
    let response = http
        .get(url.as_str())
        .await
        .map_err(|e| PollError::Request(e.to_string()))?;

    if !response.is_ok() {
        return Err(PollError::UnexpectedStatus(response.status));
    }

    Ok(serde_json::from_slice(&response.body)?)
}
