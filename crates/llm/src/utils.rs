use crate::streaming::{FrameDecoder, FrameStream};
use crate::{Answer, AnswerEvent, ApiError, EventCallback, Fragment};
use anyhow::Result;
use reqwest::{Response, StatusCode};
use std::future::Future;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Sentinel payload that ends an SSE answer stream
pub const DONE_SENTINEL: &str = "[DONE]";

/// Check response status before any decoding starts.
///
/// Non-2xx responses fail with the JSON body re-serialized if it has
/// content, otherwise with `"<status> <statusText>"`.
pub async fn check_response_error(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    Err(http_error(status, &body).into())
}

pub fn http_error(status: StatusCode, body: &str) -> ApiError {
    let message = match serde_json::from_str::<serde_json::Value>(body) {
        Ok(value) if !is_empty_json(&value) => value.to_string(),
        _ => match status.canonical_reason() {
            Some(reason) => format!("{} {}", status.as_u16(), reason),
            None => status.as_u16().to_string(),
        },
    };
    ApiError::Http {
        status: status.as_u16(),
        message,
    }
}

fn is_empty_json(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Object(map) => map.is_empty(),
        serde_json::Value::Array(items) => items.is_empty(),
        serde_json::Value::String(text) => text.is_empty(),
        serde_json::Value::Null | serde_json::Value::Bool(_) | serde_json::Value::Number(_) => {
            true
        }
    }
}

/// Read frames until the stream ends (or sends `[DONE]`), merging every
/// parsed fragment into the answer and emitting a snapshot whenever the
/// text grew.
///
/// Fragments that fail to parse are skipped. The stream only fails with a
/// decode error if not a single frame could be parsed.
pub(crate) async fn stream_fragments<D, P>(
    frames: &mut FrameStream<D>,
    mut parse: P,
    on_event: &EventCallback,
) -> Result<Answer>
where
    D: FrameDecoder,
    P: FnMut(&str) -> Result<Option<Fragment>> + Send,
{
    let mut answer = Answer::default();
    let mut parsed = 0usize;
    let mut first_failure: Option<anyhow::Error> = None;

    while let Some(frame) = frames.next_frame().await? {
        if frame == DONE_SENTINEL {
            debug!("Received end of stream sentinel");
            break;
        }

        debug!("Received stream event '{}'", frame);
        match parse(&frame) {
            Ok(Some(fragment)) => {
                parsed += 1;
                if answer.merge(fragment) {
                    on_event(AnswerEvent::Answer(answer.clone()));
                }
            }
            Ok(None) => parsed += 1,
            Err(e) => {
                warn!("Skipping undecodable fragment '{}': {}", frame, e);
                first_failure.get_or_insert(e);
            }
        }
    }

    if parsed == 0 {
        if let Some(e) = first_failure {
            return Err(ApiError::Decode(e.to_string()).into());
        }
    }

    Ok(answer)
}

/// Run an answer stream to its terminal event.
///
/// Emits `Done` on success and a single `Error` on failure. When the token
/// is cancelled first, the stream future is dropped (aborting the request)
/// and no terminal event is emitted. Returns false if cancelled.
pub(crate) async fn drive_to_terminal<F>(
    stream: F,
    on_event: &EventCallback,
    cancel: &CancellationToken,
) -> bool
where
    F: Future<Output = Result<Answer>> + Send,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            debug!("Answer generation cancelled");
            false
        }
        result = stream => {
            match result {
                Ok(answer) => {
                    debug!("Answer complete ({} characters)", answer.text.chars().count());
                    on_event(AnswerEvent::Done);
                }
                Err(e) => {
                    error!("Answer generation failed: {:#}", e);
                    on_event(AnswerEvent::from_error(&e));
                }
            }
            true
        }
    }
}

/// Read a string at a JSON pointer, treating empty strings as absent.
pub(crate) fn str_at(value: &serde_json::Value, pointer: &str) -> Option<String> {
    value
        .pointer(pointer)
        .and_then(serde_json::Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}
