//! `POST /execute_stream`: run a command and stream its output as
//! server-sent events.
//!
//! Each event carries one JSON-encoded [`StreamChunk`]. The last event is a
//! `completed` or `failed` chunk. A client disconnect cancels the command.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use poem::handler;
use poem::web::sse::{Event, SSE};
use poem::web::{Data, Json};
use tracing::{info, warn};

use super::config::resolve_hard_timeout;
use super::executor::Executor;
use super::types::{ExecuteStreamRequest, Invocation, StreamChunk};

const KEEP_ALIVE: Duration = Duration::from_secs(15);

#[handler]
pub async fn execute_stream(
    executor: Data<&Arc<Executor>>,
    Json(request): Json<ExecuteStreamRequest>,
) -> SSE {
    let hard_timeout = match request.hard_timeout_secs {
        Some(secs) => resolve_hard_timeout(Some(secs)),
        None => executor.config().default_hard_timeout,
    };
    let invocation = Invocation::new(request.command)
        .with_cwd(request.cwd)
        .with_hard_timeout(hard_timeout);
    info!(invocation_id = %invocation.id, "execute_stream");

    let stream = executor.execute_stream(invocation).map(chunk_event);
    SSE::new(stream).keep_alive(KEEP_ALIVE)
}

/// SSE event name; matches the chunk's `type` field.
fn event_kind(chunk: &StreamChunk) -> &'static str {
    match chunk {
        StreamChunk::Output { .. } => "output",
        StreamChunk::Completed { .. } => "completed",
        StreamChunk::Failed { .. } => "failed",
    }
}

fn chunk_event(chunk: StreamChunk) -> Event {
    let kind = event_kind(&chunk);
    match serde_json::to_string(&chunk) {
        Ok(data) => Event::message(data).event_type(kind),
        Err(err) => {
            warn!(%err, "failed to encode stream chunk");
            Event::message(format!(
                r#"{{"type":"failed","error_type":"ProtocolError","message":"{}"}}"#,
                err.to_string().replace('"', "'")
            ))
            .event_type("failed")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunks() -> Vec<StreamChunk> {
        vec![
            StreamChunk::Output {
                text: "hello\n".to_string(),
            },
            StreamChunk::Completed {
                exit_code: 0,
                cwd: "/work".to_string(),
                timed_out: false,
            },
            StreamChunk::Failed {
                error_type: "SessionClosedError".to_string(),
                message: "shell session is closed".to_string(),
            },
        ]
    }

    #[test]
    fn test_event_kind_matches_type_tag() {
        for chunk in chunks() {
            let json = serde_json::to_value(&chunk).unwrap();
            assert_eq!(json["type"], event_kind(&chunk));
        }
    }

    #[test]
    fn test_only_final_events_are_terminal() {
        let kinds: Vec<_> = chunks()
            .iter()
            .filter(|chunk| chunk.is_terminal())
            .map(event_kind)
            .collect();
        assert_eq!(kinds, vec!["completed", "failed"]);
    }
}
