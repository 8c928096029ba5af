// Buffered streaming for /cc/v1/messages.
//
// Events are captured in receive order instead of forwarded, so the
// message_start that eventually reaches the client can carry the exact
// input_tokens derived from the terminal context-usage event. While the
// upstream is draining, an SSE comment ping keeps intermediaries from
// closing the idle connection.

use futures::stream::{BoxStream, Stream, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;

use super::{AnthropicSseBuilder, StreamEvent, CONTEXT_WINDOW_TOKENS};
use crate::error::ApiError;
use crate::tokenizer::count_text_tokens;

/// Keepalive cadence while buffering
const PING_INTERVAL: Duration = Duration::from_secs(25);

const PING_LINE: &str = ": ping\n\n";

/// Derive the exact input token count from a context-usage percentage,
/// falling back to the tokenizer estimate.
pub fn corrected_input_tokens(context_usage: Option<f64>, estimate: i32) -> (i32, &'static str) {
    match context_usage {
        Some(pct) if pct > 0.0 => (
            (pct * CONTEXT_WINDOW_TOKENS / 100.0).round() as i32,
            "context_usage",
        ),
        _ => (estimate, "estimate"),
    }
}

/// Replay captured events as a complete Anthropic SSE message with the
/// corrected message_start.
pub fn replay_events(
    events: &[StreamEvent],
    model: &str,
    estimated_input_tokens: i32,
) -> Vec<String> {
    let mut builder = AnthropicSseBuilder::new(model);

    // The builder walks the events once to assemble the body while
    // tracking usage; message_start is prepended afterwards.
    let mut body = Vec::new();
    let mut output_text = String::new();
    for event in events {
        match event {
            StreamEvent::Content(text) | StreamEvent::Thinking(text) => {
                output_text.push_str(text)
            }
            _ => {}
        }
        body.extend(builder.on_event(event));
    }

    let (input_tokens, source) =
        corrected_input_tokens(builder.context_usage, estimated_input_tokens);
    let output_tokens = match builder.usage {
        Some((_, output)) if output > 0 => output,
        _ => count_text_tokens(&output_text),
    };

    tracing::info!(
        model,
        input_tokens,
        output_tokens,
        source,
        "Buffered replay ready"
    );

    let mut out = vec![builder.message_start(input_tokens)];
    out.extend(body);
    out.extend(builder.finish(output_tokens));
    out
}

/// Drain the upstream into a buffer, emitting pings while it runs, then
/// replay everything with the corrected message_start.
pub fn buffered_sse_stream(
    events: BoxStream<'static, Result<StreamEvent, ApiError>>,
    model: String,
    estimated_input_tokens: i32,
) -> impl Stream<Item = String> {
    buffered_sse_stream_with_ping(events, model, estimated_input_tokens, PING_INTERVAL)
}

fn buffered_sse_stream_with_ping(
    mut events: BoxStream<'static, Result<StreamEvent, ApiError>>,
    model: String,
    estimated_input_tokens: i32,
    ping_interval: Duration,
) -> impl Stream<Item = String> {
    let (tx, rx) = mpsc::unbounded_channel::<String>();

    tokio::spawn(async move {
        let mut buffered: Vec<StreamEvent> = Vec::new();
        let mut failure: Option<ApiError> = None;
        let mut ping = tokio::time::interval(ping_interval);
        // The first tick fires immediately; skip it
        ping.tick().await;

        loop {
            tokio::select! {
                next = events.next() => match next {
                    Some(Ok(event)) => buffered.push(event),
                    Some(Err(e)) => {
                        failure = Some(e);
                        break;
                    }
                    None => break,
                },
                _ = ping.tick() => {
                    if tx.send(PING_LINE.to_string()).is_err() {
                        return;
                    }
                    tracing::debug!("Sent buffered-mode keepalive ping");
                }
            }
        }

        if let Some(error) = failure {
            let _ = tx.send(error.to_sse_events());
            return;
        }

        for event in replay_events(&buffered, &model, estimated_input_tokens) {
            if tx.send(event).is_err() {
                return;
            }
        }
    });

    futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_corrected_input_tokens_from_context_usage() {
        let (tokens, source) = corrected_input_tokens(Some(40.0), 7);
        assert_eq!(tokens, 80_000);
        assert_eq!(source, "context_usage");

        let (tokens, source) = corrected_input_tokens(Some(25.0), 7);
        assert_eq!(tokens, 50_000);
        assert_eq!(source, "context_usage");
    }

    #[test]
    fn test_corrected_input_tokens_fallback() {
        assert_eq!(corrected_input_tokens(None, 123), (123, "estimate"));
        assert_eq!(corrected_input_tokens(Some(0.0), 123), (123, "estimate"));
    }

    #[test]
    fn test_replay_corrects_message_start() {
        let events = vec![
            StreamEvent::Content("Hello".into()),
            StreamEvent::ContextUsage(40.0),
        ];
        let replayed = replay_events(&events, "claude-sonnet-4", 7);

        let message_start = &replayed[0];
        assert!(message_start.starts_with("event: message_start"));
        assert!(message_start.contains("\"input_tokens\":80000"));

        let joined = replayed.join("");
        assert!(joined.contains("\"text\":\"Hello\""));
        assert!(joined.ends_with("event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n"));
    }

    #[test]
    fn test_replay_preserves_receive_order() {
        let events = vec![
            StreamEvent::Thinking("plan".into()),
            StreamEvent::Content("do".into()),
            StreamEvent::ToolUse(super::super::CompletedToolUse {
                tool_use_id: "t1".into(),
                name: "bash".into(),
                input: json!({}),
            }),
            StreamEvent::ContextUsage(10.0),
        ];
        let joined = replay_events(&events, "m", 1).join("");

        let thinking_pos = joined.find("thinking_delta").unwrap();
        let text_pos = joined.find("text_delta").unwrap();
        let tool_pos = joined.find("\"tool_use\"").unwrap();
        assert!(thinking_pos < text_pos);
        assert!(text_pos < tool_pos);
    }

    #[test]
    fn test_replay_uses_reported_output_tokens() {
        let events = vec![
            StreamEvent::Content("x".into()),
            StreamEvent::Usage {
                input_tokens: 0,
                output_tokens: 77,
            },
        ];
        let joined = replay_events(&events, "m", 1).join("");
        assert!(joined.contains("\"output_tokens\":77"));
    }

    #[tokio::test]
    async fn test_ping_emitted_while_buffering() {
        let slow = futures::stream::once(async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(StreamEvent::Content("late".into()))
        })
        .boxed();

        let out: Vec<String> = buffered_sse_stream_with_ping(
            slow,
            "m".into(),
            1,
            Duration::from_millis(50),
        )
        .collect()
        .await;

        assert!(out.iter().any(|e| e == PING_LINE));
        // Pings come before the replayed message
        let ping_idx = out.iter().position(|e| e == PING_LINE).unwrap();
        let start_idx = out
            .iter()
            .position(|e| e.starts_with("event: message_start"))
            .unwrap();
        assert!(ping_idx < start_idx);
    }

    #[tokio::test]
    async fn test_stream_error_yields_error_event() {
        let failing = futures::stream::iter(vec![
            Ok(StreamEvent::Content("partial".into())),
            Err(ApiError::StreamReadTimeout("4 consecutive read timeouts".into())),
        ])
        .boxed();

        let out: Vec<String> =
            buffered_sse_stream(failing, "m".into(), 1).collect().await;
        let joined = out.join("");
        assert!(joined.contains("event: error"));
        assert!(joined.contains("event: message_stop"));
        assert!(!joined.contains("message_start"));
    }
}
