//! Scripted step executor
//!
//! Runs a list of [`WebSocketStep`]s strictly in order on the calling task.

use std::time::Duration;

use crate::config::{enabled, DialOptions, WebSocketOptions};
use crate::constants::{DEFAULT_RECEIVE_WINDOW, MAX_RECEIVE_WINDOW};
use crate::models::WebSocketStep;
use crate::network::sender::Sender;
use crate::stream::{Session, StreamError};

/// What the script did
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StepOutcome {
    pub executed: usize,
    /// The script sent its own close frame
    pub explicit_close: bool,
}

/// Pause after a send so an echo can arrive before the next step
pub fn receive_window(idle_timeout: Duration) -> Duration {
    match enabled(idle_timeout) {
        Some(idle) => (idle / 2).min(MAX_RECEIVE_WINDOW),
        None => DEFAULT_RECEIVE_WINDOW,
    }
}

/// Execute `steps` against `sender`'s session.
///
/// Stops quietly once the session has ended. A failing step cancels the
/// session and returns [`StreamError::Step`].
pub async fn run_steps(
    sender: &Sender,
    steps: &[WebSocketStep],
    options: &WebSocketOptions,
    dial: &DialOptions,
) -> Result<StepOutcome, StreamError> {
    let session = sender.session().clone();
    let window = receive_window(options.idle_timeout);
    let mut outcome = StepOutcome::default();

    for (idx, step) in steps.iter().enumerate() {
        if session.is_terminal() {
            tracing::debug!(session = %session.id(), remaining = steps.len() - idx, "Session ended, skipping steps");
            break;
        }

        let label = format!("{}:{}", idx + 1, step.name());
        tracing::debug!(session = %session.id(), step = %label, "Running step");
        match run_step(&sender.with_step(&label), step, dial, &session).await {
            Ok(()) => {}
            Err(e) if e.is_expected() && session.is_terminal() => break,
            Err(e) => {
                tracing::warn!(session = %session.id(), step = %label, error = %e, "Step failed");
                session.cancel();
                return Err(StreamError::Step {
                    index: idx + 1,
                    kind: step.name().to_string(),
                    message: e.to_string(),
                });
            }
        }
        outcome.executed += 1;

        if let WebSocketStep::Close { .. } = step {
            outcome.explicit_close = true;
            break;
        }
        if step.awaits_reply() {
            let _ = tokio::time::timeout(window, session.done()).await;
        }
    }

    Ok(outcome)
}

async fn run_step(
    sender: &Sender,
    step: &WebSocketStep,
    dial: &DialOptions,
    session: &Session,
) -> Result<(), StreamError> {
    match step {
        WebSocketStep::SendText { value } => sender.send_text(value.clone()).await,
        WebSocketStep::SendJson { value } => sender.send_json(value).await,
        WebSocketStep::SendBase64 { value } => sender.send_base64(value).await,
        WebSocketStep::SendFile { path } => {
            let resolved = dial.resolve_file(path);
            let data = tokio::fs::read(&resolved)
                .await
                .map_err(|e| StreamError::File {
                    path: resolved.display().to_string(),
                    message: e.to_string(),
                })?;
            sender.send_binary(data).await
        }
        WebSocketStep::Ping { value } => sender.ping(value.clone()).await,
        WebSocketStep::Pong { value } => sender.pong(value.clone()).await,
        WebSocketStep::Wait { duration_ms } => {
            let _ = tokio::time::timeout(Duration::from_millis(*duration_ms), session.done()).await;
            Ok(())
        }
        WebSocketStep::Close { code, reason } => sender.close(*code, reason).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::META_WS_STEP;
    use crate::network::test_support::spawn_echo_server;
    use crate::network::websocket::{connect, Connection, WebSocket, WebSocketRequest};
    use crate::stream::Direction;
    use std::io::Write;

    async fn upgraded(url: &str) -> WebSocket {
        match connect(
            &WebSocketRequest::new(url),
            &WebSocketOptions::default(),
            &DialOptions::default(),
        )
        .await
        .unwrap()
        {
            Connection::Upgraded(ws) => ws,
            Connection::Rejected(resp) => panic!("unexpected rejection: {}", resp.status),
        }
    }

    fn fast_options() -> WebSocketOptions {
        WebSocketOptions {
            idle_timeout: Duration::from_millis(100),
            ..Default::default()
        }
    }

    #[test]
    fn test_receive_window_bounds() {
        assert_eq!(receive_window(Duration::ZERO), DEFAULT_RECEIVE_WINDOW);
        assert_eq!(receive_window(Duration::from_millis(100)), Duration::from_millis(50));
        assert_eq!(receive_window(Duration::from_secs(60)), MAX_RECEIVE_WINDOW);
    }

    #[tokio::test]
    async fn test_steps_run_in_order_with_labels() {
        let url = spawn_echo_server().await;
        let ws = upgraded(&url).await;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"\x01\x02").unwrap();
        let steps = vec![
            WebSocketStep::SendText { value: "a".into() },
            WebSocketStep::SendJson { value: "{ \"b\": 1 }".into() },
            WebSocketStep::SendFile {
                path: file.path().display().to_string(),
            },
            WebSocketStep::Wait { duration_ms: 5 },
            WebSocketStep::Close {
                code: 1000,
                reason: "script".into(),
            },
            WebSocketStep::SendText { value: "never".into() },
        ];

        let outcome = run_steps(ws.sender(), &steps, &fast_options(), &DialOptions::default())
            .await
            .unwrap();
        assert_eq!(
            outcome,
            StepOutcome {
                executed: 5,
                explicit_close: true
            }
        );

        ws.session().done().await;
        let sent: Vec<(String, String)> = ws
            .session()
            .events_snapshot()
            .into_iter()
            .filter(|e| e.direction == Direction::Send)
            .map(|e| (e.metadata(META_WS_STEP).unwrap_or_default().to_string(), e.text()))
            .collect();
        assert_eq!(sent[0], ("1:send_text".to_string(), "a".to_string()));
        assert_eq!(sent[1], ("2:send_json".to_string(), "{\"b\":1}".to_string()));
        assert_eq!(sent[2].0, "3:send_file");
        assert_eq!(sent[3].0, "5:close");
        assert_eq!(sent.len(), 4);
    }

    #[tokio::test]
    async fn test_failing_step_cancels_session() {
        let url = spawn_echo_server().await;
        let ws = upgraded(&url).await;
        let steps = vec![
            WebSocketStep::SendText { value: "ok".into() },
            WebSocketStep::SendBase64 {
                value: "not base64!".into(),
            },
            WebSocketStep::SendText { value: "never".into() },
        ];

        let err = run_steps(ws.sender(), &steps, &fast_options(), &DialOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StreamError::Step { index: 2, .. }));

        tokio::time::timeout(Duration::from_secs(2), ws.session().done())
            .await
            .unwrap();
        assert!(ws.session().context().err().is_some());
    }

    #[tokio::test]
    async fn test_missing_file_is_step_error() {
        let url = spawn_echo_server().await;
        let ws = upgraded(&url).await;
        let steps = vec![WebSocketStep::SendFile {
            path: "definitely/not/here.bin".into(),
        }];
        let err = run_steps(ws.sender(), &steps, &fast_options(), &DialOptions::default())
            .await
            .unwrap_err();
        match err {
            StreamError::Step { kind, message, .. } => {
                assert_eq!(kind, "send_file");
                assert!(message.contains("here.bin"));
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_steps_stop_after_session_ends() {
        let url = spawn_echo_server().await;
        let ws = upgraded(&url).await;
        ws.session().close(None);

        let steps = vec![WebSocketStep::SendText { value: "x".into() }];
        let outcome = run_steps(ws.sender(), &steps, &fast_options(), &DialOptions::default())
            .await
            .unwrap();
        assert_eq!(outcome.executed, 0);
        assert!(!outcome.explicit_close);
    }
}
