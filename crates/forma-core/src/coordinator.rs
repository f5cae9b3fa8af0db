use futures::StreamExt;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::Level;

use forma_observability::{emit_event, ObservabilityEvent, ProcessKind};
use forma_providers::{ChatMessage, ProviderRegistry, StreamChunk};
use forma_runtime::ExecutionPipeline;
use forma_types::{ClientEvent, ExecutionResult};

use crate::code_block::{CodeBlockPhase, CodeBlockTracker};
use crate::event_bus::EventBus;
use crate::history::HistoryEntry;
use crate::session::{SessionHandle, SessionStore};

/// Language tag the detector keys on; the prompt below instructs the model
/// to fence its script with it.
pub const SCRIPT_LANGUAGE_TAG: &str = "python";

const SYSTEM_PROMPT: &str = "You are an assistant whose job is to create CadQuery Python scripts. \
Show your CadQuery objects with the show_object function. ALWAYS create solid objects and try \
not to create wires. If you can, reuse the code that you have written before. You may use NumPy \
for math operations.";

/// Drives one model response per user message: consumes the token stream,
/// routes narrative and code deltas in arrival order, and hands a closed
/// block to the execution pipeline.
#[derive(Clone)]
pub struct ResponseCoordinator {
    sessions: SessionStore,
    providers: ProviderRegistry,
    event_bus: EventBus,
    pipeline: ExecutionPipeline,
}

impl ResponseCoordinator {
    pub fn new(
        sessions: SessionStore,
        providers: ProviderRegistry,
        event_bus: EventBus,
        pipeline: ExecutionPipeline,
    ) -> Self {
        Self {
            sessions,
            providers,
            event_bus,
            pipeline,
        }
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    pub fn pipeline(&self) -> &ExecutionPipeline {
        &self.pipeline
    }

    /// Full streaming cycle for one user message. Returns the complete
    /// response text; the terminal event for the turn has already been
    /// published when this returns.
    pub async fn run_prompt(&self, session_id: &str, user_text: &str) -> anyhow::Result<String> {
        let session = self
            .sessions
            .get(session_id)
            .await
            .ok_or_else(|| anyhow::anyhow!("unknown session `{session_id}`"))?;

        session
            .append_history(HistoryEntry::User(user_text.to_string()))
            .await;
        let prompt = session.build_prompt().await;

        self.publish(session_id, "code-cleared", json!({}));

        emit_event(
            Level::INFO,
            ProcessKind::Engine,
            ObservabilityEvent {
                event: "provider.call.start",
                component: "core.coordinator",
                session_id: Some(session_id),
                response_id: None,
                provider_id: None,
                model_id: None,
                status: Some("starting"),
                error_code: None,
                detail: None,
            },
        );

        let messages = vec![
            ChatMessage {
                role: "system".to_string(),
                content: SYSTEM_PROMPT.to_string(),
            },
            ChatMessage {
                role: "user".to_string(),
                content: prompt,
            },
        ];

        let stream = match self
            .providers
            .default_stream(messages, CancellationToken::new())
            .await
        {
            Ok(stream) => stream,
            Err(err) => {
                self.report_provider_error(session_id, &err);
                return Err(err);
            }
        };
        tokio::pin!(stream);

        let mut tracker = CodeBlockTracker::new(SCRIPT_LANGUAGE_TAG);
        let mut completion = String::new();

        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(err) => {
                    self.report_provider_error(session_id, &err);
                    return Err(anyhow::anyhow!("provider stream chunk error: {err}"));
                }
            };
            match chunk {
                StreamChunk::TextDelta(delta) => {
                    if completion.is_empty() {
                        emit_event(
                            Level::INFO,
                            ProcessKind::Engine,
                            ObservabilityEvent {
                                event: "provider.call.first_byte",
                                component: "core.coordinator",
                                session_id: Some(session_id),
                                response_id: None,
                                provider_id: None,
                                model_id: None,
                                status: Some("streaming"),
                                error_code: None,
                                detail: None,
                            },
                        );
                    }
                    completion.push_str(&delta);
                    let outcome = tracker.push_token(&delta);
                    if let Some(text) = outcome.narrative {
                        self.publish(session_id, "narrative-delta", json!({"content": text}));
                    }
                    if let Some(text) = outcome.code {
                        self.publish(session_id, "code-delta", json!({"content": text}));
                    }
                    if let Some(code) = outcome.closed {
                        // The first complete block seals the turn; the rest
                        // of the provider stream is not inspected.
                        self.execute_and_report(&session, &code).await?;
                        session
                            .append_history(HistoryEntry::Assistant(completion.clone()))
                            .await;
                        return Ok(completion);
                    }
                }
                StreamChunk::Done { .. } => break,
            }
        }

        debug_assert!(tracker.phase() != CodeBlockPhase::Closed);
        self.publish(session_id, "response-done", json!({}));
        session
            .append_history(HistoryEntry::Assistant(completion.clone()))
            .await;
        Ok(completion)
    }

    /// Re-execute a previously shown (possibly edited) block directly,
    /// bypassing the model. Stray fence markers from a copied block are
    /// stripped first.
    pub async fn rerun(&self, session_id: &str, code: &str) -> anyhow::Result<ExecutionResult> {
        let session = self
            .sessions
            .get(session_id)
            .await
            .ok_or_else(|| anyhow::anyhow!("unknown session `{session_id}`"))?;
        let code = strip_fence_markers(code);
        self.execute_and_report(&session, &code).await
    }

    /// Shared tail of both entry points: serialize on the session, run the
    /// pipeline, report, and append execution output to history.
    async fn execute_and_report(
        &self,
        session: &SessionHandle,
        code: &str,
    ) -> anyhow::Result<ExecutionResult> {
        let session_id = session.id().to_string();
        self.publish(&session_id, "viewer-buffer-start", json!({}));

        // Holding the lock across run + history append means a message
        // sent mid-execution observes the previous run's completed state.
        let _guard = session.lock_execution().await;

        let slot = session
            .resolve_artifact_slot(|| self.pipeline.artifacts().new_slot())
            .await;

        emit_event(
            Level::INFO,
            ProcessKind::Engine,
            ObservabilityEvent {
                event: "execution.start",
                component: "core.coordinator",
                session_id: Some(&session_id),
                response_id: None,
                provider_id: None,
                model_id: None,
                status: Some("running"),
                error_code: None,
                detail: Some(&slot),
            },
        );

        let result = match self
            .pipeline
            .execute(code, &slot, CancellationToken::new())
            .await
        {
            Ok(result) => result,
            Err(err) => {
                // Spawn-level failure: observable, distinct from a script
                // that merely failed.
                let error_text = err.to_string();
                emit_event(
                    Level::ERROR,
                    ProcessKind::Engine,
                    ObservabilityEvent {
                        event: "execution.spawn_failed",
                        component: "core.coordinator",
                        session_id: Some(&session_id),
                        response_id: None,
                        provider_id: None,
                        model_id: None,
                        status: Some("failed"),
                        error_code: Some("SPAWN_FAILED"),
                        detail: Some(&error_text),
                    },
                );
                self.publish(&session_id, "error", json!({"error": error_text}));
                return Err(err);
            }
        };

        if !result.stdout.trim().is_empty() {
            session
                .append_history(HistoryEntry::Stdout(result.stdout.clone()))
                .await;
        }
        if !result.stderr.trim().is_empty() {
            session
                .append_history(HistoryEntry::Stderr(result.stderr.clone()))
                .await;
        }

        emit_event(
            Level::INFO,
            ProcessKind::Engine,
            ObservabilityEvent {
                event: "execution.finished",
                component: "core.coordinator",
                session_id: Some(&session_id),
                response_id: None,
                provider_id: None,
                model_id: None,
                status: Some(if result.stderr.is_empty() {
                    "ok"
                } else {
                    "script_error"
                }),
                error_code: None,
                detail: Some(&slot),
            },
        );

        let summary = build_execution_summary(&result);
        self.publish(&session_id, "execution-summary", json!({"content": summary}));
        if let Some(artifact) = &result.artifact_url {
            self.publish(
                &session_id,
                "artifact-reference",
                json!({"content": artifact}),
            );
        }
        self.publish(&session_id, "response-done", json!({}));
        self.publish(&session_id, "viewer-buffer-end", json!({}));

        Ok(result)
    }

    fn report_provider_error(&self, session_id: &str, err: &anyhow::Error) {
        let error_text = err.to_string();
        emit_event(
            Level::ERROR,
            ProcessKind::Engine,
            ObservabilityEvent {
                event: "provider.call.error",
                component: "core.coordinator",
                session_id: Some(session_id),
                response_id: None,
                provider_id: None,
                model_id: None,
                status: Some("failed"),
                error_code: Some(provider_error_code(&error_text)),
                detail: Some(&error_text),
            },
        );
        self.publish(session_id, "error", json!({"error": error_text}));
    }

    fn publish(&self, session_id: &str, event_type: &str, mut properties: serde_json::Value) {
        if let Some(map) = properties.as_object_mut() {
            map.insert(
                "sessionID".to_string(),
                serde_json::Value::String(session_id.to_string()),
            );
        }
        self.event_bus
            .publish(ClientEvent::new(event_type, properties));
    }
}

fn strip_fence_markers(code: &str) -> String {
    let mut cleaned = code.replace("```", "");
    if let Some(rest) = cleaned.trim_start().strip_prefix(SCRIPT_LANGUAGE_TAG) {
        if rest.starts_with('\n') {
            cleaned = rest.to_string();
        }
    }
    cleaned.trim().to_string()
}

fn build_execution_summary(result: &ExecutionResult) -> String {
    let mut summary = String::new();
    if !result.stdout.is_empty() {
        summary.push_str(&format!("Program Output: {}\n", result.stdout));
    }
    if !result.stderr.is_empty() {
        summary.push_str(&format!("Execution Errors:\n{}\n", result.stderr));
    }
    if result.timed_out {
        summary.push_str("Execution exceeded the time limit and was stopped.\n");
    } else if result.stderr.is_empty() {
        summary.push_str("Successfully rendered!\n");
    }
    summary
}

fn provider_error_code(error_text: &str) -> &'static str {
    let lowered = error_text.to_ascii_lowercase();
    if lowered.contains("401") || lowered.contains("unauthorized") || lowered.contains("api key") {
        "PROVIDER_AUTH"
    } else if lowered.contains("timed out") || lowered.contains("timeout") {
        "PROVIDER_TIMEOUT"
    } else if lowered.contains("connect") || lowered.contains("dns") {
        "PROVIDER_UNREACHABLE"
    } else {
        "PROVIDER_ERROR"
    }
}
