//! Generation loop
//!
//! Drives one model turn for a chat: the model streams text and tool calls,
//! tool calls are executed in the order requested and fed back, and the loop
//! repeats until the model stops, the step ceiling is hit, or the wall-clock
//! deadline passes. Everything the model and the tools produce is written to
//! the turn's [`EventSink`] as it happens. The assistant reply is persisted
//! once at the end, whatever the reason for stopping.

pub mod event;
mod prompt;

pub use event::{FinishReason, SessionEvent};
pub use prompt::{RequestHints, TITLE_MAX_CHARS, chat_title, system_prompt};

use crate::provider::{CompletionRequest, ContentPart, Message, Provider, Role, StreamChunk, Usage};
use crate::store::{ChatStore, DbMessage, MessagePart, MessageRole};
use crate::stream::EventSink;
use crate::telemetry::{TOKEN_USAGE, TokenCounts};
use crate::tool::{ToolContext, ToolRegistry, ToolResult};
use chrono::Utc;
use futures::StreamExt;
use serde_json::{Value, json};
use std::sync::Arc;
use tokio::time::{Instant, timeout_at};

/// Where the loop is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Streaming { step: usize },
    /// The model finished on its own.
    Completed,
    /// A ceiling (steps or time) or a backend failure ended the loop.
    Stopped,
}

/// Everything one turn needs.
pub struct Generation {
    pub chat_id: String,
    /// Id given to the persisted assistant message.
    pub message_id: String,
    /// The user message that started this turn, already persisted.
    pub user_message: DbMessage,
    pub provider: Arc<dyn Provider>,
    pub model: String,
    /// Prior conversation, oldest first, including `user_message`.
    pub history: Vec<Message>,
    pub system_prompt: String,
    /// Static and dynamic tools merged for this request.
    pub tools: ToolRegistry,
    /// Reasoning-only turns expose no tools at all.
    pub reasoning: bool,
    pub max_steps: usize,
    pub deadline: Instant,
}

/// How a turn ended.
#[derive(Debug, Clone)]
pub struct GenerationOutcome {
    pub state: LoopState,
    pub finish_reason: FinishReason,
    pub steps: usize,
    pub usage: Usage,
    pub message: Option<DbMessage>,
}

struct PendingCall {
    id: String,
    name: String,
    arguments: String,
}

enum StepEnd {
    Finished,
    TimedOut,
    Failed,
}

impl Generation {
    /// Run the turn to completion, emitting events onto `events` and
    /// persisting the assistant reply through `store`.
    pub async fn run(self, events: &EventSink, store: &dyn ChatStore) -> GenerationOutcome {
        self.run_releasing(events, store, || {}).await
    }

    /// Like [`Generation::run`], calling `release` once the reply is
    /// persisted and before `finish` is emitted.
    pub async fn run_releasing<F>(
        self,
        events: &EventSink,
        store: &dyn ChatStore,
        release: F,
    ) -> GenerationOutcome
    where
        F: FnOnce() + Send,
    {
        let started = std::time::Instant::now();
        let mut state = LoopState::Idle;
        tracing::info!(
            chat_id = %self.chat_id,
            model = %self.model,
            reasoning = self.reasoning,
            tools = self.tools.len(),
            "Generation starting"
        );
        events.emit(SessionEvent::Start {
            message_id: self.message_id.clone(),
            chat_id: self.chat_id.clone(),
        });

        let active = if self.reasoning {
            ToolRegistry::new()
        } else {
            self.tools.clone()
        };
        let tool_definitions = active.definitions();

        let mut messages = Vec::with_capacity(self.history.len() + 1);
        messages.push(Message::system(self.system_prompt.clone()));
        messages.extend(self.history.iter().cloned());

        let mut parts: Vec<MessagePart> = Vec::new();
        let mut usage = Usage::default();
        let mut finish_reason = FinishReason::MaxSteps;
        let mut steps = 0;

        for step in 1..=self.max_steps {
            if Instant::now() >= self.deadline {
                self.deadline_passed();
                finish_reason = FinishReason::Timeout;
                state = LoopState::Stopped;
                break;
            }
            steps = step;
            state = LoopState::Streaming { step };
            tracing::debug!(chat_id = %self.chat_id, step, "Generation step starting");

            let request = CompletionRequest {
                messages: messages.clone(),
                tools: tool_definitions.clone(),
                model: self.model.clone(),
                temperature: None,
                max_tokens: None,
            };

            let mut step_text = String::new();
            let mut calls: Vec<PendingCall> = Vec::new();
            let end = self
                .stream_step(request, events, &mut step_text, &mut calls, &mut usage)
                .await;

            if !step_text.is_empty() {
                parts.push(MessagePart::Text {
                    text: step_text.clone(),
                });
            }

            let mut assistant = Message {
                role: Role::Assistant,
                content: Vec::new(),
            };
            if !step_text.is_empty() {
                assistant.content.push(ContentPart::Text { text: step_text });
            }
            for call in &calls {
                assistant.content.push(ContentPart::ToolCall {
                    id: call.id.clone(),
                    name: call.name.clone(),
                    arguments: call.arguments.clone(),
                });
            }

            match end {
                StepEnd::TimedOut => {
                    finish_reason = FinishReason::Timeout;
                    state = LoopState::Stopped;
                    break;
                }
                StepEnd::Failed => {
                    finish_reason = FinishReason::Error;
                    state = LoopState::Stopped;
                    break;
                }
                StepEnd::Finished => {}
            }

            if calls.is_empty() {
                finish_reason = FinishReason::Stop;
                state = LoopState::Completed;
                break;
            }
            messages.push(assistant);

            let mut timed_out = false;
            for call in calls {
                let (input, result) = self.execute_call(&active, &call, events).await;
                if result.is_none() {
                    timed_out = true;
                }
                let result = result.unwrap_or_else(|| {
                    ToolResult::error(format!("Tool '{}' timed out", call.name))
                });
                messages.push(Message {
                    role: Role::Tool,
                    content: vec![ContentPart::ToolResult {
                        tool_call_id: call.id.clone(),
                        content: result.output.clone(),
                    }],
                });
                parts.push(MessagePart::ToolInvocation {
                    tool_call_id: call.id,
                    tool_name: call.name,
                    input,
                    output: Some(result.output),
                    is_error: !result.success,
                });
                if timed_out {
                    break;
                }
            }

            if timed_out {
                finish_reason = FinishReason::Timeout;
                state = LoopState::Stopped;
                break;
            }
            if step == self.max_steps {
                tracing::info!(chat_id = %self.chat_id, step, "Step ceiling reached");
                state = LoopState::Stopped;
            }
        }

        let message = self.persist(store, parts).await;
        release();

        events.emit(SessionEvent::Finish {
            finish_reason,
            usage: Some(usage.clone()),
        });
        tracing::info!(
            chat_id = %self.chat_id,
            steps,
            state = ?state,
            finish_reason = ?finish_reason,
            total_tokens = usage.total_tokens,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Generation finished"
        );

        GenerationOutcome {
            state,
            finish_reason,
            steps,
            usage,
            message,
        }
    }

    async fn stream_step(
        &self,
        request: CompletionRequest,
        events: &EventSink,
        text: &mut String,
        calls: &mut Vec<PendingCall>,
        usage: &mut Usage,
    ) -> StepEnd {
        let mut stream = match timeout_at(self.deadline, self.provider.complete_stream(request)).await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                tracing::error!(chat_id = %self.chat_id, error = %e, "Model request failed");
                events.emit(SessionEvent::Error {
                    error_text: "The model backend is unavailable".to_string(),
                    tool_call_id: None,
                });
                return StepEnd::Failed;
            }
            Err(_) => return self.deadline_passed(),
        };

        loop {
            let chunk = match timeout_at(self.deadline, stream.next()).await {
                Ok(Some(chunk)) => chunk,
                Ok(None) => return StepEnd::Finished,
                Err(_) => return self.deadline_passed(),
            };
            match chunk {
                StreamChunk::Text(delta) => {
                    if delta.is_empty() {
                        continue;
                    }
                    text.push_str(&delta);
                    events.emit(SessionEvent::TextDelta { delta });
                }
                StreamChunk::ToolCallStart { id, name } => {
                    if !calls.iter().any(|c| c.id == id) {
                        calls.push(PendingCall {
                            id,
                            name,
                            arguments: String::new(),
                        });
                    }
                }
                StreamChunk::ToolCallDelta {
                    id,
                    arguments_delta,
                } => match calls.iter_mut().find(|c| c.id == id) {
                    Some(call) => call.arguments.push_str(&arguments_delta),
                    None => tracing::warn!(tool_call_id = %id, "Arguments for unknown tool call"),
                },
                StreamChunk::ToolCallEnd { .. } => {}
                StreamChunk::Done { usage: Some(step_usage) } => {
                    TOKEN_USAGE.record_model_usage(&self.model, TokenCounts::from(&step_usage));
                    usage.add(&step_usage);
                }
                StreamChunk::Done { usage: None } => {}
                StreamChunk::Error(e) => {
                    tracing::error!(chat_id = %self.chat_id, error = %e, "Model stream failed");
                    events.emit(SessionEvent::Error {
                        error_text: "The model stream was interrupted".to_string(),
                        tool_call_id: None,
                    });
                    return StepEnd::Failed;
                }
            }
        }
    }

    fn deadline_passed(&self) -> StepEnd {
        tracing::warn!(chat_id = %self.chat_id, "Generation deadline reached");
        StepEnd::TimedOut
    }

    /// Run one tool call. `None` means the deadline passed mid-call.
    async fn execute_call(
        &self,
        active: &ToolRegistry,
        call: &PendingCall,
        events: &EventSink,
    ) -> (Value, Option<ToolResult>) {
        let parsed = if call.arguments.trim().is_empty() {
            Ok(json!({}))
        } else {
            serde_json::from_str::<Value>(&call.arguments)
        };
        let input = match &parsed {
            Ok(value) => value.clone(),
            Err(_) => Value::String(call.arguments.clone()),
        };

        events.emit(SessionEvent::ToolCall {
            tool_call_id: call.id.clone(),
            tool_name: call.name.clone(),
            input: input.clone(),
        });
        let ctx = ToolContext::new(call.id.clone(), call.name.clone(), events.clone());

        let result = match (active.get(&call.name), parsed) {
            (None, _) => {
                tracing::warn!(tool = %call.name, "Model requested an unknown tool");
                Some(ToolResult::error(format!(
                    "Tool '{}' is not available",
                    call.name
                )))
            }
            (Some(_), Err(e)) => Some(ToolResult::error(format!(
                "Tool '{}' received malformed arguments: {e}",
                call.name
            ))),
            (Some(tool), Ok(args)) => match tool.contract().validate(&args) {
                Err(violation) => Some(ToolResult::error(format!(
                    "Tool '{}' received invalid arguments: {violation}",
                    call.name
                ))),
                Ok(()) => {
                    let started = std::time::Instant::now();
                    let outcome = timeout_at(self.deadline, tool.execute(args, &ctx)).await;
                    tracing::info!(
                        chat_id = %self.chat_id,
                        tool = %call.name,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Tool call finished"
                    );
                    match outcome {
                        Ok(Ok(result)) => Some(result),
                        Ok(Err(e)) => {
                            tracing::warn!(tool = %call.name, error = %e, "Tool execution failed");
                            Some(ToolResult::error(format!(
                                "Tool '{}' failed: {e:#}",
                                call.name
                            )))
                        }
                        Err(_) => None,
                    }
                }
            },
        };

        match &result {
            Some(result) => ctx.publish(result),
            None => ctx.publish(&ToolResult::error(format!(
                "Tool '{}' timed out",
                call.name
            ))),
        }
        (input, result)
    }

    async fn persist(&self, store: &dyn ChatStore, parts: Vec<MessagePart>) -> Option<DbMessage> {
        if parts.is_empty() {
            tracing::error!(
                chat_id = %self.chat_id,
                "Generation produced no assistant message"
            );
            return None;
        }

        // Strictly after the user message, even on a coarse clock.
        let created_at = std::cmp::max(
            Utc::now(),
            self.user_message.created_at + chrono::Duration::milliseconds(1),
        );
        let message = DbMessage {
            id: self.message_id.clone(),
            chat_id: self.chat_id.clone(),
            role: MessageRole::Assistant,
            parts,
            created_at,
        };

        match store
            .save_messages(&[self.user_message.clone(), message.clone()])
            .await
        {
            Ok(()) => Some(message),
            Err(e) => {
                tracing::error!(chat_id = %self.chat_id, error = %e, "Failed to persist assistant message");
                None
            }
        }
    }
}

/// Convert stored messages into the model's message format.
///
/// Tool invocations recorded on an assistant message become a tool call on
/// the assistant turn followed by a tool-result turn.
pub fn to_provider_messages(messages: &[DbMessage]) -> Vec<Message> {
    let mut out = Vec::with_capacity(messages.len());
    for message in messages {
        match message.role {
            MessageRole::User | MessageRole::System | MessageRole::Tool => {
                let role = match message.role {
                    MessageRole::System => Role::System,
                    _ => Role::User,
                };
                let content = message
                    .parts
                    .iter()
                    .filter_map(|part| match part {
                        MessagePart::Text { text } => Some(ContentPart::Text { text: text.clone() }),
                        MessagePart::File { media_type, url, .. } => Some(ContentPart::Image {
                            url: url.clone(),
                            mime_type: Some(media_type.clone()),
                        }),
                        MessagePart::ToolInvocation { .. } => None,
                    })
                    .collect();
                out.push(Message { role, content });
            }
            MessageRole::Assistant => {
                let mut content = Vec::new();
                let mut results = Vec::new();
                for part in &message.parts {
                    match part {
                        MessagePart::Text { text } => {
                            if !results.is_empty() {
                                flush_assistant(&mut out, &mut content, &mut results);
                            }
                            content.push(ContentPart::Text { text: text.clone() });
                        }
                        MessagePart::ToolInvocation {
                            tool_call_id,
                            tool_name,
                            input,
                            output,
                            ..
                        } => {
                            content.push(ContentPart::ToolCall {
                                id: tool_call_id.clone(),
                                name: tool_name.clone(),
                                arguments: input.to_string(),
                            });
                            results.push(ContentPart::ToolResult {
                                tool_call_id: tool_call_id.clone(),
                                content: output.clone().unwrap_or_default(),
                            });
                        }
                        MessagePart::File { .. } => {}
                    }
                }
                flush_assistant(&mut out, &mut content, &mut results);
            }
        }
    }
    out
}

fn flush_assistant(
    out: &mut Vec<Message>,
    content: &mut Vec<ContentPart>,
    results: &mut Vec<ContentPart>,
) {
    if !content.is_empty() {
        out.push(Message {
            role: Role::Assistant,
            content: std::mem::take(content),
        });
    }
    if !results.is_empty() {
        out.push(Message {
            role: Role::Tool,
            content: std::mem::take(results),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::mock::ScriptedProvider;
    use crate::store::MemoryStore;
    use crate::tool::{ParamContract, ParamKind, Tool};
    use anyhow::Result;
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::sync::broadcast;

    struct Lookup {
        contract: ParamContract,
    }

    impl Lookup {
        fn new() -> Self {
            Self {
                contract: ParamContract::new().param("city", ParamKind::String, true, None),
            }
        }
    }

    #[async_trait]
    impl Tool for Lookup {
        fn id(&self) -> &str {
            "lookup"
        }
        fn description(&self) -> &str {
            "Look up a city"
        }
        fn contract(&self) -> &ParamContract {
            &self.contract
        }
        async fn execute(&self, args: Value, _ctx: &ToolContext) -> Result<ToolResult> {
            Ok(ToolResult::success(format!("sunny in {}", args["city"].as_str().unwrap_or("?"))))
        }
    }

    fn user_message(chat_id: &str, text: &str) -> DbMessage {
        DbMessage {
            id: "u1".to_string(),
            chat_id: chat_id.to_string(),
            role: MessageRole::User,
            parts: vec![MessagePart::Text {
                text: text.to_string(),
            }],
            created_at: Utc::now(),
        }
    }

    fn generation(provider: Arc<dyn Provider>, tools: ToolRegistry, reasoning: bool) -> Generation {
        let user = user_message("c1", "hi");
        Generation {
            chat_id: "c1".to_string(),
            message_id: "a1".to_string(),
            history: to_provider_messages(std::slice::from_ref(&user)),
            user_message: user,
            provider,
            model: "test-model".to_string(),
            system_prompt: "be brief".to_string(),
            tools,
            reasoning,
            max_steps: 5,
            deadline: Instant::now() + Duration::from_secs(10),
        }
    }

    fn drain(rx: &mut broadcast::Receiver<SessionEvent>) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn lookup_registry() -> ToolRegistry {
        let mut tools = ToolRegistry::new();
        tools.register(Arc::new(Lookup::new()));
        tools
    }

    #[tokio::test]
    async fn text_only_turn_completes_and_persists() {
        let provider = ScriptedProvider::new(vec![ScriptedProvider::text_step("four")]);
        let store = MemoryStore::new();
        let sink = EventSink::new(64);
        let mut rx = sink.subscribe();

        let outcome = generation(Arc::new(provider), ToolRegistry::new(), false)
            .run(&sink, &store)
            .await;

        assert_eq!(outcome.state, LoopState::Completed);
        assert_eq!(outcome.finish_reason, FinishReason::Stop);
        assert_eq!(outcome.usage.total_tokens, 15);
        let stored = store.get_messages_by_chat("c1").await.unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[1].text(), "four");

        let events = drain(&mut rx);
        let kinds: Vec<&str> = events.iter().map(SessionEvent::kind).collect();
        assert_eq!(kinds, vec!["start", "text-delta", "text-delta", "finish"]);
    }

    #[tokio::test]
    async fn tool_results_feed_the_next_step_in_order() {
        let provider = ScriptedProvider::new(vec![
            ScriptedProvider::tool_call_step("call_1", "lookup", json!({"city": "Rome"})),
            ScriptedProvider::text_step("It is sunny."),
        ]);
        let store = MemoryStore::new();
        let sink = EventSink::new(64);
        let mut rx = sink.subscribe();

        let outcome = generation(Arc::new(provider.clone()), lookup_registry(), false)
            .run(&sink, &store)
            .await;
        assert_eq!(outcome.steps, 2);

        let requests = provider.requests();
        let tool_turn = requests[1].messages.last().unwrap();
        assert_eq!(tool_turn.role, Role::Tool);
        assert_eq!(
            tool_turn.content[0],
            ContentPart::ToolResult {
                tool_call_id: "call_1".to_string(),
                content: "sunny in Rome".to_string()
            }
        );
        assert_eq!(requests[0].tools.len(), 1);

        let kinds: Vec<&str> = drain(&mut rx).iter().map(SessionEvent::kind).collect();
        assert_eq!(
            kinds,
            vec!["start", "tool-call", "tool-result", "text-delta", "text-delta", "finish"]
        );

        let message = outcome.message.unwrap();
        assert!(matches!(
            &message.parts[0],
            MessagePart::ToolInvocation { output: Some(out), is_error: false, .. } if out == "sunny in Rome"
        ));
    }

    #[tokio::test]
    async fn unknown_tools_and_bad_arguments_become_narratives() {
        let provider = ScriptedProvider::new(vec![
            ScriptedProvider::tool_call_step("call_1", "missing", json!({})),
            ScriptedProvider::tool_call_step("call_2", "lookup", json!({"town": "Rome"})),
            ScriptedProvider::text_step("Sorry."),
        ]);
        let store = MemoryStore::new();
        let sink = EventSink::new(64);
        let mut rx = sink.subscribe();

        let outcome = generation(Arc::new(provider.clone()), lookup_registry(), false)
            .run(&sink, &store)
            .await;
        assert_eq!(outcome.state, LoopState::Completed);

        let errors: Vec<String> = drain(&mut rx)
            .into_iter()
            .filter_map(|e| match e {
                SessionEvent::Error { error_text, .. } => Some(error_text),
                _ => None,
            })
            .collect();
        assert_eq!(errors[0], "Tool 'missing' is not available");
        assert!(errors[1].starts_with("Tool 'lookup' received invalid arguments"));
    }

    #[tokio::test]
    async fn reasoning_mode_exposes_no_tools() {
        let provider = ScriptedProvider::new(vec![
            ScriptedProvider::tool_call_step("call_1", "lookup", json!({"city": "Rome"})),
            ScriptedProvider::text_step("Thinking done."),
        ]);
        let store = MemoryStore::new();
        let sink = EventSink::new(64);

        generation(Arc::new(provider.clone()), lookup_registry(), true)
            .run(&sink, &store)
            .await;

        let requests = provider.requests();
        assert!(requests.iter().all(|r| r.tools.is_empty()));
        let tool_turn = requests[1].messages.last().unwrap();
        assert!(matches!(
            &tool_turn.content[0],
            ContentPart::ToolResult { content, .. } if content == "Tool 'lookup' is not available"
        ));
    }

    #[tokio::test]
    async fn step_ceiling_stops_without_error_event() {
        let provider = ScriptedProvider::new(vec![ScriptedProvider::tool_call_step(
            "call_1",
            "lookup",
            json!({"city": "Rome"}),
        )])
        .repeating();
        let store = MemoryStore::new();
        let sink = EventSink::new(256);
        let mut rx = sink.subscribe();

        let outcome = generation(Arc::new(provider.clone()), lookup_registry(), false)
            .run(&sink, &store)
            .await;

        assert_eq!(outcome.state, LoopState::Stopped);
        assert_eq!(outcome.finish_reason, FinishReason::MaxSteps);
        assert_eq!(provider.request_count(), 5);
        assert!(outcome.message.is_some());
        assert!(
            !drain(&mut rx)
                .iter()
                .any(|e| matches!(e, SessionEvent::Error { .. }))
        );
    }

    #[tokio::test]
    async fn deadline_stops_a_slow_model() {
        let provider = ScriptedProvider::new(vec![ScriptedProvider::text_step("slow answer")])
            .with_chunk_delay(Duration::from_millis(200));
        let store = MemoryStore::new();
        let sink = EventSink::new(64);

        let mut generation = generation(Arc::new(provider), ToolRegistry::new(), false);
        generation.deadline = Instant::now() + Duration::from_millis(300);
        let outcome = generation.run(&sink, &store).await;

        assert_eq!(outcome.finish_reason, FinishReason::Timeout);
        assert_eq!(outcome.state, LoopState::Stopped);
        // The first half arrived before the deadline and is kept.
        assert_eq!(outcome.message.unwrap().text(), "slow ");
    }

    #[tokio::test]
    async fn expired_deadline_skips_the_model() {
        let provider = ScriptedProvider::new(vec![ScriptedProvider::text_step("too late")]);
        let store = MemoryStore::new();
        let sink = EventSink::new(64);

        let mut generation = generation(Arc::new(provider.clone()), ToolRegistry::new(), false);
        generation.deadline = Instant::now();
        let outcome = generation.run(&sink, &store).await;

        assert_eq!(outcome.finish_reason, FinishReason::Timeout);
        assert_eq!(outcome.steps, 0);
        assert_eq!(provider.request_count(), 0);
    }

    #[tokio::test]
    async fn release_runs_after_persist_and_before_finish() {
        let provider = ScriptedProvider::new(vec![ScriptedProvider::text_step("four")]);
        let store = MemoryStore::new();
        let sink = EventSink::new(64);
        let mut rx = sink.subscribe();
        let seen = Arc::new(parking_lot::Mutex::new(None));

        let observed = Arc::clone(&seen);
        let mut check = rx.resubscribe();
        generation(Arc::new(provider), ToolRegistry::new(), false)
            .run_releasing(&sink, &store, move || {
                let kinds: Vec<&str> = drain(&mut check).iter().map(|e| e.kind()).collect();
                *observed.lock() = Some(kinds);
            })
            .await;

        let before_release = seen.lock().clone().unwrap();
        assert!(!before_release.contains(&"finish"));
        assert_eq!(drain(&mut rx).last().map(|e| e.kind()), Some("finish"));
        assert_eq!(store.get_messages_by_chat("c1").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn empty_turn_persists_nothing() {
        let provider = ScriptedProvider::new(vec![]);
        let store = MemoryStore::new();
        let sink = EventSink::new(64);
        let outcome = generation(Arc::new(provider), ToolRegistry::new(), false)
            .run(&sink, &store)
            .await;
        assert!(outcome.message.is_none());
        assert!(store.get_messages_by_chat("c1").await.unwrap().is_empty());
    }

    #[test]
    fn stored_tool_invocations_expand_into_tool_turns() {
        let assistant = DbMessage {
            id: "a1".to_string(),
            chat_id: "c1".to_string(),
            role: MessageRole::Assistant,
            parts: vec![
                MessagePart::ToolInvocation {
                    tool_call_id: "call_1".to_string(),
                    tool_name: "lookup".to_string(),
                    input: json!({"city": "Rome"}),
                    output: Some("sunny".to_string()),
                    is_error: false,
                },
                MessagePart::Text {
                    text: "It is sunny.".to_string(),
                },
            ],
            created_at: Utc::now(),
        };
        let converted = to_provider_messages(&[user_message("c1", "weather?"), assistant]);
        let roles: Vec<Role> = converted.iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![Role::User, Role::Assistant, Role::Tool, Role::Assistant]
        );
    }
}
