//! Scripted in-memory backend for offline tests.
//!
//! Each call to `complete_stream` pops the next scripted step. Once the
//! script is exhausted the last step is replayed when `repeat_last` is set,
//! otherwise an empty completion is returned. Every request is recorded so
//! tests can assert on what the loop sent to the model.

use super::{CompletionRequest, Provider, StreamChunk, Usage};
use anyhow::Result;
use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
struct ScriptState {
    steps: VecDeque<Vec<StreamChunk>>,
    last: Option<Vec<StreamChunk>>,
    requests: Vec<CompletionRequest>,
}

#[derive(Clone, Default)]
pub struct ScriptedProvider {
    state: Arc<Mutex<ScriptState>>,
    repeat_last: bool,
    chunk_delay: Option<Duration>,
}

impl ScriptedProvider {
    pub fn new(steps: Vec<Vec<StreamChunk>>) -> Self {
        Self {
            state: Arc::new(Mutex::new(ScriptState {
                steps: steps.into(),
                ..Default::default()
            })),
            repeat_last: false,
            chunk_delay: None,
        }
    }

    /// Keep replaying the final step after the script runs out.
    pub fn repeating(mut self) -> Self {
        self.repeat_last = true;
        self
    }

    /// Sleep before yielding each chunk.
    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = Some(delay);
        self
    }

    /// A step that streams `text` in two halves and stops.
    pub fn text_step(text: &str) -> Vec<StreamChunk> {
        let (head, tail) = split_half(text);
        let mut chunks = Vec::new();
        for part in [head, tail] {
            if !part.is_empty() {
                chunks.push(StreamChunk::Text(part.to_string()));
            }
        }
        chunks.push(StreamChunk::Done {
            usage: Some(Usage {
                prompt_tokens: 10,
                completion_tokens: 5,
                total_tokens: 15,
            }),
        });
        chunks
    }

    /// A step that requests a single tool call.
    pub fn tool_call_step(id: &str, name: &str, arguments: serde_json::Value) -> Vec<StreamChunk> {
        let arguments = arguments.to_string();
        let (head, tail) = split_half(&arguments);
        vec![
            StreamChunk::ToolCallStart {
                id: id.to_string(),
                name: name.to_string(),
            },
            StreamChunk::ToolCallDelta {
                id: id.to_string(),
                arguments_delta: head.to_string(),
            },
            StreamChunk::ToolCallDelta {
                id: id.to_string(),
                arguments_delta: tail.to_string(),
            },
            StreamChunk::ToolCallEnd { id: id.to_string() },
            StreamChunk::Done {
                usage: Some(Usage {
                    prompt_tokens: 12,
                    completion_tokens: 4,
                    total_tokens: 16,
                }),
            },
        ]
    }

    /// Every request received so far, oldest first.
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.state.lock().requests.clone()
    }

    pub fn request_count(&self) -> usize {
        self.state.lock().requests.len()
    }
}

fn split_half(text: &str) -> (&str, &str) {
    let mid = text
        .char_indices()
        .nth(text.chars().count() / 2)
        .map(|(i, _)| i)
        .unwrap_or(text.len());
    text.split_at(mid)
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete_stream(
        &self,
        request: CompletionRequest,
    ) -> Result<futures::stream::BoxStream<'static, StreamChunk>> {
        let chunks = {
            let mut state = self.state.lock();
            state.requests.push(request);
            match state.steps.pop_front() {
                Some(step) => {
                    state.last = Some(step.clone());
                    step
                }
                None if self.repeat_last => state.last.clone().unwrap_or_default(),
                None => vec![StreamChunk::Done { usage: None }],
            }
        };

        let stream = futures::stream::iter(chunks);
        match self.chunk_delay {
            Some(delay) => Ok(stream
                .then(move |chunk| async move {
                    tokio::time::sleep(delay).await;
                    chunk
                })
                .boxed()),
            None => Ok(stream.boxed()),
        }
    }
}
