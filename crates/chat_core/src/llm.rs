/* Copyright 2023- The Binedge, Lda team. All rights reserved.
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *     http://www.apache.org/licenses/LICENSE-2.0
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! The LLM provider, modeled as two capabilities: streaming response generation and
//! embedding-vector generation, plus a non-streaming structured-output call used by the
//! memory extraction pipeline.

use futures::Stream;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;

/// Failures surfaced by an [`LlmGateway`]. Network/provider errors are never shown to end
/// users verbatim; callers decide whether to retry or propagate.
#[derive(Debug, Error)]
pub enum LlmGatewayError {
    #[error("failed to reach the model provider: {0}")]
    Transport(String),

    #[error("the model provider returned an error: {0}")]
    Provider(String),

    #[error("the model provider returned a malformed response: {0}")]
    MalformedResponse(String),
}

/// One delta emitted from a [`StreamHandle`].
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// A chunk of assistant text, in strict provider order.
    TextDelta(String),
    /// The stream finished normally.
    Completed,
    /// The stream was aborted via [`StreamHandle::abort`]. This is never emitted after an
    /// `Error` or another `Aborted`/`Completed` event.
    Aborted,
    /// The stream ended because of an upstream error.
    Error(LlmGatewayError),
}

/// A single in-flight streaming completion.
///
/// `abort` is idempotent: calling it more than once, or after the stream has already
/// completed, has no additional effect. After `abort`, the stream emits no further text
/// deltas and its terminal event is `Aborted`, never `Error`.
pub trait StreamHandle: Send {
    /// The stream of deltas, terminated by exactly one of `Completed`, `Aborted`, or `Error`.
    /// Borrows `self` mutably for the life of the returned stream, so callers that need to
    /// abort concurrently with iterating it should grab [`StreamHandle::abort_trigger`]
    /// first.
    fn events(&mut self) -> Pin<Box<dyn Stream<Item = StreamEvent> + Send + '_>>;

    /// Requests cancellation of the underlying generation. Idempotent.
    fn abort(&self);

    /// A cheap, independently-ownable equivalent of [`StreamHandle::abort`], obtainable
    /// before `events()` takes `self` for the duration of the stream.
    fn abort_trigger(&self) -> Arc<dyn Fn() + Send + Sync>;
}

/// The LLM provider, as an external collaborator: interfaces only, no embedded inference.
#[async_trait::async_trait]
pub trait LlmGateway: Send + Sync {
    /// Starts a streaming completion for `prompt`. The returned handle yields deltas in
    /// strict FIFO order; the gateway must never reorder them.
    async fn stream_response(
        &self,
        prompt: &str,
        instructions: Option<&str>,
    ) -> Result<Box<dyn StreamHandle>, LlmGatewayError>;

    /// Embeds a batch of texts, returning one fixed-dimension vector per input in the same
    /// order. Implementations should prefer a single batched provider call.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LlmGatewayError>;

    /// A single non-streaming response, used for fact extraction and memory
    /// reconciliation. Implementations must clamp temperature to 0 for determinism.
    async fn generate_structured(&self, prompt: &str) -> Result<String, LlmGatewayError>;
}
