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

//! The per-connection state machine: one [`StreamSocketRuntime`] per upgraded socket.
//!
//! `welcome`/`input` frames are serialized through an unbounded work queue drained by a
//! single dedicated worker task, so at most one turn ever runs at a time and turns
//! complete in receive order. `abort`/`bye` bypass that queue entirely: they act on
//! shared state (`active_cancel`, a generation counter) straight from the frame-reading
//! task, so they are never stuck behind a `send` the way they would be on a bounded
//! channel shared with `welcome`/`input`.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use chat_core::LlmGateway;

use crate::maid::{MaidError, MaidHandler, TurnContext};
use crate::protocol::{close_code, ClientMessage, ServerMessage};
use crate::services::{MemoryService, SessionService};

/// Raised by [`StreamSocketRuntime::new`] when `maidId` doesn't resolve against
/// [`crate::maid::MAIDS`]. The caller (the upgrade handler) turns this into the
/// Unrouted-state close-1008 behavior before a runtime is even constructed.
#[derive(Debug, Error)]
#[error("unknown maidId: {0}")]
pub struct UnknownMaidError(pub String);

/// Tells the socket's outer write loop to close the connection, and with what code.
#[derive(Debug, Clone, Copy)]
pub enum CloseSignal {
    /// Client said `bye`, or the runtime decided to close normally.
    Normal,
    /// A policy violation: unknown maid, or a session the caller doesn't own.
    Policy(&'static str),
}

impl CloseSignal {
    pub fn code(&self) -> u16 {
        match self {
            CloseSignal::Normal => close_code::NORMAL,
            CloseSignal::Policy(_) => close_code::POLICY_VIOLATION,
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            CloseSignal::Normal => "bye",
            CloseSignal::Policy(reason) => reason,
        }
    }
}

enum WorkKind {
    Welcome,
    Input(String),
}

struct WorkItem {
    generation: u64,
    kind: WorkKind,
}

/// Per-connection state machine. Constructed once the upgrade handler has resolved
/// `maidId`, `userId`, and an optional starting `sessionId`; lives for the socket's
/// lifetime.
pub struct StreamSocketRuntime {
    outbound: UnboundedSender<ServerMessage>,
    close_tx: UnboundedSender<CloseSignal>,
    work_tx: UnboundedSender<WorkItem>,
    generation: Arc<AtomicU64>,
    active_cancel: Arc<Mutex<Option<CancellationToken>>>,
    closing: Arc<AtomicBool>,
}

impl StreamSocketRuntime {
    /// Resolves `maid_id` and spawns the worker task. `session_id` seeds the socket's
    /// pinned session, if the caller connected with one (e.g. `?sessionId=N` at upgrade).
    pub fn new(
        maid_id: &str,
        user_id: String,
        session_id: Option<i64>,
        sessions: Arc<SessionService>,
        memories: Arc<MemoryService>,
        llm: Arc<dyn LlmGateway>,
        outbound: UnboundedSender<ServerMessage>,
        close_tx: UnboundedSender<CloseSignal>,
    ) -> Result<Self, UnknownMaidError> {
        let maid = crate::maid::MAIDS
            .get(maid_id)
            .cloned()
            .ok_or_else(|| UnknownMaidError(maid_id.to_string()))?;

        let (work_tx, mut work_rx) = mpsc::unbounded_channel::<WorkItem>();
        let generation = Arc::new(AtomicU64::new(0));
        let active_cancel: Arc<Mutex<Option<CancellationToken>>> = Arc::new(Mutex::new(None));
        let closing = Arc::new(AtomicBool::new(false));
        let current_session_id = Arc::new(Mutex::new(session_id));

        let worker_generation = Arc::clone(&generation);
        let worker_active_cancel = Arc::clone(&active_cancel);
        let worker_closing = Arc::clone(&closing);
        let worker_outbound = outbound.clone();
        let worker_close_tx = close_tx.clone();

        tokio::spawn(async move {
            while let Some(item) = work_rx.recv().await {
                if item.generation != worker_generation.load(Ordering::SeqCst) {
                    // Discarded by an abort/bye that bumped the generation after this
                    // item was enqueued but before the worker got to it.
                    continue;
                }

                let cancel = CancellationToken::new();
                *worker_active_cancel.lock().unwrap() = Some(cancel.clone());

                let session_id = *current_session_id.lock().unwrap();
                let ctx = TurnContext {
                    user_id: user_id.clone(),
                    sessions: Arc::clone(&sessions),
                    memories: Arc::clone(&memories),
                    llm: Arc::clone(&llm),
                    emit: worker_outbound.clone(),
                    cancel,
                    current_session_id: Arc::clone(&current_session_id),
                };

                let result = match item.kind {
                    WorkKind::Welcome => maid.on_welcome(&ctx, session_id).await,
                    WorkKind::Input(content) => maid.on_input(&ctx, session_id, content).await,
                };

                *worker_active_cancel.lock().unwrap() = None;

                if let Err(err) = result {
                    let is_closing = worker_closing.load(Ordering::SeqCst);
                    let message = err.message();
                    match err {
                        MaidError::SessionNotFound => {
                            if !is_closing {
                                worker_outbound
                                    .send(ServerMessage::Error { message })
                                    .ok();
                            }
                            worker_closing.store(true, Ordering::SeqCst);
                            worker_close_tx
                                .send(CloseSignal::Policy("session not found"))
                                .ok();
                        }
                        MaidError::Other(_) => {
                            if !is_closing {
                                worker_outbound
                                    .send(ServerMessage::Error { message })
                                    .ok();
                            }
                        }
                    }
                }
            }
        });

        Ok(StreamSocketRuntime {
            outbound,
            close_tx,
            work_tx,
            generation,
            active_cancel,
            closing,
        })
    }

    /// Handles one inbound text frame. Binary frames are never passed here; the caller
    /// filters them out per spec.
    pub fn handle_frame(&self, raw: &str) {
        if self.closing.load(Ordering::SeqCst) {
            return;
        }

        match crate::protocol::parse_client_message(raw) {
            Ok(ClientMessage::Welcome) => self.enqueue(WorkKind::Welcome),
            Ok(ClientMessage::Input { content }) => self.enqueue(WorkKind::Input(content)),
            Ok(ClientMessage::Abort) => self.abort(),
            Ok(ClientMessage::Bye) => self.bye(),
            Err(message) => {
                self.outbound.send(ServerMessage::Error { message }).ok();
            }
        }
    }

    fn enqueue(&self, kind: WorkKind) {
        let generation = self.generation.load(Ordering::SeqCst);
        self.work_tx.send(WorkItem { generation, kind }).ok();
    }

    /// Cancels the active stream (a no-op if none is running) and discards anything
    /// still queued, without emitting an error frame.
    fn abort(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(cancel) = self.active_cancel.lock().unwrap().as_ref() {
            cancel.cancel();
        }
    }

    /// Graceful close: abort whatever is running, discard the queue, and ask the outer
    /// loop to close the socket with code 1000.
    fn bye(&self) {
        self.closing.store(true, Ordering::SeqCst);
        self.abort();
        self.close_tx.send(CloseSignal::Normal).ok();
    }

    /// Called by the outer loop when the transport itself closes, to stop any in-flight
    /// turn the same way an explicit `bye` would.
    pub fn on_transport_close(&self) {
        self.closing.store(true, Ordering::SeqCst);
        self.abort();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use async_trait::async_trait;
    use chat_core::llm::{LlmGatewayError, StreamEvent, StreamHandle};
    use chat_core::store::StoreError;
    use chat_core::{Memory, Message, Session};
    use chat_queue_redis::{ExtractionSignaler, QueueError};
    use futures::Stream;
    use std::pin::Pin;
    use tokio::sync::mpsc::unbounded_channel;
    use tokio::time::{timeout, Duration};

    struct NullStore;

    #[async_trait]
    impl chat_core::Store for NullStore {
        async fn insert_session(&self, user_id: &str) -> Result<Session, StoreError> {
            let now = time::OffsetDateTime::now_utc();
            Ok(Session {
                id: 1,
                user_id: user_id.to_string(),
                title: None,
                metadata: serde_json::json!({}),
                created_at: now,
                updated_at: now,
            })
        }
        async fn find_session(&self, _id: i64, _user_id: &str) -> Result<Option<Session>, StoreError> {
            Ok(None)
        }
        async fn append_message(
            &self,
            session_id: i64,
            role: chat_core::MessageRole,
            content: &str,
            metadata: serde_json::Value,
        ) -> Result<Message, StoreError> {
            let now = time::OffsetDateTime::now_utc();
            Ok(Message {
                id: 1,
                session_id,
                role,
                content: content.to_string(),
                metadata,
                extracted_at: None,
                created_at: now,
                updated_at: now,
            })
        }
        async fn list_messages_by_session(&self, _: i64, _: i64) -> Result<Vec<Message>, StoreError> {
            Ok(vec![])
        }
        async fn list_messages_across_user_sessions(
            &self,
            _: &str,
            _: i64,
        ) -> Result<Vec<Message>, StoreError> {
            Ok(vec![])
        }
        async fn list_pending_messages(&self, _: &str) -> Result<Vec<Message>, StoreError> {
            Ok(vec![])
        }
        async fn mark_messages_extracted(&self, _: &[i64], _: time::OffsetDateTime) -> Result<(), StoreError> {
            Ok(())
        }
        async fn find_nearby_memories(
            &self,
            _: &str,
            _: &[f32],
            _: f32,
            _: i64,
        ) -> Result<Vec<chat_core::store::NearbyMemory>, StoreError> {
            Ok(vec![])
        }
        async fn list_recent_memories(&self, _: &str, _: i64) -> Result<Vec<Memory>, StoreError> {
            Ok(vec![])
        }
        async fn apply_memory_actions(
            &self,
            _: &str,
            _: Vec<chat_core::store::MemoryAction>,
        ) -> Result<chat_core::store::ExtractionTxStats, StoreError> {
            Ok(Default::default())
        }
    }

    struct NullStreamHandle;

    impl StreamHandle for NullStreamHandle {
        fn events(&mut self) -> Pin<Box<dyn Stream<Item = StreamEvent> + Send + '_>> {
            Box::pin(futures::stream::once(async { StreamEvent::Completed }))
        }
        fn abort(&self) {}
        fn abort_trigger(&self) -> Arc<dyn Fn() + Send + Sync> {
            Arc::new(|| {})
        }
    }

    struct NullLlm;

    #[async_trait]
    impl LlmGateway for NullLlm {
        async fn stream_response(
            &self,
            _prompt: &str,
            _instructions: Option<&str>,
        ) -> Result<Box<dyn StreamHandle>, LlmGatewayError> {
            Ok(Box::new(NullStreamHandle))
        }
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LlmGatewayError> {
            Ok(texts.iter().map(|_| vec![0.0]).collect())
        }
        async fn generate_structured(&self, _prompt: &str) -> Result<String, LlmGatewayError> {
            Ok("{}".to_string())
        }
    }

    struct NullSignaler;

    #[async_trait]
    impl ExtractionSignaler for NullSignaler {
        async fn signal(&self, _user_id: &str) -> Result<(), QueueError> {
            Ok(())
        }
    }

    fn build_runtime(
        session_id: Option<i64>,
    ) -> (
        StreamSocketRuntime,
        mpsc::UnboundedReceiver<ServerMessage>,
        mpsc::UnboundedReceiver<CloseSignal>,
    ) {
        let store: Arc<dyn chat_core::Store> = Arc::new(NullStore);
        let llm: Arc<dyn LlmGateway> = Arc::new(NullLlm);
        let sessions = Arc::new(SessionService::new(Arc::clone(&store)));
        let memories = Arc::new(MemoryService::new(
            Arc::clone(&store),
            Arc::clone(&llm),
            Arc::new(NullSignaler),
            0.7,
            5,
        ));
        let (outbound_tx, outbound_rx) = unbounded_channel();
        let (close_tx, close_rx) = unbounded_channel();

        let runtime = StreamSocketRuntime::new(
            "chat",
            "user-1".to_string(),
            session_id,
            sessions,
            memories,
            llm,
            outbound_tx,
            close_tx,
        )
        .expect("chat maid is registered");

        (runtime, outbound_rx, close_rx)
    }

    #[tokio::test]
    async fn unknown_maid_id_is_rejected_before_construction() {
        let store: Arc<dyn chat_core::Store> = Arc::new(NullStore);
        let llm: Arc<dyn LlmGateway> = Arc::new(NullLlm);
        let sessions = Arc::new(SessionService::new(Arc::clone(&store)));
        let memories = Arc::new(MemoryService::new(
            store,
            Arc::clone(&llm),
            Arc::new(NullSignaler),
            0.7,
            5,
        ));
        let (outbound_tx, _outbound_rx) = unbounded_channel();
        let (close_tx, _close_rx) = unbounded_channel();

        let result = StreamSocketRuntime::new(
            "not-a-real-maid",
            "user-1".to_string(),
            None,
            sessions,
            memories,
            llm,
            outbound_tx,
            close_tx,
        );

        assert!(result.is_err());
    }

    #[tokio::test]
    async fn malformed_frame_emits_error_and_stays_open() {
        let (runtime, mut outbound_rx, _close_rx) = build_runtime(None);
        runtime.handle_frame("not json");

        let msg = timeout(Duration::from_secs(1), outbound_rx.recv())
            .await
            .expect("response within timeout")
            .expect("channel open");
        assert!(matches!(msg, ServerMessage::Error { .. }));
        assert!(!runtime.closing.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn welcome_runs_a_turn_to_completion() {
        let (runtime, mut outbound_rx, _close_rx) = build_runtime(None);
        runtime.handle_frame(r#"{"type":"welcome"}"#);

        let mut saw_session_created = false;
        let mut saw_stream_done = false;
        for _ in 0..3 {
            let msg = timeout(Duration::from_secs(1), outbound_rx.recv())
                .await
                .expect("response within timeout")
                .expect("channel open");
            match msg {
                ServerMessage::SessionCreated { .. } => saw_session_created = true,
                ServerMessage::StreamDone { .. } => {
                    saw_stream_done = true;
                    break;
                }
                _ => {}
            }
        }
        assert!(saw_session_created);
        assert!(saw_stream_done);
    }

    #[tokio::test]
    async fn abort_with_no_active_stream_is_a_safe_no_op() {
        let (runtime, _outbound_rx, _close_rx) = build_runtime(None);
        runtime.handle_frame(r#"{"type":"abort"}"#);
        assert!(!runtime.closing.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn bye_sets_closing_and_sends_a_normal_close_signal() {
        let (runtime, _outbound_rx, mut close_rx) = build_runtime(None);
        runtime.handle_frame(r#"{"type":"bye"}"#);

        let signal = timeout(Duration::from_secs(1), close_rx.recv())
            .await
            .expect("close signal within timeout")
            .expect("channel open");
        assert_eq!(signal.code(), close_code::NORMAL);
        assert!(runtime.closing.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn frames_after_bye_are_dropped() {
        let (runtime, mut outbound_rx, _close_rx) = build_runtime(None);
        runtime.handle_frame(r#"{"type":"bye"}"#);
        runtime.handle_frame(r#"{"type":"welcome"}"#);

        // Only cleanup/close-path traffic should ever show up; no fresh turn starts.
        let result = timeout(Duration::from_millis(200), outbound_rx.recv()).await;
        assert!(result.is_err(), "expected no further messages after bye");
    }
}
