//! # Request Multiplexer
//!
//! Script-side bookkeeping that turns the one-string-in, snippet-out channel
//! into awaitable calls and token streams.
//!
//! Every request gets a fresh correlation id. One-shot calls park a oneshot
//! sender under that id until the host answers with `resolve` or `reject`;
//! streams park a small queue that `streamPush` appends to and
//! `streamEnd`/`streamError` close. Notifications for ids that are not
//! pending (already settled, timed out, never issued) are ignored.

use std::{
    collections::VecDeque,
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    task::{Context, Poll, Waker},
    time::Duration,
};

use dashmap::DashMap;
use futures::Stream;
use serde_json::{Map, Value};
use tokio::sync::oneshot;
use tracing::{debug, instrument, trace};

use super::CallError;
use crate::channel::CallIn;
use crate::engine::EngineStatus;
use crate::protocol::{
    request::BUDGET_FIELD, CorrelationId, EntryPoint, Envelope, Family, Operation,
};

type Settlement = Result<String, String>;

/// A one-shot call awaiting its settlement.
struct PendingCall {
    sender: oneshot::Sender<Settlement>,
}

#[derive(Debug, Default)]
struct StreamState {
    queued: VecDeque<String>,
    done: bool,
    error: Option<String>,
    waiter: Option<Waker>,
}

impl StreamState {
    fn push(&mut self, chunk: String) -> bool {
        if self.done {
            return false;
        }
        self.queued.push_back(chunk);
        self.wake();
        true
    }

    fn finish(&mut self, error: Option<String>) -> bool {
        if self.done {
            return false;
        }
        self.done = true;
        self.error = error;
        self.wake();
        true
    }

    fn wake(&mut self) {
        if let Some(waker) = self.waiter.take() {
            waker.wake();
        }
    }
}

type SharedStream = Arc<Mutex<StreamState>>;

fn lock(state: &SharedStream) -> MutexGuard<'_, StreamState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Inner {
    call_in: Arc<dyn CallIn>,
    next_id: AtomicU64,
    pending: DashMap<CorrelationId, PendingCall>,
    streams: DashMap<CorrelationId, SharedStream>,
    request_timeout: Option<Duration>,
}

impl Inner {
    fn allocate_id(&self) -> CorrelationId {
        self.next_id.fetch_add(1, Ordering::Relaxed).to_string()
    }

    /// Asks the host to stop a stream nobody is reading any more. The
    /// answer is addressed to an id that is never registered.
    fn abandon(&self, target: &str) {
        let cancel = EntryPoint::Cancel.to_string();
        if !self.call_in.is_bound(&cancel) {
            return;
        }
        let mut body = Map::new();
        body.insert("target".to_string(), Value::String(target.to_string()));
        let envelope = Envelope {
            id: self.allocate_id(),
            body,
        };
        debug!(%target, "stream dropped before completion; cancelling");
        self.call_in.invoke(&cancel, envelope.encode());
    }
}

/// Removes a call's pending entry however its future ends.
struct PendingGuard<'a> {
    inner: &'a Inner,
    id: &'a str,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.inner.pending.remove(self.id);
    }
}

#[derive(Clone)]
pub struct Multiplexer {
    inner: Arc<Inner>,
}

impl Multiplexer {
    pub fn new(call_in: Arc<dyn CallIn>, request_timeout: Option<Duration>) -> Self {
        Self {
            inner: Arc::new(Inner {
                call_in,
                next_id: AtomicU64::new(1),
                pending: DashMap::new(),
                streams: DashMap::new(),
                request_timeout,
            }),
        }
    }

    /// Issues a one-shot call and waits for its settlement.
    #[instrument(level = "debug", skip(self, fields))]
    pub async fn call(
        &self,
        entry: EntryPoint,
        fields: Map<String, Value>,
    ) -> Result<String, CallError> {
        let name = entry.to_string();
        if entry.is_streaming() {
            return Err(CallError::Misrouted(name));
        }
        if !self.inner.call_in.is_bound(&name) {
            return Err(CallError::Unavailable(name));
        }

        let id = self.inner.allocate_id();
        let (sender, receiver) = oneshot::channel();
        self.inner.pending.insert(id.clone(), PendingCall { sender });
        let _guard = PendingGuard {
            inner: &self.inner,
            id: &id,
        };

        let envelope = Envelope {
            id: id.clone(),
            body: fields,
        };
        self.inner.call_in.invoke(&name, envelope.encode());

        let settled = match self.inner.request_timeout {
            Some(limit) => match tokio::time::timeout(limit, receiver).await {
                Ok(settled) => settled,
                Err(_) => return Err(CallError::Timeout(id.clone())),
            },
            None => receiver.await,
        };
        match settled {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(message)) => Err(CallError::Rejected(message)),
            Err(_) => Err(CallError::Disconnected(id.clone())),
        }
    }

    /// Opens a stream. Failures that happen before anything crosses the
    /// channel are yielded as the stream's only item.
    pub fn stream(&self, entry: EntryPoint, fields: Map<String, Value>) -> BridgeStream {
        let name = entry.to_string();
        if !entry.is_streaming() {
            return BridgeStream::failed(CallError::Misrouted(name));
        }
        if !self.inner.call_in.is_bound(&name) {
            return BridgeStream::failed(CallError::Unavailable(name));
        }

        let id = self.inner.allocate_id();
        let state = SharedStream::default();
        self.inner.streams.insert(id.clone(), state.clone());
        let envelope = Envelope {
            id: id.clone(),
            body: fields,
        };
        self.inner.call_in.invoke(&name, envelope.encode());

        BridgeStream {
            id,
            state,
            owner: Some(self.inner.clone()),
            early: None,
            finished: false,
        }
    }

    pub async fn complete(
        &self,
        family: Family,
        input: &str,
        max_tokens: Option<u32>,
    ) -> Result<String, CallError> {
        self.call(
            EntryPoint::Capability(family, Operation::Complete),
            generation_fields(family, input, max_tokens),
        )
        .await
    }

    pub fn generate(&self, family: Family, input: &str, max_tokens: Option<u32>) -> BridgeStream {
        self.stream(
            EntryPoint::Capability(family, Operation::Stream),
            generation_fields(family, input, max_tokens),
        )
    }

    /// Returns the resolved resource name.
    pub async fn load(&self, family: Family, name: &str) -> Result<String, CallError> {
        let mut fields = Map::new();
        fields.insert("name".to_string(), Value::String(name.to_string()));
        self.call(EntryPoint::Capability(family, Operation::Load), fields)
            .await
    }

    pub async fn unload(&self, family: Family) -> Result<bool, CallError> {
        let raw = self
            .call(EntryPoint::Capability(family, Operation::Unload), Map::new())
            .await?;
        parse_flag(&raw)
    }

    pub async fn list(&self, family: Family) -> Result<Vec<String>, CallError> {
        let raw = self
            .call(EntryPoint::Capability(family, Operation::List), Map::new())
            .await?;
        serde_json::from_str(&raw).map_err(|e| CallError::InvalidResponse(e.to_string()))
    }

    pub async fn status(&self, family: Family) -> Result<EngineStatus, CallError> {
        let raw = self
            .call(EntryPoint::Capability(family, Operation::Status), Map::new())
            .await?;
        serde_json::from_str(&raw).map_err(|e| CallError::InvalidResponse(e.to_string()))
    }

    /// Asks the host to stop the stream with correlation id `target`.
    /// Resolves `false` when that stream already finished.
    pub async fn cancel(&self, target: &str) -> Result<bool, CallError> {
        let mut fields = Map::new();
        fields.insert("target".to_string(), Value::String(target.to_string()));
        let raw = self.call(EntryPoint::Cancel, fields).await?;
        parse_flag(&raw)
    }

    pub fn resolve(&self, id: &str, value: String) {
        self.settle(id, Ok(value));
    }

    pub fn reject(&self, id: &str, message: String) {
        self.settle(id, Err(message));
    }

    fn settle(&self, id: &str, outcome: Settlement) {
        match self.inner.pending.remove(id) {
            Some((_, call)) => {
                if call.sender.send(outcome).is_err() {
                    trace!(%id, "caller went away before settlement");
                }
            }
            None => trace!(%id, "settlement for unknown id ignored"),
        }
    }

    pub fn stream_push(&self, id: &str, chunk: String) {
        if let Some(state) = self.stream_state(id) {
            if !lock(&state).push(chunk) {
                debug!(%id, "chunk after end of stream ignored");
            }
        }
    }

    pub fn stream_end(&self, id: &str) {
        if let Some(state) = self.stream_state(id) {
            lock(&state).finish(None);
        }
    }

    pub fn stream_error(&self, id: &str, message: String) {
        if let Some(state) = self.stream_state(id) {
            lock(&state).finish(Some(message));
        }
    }

    fn stream_state(&self, id: &str) -> Option<SharedStream> {
        let state = self.inner.streams.get(id).map(|entry| entry.value().clone());
        if state.is_none() {
            trace!(%id, "stream notification for unknown id ignored");
        }
        state
    }

    /// Fails everything still outstanding, e.g. when the page is torn down.
    /// Returns how many calls and streams were affected.
    pub fn cancel_waiting(&self, reason: &str) -> usize {
        let message = format!("request_cancelled: {}", reason);
        let ids: Vec<CorrelationId> = self
            .inner
            .pending
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        let mut affected = 0;
        for id in ids {
            if let Some((_, call)) = self.inner.pending.remove(&id) {
                let _ = call.sender.send(Err(message.clone()));
                affected += 1;
            }
        }

        let streams: Vec<SharedStream> = self
            .inner
            .streams
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for state in streams {
            if lock(&state).finish(Some(message.clone())) {
                affected += 1;
            }
        }
        affected
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    pub fn open_streams(&self) -> usize {
        self.inner.streams.len()
    }
}

fn generation_fields(family: Family, input: &str, max_tokens: Option<u32>) -> Map<String, Value> {
    let mut fields = Map::new();
    fields.insert(
        family.input_field().to_string(),
        Value::String(input.to_string()),
    );
    if let Some(max_tokens) = max_tokens {
        fields.insert(BUDGET_FIELD.to_string(), Value::from(max_tokens));
    }
    fields
}

fn parse_flag(raw: &str) -> Result<bool, CallError> {
    match raw {
        "true" => Ok(true),
        "false" => Ok(false),
        other => Err(CallError::InvalidResponse(format!(
            "expected true or false, got `{}`",
            other
        ))),
    }
}

/// Chunks of one streaming call, in arrival order.
///
/// Yields `Ok(chunk)` per push, then either ends or yields one final `Err`.
/// Dropping it early asks the host to cancel the generation.
pub struct BridgeStream {
    id: CorrelationId,
    state: SharedStream,
    owner: Option<Arc<Inner>>,
    early: Option<CallError>,
    finished: bool,
}

impl BridgeStream {
    fn failed(error: CallError) -> Self {
        Self {
            id: CorrelationId::new(),
            state: SharedStream::default(),
            owner: None,
            early: Some(error),
            finished: false,
        }
    }

    /// Correlation id of the underlying call. Empty if the stream failed
    /// before it was issued.
    pub fn id(&self) -> &str {
        &self.id
    }

    fn finish(&mut self) {
        self.finished = true;
        if let Some(owner) = &self.owner {
            owner.streams.remove(&self.id);
        }
    }
}

impl Stream for BridgeStream {
    type Item = Result<String, CallError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        if let Some(error) = this.early.take() {
            this.finished = true;
            return Poll::Ready(Some(Err(error)));
        }
        if this.finished {
            return Poll::Ready(None);
        }

        let mut state = lock(&this.state);
        if let Some(chunk) = state.queued.pop_front() {
            return Poll::Ready(Some(Ok(chunk)));
        }
        if state.done {
            let error = state.error.take();
            drop(state);
            this.finish();
            return Poll::Ready(error.map(|message| Err(CallError::Rejected(message))));
        }
        state.waiter = Some(cx.waker().clone());
        Poll::Pending
    }
}

impl Drop for BridgeStream {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Some(owner) = self.owner.take() {
            owner.streams.remove(&self.id);
            if !lock(&self.state).done {
                owner.abandon(&self.id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use pretty_assertions::assert_eq;
    use std::collections::HashSet;

    /// Records call-ins instead of delivering them.
    #[derive(Default)]
    struct RecordingCallIn {
        bound: HashSet<String>,
        calls: Mutex<Vec<(String, Envelope)>>,
    }

    impl RecordingCallIn {
        fn binding(entries: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                bound: entries.iter().map(|e| e.to_string()).collect(),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<(String, Envelope)> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl CallIn for RecordingCallIn {
        fn is_bound(&self, entry: &str) -> bool {
            self.bound.contains(entry)
        }

        fn invoke(&self, entry: &str, payload: String) {
            let envelope = Envelope::decode(&payload).unwrap();
            self.calls.lock().unwrap().push((entry.to_string(), envelope));
        }
    }

    const ALL: &[&str] = &["llm.complete", "llm.stream", "llm.unload", "bridge.cancel"];

    #[tokio::test]
    async fn test_call_resolves_with_matching_id() {
        let call_in = RecordingCallIn::binding(ALL);
        let mux = Multiplexer::new(call_in.clone(), None);

        let pending = tokio::spawn({
            let mux = mux.clone();
            async move { mux.complete(Family::Llm, "hi", Some(4)).await }
        });
        while call_in.calls().is_empty() {
            tokio::task::yield_now().await;
        }
        let (entry, envelope) = call_in.calls().remove(0);
        assert_eq!(entry, "llm.complete");
        assert_eq!(envelope.id, "1");
        assert_eq!(envelope.body.get("prompt"), Some(&Value::from("hi")));
        assert_eq!(envelope.body.get("maxTokens"), Some(&Value::from(4)));

        mux.resolve("999", "stray".to_string());
        mux.resolve("1", "hello".to_string());
        mux.resolve("1", "twice".to_string());
        assert_eq!(pending.await.unwrap(), Ok("hello".to_string()));
        assert_eq!(mux.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_unbound_entry_fails_without_crossing() {
        let call_in = RecordingCallIn::binding(&["bridge.cancel"]);
        let mux = Multiplexer::new(call_in.clone(), None);

        assert_eq!(
            mux.complete(Family::Tts, "x", None).await,
            Err(CallError::Unavailable("tts.complete".to_string()))
        );
        let mut stream = mux.generate(Family::Tts, "x", None);
        assert_eq!(
            stream.next().await,
            Some(Err(CallError::Unavailable("tts.stream".to_string())))
        );
        assert_eq!(stream.next().await, None);
        assert!(call_in.calls().is_empty());
    }

    #[tokio::test]
    async fn test_timeout_clears_pending_entry() {
        let call_in = RecordingCallIn::binding(ALL);
        let mux = Multiplexer::new(call_in, Some(Duration::from_millis(20)));

        assert_eq!(
            mux.unload(Family::Llm).await,
            Err(CallError::Timeout("1".to_string()))
        );
        assert_eq!(mux.pending_count(), 0);
        // A late answer is a no-op.
        mux.resolve("1", "true".to_string());
    }

    #[tokio::test]
    async fn test_stream_yields_chunks_then_error() {
        let call_in = RecordingCallIn::binding(ALL);
        let mux = Multiplexer::new(call_in, None);
        let mut stream = mux.generate(Family::Llm, "x", None);
        let id = stream.id().to_string();

        mux.stream_push(&id, "a".to_string());
        mux.stream_push(&id, "b".to_string());
        mux.stream_error(&id, "decoding failed".to_string());
        mux.stream_push(&id, "late".to_string());
        mux.stream_end(&id);

        let items: Vec<_> = (&mut stream).collect().await;
        assert_eq!(
            items,
            vec![
                Ok("a".to_string()),
                Ok("b".to_string()),
                Err(CallError::Rejected("decoding failed".to_string())),
            ]
        );
        assert_eq!(mux.open_streams(), 0);
    }

    #[tokio::test]
    async fn test_stream_wakes_on_push() {
        let call_in = RecordingCallIn::binding(ALL);
        let mux = Multiplexer::new(call_in, None);
        let stream = mux.generate(Family::Llm, "x", None);
        let id = stream.id().to_string();

        let reader = tokio::spawn(async move { stream.collect::<Vec<_>>().await });
        tokio::task::yield_now().await;
        mux.stream_push(&id, "tok".to_string());
        mux.stream_end(&id);

        assert_eq!(reader.await.unwrap(), vec![Ok("tok".to_string())]);
    }

    #[tokio::test]
    async fn test_dropping_unfinished_stream_sends_cancel() {
        let call_in = RecordingCallIn::binding(ALL);
        let mux = Multiplexer::new(call_in.clone(), None);
        let stream = mux.generate(Family::Llm, "x", None);
        let id = stream.id().to_string();
        drop(stream);

        let calls = call_in.calls();
        assert_eq!(calls.len(), 2);
        let (entry, envelope) = &calls[1];
        assert_eq!(entry, "bridge.cancel");
        assert_eq!(envelope.body.get("target"), Some(&Value::from(id.as_str())));
        assert_eq!(mux.open_streams(), 0);
        assert_eq!(mux.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_waiting_fails_everything() {
        let call_in = RecordingCallIn::binding(ALL);
        let mux = Multiplexer::new(call_in.clone(), None);
        let mut stream = mux.generate(Family::Llm, "x", None);
        let pending = tokio::spawn({
            let mux = mux.clone();
            async move { mux.complete(Family::Llm, "y", None).await }
        });
        while mux.pending_count() == 0 {
            tokio::task::yield_now().await;
        }

        assert_eq!(mux.cancel_waiting("page unloaded"), 2);
        assert_eq!(
            pending.await.unwrap(),
            Err(CallError::Rejected("request_cancelled: page unloaded".to_string()))
        );
        assert_eq!(
            stream.next().await,
            Some(Err(CallError::Rejected(
                "request_cancelled: page unloaded".to_string()
            )))
        );
    }

    #[tokio::test]
    async fn test_misrouted_calls() {
        let mux = Multiplexer::new(RecordingCallIn::binding(ALL), None);
        assert_eq!(
            mux.call(
                EntryPoint::Capability(Family::Llm, Operation::Stream),
                Map::new()
            )
            .await,
            Err(CallError::Misrouted("llm.stream".to_string()))
        );
    }
}
