//! New-session admission queue.
//!
//! Requests that cannot be served right away wait here. A single loop task,
//! started on demand and stopped once the queue drains, retries every
//! pending request in enqueue order on a fixed tick and expires requests
//! older than `newSessionWaitTimeout`.
//!
//! A caller holds a [`PendingSession`]. Dropping it removes the request from
//! the queue; a session created for a caller that is already gone is ended
//! on its node straight away.

use grid_common::{GridError, Result};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::driver::NewSessionRequest;
use crate::node_set::NodeSet;
use crate::session::Session;

type Reply = oneshot::Sender<Result<Arc<Session>>>;

struct PendingRequest {
    request: Arc<NewSessionRequest>,
    enqueued_at: Instant,
    reply: Reply,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<PendingRequest>,
    running: bool,
}

struct QueueInner {
    nodes: Arc<NodeSet>,
    tick: Duration,
    wait_timeout: Option<Duration>,
    state: Mutex<QueueState>,
    shutdown: CancellationToken,
}

pub struct SessionQueue {
    inner: Arc<QueueInner>,
}

impl SessionQueue {
    /// Creates a queue.
    ///
    /// # Arguments
    /// * `nodes` - Nodes requests are matched against
    /// * `tick` - Retry cadence
    /// * `wait_timeout` - Maximum wait of a request, `None` for unbounded
    /// * `shutdown` - Stops the loop and fails every waiting request
    pub fn new(
        nodes: Arc<NodeSet>,
        tick: Duration,
        wait_timeout: Option<Duration>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                nodes,
                tick,
                wait_timeout,
                state: Mutex::new(QueueState::default()),
                shutdown,
            }),
        }
    }

    /// Queues a request and starts the loop if it is idle.
    pub fn add_request(&self, request: NewSessionRequest) -> PendingSession {
        let (reply, receiver) = oneshot::channel();
        let id = request.id;

        if self.inner.shutdown.is_cancelled() {
            // reply dropped: the caller sees the queue as shut down
            return PendingSession::new(id, receiver, &self.inner);
        }

        let mut state = self.inner.state.lock();
        state.pending.push_back(PendingRequest {
            request: Arc::new(request),
            enqueued_at: Instant::now(),
            reply,
        });
        debug!(request_id = %id, queued = state.pending.len(), "New session request queued");

        if !state.running {
            state.running = true;
            tokio::spawn(run(self.inner.clone()));
        }

        PendingSession::new(id, receiver, &self.inner)
    }

    /// Drops a pending request. Returns false if it was no longer queued.
    pub fn remove(&self, id: Uuid) -> bool {
        self.inner.take(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_running(&self) -> bool {
        self.inner.state.lock().running
    }

    /// Desired capabilities of every waiting request, in queue order.
    pub fn pending_capabilities(&self) -> Vec<grid_common::Capabilities> {
        self.inner
            .state
            .lock()
            .pending
            .iter()
            .map(|entry| entry.request.desired.clone())
            .collect()
    }
}

/// Handle to a queued request.
pub struct PendingSession {
    id: Uuid,
    receiver: oneshot::Receiver<Result<Arc<Session>>>,
    queue: Weak<QueueInner>,
}

impl PendingSession {
    fn new(id: Uuid, receiver: oneshot::Receiver<Result<Arc<Session>>>, queue: &Arc<QueueInner>) -> Self {
        Self {
            id,
            receiver,
            queue: Arc::downgrade(queue),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Waits for a session, a timeout or a shutdown.
    pub async fn wait(mut self) -> Result<Arc<Session>> {
        match (&mut self.receiver).await {
            Ok(result) => result,
            Err(_) => Err(GridError::ShuttingDown),
        }
    }
}

impl Drop for PendingSession {
    fn drop(&mut self) {
        if let Some(queue) = self.queue.upgrade() {
            if queue.take(self.id).is_some() {
                debug!(request_id = %self.id, "New session request cancelled by caller");
            }
        }

        // A session may already sit in the channel unread.
        self.receiver.close();
        if let Ok(Ok(session)) = self.receiver.try_recv() {
            end_orphan(self.id, session);
        }
    }
}

fn end_orphan(request_id: Uuid, session: Arc<Session>) {
    info!(request_id = %request_id, session = %session.id(), "Caller gone, ending orphaned session");
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move {
                let _ = session.terminate().await;
            });
        }
        Err(_) => {
            warn!(session = %session.id(), "No runtime to end orphaned session, releasing its slot");
            session.discard();
        }
    }
}

impl QueueInner {
    fn take(&self, id: Uuid) -> Option<PendingRequest> {
        let mut state = self.state.lock();
        let position = state.pending.iter().position(|entry| entry.request.id == id)?;
        state.pending.remove(position)
    }

    fn contains(&self, id: Uuid) -> bool {
        self.state
            .lock()
            .pending
            .iter()
            .any(|entry| entry.request.id == id)
    }

    /// Hands `session` to the caller waiting on `id`, or ends it if there is none.
    fn resolve(&self, id: Uuid, session: Arc<Session>) {
        let unclaimed = match self.take(id) {
            Some(entry) => entry.reply.send(Ok(session)).err().and_then(|r| r.ok()),
            None => Some(session),
        };

        if let Some(session) = unclaimed {
            end_orphan(id, session);
        }
    }

    fn expire(&self, id: Uuid, limit: Duration) {
        if let Some(entry) = self.take(id) {
            warn!(
                request_id = %id,
                waited_ms = entry.enqueued_at.elapsed().as_millis() as u64,
                "New session request timed out"
            );
            let _ = entry
                .reply
                .send(Err(GridError::NewSessionTimeout(limit.as_millis() as u64)));
        }
    }

    /// One pass over the queue. Returns false once the queue is empty.
    async fn process(&self) -> bool {
        let entries: Vec<(Arc<NewSessionRequest>, Instant)> = self
            .state
            .lock()
            .pending
            .iter()
            .map(|entry| (entry.request.clone(), entry.enqueued_at))
            .collect();

        for (request, enqueued_at) in entries {
            if !self.contains(request.id) {
                continue;
            }

            if let Some(limit) = self.wait_timeout {
                if enqueued_at.elapsed() >= limit {
                    self.expire(request.id, limit);
                    continue;
                }
            }

            match self.nodes.get_new_session(&request).await {
                Ok(Some(session)) => self.resolve(request.id, session),
                Ok(None) => {}
                Err(e) => {
                    warn!(request_id = %request.id, error = %e, "Session attempt failed, request stays queued")
                }
            }
        }

        let mut state = self.state.lock();
        if state.pending.is_empty() {
            state.running = false;
            return false;
        }
        true
    }

    fn drain(&self) {
        let mut state = self.state.lock();
        state.running = false;
        for entry in state.pending.drain(..) {
            let _ = entry.reply.send(Err(GridError::ShuttingDown));
        }
    }
}

async fn run(inner: Arc<QueueInner>) {
    let mut ticker = tokio::time::interval(inner.tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    debug!("Session queue loop started");

    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => {
                inner.drain();
                break;
            }
            _ = ticker.tick() => {}
        }

        if !inner.process().await {
            break;
        }
    }

    debug!("Session queue loop stopped");
}
