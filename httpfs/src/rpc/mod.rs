//! RPC call manager
//!
//! Every filesystem verb becomes one [`Call`] tracked in the outstanding set
//! until its completion fires. Each call is driven by its own task which
//! encodes the request, exchanges it through the [`Transport`], and retries
//! recoverable failures after a fixed delay while the retry budget lasts.
//!
//! Completion goes through a oneshot channel that is removed from the
//! outstanding set under the lock before it is used, so a call completes
//! exactly once whether it finishes, exhausts its retries, or is cancelled
//! by [`CallManager::shutdown`].

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::{debug, error, warn};

use crate::error::GENERIC_ERROR;
use crate::wire::transport::Transport;
use crate::wire::{Codec, Reply, Request, Value, Verb};

/// What an outstanding call is currently waiting on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallPhase {
    /// A transport exchange is in flight.
    Sending,
    /// Sleeping before the next attempt.
    RetryWait,
}

struct Call {
    verb: Verb,
    completion: Option<oneshot::Sender<Reply>>,
    phase: CallPhase,
    /// Aborting the driver drops whichever exchange or retry timer it is parked on.
    task: Option<AbortHandle>,
}

struct Inner {
    running: AtomicBool,
    next_id: AtomicU64,
    calls: Mutex<HashMap<u64, Call>>,
    transport: Arc<dyn Transport>,
    codec: Arc<dyn Codec>,
    retries: u32,
    retry_delay: Duration,
}

impl Inner {
    fn calls(&self) -> MutexGuard<'_, HashMap<u64, Call>> {
        self.calls.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Returns false once the call has left the outstanding set.
    fn set_phase(&self, id: u64, phase: CallPhase) -> bool {
        match self.calls().get_mut(&id) {
            Some(call) => {
                call.phase = phase;
                true
            }
            None => false,
        }
    }

    fn complete(&self, id: u64, reply: Reply) {
        let call = self.calls().remove(&id);
        if let Some(mut call) = call
            && let Some(tx) = call.completion.take()
        {
            debug!(id, verb = %call.verb, status = reply.status, "call completed");
            // the caller may have stopped waiting; nothing to do then
            let _ = tx.send(reply);
        }
    }
}

/// Tracks and drives outstanding remote calls. Cheap to clone.
#[derive(Clone)]
pub struct CallManager {
    inner: Arc<Inner>,
}

impl CallManager {
    /// `retries` is the number of extra attempts after the first one.
    pub fn new(
        transport: Arc<dyn Transport>,
        codec: Arc<dyn Codec>,
        retries: u32,
        retry_delay: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                running: AtomicBool::new(true),
                next_id: AtomicU64::new(1),
                calls: Mutex::new(HashMap::new()),
                transport,
                codec,
                retries,
                retry_delay,
            }),
        }
    }

    /// Registers a call and starts sending it.
    ///
    /// After shutdown the returned handle is already completed with the
    /// generic error and nothing is sent.
    pub fn submit(&self, verb: Verb, args: Vec<Value>) -> CallHandle {
        let (tx, rx) = oneshot::channel();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut calls = self.inner.calls();
            if !self.inner.running.load(Ordering::SeqCst) {
                drop(calls);
                debug!(%verb, "rejecting call submitted after shutdown");
                let _ = tx.send(Reply::generic_failure());
                return CallHandle { rx };
            }
            calls.insert(
                id,
                Call {
                    verb,
                    completion: Some(tx),
                    phase: CallPhase::Sending,
                    task: None,
                },
            );
        }

        let request = Request::new(verb, args);
        let task = tokio::spawn(drive(self.inner.clone(), id, request));
        if let Some(call) = self.inner.calls().get_mut(&id) {
            call.task = Some(task.abort_handle());
        }
        CallHandle { rx }
    }

    /// Submits and waits for the reply.
    pub async fn call(&self, verb: Verb, args: Vec<Value>) -> Reply {
        self.submit(verb, args).await
    }

    /// Stops accepting calls and fails every outstanding one with the generic
    /// error, aborting in-flight exchanges and pending retries. Returns the
    /// number of calls cancelled.
    pub fn shutdown(&self) -> usize {
        let drained: Vec<(u64, Call)> = {
            let mut calls = self.inner.calls();
            self.inner.running.store(false, Ordering::SeqCst);
            calls.drain().collect()
        };
        let count = drained.len();
        for (id, mut call) in drained {
            if let Some(task) = call.task.take() {
                task.abort();
            }
            if let Some(tx) = call.completion.take() {
                debug!(id, verb = %call.verb, phase = ?call.phase, "cancelling call");
                let _ = tx.send(Reply::generic_failure());
            }
        }
        count
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    pub fn outstanding(&self) -> usize {
        self.inner.calls().len()
    }

    /// Calls currently parked on a retry timer.
    pub fn waiting_retry(&self) -> usize {
        self.inner
            .calls()
            .values()
            .filter(|c| c.phase == CallPhase::RetryWait)
            .count()
    }
}

async fn drive(inner: Arc<Inner>, id: u64, request: Request) {
    let body = match inner.codec.encode_request(&request) {
        Ok(body) => body,
        Err(e) => {
            error!(id, operation = %request.operation, "cannot encode request: {e}");
            inner.complete(id, Reply::generic_failure());
            return;
        }
    };

    let mut retries = inner.retries;
    loop {
        if !inner.set_phase(id, CallPhase::Sending) {
            return;
        }
        debug!(id, operation = %request.operation, retries, "sending request");

        let (reason, errno) = match inner.transport.exchange(body.clone()).await {
            Ok(buf) => match inner.codec.decode_reply(&buf) {
                Ok(reply) => {
                    inner.complete(id, reply);
                    return;
                }
                Err(e) => (e.to_string(), None),
            },
            Err(e) => {
                let errno = e.errno();
                (e.to_string(), errno)
            }
        };

        if retries == 0 {
            error!(id, operation = %request.operation, "giving up: {reason}");
            inner.complete(id, Reply::failure(errno.unwrap_or(GENERIC_ERROR)));
            return;
        }
        retries -= 1;
        warn!(
            id,
            operation = %request.operation,
            retries_left = retries,
            "request failed, retrying in {:?}: {reason}",
            inner.retry_delay
        );
        if !inner.set_phase(id, CallPhase::RetryWait) {
            return;
        }
        tokio::time::sleep(inner.retry_delay).await;
    }
}

/// Resolves to the call's reply exactly once.
pub struct CallHandle {
    rx: oneshot::Receiver<Reply>,
}

impl Future for CallHandle {
    type Output = Reply;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|res| res.unwrap_or_else(|_| Reply::generic_failure()))
    }
}
