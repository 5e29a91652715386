use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use dropstream_protocol::{JobId, ProgressEvent};
use tokio::sync::mpsc;
use tracing::trace;

/// How many finished job ids are remembered for refusing late subscribers.
const FINISHED_MEMORY: usize = 1024;

/// Per-job event fan-out to at most one subscriber.
///
/// Publishing never blocks: with no subscriber the event is dropped. Percent
/// values are kept non-decreasing per job, and nothing is delivered after a
/// job's terminal event.
#[derive(Clone, Default)]
pub struct ProgressChannel {
    inner: Arc<Mutex<ChannelInner>>,
}

#[derive(Default)]
struct ChannelInner {
    endpoints: HashMap<JobId, Endpoint>,
    last_percent: HashMap<JobId, f64>,
    finished: HashSet<JobId>,
    finished_order: VecDeque<JobId>,
    next_serial: u64,
}

struct Endpoint {
    serial: u64,
    tx: mpsc::UnboundedSender<ProgressEvent>,
}

impl ChannelInner {
    fn mark_finished(&mut self, job_id: JobId) {
        if self.finished.insert(job_id.clone()) {
            self.finished_order.push_back(job_id);
        }
        while self.finished_order.len() > FINISHED_MEMORY {
            if let Some(old) = self.finished_order.pop_front() {
                self.finished.remove(&old);
            }
        }
    }
}

impl ProgressChannel {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ChannelInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers interest in `job_id`, replacing any previous subscriber.
    ///
    /// If the job already delivered its terminal event the returned
    /// subscription yields nothing.
    pub fn subscribe(&self, job_id: JobId) -> ProgressSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.lock();
        let serial = inner.next_serial;
        inner.next_serial += 1;

        if inner.finished.contains(&job_id) {
            trace!(%job_id, "late subscriber, job already finished");
            drop(tx);
        } else if inner
            .endpoints
            .insert(job_id.clone(), Endpoint { serial, tx })
            .is_some()
        {
            trace!(%job_id, "replaced previous subscriber");
        }

        ProgressSubscription {
            job_id,
            serial,
            rx,
            channel: Arc::downgrade(&self.inner),
        }
    }

    /// Delivers `event` to the job's subscriber, if any.
    pub fn publish(&self, mut event: ProgressEvent) {
        let mut inner = self.lock();
        if inner.finished.contains(&event.job_id) {
            return;
        }

        if let Some(&floor) = inner.last_percent.get(&event.job_id) {
            if event.percent < floor {
                event.percent = floor;
            }
        }

        if event.is_terminal() {
            let job_id = event.job_id.clone();
            inner.last_percent.remove(&job_id);
            if let Some(endpoint) = inner.endpoints.remove(&job_id) {
                let _ = endpoint.tx.send(event);
            }
            inner.mark_finished(job_id);
            return;
        }

        inner
            .last_percent
            .insert(event.job_id.clone(), event.percent);
        let job_id = event.job_id.clone();
        let closed = match inner.endpoints.get(&job_id) {
            Some(endpoint) => endpoint.tx.send(event).is_err(),
            None => false,
        };
        if closed {
            trace!(%job_id, "subscriber gone, removing endpoint");
            inner.endpoints.remove(&job_id);
        }
    }

    /// Forgets a previous terminal event for `job_id` so a new job reusing the
    /// id can be observed.
    pub fn begin(&self, job_id: &JobId) {
        let mut inner = self.lock();
        if inner.finished.remove(job_id) {
            inner.finished_order.retain(|id| id != job_id);
        }
        inner.last_percent.remove(job_id);
    }

    /// Drops the current subscriber of `job_id`, ending its stream.
    pub fn unsubscribe(&self, job_id: &JobId) {
        self.lock().endpoints.remove(job_id);
    }

    pub fn has_subscriber(&self, job_id: &JobId) -> bool {
        self.lock()
            .endpoints
            .get(job_id)
            .is_some_and(|e| !e.tx.is_closed())
    }

    /// Returns `true` once the job's terminal event has been published.
    pub fn is_finished(&self, job_id: &JobId) -> bool {
        self.lock().finished.contains(job_id)
    }
}

/// Receiving end of a job's event stream.
///
/// Dropping it removes its endpoint from the channel (unless a newer
/// subscriber already replaced it).
pub struct ProgressSubscription {
    job_id: JobId,
    serial: u64,
    rx: mpsc::UnboundedReceiver<ProgressEvent>,
    channel: Weak<Mutex<ChannelInner>>,
}

impl ProgressSubscription {
    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    /// Next event, or `None` once the stream has ended.
    pub async fn recv(&mut self) -> Option<ProgressEvent> {
        self.rx.recv().await
    }

    /// Non-blocking variant of [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> Option<ProgressEvent> {
        self.rx.try_recv().ok()
    }
}

impl Drop for ProgressSubscription {
    fn drop(&mut self) {
        let Some(inner) = self.channel.upgrade() else {
            return;
        };
        let mut inner = inner.lock().unwrap_or_else(PoisonError::into_inner);
        if inner
            .endpoints
            .get(&self.job_id)
            .is_some_and(|e| e.serial == self.serial)
        {
            inner.endpoints.remove(&self.job_id);
        }
    }
}
