//! In-flight request deduplication.

use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};

use futures::future::{BoxFuture, Shared};
use tokio_util::sync::CancellationToken;

use crate::error::JobError;
use crate::pool::job::JobId;

/// Shared handle to a pending count.
pub(crate) type SharedCount = Shared<BoxFuture<'static, Result<usize, JobError>>>;

/// Content key for likely-identical payloads: a hash of the text plus its
/// byte length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    hash: u64,
    len: usize,
}

impl Fingerprint {
    pub fn of(text: &str) -> Self {
        let mut hasher = DefaultHasher::new();
        text.hash(&mut hasher);
        Self {
            hash: hasher.finish(),
            len: text.len(),
        }
    }
}

/// One in-flight job and the callers waiting on it.
struct InFlight {
    job_id: JobId,
    result: SharedCount,
    /// Cancelled when the job settles.
    controller: CancellationToken,
    subscribers: usize,
    cancelled: usize,
}

/// A caller joining an in-flight job.
pub(crate) struct Subscription {
    pub job_id: JobId,
    pub result: SharedCount,
    pub controller: CancellationToken,
}

/// Maps fingerprints to the future of the job computing them.
///
/// Every caller of a fingerprint is a subscriber. The job itself is only
/// abandoned once every subscriber has cancelled; a subscriber without a
/// cancellation token keeps it alive.
#[derive(Default)]
pub(crate) struct Deduplicator {
    inflight: HashMap<Fingerprint, InFlight>,
}

impl Deduplicator {
    /// Join the job computing `fingerprint`, if there is one.
    pub fn subscribe(&mut self, fingerprint: &Fingerprint) -> Option<Subscription> {
        let entry = self.inflight.get_mut(fingerprint)?;
        entry.subscribers += 1;
        Some(Subscription {
            job_id: entry.job_id,
            result: entry.result.clone(),
            controller: entry.controller.clone(),
        })
    }

    /// Register a new job with its submitter as the first subscriber.
    pub fn insert(
        &mut self,
        fingerprint: Fingerprint,
        job_id: JobId,
        result: SharedCount,
        controller: CancellationToken,
    ) {
        self.inflight.insert(
            fingerprint,
            InFlight {
                job_id,
                result,
                controller,
                subscribers: 1,
                cancelled: 0,
            },
        );
    }

    /// Record that one subscriber of `job_id` cancelled. Returns
    /// `Some(true)` once every subscriber has, `None` if the job is no
    /// longer tracked.
    pub fn unsubscribe(&mut self, fingerprint: &Fingerprint, job_id: JobId) -> Option<bool> {
        let entry = self
            .inflight
            .get_mut(fingerprint)
            .filter(|entry| entry.job_id == job_id)?;
        entry.cancelled += 1;
        Some(entry.cancelled >= entry.subscribers)
    }

    /// Forget the entry owned by `job_id`. An entry since replaced by a
    /// newer job is left alone.
    pub fn release(&mut self, fingerprint: &Fingerprint, job_id: JobId) {
        if self
            .inflight
            .get(fingerprint)
            .is_some_and(|entry| entry.job_id == job_id)
        {
            self.inflight.remove(fingerprint);
        }
    }

    pub fn clear(&mut self) {
        self.inflight.clear();
    }

    pub fn len(&self) -> usize {
        self.inflight.len()
    }
}
