use blake2b_simd::Params;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use log::{debug, info};
use thiserror::Error;
use tokio::sync::oneshot;

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use super::types::{BlockHash, PublicKey, Work};

/// Minimum work value accepted on the live network
pub const LIVE_THRESHOLD: u64 = 0xffff_ffc0_0000_0000;

/// Minimum work value accepted on the test network
pub const TEST_THRESHOLD: u64 = 0xff00_0000_0000_0000;

/// Errors that can occur when requesting work generation
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WorkError {
    #[error("Already generating work for account {0}")]
    AlreadyGenerating(String),
}

/// blake2b-64(work || root) read as a little-endian integer
pub fn work_value(work: Work, root: &BlockHash) -> u64 {
    let hash = Params::new()
        .hash_length(8)
        .to_state()
        .update(&work.to_preimage_bytes())
        .update(root.as_bytes())
        .finalize();

    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(hash.as_bytes());
    u64::from_le_bytes(bytes)
}

/// Checks that `work` meets `threshold` for `root`
pub fn validate(work: Work, root: &BlockHash, threshold: u64) -> bool {
    work_value(work, root) >= threshold
}

/// Counts up from zero until a work value meets the threshold
///
/// Returns `None` once `cancel` is raised.
pub fn generate(root: &BlockHash, threshold: u64, cancel: &AtomicBool) -> Option<Work> {
    let mut counter: u64 = 0;

    loop {
        if cancel.load(Ordering::Relaxed) {
            return None;
        }

        let work = Work(counter);
        if validate(work, root, threshold) {
            return Some(work);
        }

        counter = counter.wrapping_add(1);
    }
}

struct Job {
    id: u64,
    root: BlockHash,
    cancel: Arc<AtomicBool>,
}

/// Resolves to the generated work, or `None` if the search was cancelled
pub struct WorkHandle {
    account: PublicKey,
    root: BlockHash,
    receiver: oneshot::Receiver<Option<Work>>,
}

impl WorkHandle {
    pub fn account(&self) -> PublicKey {
        self.account
    }

    /// Root the work is being generated against
    pub fn root(&self) -> BlockHash {
        self.root
    }
}

impl Future for WorkHandle {
    type Output = Option<Work>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Ready(Ok(work)) => Poll::Ready(work),
            Poll::Ready(Err(_)) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Runs proof-of-work searches on the blocking pool, one per account
///
/// Must be used from within a tokio runtime.
#[derive(Clone)]
pub struct WorkPool {
    threshold: u64,
    jobs: Arc<DashMap<PublicKey, Job>>,
    next_id: Arc<AtomicU64>,
}

impl std::fmt::Debug for WorkPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkPool")
            .field("threshold", &format_args!("{:#x}", self.threshold))
            .field("in_flight", &self.jobs.len())
            .finish()
    }
}

impl WorkPool {
    pub fn new(threshold: u64) -> Self {
        WorkPool {
            threshold,
            jobs: Arc::new(DashMap::new()),
            next_id: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn threshold(&self) -> u64 {
        self.threshold
    }

    /// Starts a search for `account`; fails if one is already outstanding
    pub fn generate(&self, account: PublicKey, root: BlockHash) -> Result<WorkHandle, WorkError> {
        match self.jobs.entry(account) {
            Entry::Occupied(_) => Err(WorkError::AlreadyGenerating(account.address())),
            Entry::Vacant(vacant) => {
                let (job, handle) = self.spawn(account, root);
                vacant.insert(job);
                Ok(handle)
            }
        }
    }

    /// Cancels any outstanding search for `account` and starts one for the new root
    pub fn supersede(&self, account: PublicKey, root: BlockHash) -> WorkHandle {
        match self.jobs.entry(account) {
            Entry::Occupied(mut occupied) => {
                occupied.get().cancel.store(true, Ordering::Relaxed);
                debug!(
                    "Superseding work for {} (root {} -> {})",
                    account,
                    occupied.get().root,
                    root
                );
                let (job, handle) = self.spawn(account, root);
                occupied.insert(job);
                handle
            }
            Entry::Vacant(vacant) => {
                let (job, handle) = self.spawn(account, root);
                vacant.insert(job);
                handle
            }
        }
    }

    /// Cancels the outstanding search for `account`, returning whether one existed
    pub fn cancel(&self, account: &PublicKey) -> bool {
        match self.jobs.remove(account) {
            Some((_, job)) => {
                job.cancel.store(true, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    /// Abandons every outstanding search
    pub fn cancel_all(&self) {
        let count = self.jobs.len();
        self.jobs.retain(|_, job| {
            job.cancel.store(true, Ordering::Relaxed);
            false
        });
        if count > 0 {
            info!("Cancelled {} work generation task(s)", count);
        }
    }

    pub fn is_generating(&self, account: &PublicKey) -> bool {
        self.jobs.contains_key(account)
    }

    pub fn in_flight(&self) -> usize {
        self.jobs.len()
    }

    fn spawn(&self, account: PublicKey, root: BlockHash) -> (Job, WorkHandle) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel = Arc::new(AtomicBool::new(false));
        let (sender, receiver) = oneshot::channel();

        let jobs = self.jobs.clone();
        let flag = cancel.clone();
        let threshold = self.threshold;

        tokio::task::spawn_blocking(move || {
            let result = generate(&root, threshold, &flag);
            // A superseding job has a different id and stays registered
            jobs.remove_if(&account, |_, job| job.id == id);
            let _ = sender.send(result);
        });

        (Job { id, root, cancel }, WorkHandle { account, root, receiver })
    }
}
