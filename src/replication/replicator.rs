//! The replication state machine and its push and pull loops

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;

use super::{
    Backoff, Checkpoint, CheckpointStore, ErrorClass, ReplicationConfig, ReplicationError,
    ReplicationState,
};
use crate::protocol::{self, RevsDiff};
use crate::store::{
    ApplyOutcome, ChangeEntry, Partition, PartitionId, ReplicatedDocument, StoreError,
    LOCAL_ID_PREFIX,
};
use crate::transport::{Transport, TransportError};

/// Totals from one [`Replicator::sync_once`] run
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SyncSummary {
    /// Revisions sent to the peer
    pub pushed: usize,
    /// Revisions from the peer that were new here
    pub pulled: usize,
    pub last_pushed_seq: u64,
    pub last_pulled_seq: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum LoopStatus {
    Busy,
    Idle,
    BackingOff,
    Retrying,
}

const PUSH: usize = 0;
const PULL: usize = 1;
const LOOP_NAMES: [&str; 2] = ["push", "pull"];

struct PullPage {
    applied: usize,
    last_seq: u64,
    caught_up: bool,
}

/// State shared by the replicator handle and its two loops.
struct Shared {
    partition: Arc<Partition>,
    peer_id: String,
    transport: Arc<dyn Transport>,
    checkpoints: Arc<dyn CheckpointStore>,
    config: ReplicationConfig,
    state_tx: watch::Sender<ReplicationState>,
    checkpoint: Mutex<Checkpoint>,
    loops: Mutex<[LoopStatus; 2]>,
    /// Loop status changes no longer drive the state (terminal error or stop)
    halted: AtomicBool,
}

impl Shared {
    fn set_state(&self, state: ReplicationState) {
        let previous = *self.state_tx.borrow();
        if previous != state {
            log::info!(
                "[{} -> {}] replication {} -> {}",
                self.partition.id(),
                self.peer_id,
                previous,
                state
            );
            self.state_tx.send_replace(state);
        }
    }

    fn set_loop(&self, index: usize, status: LoopStatus) {
        let mut loops = self.loops.lock().unwrap_or_else(|e| e.into_inner());
        loops[index] = status;
        if self.halted.load(Ordering::SeqCst) {
            return;
        }
        let state = if loops.contains(&LoopStatus::BackingOff) {
            ReplicationState::Error(ErrorClass::Transient)
        } else if loops.contains(&LoopStatus::Retrying) {
            ReplicationState::Starting
        } else if loops.iter().all(|s| *s == LoopStatus::Idle) {
            ReplicationState::Paused
        } else {
            ReplicationState::Active
        };
        self.set_state(state);
    }

    /// Stop both loops after a terminal failure.
    fn halt(&self, error: &ReplicationError, shutdown: &watch::Sender<bool>) {
        log::error!(
            "[{} -> {}] replication halted: {}",
            self.partition.id(),
            self.peer_id,
            error
        );
        {
            // Under the loop lock so a concurrent status update cannot
            // overwrite the error state
            let _loops = self.loops.lock().unwrap_or_else(|e| e.into_inner());
            self.halted.store(true, Ordering::SeqCst);
            self.set_state(ReplicationState::Error(error.class()));
        }
        shutdown.send_replace(true);
    }

    fn checkpoint(&self) -> Checkpoint {
        self.checkpoint.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Load the stored checkpoint, creating one at zero on first use.
    fn load_checkpoint(&self) -> Result<Checkpoint, ReplicationError> {
        let checkpoint = match self.checkpoints.load(self.partition.id(), &self.peer_id)? {
            Some(stored) => stored,
            None => {
                let fresh = Checkpoint::new(self.partition.id().clone(), self.peer_id.clone());
                self.checkpoints.save(&fresh)?;
                fresh
            }
        };
        log::debug!(
            "[{} -> {}] resuming at push {} / pull {}",
            self.partition.id(),
            self.peer_id,
            checkpoint.last_pushed_seq,
            checkpoint.last_pulled_seq
        );
        *self.checkpoint.lock().unwrap_or_else(|e| e.into_inner()) = checkpoint.clone();
        Ok(checkpoint)
    }

    /// Apply `update` and save, all under the checkpoint lock so the push and
    /// pull loops cannot interleave their saves.
    fn update_checkpoint(&self, update: impl FnOnce(&mut Checkpoint)) -> Result<(), ReplicationError> {
        let mut checkpoint = self.checkpoint.lock().unwrap_or_else(|e| e.into_inner());
        update(&mut checkpoint);
        self.checkpoints.save(&checkpoint)?;
        Ok(())
    }

    fn persist(&self) -> Result<(), ReplicationError> {
        let checkpoint = self.checkpoint.lock().unwrap_or_else(|e| e.into_inner());
        self.checkpoints.save(&checkpoint)?;
        Ok(())
    }

    /// Send the current leaves of every id in `batch` that the peer lacks.
    async fn push_batch(&self, batch: &[ChangeEntry]) -> Result<usize, ReplicationError> {
        let mut seen = HashSet::new();
        let mut ask = RevsDiff::new();
        let mut candidates: Vec<ReplicatedDocument> = Vec::new();
        for entry in batch {
            if entry.id.starts_with(LOCAL_ID_PREFIX) || !seen.insert(entry.id.as_str()) {
                continue;
            }
            let leaves = self.partition.leaf_revisions(&entry.id)?;
            ask.insert(entry.id.clone(), leaves.iter().map(|d| d.revision.id()).collect());
            candidates.extend(leaves);
        }
        if ask.is_empty() {
            return Ok(0);
        }

        let missing = protocol::revs_diff(&*self.transport, self.partition.id(), &ask).await?;
        let missing: HashMap<&str, &Vec<_>> = missing.iter().map(|(id, revs)| (id.as_str(), revs)).collect();
        let docs: Vec<ReplicatedDocument> = candidates
            .into_iter()
            .filter(|d| {
                missing
                    .get(d.id.as_str())
                    .is_some_and(|revs| revs.contains(&d.revision.id()))
            })
            .collect();
        if docs.is_empty() {
            return Ok(0);
        }

        let count = docs.len();
        let response = protocol::bulk_docs(&*self.transport, self.partition.id(), docs).await?;
        let refused: Vec<String> = response
            .failures()
            .map(|r| format!("{}@{}: {}", r.id, r.revision, r.error.as_deref().unwrap_or("refused")))
            .collect();
        if !refused.is_empty() {
            return Err(ReplicationError::PeerRefused(refused.join("; ")));
        }
        log::debug!("[{} -> {}] pushed {} revisions", self.partition.id(), self.peer_id, count);
        Ok(count)
    }

    /// Fetch one page of the peer's changes and graft it locally.
    async fn pull_batch(&self, since: u64) -> Result<PullPage, ReplicationError> {
        let batch_size = self.config.batch_size.max(1);
        let page = protocol::fetch_changes(&*self.transport, self.partition.id(), since, batch_size).await?;
        let last_seq = page.last_seq;
        let caught_up = page.results.len() < batch_size;

        // Log appends fsync when `sync_writes` is on; run them on the blocking pool
        let partition = Arc::clone(&self.partition);
        let applied = tokio::task::spawn_blocking(move || apply_page(&partition, page.results)).await??;
        if applied > 0 {
            log::debug!("[{} <- {}] pulled {} revisions", self.partition.id(), self.peer_id, applied);
        }
        Ok(PullPage {
            applied,
            last_seq,
            caught_up,
        })
    }

    /// Back off after a transient failure; halt on a terminal one. Returns
    /// whether the loop should retry.
    async fn recover(
        &self,
        index: usize,
        error: ReplicationError,
        backoff: &mut Backoff,
        shutdown_tx: &watch::Sender<bool>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> bool {
        if error.is_terminal() {
            self.halt(&error, shutdown_tx);
            return false;
        }

        let delay = backoff.next_delay();
        log::warn!(
            "[{} / {}] {} failed (attempt {}): {}; retrying in {:?}",
            self.partition.id(),
            self.peer_id,
            LOOP_NAMES[index],
            backoff.attempts(),
            error,
            delay
        );
        self.set_loop(index, LoopStatus::BackingOff);
        tokio::select! {
            biased;
            _ = wait_for_shutdown(shutdown) => return false,
            _ = tokio::time::sleep(delay) => {}
        }
        self.set_loop(index, LoopStatus::Retrying);
        true
    }
}

/// Graft one page of pulled rows, returning how many revisions were new.
fn apply_page(partition: &Partition, rows: Vec<protocol::ChangeRow>) -> Result<usize, ReplicationError> {
    let mut applied = 0;
    for doc in rows.iter().flat_map(|row| &row.docs) {
        if doc.id.starts_with(LOCAL_ID_PREFIX) {
            continue;
        }
        match partition.apply_replicated(doc) {
            Ok(ApplyOutcome::Applied { .. }) => applied += 1,
            Ok(ApplyOutcome::AlreadyPresent) => {}
            Err(StoreError::InvalidRevision(message)) | Err(StoreError::InvalidId(message)) => {
                return Err(TransportError::Malformed(message).into())
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(applied)
}

async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

async fn push_loop(shared: Arc<Shared>, shutdown_tx: Arc<watch::Sender<bool>>) {
    let mut shutdown = shutdown_tx.subscribe();
    let batch_size = shared.config.batch_size.max(1);
    let mut backoff = Backoff::new(shared.config.backoff.clone());
    let mut feed = shared.partition.subscribe(shared.checkpoint().last_pushed_seq);

    loop {
        let mut batch = feed.try_next_batch(batch_size);
        if batch.is_empty() {
            shared.set_loop(PUSH, LoopStatus::Idle);
            batch = tokio::select! {
                biased;
                _ = wait_for_shutdown(&mut shutdown) => return,
                batch = feed.next_batch(batch_size) => batch,
            };
        }
        let Some(last_seq) = batch.last().map(|e| e.seq) else {
            return;
        };
        shared.set_loop(PUSH, LoopStatus::Busy);

        // The same batch is retried until it is acknowledged
        loop {
            let result = tokio::select! {
                biased;
                _ = wait_for_shutdown(&mut shutdown) => return,
                result = shared.push_batch(&batch) => result,
            };
            let result = result.and_then(|_| shared.update_checkpoint(|cp| cp.advance_pushed(last_seq)));
            match result {
                Ok(()) => {
                    backoff.reset();
                    shared.set_loop(PUSH, LoopStatus::Busy);
                    break;
                }
                Err(e) => {
                    if !shared.recover(PUSH, e, &mut backoff, &shutdown_tx, &mut shutdown).await {
                        return;
                    }
                }
            }
        }
    }
}

async fn pull_loop(shared: Arc<Shared>, shutdown_tx: Arc<watch::Sender<bool>>) {
    let mut shutdown = shutdown_tx.subscribe();
    let mut backoff = Backoff::new(shared.config.backoff.clone());
    let poll_interval = shared.config.poll_interval();

    loop {
        let since = shared.checkpoint().last_pulled_seq;
        let result = tokio::select! {
            biased;
            _ = wait_for_shutdown(&mut shutdown) => return,
            result = shared.pull_batch(since) => result,
        };
        let result = result.and_then(|page| {
            shared.update_checkpoint(|cp| cp.advance_pulled(page.last_seq))?;
            Ok(page)
        });

        match result {
            Ok(page) if page.caught_up => {
                backoff.reset();
                shared.set_loop(PULL, LoopStatus::Idle);
                tokio::select! {
                    biased;
                    _ = wait_for_shutdown(&mut shutdown) => return,
                    _ = tokio::time::sleep(poll_interval) => {}
                }
            }
            Ok(_) => {
                backoff.reset();
                shared.set_loop(PULL, LoopStatus::Busy);
            }
            Err(e) => {
                if !shared.recover(PULL, e, &mut backoff, &shutdown_tx, &mut shutdown).await {
                    return;
                }
            }
        }
    }
}

struct Running {
    shutdown: Arc<watch::Sender<bool>>,
    push: JoinHandle<()>,
    pull: JoinHandle<()>,
}

impl Running {
    fn is_finished(&self) -> bool {
        self.push.is_finished() && self.pull.is_finished()
    }

    async fn shut_down(self) {
        self.shutdown.send_replace(true);
        for (name, handle) in LOOP_NAMES.iter().zip([self.push, self.pull]) {
            if let Err(e) = handle.await {
                log::warn!("{} loop ended abnormally: {}", name, e);
            }
        }
    }
}

/// Replicates one partition with one peer.
///
/// The transport is used as given; wrap it in
/// [`crate::transport::BearerAuth`] to attach credentials.
pub struct Replicator {
    shared: Arc<Shared>,
    running: AsyncMutex<Option<Running>>,
    /// Cancels the one-shot pass in progress, if any
    one_shot: Mutex<Option<watch::Sender<bool>>>,
}

impl Replicator {
    pub fn new(
        partition: Arc<Partition>,
        peer_id: impl Into<String>,
        transport: Arc<dyn Transport>,
        checkpoints: Arc<dyn CheckpointStore>,
        config: ReplicationConfig,
    ) -> Self {
        let peer_id = peer_id.into();
        let (state_tx, _) = watch::channel(ReplicationState::Stopped);
        let checkpoint = Checkpoint::new(partition.id().clone(), peer_id.clone());
        Self {
            shared: Arc::new(Shared {
                partition,
                peer_id,
                transport,
                checkpoints,
                config,
                state_tx,
                checkpoint: Mutex::new(checkpoint),
                loops: Mutex::new([LoopStatus::Busy; 2]),
                halted: AtomicBool::new(false),
            }),
            running: AsyncMutex::new(None),
            one_shot: Mutex::new(None),
        }
    }

    pub fn partition_id(&self) -> &PartitionId {
        self.shared.partition.id()
    }

    pub fn peer_id(&self) -> &str {
        &self.shared.peer_id
    }

    pub fn config(&self) -> &ReplicationConfig {
        &self.shared.config
    }

    pub fn state(&self) -> ReplicationState {
        *self.shared.state_tx.borrow()
    }

    /// Follow state transitions (the in-sync indicator).
    pub fn subscribe_state(&self) -> watch::Receiver<ReplicationState> {
        self.shared.state_tx.subscribe()
    }

    /// Progress as last recorded in memory
    pub fn checkpoint(&self) -> Checkpoint {
        self.shared.checkpoint()
    }

    pub async fn is_running(&self) -> bool {
        self.running
            .lock()
            .await
            .as_ref()
            .is_some_and(|running| !running.is_finished())
    }

    /// Start live replication in the background.
    ///
    /// Fails with `AlreadyRunning` if the loops are active. After a terminal
    /// error the loops have exited and `start` may be called again.
    pub async fn start(&self) -> Result<(), ReplicationError> {
        let mut running = self.running.lock().await;
        if running.as_ref().is_some_and(|r| !r.is_finished()) {
            return Err(ReplicationError::AlreadyRunning);
        }
        if let Some(previous) = running.take() {
            previous.shut_down().await;
        }

        self.shared.halted.store(false, Ordering::SeqCst);
        self.shared.set_state(ReplicationState::Starting);
        if let Err(e) = self.shared.load_checkpoint() {
            self.shared.set_state(ReplicationState::Error(e.class()));
            return Err(e);
        }
        *self.shared.loops.lock().unwrap_or_else(|e| e.into_inner()) = [LoopStatus::Busy; 2];

        self.shared.set_state(ReplicationState::Active);

        let (shutdown, _) = watch::channel(false);
        let shutdown = Arc::new(shutdown);
        let push = tokio::spawn(push_loop(Arc::clone(&self.shared), Arc::clone(&shutdown)));
        let pull = tokio::spawn(pull_loop(Arc::clone(&self.shared), Arc::clone(&shutdown)));
        *running = Some(Running { shutdown, push, pull });
        Ok(())
    }

    /// Stop both loops (or a one-shot pass), persist the checkpoint and enter
    /// `Stopped`.
    ///
    /// Safe to call in any state and more than once. In-flight requests are
    /// abandoned rather than awaited.
    pub async fn stop(&self) -> Result<(), ReplicationError> {
        if let Some(cancel) = self.one_shot.lock().unwrap_or_else(|e| e.into_inner()).as_ref() {
            cancel.send_replace(true);
        }
        let mut running = self.running.lock().await;
        let result = match running.take() {
            Some(active) => {
                active.shut_down().await;
                self.shared.persist()
            }
            None => Ok(()),
        };
        self.shared.halted.store(true, Ordering::SeqCst);
        self.shared.set_state(ReplicationState::Stopped);
        result
    }

    /// One catch-up pass: push everything pending, then pull until caught
    /// up. Transient failures are retried a bounded number of times.
    pub async fn sync_once(&self) -> Result<SyncSummary, ReplicationError> {
        let running = self.running.lock().await;
        if running.as_ref().is_some_and(|r| !r.is_finished()) {
            return Err(ReplicationError::AlreadyRunning);
        }

        let (cancel, mut cancelled) = watch::channel(false);
        *self.one_shot.lock().unwrap_or_else(|e| e.into_inner()) = Some(cancel);

        self.shared.set_state(ReplicationState::Starting);
        // Checkpoints only change between awaits, so dropping the pass at
        // any await keeps them consistent
        let result = tokio::select! {
            biased;
            _ = wait_for_shutdown(&mut cancelled) => Err(ReplicationError::Stopped),
            result = self.run_once() => result,
        };
        *self.one_shot.lock().unwrap_or_else(|e| e.into_inner()) = None;

        match &result {
            Ok(summary) => {
                log::info!(
                    "[{} / {}] one-shot sync done: pushed {}, pulled {}",
                    self.shared.partition.id(),
                    self.shared.peer_id,
                    summary.pushed,
                    summary.pulled
                );
                self.shared.set_state(ReplicationState::Stopped);
            }
            Err(ReplicationError::Stopped) => {
                log::info!(
                    "[{} / {}] one-shot sync stopped",
                    self.shared.partition.id(),
                    self.shared.peer_id
                );
                self.shared.set_state(ReplicationState::Stopped);
            }
            Err(e) => {
                log::error!(
                    "[{} / {}] one-shot sync failed: {}",
                    self.shared.partition.id(),
                    self.shared.peer_id,
                    e
                );
                self.shared.set_state(ReplicationState::Error(e.class()));
            }
        }
        drop(running);
        result
    }

    async fn run_once(&self) -> Result<SyncSummary, ReplicationError> {
        let shared = &self.shared;
        let checkpoint = shared.load_checkpoint()?;
        shared.set_state(ReplicationState::Active);

        let batch_size = shared.config.batch_size.max(1);
        let max_attempts = shared.config.one_shot_max_attempts.max(1);
        let mut backoff = Backoff::new(shared.config.backoff.clone());
        let mut summary = SyncSummary::default();

        let mut feed = shared.partition.subscribe(checkpoint.last_pushed_seq);
        loop {
            let batch = feed.try_next_batch(batch_size);
            let Some(last_seq) = batch.last().map(|e| e.seq) else {
                break;
            };
            let pushed = loop {
                match shared.push_batch(&batch).await {
                    Ok(n) => break n,
                    Err(e) => self.retry_once(e, &mut backoff, max_attempts).await?,
                }
            };
            backoff.reset();
            shared.update_checkpoint(|cp| cp.advance_pushed(last_seq))?;
            summary.pushed += pushed;
        }

        loop {
            let since = shared.checkpoint().last_pulled_seq;
            let page = loop {
                match shared.pull_batch(since).await {
                    Ok(page) => break page,
                    Err(e) => self.retry_once(e, &mut backoff, max_attempts).await?,
                }
            };
            backoff.reset();
            shared.update_checkpoint(|cp| cp.advance_pulled(page.last_seq))?;
            summary.pulled += page.applied;
            if page.caught_up {
                break;
            }
        }

        let checkpoint = shared.checkpoint();
        summary.last_pushed_seq = checkpoint.last_pushed_seq;
        summary.last_pulled_seq = checkpoint.last_pulled_seq;
        Ok(summary)
    }

    /// Sleep before another attempt, or give the error back when it is
    /// terminal or the attempts are used up.
    async fn retry_once(
        &self,
        error: ReplicationError,
        backoff: &mut Backoff,
        max_attempts: u32,
    ) -> Result<(), ReplicationError> {
        if error.is_terminal() || backoff.attempts() + 1 >= max_attempts {
            return Err(error);
        }
        let delay = backoff.next_delay();
        log::warn!(
            "[{} / {}] attempt {} failed: {}; retrying in {:?}",
            self.shared.partition.id(),
            self.shared.peer_id,
            backoff.attempts(),
            error,
            delay
        );
        tokio::time::sleep(delay).await;
        Ok(())
    }
}
