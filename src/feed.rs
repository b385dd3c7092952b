//! Change feed
//!
//! A subscription first drains the backlog after its starting sequence and
//! then waits for new writes. Each subscription keeps its own cursor, so any
//! number of consumers can follow the same partition independently.

use std::collections::VecDeque;
use std::sync::Arc;

use futures_util::stream::{self, Stream};
use tokio::sync::watch;

use crate::store::{ChangeEntry, Partition, PartitionId};

const FILL_CHUNK: usize = 256;

pub struct ChangeSubscription {
    partition: Arc<Partition>,
    cursor: u64,
    seq_rx: watch::Receiver<u64>,
    buffer: VecDeque<ChangeEntry>,
}

impl ChangeSubscription {
    pub(crate) fn new(partition: Arc<Partition>, from_seq: u64) -> Self {
        let seq_rx = partition.watch_seq();
        Self {
            partition,
            cursor: from_seq,
            seq_rx,
            buffer: VecDeque::new(),
        }
    }

    pub fn partition_id(&self) -> &PartitionId {
        self.partition.id()
    }

    /// Sequence of the last entry handed out (or the starting sequence)
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    fn fill(&mut self, want: usize) {
        if self.buffer.len() >= want {
            return;
        }
        let after = self.buffer.back().map_or(self.cursor, |e| e.seq);
        let more = self
            .partition
            .changes_since_limited(after, want.max(FILL_CHUNK) - self.buffer.len());
        self.buffer.extend(more);
    }

    fn take(&mut self, max: usize) -> Vec<ChangeEntry> {
        let n = max.min(self.buffer.len());
        let batch: Vec<ChangeEntry> = self.buffer.drain(..n).collect();
        if let Some(last) = batch.last() {
            self.cursor = last.seq;
        }
        batch
    }

    /// Whatever is available right now, up to `max` entries, without waiting.
    pub fn try_next_batch(&mut self, max: usize) -> Vec<ChangeEntry> {
        self.seq_rx.borrow_and_update();
        self.fill(max);
        self.take(max)
    }

    /// Wait until at least one entry is available and return up to `max`.
    ///
    /// Cancel-safe: dropping the future before it resolves loses nothing, the
    /// next call picks up from the same cursor.
    pub async fn next_batch(&mut self, max: usize) -> Vec<ChangeEntry> {
        let max = max.max(1);
        loop {
            // Mark the current value seen before looking, so a write landing
            // after the check still wakes us.
            self.seq_rx.borrow_and_update();
            self.fill(max);
            if !self.buffer.is_empty() {
                return self.take(max);
            }
            if self.seq_rx.changed().await.is_err() {
                return Vec::new();
            }
        }
    }

    /// The next single entry. Waits for one if the backlog is drained.
    pub async fn next(&mut self) -> Option<ChangeEntry> {
        self.next_batch(1).await.into_iter().next()
    }

    pub fn into_stream(self) -> impl Stream<Item = ChangeEntry> {
        stream::unfold(self, |mut sub| async move {
            let entry = sub.next().await?;
            Some((entry, sub))
        })
    }
}
