//! Partitioned Channel
//!
//! Bounded hand-off between a reader and its importers. A channel has a fixed
//! number of partitions, each a bounded queue drained by exactly one
//! consumer. Data events are routed by `crc32(table) % partitions`, so every
//! event of a table passes through the same partition in emission order.
//! `Finished` is broadcast to every partition.
//!
//! A producer waits for space up to the push timeout and then fails with
//! [`Error::ChannelFull`]; nothing is ever dropped. A consumer waits up to the
//! pop timeout and gets `None` when no data arrived.

mod ack;

pub use ack::AckTracker;

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{SendTimeoutError, TryRecvError};

use crate::config::PipelineConfig;
use crate::error::{Error, Result};
use crate::position::Position;
use crate::record::RowEvent;

/// An event together with its acknowledgement number
#[derive(Debug)]
pub struct Delivery {
    /// `None` for control events that are never acknowledged
    pub seq: Option<u64>,
    pub event: RowEvent,
}

/// Channel construction parameters
#[derive(Debug, Clone)]
pub struct ChannelOptions {
    pub partitions: usize,
    pub capacity: usize,
    pub push_timeout: Duration,
    pub pop_timeout: Duration,
}

impl ChannelOptions {
    pub fn from_pipeline(config: &PipelineConfig) -> Self {
        Self {
            partitions: config.importer_concurrency,
            capacity: config.channel_capacity,
            push_timeout: config.push_timeout(),
            pop_timeout: config.pop_timeout(),
        }
    }

    pub fn with_partitions(mut self, partitions: usize) -> Self {
        self.partitions = partitions;
        self
    }
}

/// Partition a table's events are routed to
pub fn partition_for(table: &str, partitions: usize) -> usize {
    if partitions <= 1 {
        return 0;
    }
    (crc32fast::hash(table.as_bytes()) as usize) % partitions
}

fn lock(tracker: &Mutex<AckTracker>) -> MutexGuard<'_, AckTracker> {
    tracker.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Constructor for partitioned channels
pub struct Channel;

impl Channel {
    /// Build a channel and its consumers.
    ///
    /// Consumer `i` is bound to partition `i` for the channel's lifetime.
    pub fn new(options: ChannelOptions) -> (ChannelProducer, Vec<ChannelConsumer>) {
        Self::resume(options, None)
    }

    /// Build a channel whose watermark starts at a persisted position
    pub fn resume(
        options: ChannelOptions,
        committed: Option<Position>,
    ) -> (ChannelProducer, Vec<ChannelConsumer>) {
        let partitions = options.partitions.max(1);
        let capacity = options.capacity.max(1);
        let tracker = Arc::new(Mutex::new(AckTracker::with_committed(committed)));

        let mut senders = Vec::with_capacity(partitions);
        let mut consumers = Vec::with_capacity(partitions);
        for partition in 0..partitions {
            let (tx, rx) = mpsc::channel(capacity);
            senders.push(tx);
            consumers.push(ChannelConsumer {
                partition,
                receiver: rx,
                pop_timeout: options.pop_timeout,
                tracker: tracker.clone(),
            });
        }

        let producer = ChannelProducer {
            senders,
            push_timeout: options.push_timeout,
            tracker,
        };
        (producer, consumers)
    }
}

/// Producer side, owned by a single reader
pub struct ChannelProducer {
    senders: Vec<mpsc::Sender<Delivery>>,
    push_timeout: Duration,
    tracker: Arc<Mutex<AckTracker>>,
}

impl ChannelProducer {
    pub fn partitions(&self) -> usize {
        self.senders.len()
    }

    /// Push one event, waiting for space up to the push timeout
    pub async fn push(&self, event: RowEvent) -> Result<()> {
        if event.is_finished() {
            for partition in 0..self.senders.len() {
                self.send(
                    partition,
                    Delivery {
                        seq: None,
                        event: event.clone(),
                    },
                )
                .await?;
            }
            return Ok(());
        }

        let partition = event
            .table()
            .map(|table| partition_for(table, self.senders.len()))
            .unwrap_or(0);
        let seq = match event.position() {
            Some(position) => Some(lock(&self.tracker).register(position.clone())),
            None => None,
        };
        self.send(partition, Delivery { seq, event }).await
    }

    pub async fn push_all(&self, events: Vec<RowEvent>) -> Result<()> {
        for event in events {
            self.push(event).await?;
        }
        Ok(())
    }

    async fn send(&self, partition: usize, delivery: Delivery) -> Result<()> {
        match self.senders[partition]
            .send_timeout(delivery, self.push_timeout)
            .await
        {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(_)) => {
                tracing::error!(
                    "Channel partition {} stayed full for {:?}",
                    partition,
                    self.push_timeout
                );
                Err(Error::ChannelFull {
                    partition,
                    timeout_ms: self.push_timeout.as_millis() as u64,
                })
            }
            Err(SendTimeoutError::Closed(_)) => Err(Error::ChannelClosed),
        }
    }

    /// Position of the highest contiguously applied event
    pub fn committed(&self) -> Option<Position> {
        lock(&self.tracker).committed().cloned()
    }

    /// Applied row events so far
    pub fn acked_records(&self) -> u64 {
        lock(&self.tracker).acked_data()
    }

    /// Handle for reading the watermark after the producer is moved
    pub fn watermark(&self) -> Watermark {
        Watermark {
            tracker: self.tracker.clone(),
        }
    }
}

/// Read-only view of a channel's acknowledgement state
#[derive(Clone)]
pub struct Watermark {
    tracker: Arc<Mutex<AckTracker>>,
}

impl Watermark {
    pub fn committed(&self) -> Option<Position> {
        lock(&self.tracker).committed().cloned()
    }

    pub fn acked_records(&self) -> u64 {
        lock(&self.tracker).acked_data()
    }
}

/// Consumer side, bound to one partition
pub struct ChannelConsumer {
    partition: usize,
    receiver: mpsc::Receiver<Delivery>,
    pop_timeout: Duration,
    tracker: Arc<Mutex<AckTracker>>,
}

impl ChannelConsumer {
    pub fn partition(&self) -> usize {
        self.partition
    }

    /// Wait up to the pop timeout for the next event.
    ///
    /// `Ok(None)` means no data arrived in time. A producer that went away
    /// without sending `Finished` is reported as [`Error::ChannelClosed`].
    pub async fn pop(&mut self) -> Result<Option<Delivery>> {
        match tokio::time::timeout(self.pop_timeout, self.receiver.recv()).await {
            Err(_) => Ok(None),
            Ok(Some(delivery)) => Ok(Some(delivery)),
            Ok(None) => Err(Error::ChannelClosed),
        }
    }

    /// Pop up to `max` events, waiting only for the first.
    ///
    /// A `Finished` event ends the batch.
    pub async fn fetch(&mut self, max: usize) -> Result<Vec<Delivery>> {
        let mut batch = Vec::new();
        let Some(first) = self.pop().await? else {
            return Ok(batch);
        };
        let finished = first.event.is_finished();
        batch.push(first);
        if finished {
            return Ok(batch);
        }

        while batch.len() < max {
            match self.receiver.try_recv() {
                Ok(delivery) => {
                    let finished = delivery.event.is_finished();
                    batch.push(delivery);
                    if finished {
                        break;
                    }
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => break,
            }
        }
        Ok(batch)
    }

    /// Acknowledge applied events
    pub fn ack(&self, seqs: &[u64], data_records: u64) {
        if seqs.is_empty() && data_records == 0 {
            return;
        }
        lock(&self.tracker).ack(seqs, data_records);
    }
}
