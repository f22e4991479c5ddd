use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError, SyncSender, TrySendError};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use super::{HistoryStore, NewRecord};

const BATCH_SIZE: usize = 32;
const FLUSH_INTERVAL: Duration = Duration::from_secs(5);

/// Moves history writes off the sampling path. Records are stamped when
/// submitted and written in batches by a dedicated thread.
pub struct HistoryWriter {
    tx: Option<SyncSender<NewRecord>>,
    handle: Option<JoinHandle<()>>,
}

impl HistoryWriter {
    pub fn spawn(store: Arc<HistoryStore>, capacity: usize) -> std::io::Result<Self> {
        let (tx, rx) = mpsc::sync_channel(capacity.max(1));
        let handle = std::thread::Builder::new()
            .name("history-writer".to_string())
            .spawn(move || writer_task(store, rx))?;
        Ok(Self {
            tx: Some(tx),
            handle: Some(handle),
        })
    }

    /// Queues one interval. Returns `false` when the delta is empty, the
    /// queue is full, or the writer has stopped.
    pub fn submit(&self, source: &str, bytes_down: u64, bytes_up: u64) -> bool {
        let record = NewRecord::now(source, bytes_down, bytes_up);
        if record.is_empty() {
            return false;
        }
        let Some(tx) = &self.tx else {
            return false;
        };
        match tx.try_send(record) {
            Ok(()) => true,
            Err(TrySendError::Full(dropped)) => {
                warn!(
                    source = %dropped.source,
                    bytes_down = dropped.bytes_down,
                    bytes_up = dropped.bytes_up,
                    "History queue is full, dropping sample."
                );
                false
            }
            Err(TrySendError::Disconnected(_)) => {
                error!("History writer thread is gone, sample not recorded.");
                false
            }
        }
    }

    /// Flushes everything queued so far and waits for the thread to exit.
    pub fn shutdown(mut self) {
        self.close();
    }

    fn close(&mut self) {
        // Dropping the sender disconnects the channel, which makes the
        // thread flush and return.
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("History writer thread panicked.");
            }
        }
    }
}

impl Drop for HistoryWriter {
    fn drop(&mut self) {
        self.close();
    }
}

fn writer_task(store: Arc<HistoryStore>, rx: mpsc::Receiver<NewRecord>) {
    info!("History writer thread started.");
    let mut buffer = Vec::with_capacity(BATCH_SIZE);

    loop {
        match rx.recv_timeout(FLUSH_INTERVAL) {
            Ok(record) => {
                buffer.push(record);
                if buffer.len() >= BATCH_SIZE {
                    flush(&store, &mut buffer);
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                if !buffer.is_empty() {
                    flush(&store, &mut buffer);
                }
            }
            Err(RecvTimeoutError::Disconnected) => {
                info!("History channel closed. Flushing remaining samples and stopping writer.");
                flush(&store, &mut buffer);
                break;
            }
        }
    }
    info!("History writer thread finished.");
}

fn flush(store: &HistoryStore, buffer: &mut Vec<NewRecord>) {
    if buffer.is_empty() {
        return;
    }
    let written = store.append_records(buffer);
    debug!(queued = buffer.len(), written, "Flushed history batch.");
    buffer.clear();
}
