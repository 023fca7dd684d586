//! Background shipping queue and its single consumer

use crate::uploader::Uploader;
use metrics::counter;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// One closed segment waiting to be shipped
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueItem {
    pub path: PathBuf,
    /// Stops the worker once this item has been handled
    pub last: bool,
}

impl QueueItem {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            last: false,
        }
    }

    pub fn last(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            last: true,
        }
    }
}

/// Producer half; cheap to clone and never blocks
#[derive(Debug, Clone)]
pub struct ShippingQueue {
    sender: mpsc::UnboundedSender<QueueItem>,
}

impl ShippingQueue {
    /// A queue and the worker that drains it
    pub fn channel(uploader: Option<Uploader>) -> (Self, ShippingWorker) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, ShippingWorker { receiver, uploader })
    }

    /// Returns `false` once the worker has gone away
    pub fn enqueue(&self, item: QueueItem) -> bool {
        self.sender.send(item).is_ok()
    }

    pub fn enqueue_path(&self, path: &Path) -> bool {
        self.enqueue(QueueItem::new(path))
    }
}

/// What a worker did before it stopped
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ShippingSummary {
    pub processed: u32,
    pub uploaded: u32,
    pub failed: u32,
}

/// Drains a [`ShippingQueue`] in submission order.
///
/// Without an uploader items are only acknowledged. Upload errors stop at
/// this boundary and are counted, never raised.
#[derive(Debug)]
pub struct ShippingWorker {
    receiver: mpsc::UnboundedReceiver<QueueItem>,
    uploader: Option<Uploader>,
}

impl ShippingWorker {
    pub fn spawn(self) -> JoinHandle<ShippingSummary> {
        tokio::spawn(self.run())
    }

    /// Runs until a `last` item is handled or every queue handle is dropped
    pub async fn run(mut self) -> ShippingSummary {
        let mut summary = ShippingSummary::default();

        while let Some(item) = self.receiver.recv().await {
            summary.processed += 1;

            if let Some(uploader) = &self.uploader {
                match uploader.upload(&item.path).await {
                    Ok(_) => {
                        summary.uploaded += 1;
                        counter!("skiff.shipping.uploaded").increment(1);
                    }
                    Err(e) => {
                        summary.failed += 1;
                        counter!("skiff.shipping.failed", "kind" => e.kind()).increment(1);
                    }
                }
            }

            if item.last {
                break;
            }
        }

        summary
    }

    /// Items queued so far, without processing them
    #[cfg(test)]
    pub(crate) fn drain(&mut self) -> Vec<QueueItem> {
        let mut items = Vec::new();
        while let Ok(item) = self.receiver.try_recv() {
            items.push(item);
        }
        items
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_worker_stops_after_last_item() {
        let (queue, worker) = ShippingQueue::channel(None);
        let handle = worker.spawn();

        assert!(queue.enqueue(QueueItem::new("/tmp/a.log")));
        assert!(queue.enqueue(QueueItem::new("/tmp/b.log")));
        assert!(queue.enqueue(QueueItem::last("/tmp/c.log")));

        let summary = handle.await.unwrap();
        assert_eq!(summary.processed, 3);
        assert_eq!(summary.uploaded, 0);

        // Worker is gone; further items are refused.
        assert!(!queue.enqueue(QueueItem::new("/tmp/d.log")));
    }

    #[tokio::test]
    async fn test_worker_stops_when_queue_dropped() {
        let (queue, worker) = ShippingQueue::channel(None);
        let handle = worker.spawn();

        queue.enqueue_path(Path::new("/tmp/a.log"));
        drop(queue);

        let summary = handle.await.unwrap();
        assert_eq!(summary.processed, 1);
    }

    #[tokio::test]
    async fn test_items_after_last_are_not_processed() {
        let (queue, worker) = ShippingQueue::channel(None);
        queue.enqueue(QueueItem::last("/tmp/a.log"));
        queue.enqueue(QueueItem::new("/tmp/b.log"));

        let summary = worker.run().await;
        assert_eq!(summary.processed, 1);
    }
}
