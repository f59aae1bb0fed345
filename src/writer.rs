use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::document::IndexDocument;
use crate::index::DocumentSink;

const LANE_CAPACITY: usize = 1024;

/// Fan-out of index writes over a fixed set of lanes.
///
/// A document always lands on the lane chosen by its message id, and each
/// lane writes strictly in arrival order. Two versions of the same message are
/// therefore applied in the order they were received, while unrelated
/// messages are written concurrently.
#[derive(Clone)]
pub struct IndexWriter {
    lanes: Vec<mpsc::Sender<IndexDocument>>,
}

impl IndexWriter {
    pub fn spawn(sink: Arc<dyn DocumentSink>, lanes: usize) -> (Self, Vec<JoinHandle<()>>) {
        let lanes = lanes.max(1);
        let mut senders = Vec::with_capacity(lanes);
        let mut handles = Vec::with_capacity(lanes);

        for lane in 0..lanes {
            let (tx, rx) = mpsc::channel(LANE_CAPACITY);
            senders.push(tx);
            handles.push(tokio::spawn(run_lane(lane, rx, sink.clone())));
        }

        (Self { lanes: senders }, handles)
    }

    fn lane_for(&self, message_id: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        message_id.hash(&mut hasher);
        (hasher.finish() % self.lanes.len() as u64) as usize
    }

    /// Queue a document for writing. Waits only if the lane is saturated.
    pub async fn submit(&self, document: IndexDocument) {
        let lane = self.lane_for(&document.message_id);
        if let Err(e) = self.lanes[lane].send(document).await {
            error!(
                message_id = %e.0.message_id,
                channel = %e.0.channel_name,
                "Index lane closed, dropping document"
            );
        }
    }
}

async fn run_lane(lane: usize, mut rx: mpsc::Receiver<IndexDocument>, sink: Arc<dyn DocumentSink>) {
    while let Some(document) = rx.recv().await {
        match sink.upsert(&document).await {
            Ok(()) => info!(
                message_id = %document.message_id,
                channel = %document.channel_name,
                "Indexed: {}",
                document.preview()
            ),
            Err(e) => error!(
                message_id = %document.message_id,
                channel = %document.channel_name,
                error = %e,
                "Failed to index message"
            ),
        }
    }
    debug!(lane, "Index lane finished");
}
