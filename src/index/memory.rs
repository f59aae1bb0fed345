use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use super::{DocumentSink, IndexError};
use crate::document::IndexDocument;

/// In-memory index keyed by message id, with per-id failure injection.
#[derive(Default)]
pub struct MemorySink {
    docs: Mutex<HashMap<String, IndexDocument>>,
    writes: Mutex<Vec<String>>,
    failing: Mutex<HashSet<String>>,
    refreshes: Mutex<u32>,
}

impl MemorySink {
    pub fn fail_on(&self, message_id: &str) {
        self.failing.lock().unwrap().insert(message_id.to_string());
    }

    pub fn get(&self, message_id: &str) -> Option<IndexDocument> {
        self.docs.lock().unwrap().get(message_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.docs.lock().unwrap().len()
    }

    /// Message ids in write order, including overwrites.
    pub fn writes(&self) -> Vec<String> {
        self.writes.lock().unwrap().clone()
    }

    pub fn refreshes(&self) -> u32 {
        *self.refreshes.lock().unwrap()
    }
}

#[async_trait]
impl DocumentSink for MemorySink {
    async fn upsert(&self, document: &IndexDocument) -> Result<(), IndexError> {
        if self.failing.lock().unwrap().contains(&document.message_id) {
            return Err(IndexError::Status {
                status: 400,
                body: "mapper_parsing_exception".to_string(),
            });
        }
        self.writes.lock().unwrap().push(document.message_id.clone());
        self.docs
            .lock()
            .unwrap()
            .insert(document.message_id.clone(), document.clone());
        Ok(())
    }

    async fn refresh(&self) -> Result<(), IndexError> {
        *self.refreshes.lock().unwrap() += 1;
        Ok(())
    }
}
