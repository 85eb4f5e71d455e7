use crate::error::{Result, RustAclError};
use crate::event::ChangeEvent;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::error;

/// Receives events whose handling failed for good
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn dead_letter(&self, event: &ChangeEvent, error: &RustAclError, attempts: u32)
        -> Result<()>;
}

/// Logs dead letters and drops them
#[derive(Debug, Default)]
pub struct LoggingDeadLetterSink;

#[async_trait]
impl DeadLetterSink for LoggingDeadLetterSink {
    async fn dead_letter(
        &self,
        event: &ChangeEvent,
        error: &RustAclError,
        attempts: u32,
    ) -> Result<()> {
        error!(
            "Dead letter {} after {} attempts (key: {:?}): {}",
            event,
            attempts,
            event.key.as_ref().map(|k| String::from_utf8_lossy(k).to_string()),
            error
        );
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub event: ChangeEvent,
    pub error: String,
    pub attempts: u32,
}

/// Keeps dead letters in memory for inspection
#[derive(Debug, Default)]
pub struct InMemoryDeadLetterSink {
    letters: Mutex<Vec<DeadLetter>>,
}

impl InMemoryDeadLetterSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn letters(&self) -> Vec<DeadLetter> {
        self.letters.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.letters.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl DeadLetterSink for InMemoryDeadLetterSink {
    async fn dead_letter(
        &self,
        event: &ChangeEvent,
        error: &RustAclError,
        attempts: u32,
    ) -> Result<()> {
        self.letters.lock().push(DeadLetter {
            event: event.clone(),
            error: error.to_string(),
            attempts,
        });
        Ok(())
    }
}
