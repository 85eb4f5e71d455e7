use crate::error::Result;

use async_trait::async_trait;
use dashmap::DashMap;

/// Acknowledges consumed positions back to the change stream
#[async_trait]
pub trait OffsetCommitter: Send + Sync {
    async fn commit_offset(&self, topic: &str, partition: u32, offset: u64) -> Result<()>;
}

/// Records the highest committed offset per topic partition
#[derive(Debug, Default)]
pub struct InMemoryOffsetCommitter {
    committed: DashMap<(String, u32), u64>,
}

impl InMemoryOffsetCommitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn committed(&self, topic: &str, partition: u32) -> Option<u64> {
        self.committed
            .get(&(topic.to_string(), partition))
            .map(|offset| *offset)
    }
}

#[async_trait]
impl OffsetCommitter for InMemoryOffsetCommitter {
    async fn commit_offset(&self, topic: &str, partition: u32, offset: u64) -> Result<()> {
        self.committed
            .entry((topic.to_string(), partition))
            .and_modify(|current| *current = (*current).max(offset))
            .or_insert(offset);
        Ok(())
    }
}
