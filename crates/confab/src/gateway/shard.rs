//! Shard ownership.
//!
//! Several processes may serve the same platform account. Each conversation is
//! owned by exactly one shard: the one recorded in its assignment, or else the
//! one picked by its creation time.

use chrono::{DateTime, Utc};

use crate::config::ShardConfig;

impl ShardConfig {
    /// Shard responsible for a conversation created at `created_at`.
    pub fn shard_for(&self, created_at: DateTime<Utc>) -> u32 {
        let count = i64::from(self.count.max(1));
        // rem_euclid keeps pre-epoch timestamps in range
        created_at.timestamp().rem_euclid(count) as u32
    }

    /// Whether this process handles the conversation.
    pub fn owns(&self, created_at: DateTime<Utc>, owner_shard: Option<u32>) -> bool {
        if self.count <= 1 {
            return true;
        }
        match owner_shard {
            Some(owner) => owner == self.id,
            None => self.shard_for(created_at) == self.id,
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn shard(count: u32, id: u32) -> ShardConfig {
        ShardConfig { count, id }
    }

    #[test]
    fn single_shard_owns_everything() {
        let created = Utc.timestamp_opt(7, 0).single().unwrap();
        assert!(shard(1, 0).owns(created, Some(3)));
    }

    #[test]
    fn creation_time_partitions_conversations() {
        let created = Utc.timestamp_opt(1_700_000_001, 0).single().unwrap();
        assert!(shard(2, 1).owns(created, None));
        assert!(!shard(2, 0).owns(created, None));
    }

    #[test]
    fn recorded_owner_wins() {
        let created = Utc.timestamp_opt(1_700_000_001, 0).single().unwrap();
        assert!(shard(2, 0).owns(created, Some(0)));
        assert!(!shard(2, 1).owns(created, Some(0)));
    }
}
