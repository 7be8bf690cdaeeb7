//! Per-message usage keyed by message id, with thread-level rollups.

use std::collections::HashMap;

use chat_protocol::{ThreadRecord, ThreadUsage};

#[derive(Debug, Clone, Default)]
pub struct UsageAggregator {
    by_message: HashMap<String, ThreadUsage>,
}

impl UsageAggregator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores usage for a message, overwriting any earlier value for that id.
    pub fn record(&mut self, message_id: impl Into<String>, usage: ThreadUsage) {
        self.by_message.insert(message_id.into(), usage);
    }

    #[must_use]
    pub fn get(&self, message_id: &str) -> Option<ThreadUsage> {
        self.by_message.get(message_id).copied()
    }

    /// Drops usage for every id rejected by `keep`.
    pub fn retain(&mut self, mut keep: impl FnMut(&str) -> bool) {
        self.by_message.retain(|message_id, _| keep(message_id));
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_message.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_message.is_empty()
    }

    /// Sums usage across the given live message ids. Ids without recorded
    /// usage contribute nothing.
    #[must_use]
    pub fn rollup<'a>(&self, live_message_ids: impl IntoIterator<Item = &'a str>) -> ThreadUsage {
        live_message_ids
            .into_iter()
            .filter_map(|message_id| self.by_message.get(message_id))
            .fold(ThreadUsage::default(), |total, usage| total.saturating_add(usage))
    }

    /// Sums usage across the live transcript of `thread`.
    #[must_use]
    pub fn rollup_thread(&self, thread: &ThreadRecord) -> ThreadUsage {
        let live = thread.live_transcript();
        self.rollup(live.iter().map(|record| record.message.id.as_str()))
    }
}
