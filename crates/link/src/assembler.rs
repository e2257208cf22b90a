//! Item buffer the link fills while assembling one relay message.

use crate::message::RelayMessageItem;

/// Accumulates items and their running encoded size until the link flushes
/// them into a relay message.
#[derive(Debug, Default)]
pub struct ItemBuffer {
    items: Vec<RelayMessageItem>,
    size: i64,
}

impl ItemBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, item: RelayMessageItem) {
        self.size += item.len();
        self.items.push(item);
    }

    /// Running encoded size of the buffered items.
    pub fn size(&self) -> i64 {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Drains the buffer, resetting the running size.
    pub fn take(&mut self) -> Vec<RelayMessageItem> {
        self.size = 0;
        std::mem::take(&mut self.items)
    }
}
