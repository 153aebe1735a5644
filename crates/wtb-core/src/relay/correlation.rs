use std::collections::{HashMap, VecDeque};

use crate::domain::{MessageId, RemoteChatId};

/// Maps messages the relay showed to an operator back to the WhatsApp conversation
/// they came from, so replies can be routed.
///
/// Owned by a session and dropped with it. With a non-zero capacity the oldest
/// entry is evicted once full; entries are never updated, so insertion order is
/// also age order.
#[derive(Debug, Default)]
pub struct CorrelationTable {
    entries: HashMap<MessageId, RemoteChatId>,
    order: VecDeque<MessageId>,
    capacity: usize,
}

impl CorrelationTable {
    /// `capacity == 0` means unbounded.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    pub fn record(&mut self, relay_message: MessageId, remote_chat: RemoteChatId) {
        if self.entries.insert(relay_message, remote_chat).is_some() {
            // Overwrite keeps the original age.
            return;
        }
        self.order.push_back(relay_message);

        if self.capacity == 0 {
            return;
        }
        while self.entries.len() > self.capacity {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            self.entries.remove(&oldest);
        }
    }

    pub fn resolve(&self, relay_message: MessageId) -> Option<&RemoteChatId> {
        self.entries.get(&relay_message)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
