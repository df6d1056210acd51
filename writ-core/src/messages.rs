use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    /// Output of `print(...)` and VM logging.
    Print,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub kind: MessageKind,
    pub msg: String,
}

impl Message {
    pub fn print<S: Into<String>>(msg: S) -> Self {
        Message {
            kind: MessageKind::Print,
            msg: msg.into(),
        }
    }

    pub fn warning<S: Into<String>>(msg: S) -> Self {
        Message {
            kind: MessageKind::Warning,
            msg: msg.into(),
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.kind {
            MessageKind::Print => write!(f, "{}", self.msg),
            MessageKind::Warning => write!(f, "warning: {}", self.msg),
        }
    }
}

/// Out-of-band output (`print`, VM logging, load warnings) waiting for the
/// host to drain it. Clones share one queue, so an engine and the queries
/// it creates report through the same channel.
#[derive(Clone, Debug, Default)]
pub struct MessageQueue {
    inner: Arc<Mutex<VecDeque<Message>>>,
}

impl MessageQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn queue(&self) -> MutexGuard<'_, VecDeque<Message>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Oldest message first.
    pub fn next(&self) -> Option<Message> {
        self.queue().pop_front()
    }

    pub fn push(&self, kind: MessageKind, msg: String) {
        self.queue().push_back(Message { kind, msg });
    }

    pub fn extend<T: IntoIterator<Item = Message>>(&self, messages: T) {
        self.queue().extend(messages)
    }

    pub fn is_empty(&self) -> bool {
        self.queue().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_come_out_in_the_order_they_went_in() {
        let queue = MessageQueue::new();
        let shared = queue.clone();
        queue.push(MessageKind::Print, "one".to_owned());
        shared.extend(vec![Message::warning("two"), Message::print("three")]);

        let drained: Vec<String> = std::iter::from_fn(|| queue.next())
            .map(|m| m.to_string())
            .collect();
        assert_eq!(drained, vec!["one", "warning: two", "three"]);
        assert!(shared.is_empty());
    }
}
