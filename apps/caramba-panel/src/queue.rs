use std::collections::VecDeque;

use caramba_shared::command::PendingCommand;

/// Bounded per-node outbound FIFO. Lives inside `NodeSessionState`
/// behind the Registry's own per-entry lock rather than owning a second
/// lock — enqueue and drain are both already serialized by that lock.
#[derive(Debug)]
pub struct CommandQueue {
    capacity: usize,
    items: VecDeque<PendingCommand>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum EnqueueError {
    QueueFull,
}

impl CommandQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            items: VecDeque::with_capacity(capacity.min(64)),
        }
    }

    /// Fails with `QueueFull` at capacity. Never blocks.
    pub fn enqueue(&mut self, cmd: PendingCommand) -> Result<(), EnqueueError> {
        if self.items.len() >= self.capacity {
            return Err(EnqueueError::QueueFull);
        }
        self.items.push_back(cmd);
        Ok(())
    }

    /// Atomically removes and returns everything queued. May be empty.
    pub fn drain(&mut self) -> Vec<PendingCommand> {
        self.items.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use caramba_shared::command::CommandKind;
    use std::collections::HashMap;

    fn cmd(node_id: &str) -> PendingCommand {
        PendingCommand::new(node_id, CommandKind::AddUser, HashMap::new())
    }

    #[test]
    fn drain_returns_fifo_order_and_empties() {
        let mut q = CommandQueue::new(100);
        for _ in 0..3 {
            q.enqueue(cmd("node-A")).unwrap();
        }
        let drained = q.drain();
        assert_eq!(drained.len(), 3);
        assert!(q.is_empty());
        assert!(q.drain().is_empty());
    }

    #[test]
    fn enqueue_past_capacity_fails_on_the_overflowing_call() {
        let mut q = CommandQueue::new(100);
        for _ in 0..100 {
            q.enqueue(cmd("node-A")).unwrap();
        }
        assert_eq!(q.enqueue(cmd("node-A")), Err(EnqueueError::QueueFull));
        assert_eq!(q.len(), 100);
        assert_eq!(q.drain().len(), 100);
    }
}
