//! Shared command pool and a synthetic load generator

use cadence_consensus::{Command, Mempool};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Pending commands visible to every replica. Commands stay pending until a
/// replica executes them.
pub struct SharedMempool {
    pending: Mutex<VecDeque<Command>>,
    capacity: usize,
}

impl SharedMempool {
    /// Empty pool holding at most `capacity` commands
    pub fn new(capacity: usize) -> Self {
        Self {
            pending: Mutex::new(VecDeque::new()),
            capacity,
        }
    }

    /// Queue a command. Returns false when full or already pending.
    pub fn add(&self, command: Command) -> bool {
        let mut pending = self.pending.lock();
        if pending.len() >= self.capacity || pending.contains(&command) {
            return false;
        }
        pending.push_back(command);
        true
    }

    /// Forget a command that has been executed
    pub fn committed(&self, command: &Command) {
        self.pending.lock().retain(|c| c != command);
    }

    /// Number of pending commands
    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Whether nothing is pending
    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }
}

impl Mempool for SharedMempool {
    fn get_commands(&self, count: usize, exclude: &[Command]) -> Vec<Command> {
        self.pending
            .lock()
            .iter()
            .filter(|c| !exclude.contains(c))
            .take(count)
            .cloned()
            .collect()
    }
}

/// Feed `mempool` with `rate` random commands per second until shutdown
pub async fn generate_commands(
    mempool: Arc<SharedMempool>,
    rate: u64,
    mut shutdown: watch::Receiver<bool>,
) {
    if rate == 0 {
        return;
    }
    let mut ticker = tokio::time::interval(Duration::from_micros((1_000_000 / rate).max(1)));
    let mut sequence: u64 = 0;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let mut payload = sequence.to_be_bytes().to_vec();
                payload.extend_from_slice(&rand::random::<[u8; 24]>());
                if !mempool.add(Command::new(payload)) {
                    tracing::trace!(pending = mempool.len(), "Mempool full, command dropped");
                }
                sequence += 1;
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    tracing::debug!(generated = sequence, "Command generator stopping");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cmd(s: &str) -> Command {
        Command::new(s.as_bytes().to_vec())
    }

    #[test]
    fn test_get_commands_honours_exclude() {
        let mempool = SharedMempool::new(10);
        assert!(mempool.add(cmd("a")));
        assert!(mempool.add(cmd("b")));
        assert!(mempool.add(cmd("c")));

        let got = mempool.get_commands(1, &[cmd("a")]);
        assert_eq!(got, vec![cmd("b")]);
        // reads do not remove
        assert_eq!(mempool.len(), 3);
    }

    #[test]
    fn test_capacity_and_duplicates() {
        let mempool = SharedMempool::new(2);
        assert!(mempool.add(cmd("a")));
        assert!(!mempool.add(cmd("a")));
        assert!(mempool.add(cmd("b")));
        assert!(!mempool.add(cmd("c")));
    }

    #[test]
    fn test_committed_removes() {
        let mempool = SharedMempool::new(10);
        mempool.add(cmd("a"));
        mempool.add(cmd("b"));
        mempool.committed(&cmd("a"));
        mempool.committed(&cmd("a"));
        assert_eq!(mempool.get_commands(5, &[]), vec![cmd("b")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_generator_fills_pool() {
        let mempool = Arc::new(SharedMempool::new(100));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(generate_commands(mempool.clone(), 10, shutdown_rx));

        tokio::time::sleep(Duration::from_millis(950)).await;
        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
        assert_eq!(mempool.len(), 10);
    }
}
