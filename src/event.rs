//! Node-wide event bus

use crate::blockchain::Block;
use crate::error::ChainError;
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::debug;

#[derive(Debug, Clone)]
pub enum Event {
    /// A block sealed by the local miner was imported.
    NewMinedBlock(Block),
    StartSync,
    DoneSync,
    FailedSync(String),
}

/// Fan-out of [`Event`]s to every live subscriber.
#[derive(Default)]
pub struct EventMux {
    subscribers: Mutex<Vec<Sender<Event>>>,
    stopped: Mutex<bool>,
}

impl EventMux {
    pub fn new() -> Self {
        Self::default()
    }

    /// New subscription. After `stop` the returned receiver is already closed.
    pub fn subscribe(&self) -> Receiver<Event> {
        let (tx, rx) = unbounded();
        if !*self.stopped.lock() {
            self.subscribers.lock().push(tx);
        }
        rx
    }

    pub fn post(&self, event: Event) -> Result<(), ChainError> {
        if *self.stopped.lock() {
            return Err(ChainError::MuxClosed);
        }
        self.subscribers.lock().retain(|sub| sub.send(event.clone()).is_ok());
        Ok(())
    }

    /// Closes every subscription. Idempotent.
    pub fn stop(&self) {
        let mut stopped = self.stopped.lock();
        if !*stopped {
            *stopped = true;
            self.subscribers.lock().clear();
            debug!("Event mux stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_post_reaches_all_subscribers() {
        let mux = EventMux::new();
        let a = mux.subscribe();
        let b = mux.subscribe();
        mux.post(Event::StartSync).unwrap();
        assert!(matches!(a.recv().unwrap(), Event::StartSync));
        assert!(matches!(b.recv().unwrap(), Event::StartSync));
    }

    #[test]
    fn test_dropped_subscriber_is_pruned() {
        let mux = EventMux::new();
        drop(mux.subscribe());
        mux.post(Event::DoneSync).unwrap();
        assert!(mux.subscribers.lock().is_empty());
    }

    #[test]
    fn test_post_after_stop() {
        let mux = EventMux::new();
        let rx = mux.subscribe();
        mux.stop();
        assert!(matches!(mux.post(Event::DoneSync), Err(ChainError::MuxClosed)));
        assert!(rx.recv().is_err());
        assert!(mux.subscribe().recv().is_err());
    }
}
