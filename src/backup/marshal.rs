//! Hand-off of events from reader tasks to the control loop.
//!
//! Producers post from any thread; the control loop pumps the queue once per
//! iteration. Each posted event is handed to the pump callback exactly once, in
//! the order it was posted.

use std::sync::Arc;

use crossbeam_channel::{unbounded, Receiver, Sender};
use tokio::sync::Notify;

pub struct EventMarshaler<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
    wake: Arc<Notify>,
}

/// Producer side, cheap to clone into background tasks.
pub struct MarshalHandle<T> {
    tx: Sender<T>,
    wake: Arc<Notify>,
}

impl<T> Clone for MarshalHandle<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            wake: self.wake.clone(),
        }
    }
}

impl<T> MarshalHandle<T> {
    /// Queues an event for the control loop. Returns false once the loop is gone.
    pub fn post(&self, event: T) -> bool {
        let sent = self.tx.send(event).is_ok();
        if sent {
            self.wake.notify_one();
        }
        sent
    }
}

impl<T> EventMarshaler<T> {
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        Self {
            tx,
            rx,
            wake: Arc::new(Notify::new()),
        }
    }

    pub fn handle(&self) -> MarshalHandle<T> {
        MarshalHandle {
            tx: self.tx.clone(),
            wake: self.wake.clone(),
        }
    }

    pub fn pending(&self) -> usize {
        self.rx.len()
    }

    /// Delivers the events queued at call time. Events posted by `deliver` itself
    /// wait for the next pump.
    pub fn pump(&self, mut deliver: impl FnMut(T)) -> usize {
        let queued = self.rx.len();
        let mut delivered = 0;
        while delivered < queued {
            match self.rx.try_recv() {
                Ok(event) => {
                    deliver(event);
                    delivered += 1;
                }
                Err(_) => break,
            }
        }
        delivered
    }

    /// Takes the queued events without delivering them.
    pub fn drain(&self) -> Vec<T> {
        let mut events = Vec::with_capacity(self.rx.len());
        self.pump(|event| events.push(event));
        events
    }

    /// Resolves once something was posted since the last wake-up.
    pub async fn notified(&self) {
        if self.rx.is_empty() {
            self.wake.notified().await;
        }
    }
}

impl<T> Default for EventMarshaler<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_background_lines_arrive_in_order() {
        let marshaler = EventMarshaler::new();
        let handle = marshaler.handle();

        let emitter = std::thread::spawn(move || {
            for i in 0..500 {
                handle.post(format!("line {}", i));
            }
        });

        let mut seen = Vec::new();
        while seen.len() < 500 {
            marshaler.pump(|line| seen.push(line));
            std::thread::sleep(Duration::from_millis(1));
        }
        emitter.join().unwrap();

        let expected: Vec<String> = (0..500).map(|i| format!("line {}", i)).collect();
        assert_eq!(seen, expected);
    }

    #[test]
    fn test_each_event_is_delivered_once() {
        let marshaler = EventMarshaler::new();
        let handle = marshaler.handle();
        handle.post(1);
        handle.post(2);

        let mut count = 0;
        assert_eq!(marshaler.pump(|_| count += 1), 2);
        assert_eq!(marshaler.pump(|_| count += 1), 0);
        assert_eq!(count, 2);
        assert_eq!(marshaler.pending(), 0);
    }

    #[test]
    fn test_events_posted_while_pumping_wait_for_next_tick() {
        let marshaler = EventMarshaler::new();
        let handle = marshaler.handle();
        handle.post(1u32);

        let mut seen = Vec::new();
        marshaler.pump(|n| {
            seen.push(n);
            handle.post(n + 1);
        });
        assert_eq!(seen, vec![1]);
        assert_eq!(marshaler.drain(), vec![2]);
    }

    #[test]
    fn test_post_after_drop_reports_failure() {
        let handle = {
            let marshaler = EventMarshaler::<u8>::new();
            marshaler.handle()
        };
        assert!(!handle.post(1));
    }

    #[tokio::test]
    async fn test_notified_wakes_on_post() {
        let marshaler = Arc::new(EventMarshaler::new());
        let handle = marshaler.handle();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            handle.post("done");
        });

        tokio::time::timeout(Duration::from_secs(5), marshaler.notified())
            .await
            .unwrap();
        assert_eq!(marshaler.drain(), vec!["done"]);
    }
}
