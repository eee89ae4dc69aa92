//! # Worker Threads
//!
//! Two long-running loops the endpoint builds on:
//!
//! - [`AckSender`] drives an [`AckScheduler`]: it sleeps on the scheduler's
//!   doorbell until a peer's ACKs become eligible, drains the batch and hands
//!   it to a send callback.
//! - [`MessageDelivery`] owns a bounded queue of finished items (completed
//!   messages, events) and runs a handler on each, off the receive path.
//!
//! Both re-check their liveness flag on every wake and at least once per
//! [`IDLE_RECHECK_MS`]. Dropping either one stops and joins its thread.

use std::hash::Hash;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use thiserror::Error;
use tracing::{debug, trace};

use crate::ack::{AckBitfield, AckPoll, AckScheduler, IDLE_RECHECK_MS};
use crate::clock::Clock;

/// Delivery queue poll interval.
const DELIVERY_POLL_MS: u64 = 100;

// ─── AckSender ──────────────────────────────────────────────────────────────

pub struct AckSender<K> {
    scheduler: Arc<AckScheduler<K>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl<K> AckSender<K>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
{
    /// Start the loop on a thread called `name`. `send` is called with each
    /// peer's batch, oldest pending peer first.
    pub fn spawn<F>(
        name: &str,
        scheduler: Arc<AckScheduler<K>>,
        clock: Arc<dyn Clock>,
        send: F,
    ) -> io::Result<Self>
    where
        F: FnMut(&K, Vec<AckBitfield>) + Send + 'static,
    {
        let worker_scheduler = scheduler.clone();
        let handle = thread::Builder::new()
            .name(name.into())
            .spawn(move || ack_sender_loop(&worker_scheduler, clock.as_ref(), send))?;
        Ok(AckSender {
            scheduler,
            handle: Some(handle),
        })
    }

    pub fn scheduler(&self) -> &Arc<AckScheduler<K>> {
        &self.scheduler
    }

    /// Stop the loop and wait for it. Idempotent.
    pub fn shutdown(&mut self) {
        self.scheduler.shutdown();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl<K> Drop for AckSender<K> {
    fn drop(&mut self) {
        self.scheduler.shutdown();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn ack_sender_loop<K, F>(scheduler: &AckScheduler<K>, clock: &dyn Clock, mut send: F)
where
    K: Clone + Eq + Hash,
    F: FnMut(&K, Vec<AckBitfield>),
{
    debug!("ack sender started");
    while scheduler.is_running() {
        match scheduler.poll(clock.now_ms()) {
            AckPoll::Ready(peer, batch) => {
                trace!(acks = batch.len(), "sending ack batch");
                send(&peer, batch);
            }
            AckPoll::Wait(delay) => {
                let ms = delay.unwrap_or(IDLE_RECHECK_MS).clamp(1, IDLE_RECHECK_MS);
                scheduler.wait(Duration::from_millis(ms));
            }
        }
    }
    debug!("ack sender stopped");
}

// ─── MessageDelivery ────────────────────────────────────────────────────────

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DeliveryError<T> {
    #[error("delivery queue full")]
    Full(T),
    #[error("delivery worker stopped")]
    Stopped(T),
}

/// Bounded queue drained by a dedicated thread.
pub struct MessageDelivery<T> {
    tx: Sender<T>,
    running: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl<T: Send + 'static> MessageDelivery<T> {
    pub fn spawn<F>(name: &str, capacity: usize, handler: F) -> io::Result<Self>
    where
        F: FnMut(T) + Send + 'static,
    {
        let (tx, rx) = bounded(capacity.max(1));
        let running = Arc::new(AtomicBool::new(true));
        let worker_running = running.clone();
        let handle = thread::Builder::new()
            .name(name.into())
            .spawn(move || delivery_loop(rx, &worker_running, handler))?;
        Ok(MessageDelivery {
            tx,
            running,
            handle: Some(handle),
        })
    }

    /// Hand an item to the worker without blocking.
    pub fn deliver(&self, item: T) -> Result<(), DeliveryError<T>> {
        if !self.running.load(Ordering::Acquire) {
            return Err(DeliveryError::Stopped(item));
        }
        self.tx.try_send(item).map_err(|e| match e {
            TrySendError::Full(item) => DeliveryError::Full(item),
            TrySendError::Disconnected(item) => DeliveryError::Stopped(item),
        })
    }

    pub fn queued(&self) -> usize {
        self.tx.len()
    }

    /// Stop after handling what is already queued. Idempotent.
    pub fn shutdown(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl<T> Drop for MessageDelivery<T> {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn delivery_loop<T, F>(rx: Receiver<T>, running: &AtomicBool, mut handler: F)
where
    F: FnMut(T),
{
    while running.load(Ordering::Acquire) {
        match rx.recv_timeout(Duration::from_millis(DELIVERY_POLL_MS)) {
            Ok(item) => handler(item),
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    for item in rx.try_iter() {
        handler(item);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::Mutex;

    // ─── AckSender Tests ────────────────────────────────────────────────

    #[test]
    fn ack_sender_sends_queued_batch() {
        let scheduler = Arc::new(AckScheduler::<u32>::new(0));
        let clock = Arc::new(ManualClock::new(0));
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut sender = AckSender::spawn("test-acks", scheduler.clone(), clock, move |peer, acks| {
            let _ = tx.send((*peer, acks));
        })
        .unwrap();

        scheduler.add_pending(&7, AckBitfield::fully_received(1, 3), 0);
        let (peer, acks) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(peer, 7);
        assert_eq!(acks, vec![AckBitfield::fully_received(1, 3)]);
        sender.shutdown();
        assert!(!scheduler.is_running());
    }

    #[test]
    fn ack_sender_stops_promptly_when_idle() {
        let scheduler = Arc::new(AckScheduler::<u32>::new(150));
        let clock = Arc::new(ManualClock::new(0));
        let sender = AckSender::spawn("test-acks-idle", scheduler, clock, |_, _| {}).unwrap();
        let started = std::time::Instant::now();
        drop(sender);
        assert!(started.elapsed() < Duration::from_millis(IDLE_RECHECK_MS + 500));
    }

    // ─── MessageDelivery Tests ──────────────────────────────────────────

    #[test]
    fn delivery_runs_handler_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let mut delivery = MessageDelivery::spawn("test-delivery", 16, move |n: u32| {
            sink.lock().unwrap().push(n);
        })
        .unwrap();
        for n in 0..10 {
            delivery.deliver(n).unwrap();
        }
        delivery.shutdown();
        assert_eq!(*seen.lock().unwrap(), (0..10).collect::<Vec<_>>());
        assert_eq!(delivery.deliver(99), Err(DeliveryError::Stopped(99)));
    }

    #[test]
    fn full_queue_hands_item_back() {
        let (gate_tx, gate_rx) = bounded::<()>(0);
        let delivery = MessageDelivery::spawn("test-delivery-full", 1, move |_: u32| {
            let _ = gate_rx.recv_timeout(Duration::from_secs(2));
        })
        .unwrap();
        // First item occupies the handler, second the queue slot.
        delivery.deliver(1).unwrap();
        std::thread::sleep(Duration::from_millis(50));
        delivery.deliver(2).unwrap();
        assert_eq!(delivery.deliver(3), Err(DeliveryError::Full(3)));
        drop(gate_tx);
    }
}
