#![forbid(unsafe_code)]
#![deny(warnings)]
#![warn(clippy::pedantic)]

//! Cancellation scoped to one active episode.
//!
//! A [`StopSignal`] is created on every activation and dropped on the matching
//! deactivation; listeners from an old episode can never observe the state of
//! a new one.

use tokio::sync::watch;

#[derive(Debug)]
pub struct StopSignal {
    tx: watch::Sender<bool>,
    episode: u64,
}

impl StopSignal {
    pub fn new(episode: u64) -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx, episode }
    }

    pub fn episode(&self) -> u64 {
        self.episode
    }

    /// Idempotent.
    pub fn stop(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn listener(&self) -> StopListener {
        StopListener {
            rx: self.tx.subscribe(),
            episode: self.episode,
        }
    }
}

#[derive(Clone, Debug)]
pub struct StopListener {
    rx: watch::Receiver<bool>,
    episode: u64,
}

impl StopListener {
    pub fn episode(&self) -> u64 {
        self.episode
    }

    /// Non-blocking poll; a dropped signal counts as stopped.
    pub fn is_stopped(&self) -> bool {
        *self.rx.borrow() || self.rx.has_changed().is_err()
    }

    /// Resolves once the signal fires or its owner goes away.
    pub async fn stopped(&mut self) {
        while !*self.rx.borrow_and_update() {
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}
