//! Trailing-edge change debouncer.
//!
//! Producers call [`Debouncer::signal`] as often as they like; the
//! debouncer task fires one trigger once `delay` has passed since the last
//! signal of a burst. The trigger channel has room for a single pending
//! trigger, so any number of bursts that land while the consumer is busy
//! collapse into one follow-up.

use std::time::Duration;

use log::debug;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;

/// Cheap, cloneable handle used to report changes.
#[derive(Clone)]
pub struct Debouncer {
    tx: mpsc::Sender<()>,
}

/// Receiving side of the coalesced trigger.
pub type Trigger = mpsc::Receiver<()>;

impl Debouncer {
    /// Spawns the debouncer task. The task exits on shutdown or once every
    /// `Debouncer` handle has been dropped.
    pub fn spawn(
        delay: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> (Self, Trigger, JoinHandle<()>) {
        let (signal_tx, mut signal_rx) = mpsc::channel::<()>(1);
        let (trigger_tx, trigger_rx) = mpsc::channel::<()>(1);

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.changed() => break,
                    signal = signal_rx.recv() => {
                        if signal.is_none() {
                            break;
                        }
                    }
                }

                // A burst has started: wait until it has been quiet for `delay`.
                let mut closed = false;
                loop {
                    match timeout(delay, signal_rx.recv()).await {
                        Ok(Some(())) => continue,
                        Ok(None) => {
                            closed = true;
                            break;
                        }
                        Err(_) => break,
                    }
                }

                // Full means a trigger is already pending; that one covers us.
                if trigger_tx.try_send(()).is_err() {
                    debug!("Reconcile trigger already pending, coalescing");
                }
                if closed {
                    break;
                }
            }
        });

        (Self { tx: signal_tx }, trigger_rx, handle)
    }

    /// Reports a change. Never blocks.
    pub fn signal(&self) {
        // A full channel means the debouncer has a signal it has not
        // consumed yet, which is as good as this one.
        let _ = self.tx.try_send(());
    }
}
