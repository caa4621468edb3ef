//! Listener extension: a bounded signal feed for external observers.
//!
//! Every signal the owning node dispatches is mirrored into a bounded
//! channel. When the buffer is full the signal is dropped and the drop is
//! logged — a slow external consumer must never block the node's run
//! loop. Only the buffer capacity persists; the channel itself is rebuilt
//! on load and observers re-attach.

use tokio::sync::mpsc;
use tracing::debug;

use super::{ProcessEnv, ProcessOutput};
use crate::crypto::NodeId;
use crate::signal::Signal;
use crate::wire::{SerializedValue, ValueReader, ValueWriter, WireError};

/// The receiving end of a listener's signal feed.
pub type SignalReceiver = mpsc::Receiver<Signal>;

/// The listener extension state.
#[derive(Debug)]
pub struct ListenerExt {
    /// Buffer capacity of the feed.
    pub capacity: usize,
    tx: mpsc::Sender<Signal>,
    // Parked until an observer takes it; dropped feeds simply fill up and
    // log drops.
    rx: Option<SignalReceiver>,
}

impl ListenerExt {
    /// Creates a listener and hands out its receiver.
    #[must_use]
    pub fn channel(capacity: usize) -> (Self, SignalReceiver) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Self {
                capacity,
                tx,
                rx: None,
            },
            rx,
        )
    }

    /// Creates a listener with the receiver parked inside.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            capacity,
            tx,
            rx: Some(rx),
        }
    }

    /// Takes the parked receiver, if nobody holds it yet.
    #[must_use]
    pub fn take_receiver(&mut self) -> Option<SignalReceiver> {
        self.rx.take()
    }

    /// Dispatch entry point: mirror the signal into the feed.
    pub fn process(
        &mut self,
        env: &ProcessEnv<'_>,
        _source: NodeId,
        signal: &Signal,
    ) -> ProcessOutput {
        match self.tx.try_send(signal.clone()) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!(target: "listener", node = %env.node_id, signal = %signal, "listener overflow, signal dropped");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(target: "listener", node = %env.node_id, "listener closed, signal dropped");
            }
        }
        ProcessOutput::none()
    }

    /// Applies the configured default capacity when none was persisted.
    pub fn load(&mut self, env: &ProcessEnv<'_>) {
        if self.capacity == 0 {
            self.capacity = env.config.listener_capacity;
            let (tx, rx) = mpsc::channel(self.capacity);
            self.tx = tx;
            self.rx = Some(rx);
        }
    }

    /// Serializes one readable field.
    #[must_use]
    pub fn read_field(&self, name: &str) -> Option<SerializedValue> {
        let mut w = ValueWriter::new();
        match name {
            "buffer" => w.push_u64(self.capacity as u64),
            _ => return None,
        }
        Some(w.finish())
    }

    /// Serializes the persistent state (capacity only).
    #[must_use]
    pub fn to_value(&self) -> SerializedValue {
        let mut w = ValueWriter::new();
        w.push_u64(self.capacity as u64);
        w.finish()
    }

    /// Rebuilds the listener from storage with a fresh, empty feed.
    ///
    /// # Errors
    ///
    /// Any [`WireError`] from the decoder.
    pub fn from_value(value: &SerializedValue) -> Result<Self, WireError> {
        let mut r = ValueReader::new(value);
        let capacity = usize::try_from(r.take_u64("listener capacity")?)
            .map_err(|_| WireError::ShapeMismatch {
                context: "listener capacity",
            })?;
        r.finish()?;
        Ok(Self::new(capacity.max(1)))
    }
}
