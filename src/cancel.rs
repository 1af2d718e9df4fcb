use std::sync::{Arc, Mutex};

use crossbeam_channel::{bounded, Receiver, Sender};

/// One-shot cancellation broadcast.
///
/// Nothing is ever sent on the inner channel; pulling the trigger drops the
/// sender, which makes `recv` on every [`Signal`] clone return immediately
/// from then on. Pipeline tasks pair each of their channel sends with a
/// `recv` on the signal inside a `select!`.
pub(crate) fn trigger() -> (Trigger, Signal) {
    let (tx, rx) = bounded::<()>(0);

    (
        Trigger {
            tx: Arc::new(Mutex::new(Some(tx))),
        },
        Signal { rx },
    )
}

#[derive(Clone)]
pub(crate) struct Trigger {
    tx: Arc<Mutex<Option<Sender<()>>>>,
}

impl Trigger {
    /// Fire the broadcast. Safe to call any number of times, from any
    /// holder of a clone.
    pub(crate) fn pull(&self) {
        self.tx.lock().unwrap().take();
    }
}

#[derive(Clone)]
pub(crate) struct Signal {
    rx: Receiver<()>,
}

impl Signal {
    pub(crate) fn receiver(&self) -> &Receiver<()> {
        &self.rx
    }
}
