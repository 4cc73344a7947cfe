use tokio::sync::broadcast;

/// Published once per store batch that actually changed something.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreChange {
    /// `"global"` or the directory key of the store that changed.
    pub scope: String,
    pub revision: u64,
}

#[derive(Clone)]
pub struct ChangeBus {
    tx: broadcast::Sender<StoreChange>,
}

impl ChangeBus {
    pub fn new() -> Self {
        Self::with_capacity(2048)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.tx.subscribe()
    }

    pub fn publish(&self, change: StoreChange) {
        let _ = self.tx.send(change);
    }
}

impl Default for ChangeBus {
    fn default() -> Self {
        Self::new()
    }
}
