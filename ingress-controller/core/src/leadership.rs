use tokio::sync::watch;

/// Indicates whether this instance may publish configuration.
///
/// Each clone observes the same underlying state independently, so every
/// loop that depends on leadership holds its own handle.
#[derive(Clone, Debug)]
pub struct Leadership {
    rx: watch::Receiver<bool>,
}

// === impl Leadership ===

impl Leadership {
    pub fn new(rx: watch::Receiver<bool>) -> Self {
        Self { rx }
    }

    /// Returns a handle that may be used to change the leadership state.
    pub fn channel(leader: bool) -> (watch::Sender<bool>, Self) {
        let (tx, rx) = watch::channel(leader);
        (tx, Self::new(rx))
    }

    /// A leadership state that never changes.
    pub fn fixed(leader: bool) -> Self {
        Self::channel(leader).1
    }

    pub fn is_leader(&self) -> bool {
        *self.rx.borrow()
    }

    /// Waits for the leadership state to change and returns the new state.
    ///
    /// Never completes once the state can no longer change.
    pub async fn changed(&mut self) -> bool {
        if self.rx.changed().await.is_err() {
            return std::future::pending().await;
        }
        let leader = *self.rx.borrow_and_update();
        leader
    }

    /// Waits until this instance holds leadership.
    pub async fn acquired(&mut self) {
        while !*self.rx.borrow_and_update() {
            if self.rx.changed().await.is_err() {
                return std::future::pending().await;
            }
        }
    }
}
