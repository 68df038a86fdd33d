//! Active/standby traffic coordination.
//!
//! Leader election lives outside the process: an external traffic manager
//! (or an operator) tells this instance which role it holds via
//! [`TrafficManager::set_mode`]. On Standby the lifecycle coordinator stops
//! all broker consumers; pools keep draining whatever is already in flight.
//! On return to Primary the consumers are started again.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TrafficMode {
    Primary,
    Standby,
}

type ModeListener = Box<dyn Fn(TrafficMode) + Send + Sync>;

pub struct TrafficManager {
    mode_tx: watch::Sender<TrafficMode>,
    listeners: RwLock<Vec<ModeListener>>,
    instance_id: String,
}

impl TrafficManager {
    pub fn new(instance_id: impl Into<String>, initial: TrafficMode) -> Self {
        let (mode_tx, _) = watch::channel(initial);
        Self {
            mode_tx,
            listeners: RwLock::new(Vec::new()),
            instance_id: instance_id.into(),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn mode(&self) -> TrafficMode {
        *self.mode_tx.borrow()
    }

    pub fn is_primary(&self) -> bool {
        self.mode() == TrafficMode::Primary
    }

    /// Switch role. Idempotent; listeners fire only on actual transitions.
    pub fn set_mode(&self, mode: TrafficMode) {
        let changed = self.mode_tx.send_if_modified(|current| {
            if *current == mode {
                false
            } else {
                *current = mode;
                true
            }
        });

        if changed {
            info!(
                instance_id = %self.instance_id,
                mode = ?mode,
                "Traffic mode changed"
            );
            for listener in self.listeners.read().iter() {
                listener(mode);
            }
        }
    }

    pub fn add_mode_change_listener<F>(&self, listener: F)
    where
        F: Fn(TrafficMode) + Send + Sync + 'static,
    {
        self.listeners.write().push(Box::new(listener));
    }

    /// Watch-channel view of the mode for async tasks.
    pub fn subscribe(&self) -> watch::Receiver<TrafficMode> {
        self.mode_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn listeners_fire_only_on_transitions() {
        let manager = TrafficManager::new("inst-1", TrafficMode::Primary);
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = fired.clone();
        manager.add_mode_change_listener(move |_| {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });

        manager.set_mode(TrafficMode::Primary); // no-op
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        manager.set_mode(TrafficMode::Standby);
        manager.set_mode(TrafficMode::Standby); // no-op
        manager.set_mode(TrafficMode::Primary);
        assert_eq!(fired.load(Ordering::SeqCst), 2);
        assert!(manager.is_primary());
    }

    #[tokio::test]
    async fn subscribers_see_mode_changes() {
        let manager = TrafficManager::new("inst-1", TrafficMode::Primary);
        let mut rx = manager.subscribe();

        manager.set_mode(TrafficMode::Standby);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), TrafficMode::Standby);
    }
}
