//! Registry multiplexing many monitors by identifier.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::config::Config;
use crate::monitor::Monitor;

#[derive(Debug, Clone, Copy, Default)]
pub struct ManagerConfig {
    /// Remove a monitor's registry entry automatically when it terminates
    /// (for example on VOD exit). The caller's `on_terminate` still runs,
    /// after the removal.
    pub auto_remove: bool,
}

type Registry = Arc<RwLock<HashMap<String, Arc<Monitor>>>>;

/// Keyed registry of monitors with batch reconciliation.
///
/// Mutations take an exclusive lock; lookups take a shared one. Termination
/// of removed monitors happens after the lock is released.
pub struct Manager {
    config: ManagerConfig,
    monitors: Registry,
}

impl Manager {
    pub fn new(config: ManagerConfig) -> Self {
        Self {
            config,
            monitors: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register and start a monitor under `id`. Returns false (without
    /// constructing anything) when the id is already taken.
    pub fn add(&self, id: impl Into<String>, config: Config) -> bool {
        let id = id.into();
        let mut monitors = self.monitors.write().unwrap();
        self.add_locked(&mut monitors, id, config)
    }

    fn add_locked(
        &self,
        monitors: &mut HashMap<String, Arc<Monitor>>,
        id: String,
        mut config: Config,
    ) -> bool {
        if monitors.contains_key(&id) {
            return false;
        }
        if self.config.auto_remove {
            let registry = Arc::clone(&self.monitors);
            let registered_id = id.clone();
            let user_on_terminate = config.on_terminate.take();
            config.on_terminate = Some(Arc::new(move || {
                registry.write().unwrap().remove(&registered_id);
                if let Some(handler) = &user_on_terminate {
                    handler();
                }
            }));
        }
        monitors.insert(id, Arc::new(Monitor::spawn(config)));
        true
    }

    /// Remove the entry and terminate the monitor. The termination happens
    /// off-lock.
    pub fn remove(&self, id: &str) -> bool {
        let removed = self.monitors.write().unwrap().remove(id);
        match removed {
            Some(monitor) => {
                monitor.terminate();
                true
            }
            None => false,
        }
    }

    /// Remove and terminate every monitor; returns the removed ids.
    pub fn remove_all(&self) -> Vec<String> {
        let drained: Vec<(String, Arc<Monitor>)> =
            self.monitors.write().unwrap().drain().collect();
        let mut removed = Vec::with_capacity(drained.len());
        for (id, monitor) in drained {
            monitor.terminate();
            removed.push(id);
        }
        removed
    }

    /// Reconcile the registry against `configs`: ids absent from the input
    /// are removed, ids new to the registry are added. Returns
    /// `(added, removed)`.
    pub fn batch(&self, configs: HashMap<String, Config>) -> (Vec<String>, Vec<String>) {
        let mut to_terminate: Vec<Arc<Monitor>> = Vec::new();
        let (added, removed) = {
            let mut monitors = self.monitors.write().unwrap();
            let stale: Vec<String> = monitors
                .keys()
                .filter(|id| !configs.contains_key(*id))
                .cloned()
                .collect();
            let mut removed = Vec::with_capacity(stale.len());
            for id in stale {
                if let Some(monitor) = monitors.remove(&id) {
                    to_terminate.push(monitor);
                }
                removed.push(id);
            }
            let mut added = Vec::new();
            for (id, config) in configs {
                if self.add_locked(&mut monitors, id.clone(), config) {
                    added.push(id);
                }
            }
            (added, removed)
        };
        for monitor in to_terminate {
            monitor.terminate();
        }
        (added, removed)
    }

    pub fn get(&self, id: &str) -> Option<Arc<Monitor>> {
        self.monitors.read().unwrap().get(id).cloned()
    }

    /// Copy of the registry, safe to iterate without holding any lock.
    pub fn map(&self) -> HashMap<String, Arc<Monitor>> {
        self.monitors.read().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.monitors.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.monitors.read().unwrap().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use url::Url;

    use super::*;
    use crate::config::StreamType;

    fn config() -> Config {
        // Points at a closed port; the monitor just error-reports inside
        // its own task until terminated.
        Config::new(
            Url::parse("http://127.0.0.1:1/live.m3u8").unwrap(),
            StreamType::Hls,
        )
    }

    #[tokio::test]
    async fn add_rejects_duplicate_ids() {
        let manager = Manager::new(ManagerConfig::default());
        assert!(manager.add("a", config()));
        assert!(!manager.add("a", config()));
        assert_eq!(manager.len(), 1);
        manager.remove_all();
    }

    #[tokio::test]
    async fn remove_returns_whether_the_id_existed() {
        let manager = Manager::new(ManagerConfig::default());
        manager.add("a", config());
        assert!(manager.remove("a"));
        assert!(!manager.remove("a"));
        assert!(manager.is_empty());
    }

    #[tokio::test]
    async fn remove_all_returns_every_id() {
        let manager = Manager::new(ManagerConfig::default());
        manager.add("a", config());
        manager.add("b", config());
        let mut removed = manager.remove_all();
        removed.sort();
        assert_eq!(removed, vec!["a".to_string(), "b".to_string()]);
        assert!(manager.is_empty());
    }

    #[tokio::test]
    async fn batch_reconciles_by_set_difference() {
        let manager = Manager::new(ManagerConfig::default());
        manager.add("keep", config());
        manager.add("drop", config());

        let mut configs = HashMap::new();
        configs.insert("keep".to_string(), config());
        configs.insert("new".to_string(), config());
        let (added, removed) = manager.batch(configs);

        assert_eq!(added, vec!["new".to_string()]);
        assert_eq!(removed, vec!["drop".to_string()]);
        assert!(manager.get("keep").is_some());
        assert!(manager.get("new").is_some());
        assert!(manager.get("drop").is_none());
        manager.remove_all();
    }

    #[tokio::test]
    async fn map_returns_an_independent_copy() {
        let manager = Manager::new(ManagerConfig::default());
        manager.add("a", config());
        let copied = manager.map();
        manager.remove_all();
        assert_eq!(copied.len(), 1);
        assert!(manager.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn auto_remove_unregisters_on_termination() {
        use std::sync::mpsc;
        use std::time::Duration;

        let manager = Manager::new(ManagerConfig { auto_remove: true });
        let (tx, rx) = mpsc::channel();
        let mut cfg = config();
        cfg.on_terminate = Some(Arc::new(move || {
            let _ = tx.send(());
        }));
        manager.add("a", cfg);

        // Terminate the monitor directly (not via the manager): the wrapped
        // handler must remove the registry entry before the user handler.
        manager.get("a").unwrap().terminate();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(manager.get("a").is_none());
    }
}
