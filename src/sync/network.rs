//! Network Monitor - connectivity tracking
//!
//! Wraps the platform connectivity API (`ConnectivityProvider`) and exposes:
//! - `get_status()` / `is_online_now()` for synchronous checks
//! - `add_listener()` for transition notifications (restored, lost, changed)
//!
//! Until a confirmed reading arrives, and after any provider error, the
//! device is treated as offline.

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;

use super::events::{lock, EventBus, Subscription};

/// Physical link type reported by the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionType {
    Wifi,
    Cellular,
    Ethernet,
    Bluetooth,
    Vpn,
    Other,
    None,
    Unknown,
}

/// A connectivity reading
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkStatus {
    pub is_connected: bool,
    /// `None` while the platform has not checked internet reachability yet
    pub is_internet_reachable: Option<bool>,
    #[serde(rename = "type")]
    pub connection_type: ConnectionType,
}

impl NetworkStatus {
    pub fn offline() -> Self {
        Self {
            is_connected: false,
            is_internet_reachable: Some(false),
            connection_type: ConnectionType::None,
        }
    }

    pub fn online(connection_type: ConnectionType) -> Self {
        Self {
            is_connected: true,
            is_internet_reachable: Some(true),
            connection_type,
        }
    }

    /// Connected, and reachability not known to be false
    pub fn is_online(&self) -> bool {
        self.is_connected && self.is_internet_reachable != Some(false)
    }
}

/// Kind of status transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityChange {
    /// offline -> online
    Restored,
    /// online -> offline
    Lost,
    /// Any other change (e.g. wifi -> cellular)
    Changed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkEvent {
    pub status: NetworkStatus,
    pub change: ConnectivityChange,
}

/// Platform connectivity API
#[async_trait]
pub trait ConnectivityProvider: Send + Sync {
    /// Current state
    async fn fetch(&self) -> Result<NetworkStatus, ConnectivityError>;

    /// Stream of readings as the platform reports them
    fn changes(&self) -> BoxStream<'static, Result<NetworkStatus, ConnectivityError>>;
}

/// Connectivity state holder
pub struct NetworkMonitor {
    status: Mutex<NetworkStatus>,
    online: AtomicBool,
    events: EventBus<NetworkEvent>,
}

impl NetworkMonitor {
    pub fn new() -> Self {
        Self {
            status: Mutex::new(NetworkStatus::offline()),
            online: AtomicBool::new(false),
            events: EventBus::new(),
        }
    }

    pub fn get_status(&self) -> NetworkStatus {
        lock(&self.status).clone()
    }

    /// Cached online flag
    pub fn is_online_now(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Register a transition listener
    pub fn add_listener<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&NetworkEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(listener)
    }

    /// Record a confirmed reading; listeners run only if the status changed
    pub fn apply_reading(&self, status: NetworkStatus) {
        let is_online = status.is_online();
        let was_online = {
            let mut current = lock(&self.status);
            if *current == status {
                return;
            }
            let was_online = current.is_online();
            *current = status.clone();
            // Flag and status change together under the status lock
            self.online.store(is_online, Ordering::SeqCst);
            was_online
        };

        let change = match (was_online, is_online) {
            (false, true) => ConnectivityChange::Restored,
            (true, false) => ConnectivityChange::Lost,
            _ => ConnectivityChange::Changed,
        };

        match change {
            ConnectivityChange::Restored => {
                log::info!("Connectivity restored ({:?})", status.connection_type)
            }
            ConnectivityChange::Lost => log::info!("Connectivity lost"),
            ConnectivityChange::Changed => log::debug!("Network status changed: {:?}", status),
        }

        self.events.publish(&NetworkEvent { status, change });
    }

    /// The platform API failed; assume offline until a reading confirms otherwise
    pub fn apply_failure(&self, error: &ConnectivityError) {
        log::warn!("Connectivity check failed, assuming offline: {}", error);
        self.apply_reading(NetworkStatus::offline());
    }

    /// Poll the provider once
    pub async fn refresh(&self, provider: &dyn ConnectivityProvider) -> NetworkStatus {
        match provider.fetch().await {
            Ok(status) => self.apply_reading(status),
            Err(e) => self.apply_failure(&e),
        }
        self.get_status()
    }

    /// Take an initial reading and follow the provider's change stream
    pub fn attach(self: &Arc<Self>, provider: Arc<dyn ConnectivityProvider>) -> JoinHandle<()> {
        let monitor = self.clone();
        tokio::spawn(async move {
            monitor.refresh(provider.as_ref()).await;

            let mut changes = provider.changes();
            while let Some(reading) = changes.next().await {
                match reading {
                    Ok(status) => monitor.apply_reading(status),
                    Err(e) => monitor.apply_failure(&e),
                }
            }

            log::debug!("Connectivity change stream ended");
        })
    }
}

impl Default for NetworkMonitor {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Clone, thiserror::Error)]
pub enum ConnectivityError {
    #[error("Connectivity API unavailable: {0}")]
    Unavailable(String),

    #[error("Connectivity API error: {0}")]
    Platform(String),
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder(monitor: &NetworkMonitor) -> Arc<Mutex<Vec<ConnectivityChange>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        monitor.add_listener(move |event| sink.lock().unwrap().push(event.change));
        seen
    }

    struct ScriptedProvider {
        initial: Result<NetworkStatus, ConnectivityError>,
        readings: Vec<Result<NetworkStatus, ConnectivityError>>,
    }

    #[async_trait]
    impl ConnectivityProvider for ScriptedProvider {
        async fn fetch(&self) -> Result<NetworkStatus, ConnectivityError> {
            self.initial.clone()
        }

        fn changes(&self) -> BoxStream<'static, Result<NetworkStatus, ConnectivityError>> {
            futures::stream::iter(self.readings.clone()).boxed()
        }
    }

    #[test]
    fn test_initial_status_is_offline() {
        let monitor = NetworkMonitor::new();
        assert!(!monitor.is_online_now());
        assert!(!monitor.get_status().is_connected);
    }

    #[test]
    fn test_transitions() {
        let monitor = NetworkMonitor::new();
        let seen = recorder(&monitor);

        monitor.apply_reading(NetworkStatus::online(ConnectionType::Wifi));
        assert!(monitor.is_online_now());

        // Same reading again: no event
        monitor.apply_reading(NetworkStatus::online(ConnectionType::Wifi));

        monitor.apply_reading(NetworkStatus::online(ConnectionType::Cellular));
        monitor.apply_reading(NetworkStatus::offline());
        assert!(!monitor.is_online_now());

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                ConnectivityChange::Restored,
                ConnectivityChange::Changed,
                ConnectivityChange::Lost,
            ]
        );
    }

    #[test]
    fn test_concurrent_readings_keep_flag_consistent() {
        let monitor = Arc::new(NetworkMonitor::new());

        let handles: Vec<_> = (0..4)
            .map(|worker| {
                let monitor = monitor.clone();
                std::thread::spawn(move || {
                    for i in 0..200 {
                        if (i + worker) % 2 == 0 {
                            monitor.apply_reading(NetworkStatus::online(ConnectionType::Wifi));
                        } else {
                            monitor.apply_reading(NetworkStatus::offline());
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(monitor.is_online_now(), monitor.get_status().is_online());
    }

    #[test]
    fn test_unknown_reachability_counts_as_online() {
        let status = NetworkStatus {
            is_connected: true,
            is_internet_reachable: None,
            connection_type: ConnectionType::Wifi,
        };
        assert!(status.is_online());

        let captive = NetworkStatus {
            is_internet_reachable: Some(false),
            ..status
        };
        assert!(!captive.is_online());
    }

    #[test]
    fn test_failure_falls_back_to_offline() {
        let monitor = NetworkMonitor::new();
        monitor.apply_reading(NetworkStatus::online(ConnectionType::Ethernet));
        let seen = recorder(&monitor);

        monitor.apply_failure(&ConnectivityError::Platform("boom".to_string()));

        assert!(!monitor.is_online_now());
        assert_eq!(*seen.lock().unwrap(), vec![ConnectivityChange::Lost]);
    }

    #[test]
    fn test_panicking_listener_does_not_block_others() {
        let monitor = NetworkMonitor::new();
        monitor.add_listener(|_| panic!("listener failure"));
        let seen = recorder(&monitor);

        monitor.apply_reading(NetworkStatus::online(ConnectionType::Wifi));

        assert_eq!(*seen.lock().unwrap(), vec![ConnectivityChange::Restored]);
    }

    #[tokio::test]
    async fn test_attach_follows_provider() {
        let monitor = Arc::new(NetworkMonitor::new());
        let seen = recorder(&monitor);

        let provider = Arc::new(ScriptedProvider {
            initial: Ok(NetworkStatus::online(ConnectionType::Wifi)),
            readings: vec![
                Ok(NetworkStatus::offline()),
                Err(ConnectivityError::Unavailable("radio off".to_string())),
                Ok(NetworkStatus::online(ConnectionType::Cellular)),
            ],
        });

        monitor.attach(provider).await.unwrap();

        assert!(monitor.is_online_now());
        assert_eq!(monitor.get_status().connection_type, ConnectionType::Cellular);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                ConnectivityChange::Restored,
                ConnectivityChange::Lost,
                ConnectivityChange::Restored,
            ]
        );
    }

    #[tokio::test]
    async fn test_refresh_error_keeps_offline() {
        let monitor = NetworkMonitor::new();
        let provider = ScriptedProvider {
            initial: Err(ConnectivityError::Unavailable("no api".to_string())),
            readings: Vec::new(),
        };

        let status = monitor.refresh(&provider).await;
        assert!(!status.is_online());
        assert!(!monitor.is_online_now());
    }
}
