//! Runtime orchestrator and public API
//!
//! This module provides the main `Runtime` struct that owns the shared
//! services (unit world, stack store, pool manager, controller registry),
//! wires program instances to them, and runs the periodic reclamation task.
//! Services are instances with explicit lifecycle, not process singletons.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

// Submodules
pub mod error;
pub mod pools;
pub mod reaper;
pub mod stacks;
pub mod units;

use crate::logic::{Processor, Program};
use reaper::Reaper;
use stacks::StackStore;
use units::{ControllerId, Team, UnitWorld};

/// Configuration for the Cohort runtime
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Seconds a stack slot survives without being rewritten (default: 30)
    pub slot_expiry_secs: u64,

    /// Seconds between reclamation sweeps (default: 10)
    pub sweep_interval_secs: u64,

    /// Instructions one program instance may execute per tick, shared with
    /// any nested programs it invokes
    pub tick_budget: usize,

    /// Maximum nesting depth of call instructions (default: 5)
    pub max_call_depth: usize,

    /// Enable debug tracing
    pub debug: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            slot_expiry_secs: 30,
            sweep_interval_secs: 10,
            tick_budget: 1024,
            max_call_depth: 5,
            debug: false,
        }
    }
}

impl RuntimeConfig {
    /// Slot expiry as a duration.
    pub fn slot_expiry(&self) -> Duration {
        Duration::from_secs(self.slot_expiry_secs)
    }

    /// Sweep interval as a duration.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// Registry of live program instances.
///
/// The pool sweep consults this to decide whether an owner binding is stale;
/// processors register on spawn and retire when dropped.
#[derive(Default)]
pub struct ControllerRegistry {
    live: Mutex<HashSet<ControllerId>>,
}

impl ControllerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a controller live.
    pub fn register(&self, id: ControllerId) {
        self.live.lock().insert(id);
    }

    /// Mark a controller dead.
    pub fn retire(&self, id: ControllerId) {
        self.live.lock().remove(&id);
    }

    /// Whether the controller is currently live.
    pub fn is_live(&self, id: ControllerId) -> bool {
        self.live.lock().contains(&id)
    }

    /// Number of live controllers.
    pub fn len(&self) -> usize {
        self.live.lock().len()
    }

    /// Whether no controllers are live.
    pub fn is_empty(&self) -> bool {
        self.live.lock().is_empty()
    }
}

/// Handle bundle giving the VM layer access to the shared services.
#[derive(Clone)]
pub struct Services {
    /// Runtime configuration snapshot.
    pub config: Arc<RuntimeConfig>,
    /// Live unit population.
    pub world: Arc<UnitWorld>,
    /// Shared named stacks.
    pub stacks: Arc<StackStore>,
    /// Group pool manager.
    pub pools: Arc<pools::UnitPools>,
    /// Live program-instance registry.
    pub controllers: Arc<ControllerRegistry>,
}

/// The main runtime orchestrator
///
/// Owns all shared services and the reclamation task lifecycle.
pub struct Runtime {
    config: Arc<RuntimeConfig>,
    world: Arc<UnitWorld>,
    stacks: Arc<StackStore>,
    pools: Arc<pools::UnitPools>,
    controllers: Arc<ControllerRegistry>,
    reaper_stop: Option<watch::Sender<bool>>,
    reaper_task: Option<JoinHandle<()>>,
}

impl Runtime {
    /// Create a new runtime with the given configuration
    pub fn new(config: RuntimeConfig) -> anyhow::Result<Self> {
        if config.sweep_interval_secs == 0 {
            anyhow::bail!("sweep interval must be at least one second");
        }
        if config.tick_budget == 0 {
            anyhow::bail!("tick budget must be positive");
        }

        Ok(Self {
            config: Arc::new(config),
            world: Arc::new(UnitWorld::new()),
            stacks: Arc::new(StackStore::new()),
            pools: Arc::new(pools::UnitPools::new()),
            controllers: Arc::new(ControllerRegistry::new()),
            reaper_stop: None,
            reaper_task: None,
        })
    }

    /// Get the current configuration
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Get the unit world
    pub fn world(&self) -> &Arc<UnitWorld> {
        &self.world
    }

    /// Get the stack store
    pub fn stacks(&self) -> &Arc<StackStore> {
        &self.stacks
    }

    /// Get the pool manager
    pub fn pools(&self) -> &Arc<pools::UnitPools> {
        &self.pools
    }

    /// Get the controller registry
    pub fn controllers(&self) -> &Arc<ControllerRegistry> {
        &self.controllers
    }

    /// Clone a service handle bundle for wiring up a program instance.
    pub fn services(&self) -> Services {
        Services {
            config: Arc::clone(&self.config),
            world: Arc::clone(&self.world),
            stacks: Arc::clone(&self.stacks),
            pools: Arc::clone(&self.pools),
            controllers: Arc::clone(&self.controllers),
        }
    }

    /// Create a program instance wired to this runtime's services.
    ///
    /// The instance registers as a live controller and retires itself when
    /// dropped; its pool claims are then reclaimed by the next sweep.
    pub fn spawn_processor(&self, program: Program, team: Team, privileged: bool) -> Processor {
        Processor::spawn(self.services(), program, team, privileged)
    }

    /// Build the reclamation sweeper for this runtime's services.
    pub fn reaper(&self) -> Reaper {
        Reaper::new(
            Arc::clone(&self.stacks),
            Arc::clone(&self.pools),
            Arc::clone(&self.world),
            Arc::clone(&self.controllers),
            self.config.slot_expiry(),
            self.config.sweep_interval(),
        )
    }

    /// Run one reclamation sweep synchronously.
    pub fn sweep_now(&self) {
        self.reaper().sweep_once();
    }

    /// Start the periodic reclamation task on the current tokio runtime.
    pub fn start_reaper(&mut self) {
        if self.reaper_task.is_some() {
            return;
        }
        let (stop_tx, stop_rx) = watch::channel(false);
        let reaper = self.reaper();
        self.reaper_task = Some(tokio::spawn(reaper.run(stop_rx)));
        self.reaper_stop = Some(stop_tx);
    }

    /// Stop the reclamation task and wait for it to finish.
    pub async fn shutdown(&mut self) {
        if let Some(stop) = self.reaper_stop.take() {
            let _ = stop.send(true);
        }
        if let Some(task) = self.reaper_task.take() {
            let _ = task.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_match_observed_system() {
        let config = RuntimeConfig::default();
        assert_eq!(config.slot_expiry(), Duration::from_secs(30));
        assert_eq!(config.sweep_interval(), Duration::from_secs(10));
        assert_eq!(config.max_call_depth, 5);
    }

    #[test]
    fn rejects_degenerate_config() {
        let config = RuntimeConfig {
            sweep_interval_secs: 0,
            ..Default::default()
        };
        assert!(Runtime::new(config).is_err());
    }

    #[test]
    fn config_round_trips_through_json() {
        let config = RuntimeConfig {
            slot_expiry_secs: 45,
            debug: true,
            ..Default::default()
        };
        let json = serde_json::to_string(&config).expect("serialize");
        let parsed: RuntimeConfig = serde_json::from_str(&json).expect("parse");
        assert_eq!(parsed.slot_expiry_secs, 45);
        assert_eq!(parsed.tick_budget, config.tick_budget);
        assert!(parsed.debug);
    }

    #[test]
    fn registry_tracks_liveness() {
        let registry = ControllerRegistry::new();
        let id = ControllerId::new();
        assert!(!registry.is_live(id));
        registry.register(id);
        assert!(registry.is_live(id));
        registry.retire(id);
        assert!(!registry.is_live(id));
        assert!(registry.is_empty());
    }
}
