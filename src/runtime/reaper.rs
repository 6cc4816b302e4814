//! Periodic reclamation of stale stack slots and abandoned pool claims
//!
//! The sweeper runs on a wall-clock interval, decoupled from simulation
//! ticks, and takes the same store locks as in-flight instruction execution.
//! `sweep_once` is the whole sweep; the async loop only schedules it, so
//! tests drive reclamation synchronously.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::trace;

use super::ControllerRegistry;
use super::pools::UnitPools;
use super::stacks::StackStore;
use super::units::UnitWorld;

/// Low-frequency sweeper over the stack store and the pool manager.
pub struct Reaper {
    stacks: Arc<StackStore>,
    pools: Arc<UnitPools>,
    world: Arc<UnitWorld>,
    controllers: Arc<ControllerRegistry>,
    slot_expiry: Duration,
    interval: Duration,
}

impl Reaper {
    /// Create a sweeper over the given services.
    pub fn new(
        stacks: Arc<StackStore>,
        pools: Arc<UnitPools>,
        world: Arc<UnitWorld>,
        controllers: Arc<ControllerRegistry>,
        slot_expiry: Duration,
        interval: Duration,
    ) -> Self {
        Self {
            stacks,
            pools,
            world,
            controllers,
            slot_expiry,
            interval,
        }
    }

    /// Run one full sweep: expire old stack slots, then reclaim pools whose
    /// owners are gone.
    pub fn sweep_once(&self) {
        let started = Instant::now();
        self.stacks.expire(started, self.slot_expiry);
        let controllers = &self.controllers;
        self.pools.sweep(&self.world, |owner| controllers.is_live(owner));
        trace!(elapsed = ?started.elapsed(), "reclamation sweep finished");
    }

    /// Loop `sweep_once` on the configured interval until `stop` flips true.
    pub async fn run(self, mut stop: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick of a tokio interval fires immediately; skip it so
        // the first sweep happens one interval after startup.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => self.sweep_once(),
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logic::LValue;
    use crate::runtime::pools::{BindMode, BindRequest};
    use crate::runtime::units::{ControllerId, Team};

    fn reaper_fixture(expiry: Duration) -> (Reaper, Arc<StackStore>, Arc<UnitPools>, Arc<UnitWorld>, Arc<ControllerRegistry>) {
        let stacks = Arc::new(StackStore::new());
        let pools = Arc::new(UnitPools::new());
        let world = Arc::new(UnitWorld::new());
        let controllers = Arc::new(ControllerRegistry::new());
        let reaper = Reaper::new(
            Arc::clone(&stacks),
            Arc::clone(&pools),
            Arc::clone(&world),
            Arc::clone(&controllers),
            expiry,
            Duration::from_millis(10),
        );
        (reaper, stacks, pools, world, controllers)
    }

    #[test]
    fn sweep_reclaims_pools_of_retired_controllers() {
        let (reaper, _stacks, pools, world, controllers) = reaper_fixture(Duration::from_secs(30));
        let kind = world.register_kind("mono");
        let unit = world.spawn(kind, Team(1));

        let owner = ControllerId::new();
        controllers.register(owner);
        pools
            .bind(
                &world,
                BindRequest {
                    owner,
                    team: Team(1),
                    privileged: false,
                    scope_name: Some("alpha"),
                    kind_name: None,
                    count: 1,
                    mode: BindMode::Claim,
                },
            )
            .expect("bind");

        reaper.sweep_once();
        assert!(pools.stats("alpha").is_some(), "live owner keeps its pool");

        controllers.retire(owner);
        reaper.sweep_once();
        assert!(pools.stats("alpha").is_none());
        assert!(!world.is_controlled(unit));
    }

    #[test]
    fn sweep_expires_stack_slots() {
        let (reaper, stacks, _pools, _world, _controllers) = reaper_fixture(Duration::ZERO);
        stacks.write("mailbox", 0, LValue::Num(7.0));
        reaper.sweep_once();
        assert_eq!(stacks.read("mailbox", 0), None);
        assert_eq!(stacks.stack_count(), 0);
    }

    #[tokio::test]
    async fn periodic_task_sweeps_and_stops() {
        let (reaper, stacks, _pools, _world, _controllers) = reaper_fixture(Duration::ZERO);
        stacks.write("mailbox", 0, LValue::Num(7.0));

        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(reaper.run(stop_rx));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(stacks.read("mailbox", 0), None);

        stop_tx.send(true).expect("signal stop");
        task.await.expect("reaper task joins");
    }
}
