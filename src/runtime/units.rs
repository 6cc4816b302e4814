//! Unit population and controller identities
//!
//! The pools draw members from a live population of controllable units. The
//! population keeps spawn order so repeated scans over an unchanged world
//! produce the same sequence.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

/// Unique identifier of a unit, assigned in spawn order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UnitId(pub u64);

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a program instance's owning controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ControllerId(pub Uuid);

impl ControllerId {
    /// Create a fresh controller identity.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ControllerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ControllerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Team marker; units are claimable by same-team or privileged callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Team(pub u8);

/// Interned unit kind (type) identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UnitKind(pub u32);

#[derive(Debug, Clone)]
struct UnitSlot {
    id: UnitId,
    kind: UnitKind,
    team: Team,
    alive: bool,
    controlled: bool,
}

#[derive(Default)]
struct WorldInner {
    units: Vec<UnitSlot>,
    index: HashMap<UnitId, usize>,
    kinds: Vec<String>,
    next_id: u64,
}

/// Live population of controllable units.
///
/// Iteration order is spawn order and survives kills (dead slots are skipped,
/// not compacted), which keeps pool refresh scans deterministic.
#[derive(Default)]
pub struct UnitWorld {
    inner: RwLock<WorldInner>,
}

impl UnitWorld {
    /// Create an empty world.
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern a kind name, returning its id. Idempotent per name.
    pub fn register_kind(&self, name: &str) -> UnitKind {
        let mut inner = self.inner.write();
        if let Some(pos) = inner.kinds.iter().position(|kind| kind == name) {
            return UnitKind(pos as u32);
        }
        inner.kinds.push(name.to_string());
        UnitKind((inner.kinds.len() - 1) as u32)
    }

    /// Resolve a kind name to its interned id.
    pub fn resolve_kind(&self, name: &str) -> Option<UnitKind> {
        let inner = self.inner.read();
        inner
            .kinds
            .iter()
            .position(|kind| kind == name)
            .map(|pos| UnitKind(pos as u32))
    }

    /// Spawn a unit of the given kind on the given team.
    pub fn spawn(&self, kind: UnitKind, team: Team) -> UnitId {
        let mut inner = self.inner.write();
        let id = UnitId(inner.next_id);
        inner.next_id += 1;
        let slot = UnitSlot {
            id,
            kind,
            team,
            alive: true,
            controlled: false,
        };
        let pos = inner.units.len();
        inner.units.push(slot);
        inner.index.insert(id, pos);
        id
    }

    /// Remove a unit from the live population.
    pub fn kill(&self, id: UnitId) {
        let mut inner = self.inner.write();
        if let Some(&pos) = inner.index.get(&id) {
            inner.units[pos].alive = false;
            inner.units[pos].controlled = false;
        }
    }

    /// Whether the unit exists and is alive.
    pub fn is_valid(&self, id: UnitId) -> bool {
        let inner = self.inner.read();
        inner
            .index
            .get(&id)
            .map(|&pos| inner.units[pos].alive)
            .unwrap_or(false)
    }

    /// Kind of a live unit.
    pub fn kind_of(&self, id: UnitId) -> Option<UnitKind> {
        let inner = self.inner.read();
        inner
            .index
            .get(&id)
            .filter(|&&pos| inner.units[pos].alive)
            .map(|&pos| inner.units[pos].kind)
    }

    /// Team of a live unit.
    pub fn team_of(&self, id: UnitId) -> Option<Team> {
        let inner = self.inner.read();
        inner
            .index
            .get(&id)
            .filter(|&&pos| inner.units[pos].alive)
            .map(|&pos| inner.units[pos].team)
    }

    /// Set or clear the controlled marker on a unit.
    pub fn set_controlled(&self, id: UnitId, controlled: bool) {
        let mut inner = self.inner.write();
        if let Some(&pos) = inner.index.get(&id) {
            inner.units[pos].controlled = controlled;
        }
    }

    /// Whether the unit currently carries the controlled marker.
    pub fn is_controlled(&self, id: UnitId) -> bool {
        let inner = self.inner.read();
        inner
            .index
            .get(&id)
            .map(|&pos| inner.units[pos].controlled)
            .unwrap_or(false)
    }

    /// Live unit ids in spawn order.
    pub fn population(&self) -> Vec<UnitId> {
        let inner = self.inner.read();
        inner
            .units
            .iter()
            .filter(|slot| slot.alive)
            .map(|slot| slot.id)
            .collect()
    }

    /// Number of live units.
    pub fn live_count(&self) -> usize {
        let inner = self.inner.read();
        inner.units.iter().filter(|slot| slot.alive).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawn_order_is_stable_across_kills() {
        let world = UnitWorld::new();
        let kind = world.register_kind("mono");
        let a = world.spawn(kind, Team(1));
        let b = world.spawn(kind, Team(1));
        let c = world.spawn(kind, Team(1));

        world.kill(b);
        assert_eq!(world.population(), vec![a, c]);

        let d = world.spawn(kind, Team(1));
        assert_eq!(world.population(), vec![a, c, d]);
    }

    #[test]
    fn kind_interning_is_idempotent() {
        let world = UnitWorld::new();
        let first = world.register_kind("flare");
        let second = world.register_kind("flare");
        assert_eq!(first, second);
        assert_eq!(world.resolve_kind("flare"), Some(first));
        assert_eq!(world.resolve_kind("unknown"), None);
    }

    #[test]
    fn kill_clears_controlled_marker() {
        let world = UnitWorld::new();
        let kind = world.register_kind("poly");
        let unit = world.spawn(kind, Team(2));
        world.set_controlled(unit, true);
        assert!(world.is_controlled(unit));

        world.kill(unit);
        assert!(!world.is_valid(unit));
        assert!(!world.is_controlled(unit));
    }
}
