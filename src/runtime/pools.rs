//! Group pools of claimable units
//!
//! Many independent program instances share a bounded set of controllable
//! units through pools keyed by a scope: a caller-chosen name, or the calling
//! controller itself when no name is given. Claim-mode binds create and
//! refresh membership and hold exclusive ownership of a scope name; access-
//! mode binds read an existing named pool. Members are handed out round-robin.
//!
//! The whole manager serializes behind one mutex so cross-pool invariants
//! (a unit belongs to at most one pool) observe a consistent snapshot.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Instant;
use tracing::{debug, trace};

use super::error::{BindError, BindResult};
use super::units::{ControllerId, Team, UnitId, UnitKind, UnitWorld};

/// Scope under which a pool is keyed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Scope {
    /// Shared pool addressed by name.
    Named(String),
    /// Private pool of a single controller (empty scope name).
    Private(ControllerId),
}

/// How a bind call treats pool membership.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindMode {
    /// Create or refresh membership, enforcing scope-name exclusivity.
    Claim,
    /// Read an existing named pool without refreshing it.
    Access,
}

/// One bind call's inputs and caller context.
#[derive(Debug, Clone)]
pub struct BindRequest<'a> {
    /// Controller issuing the bind.
    pub owner: ControllerId,
    /// Caller's team, used to filter claimable units.
    pub team: Team,
    /// Privileged callers may claim units of any team.
    pub privileged: bool,
    /// Scope name; `None` or empty selects the caller's private pool.
    pub scope_name: Option<&'a str>,
    /// Unit kind selector by name, if any.
    pub kind_name: Option<&'a str>,
    /// Requested member count (claim mode).
    pub count: i64,
    /// Claim or access.
    pub mode: BindMode,
}

/// Inputs remembered between ticks so an unchanged claim skips the
/// population scan.
#[derive(Debug, Clone, PartialEq)]
struct BindSnapshot {
    kind: Option<UnitKind>,
    count: usize,
    scope: Scope,
}

struct OwnerBinding {
    claim: Option<Scope>,
    snapshot: Option<BindSnapshot>,
    last_seen: Instant,
}

struct PoolEntry {
    members: Vec<UnitId>,
    cursor: usize,
    capacity: Option<usize>,
    refreshes: u64,
}

impl PoolEntry {
    fn new(capacity: Option<usize>) -> Self {
        Self {
            members: Vec::new(),
            cursor: 0,
            capacity,
            refreshes: 0,
        }
    }

    /// Remove the member at `pos`, keeping the cursor on the member it was
    /// about to hand out.
    fn remove_at(&mut self, pos: usize) {
        self.members.remove(pos);
        if pos < self.cursor {
            self.cursor -= 1;
        }
        if self.cursor >= self.members.len() {
            self.cursor = 0;
        }
    }

    /// Hand out the member under the cursor and advance it round-robin.
    fn take_next(&mut self) -> Option<(UnitId, usize)> {
        if self.members.is_empty() {
            self.cursor = 0;
            return None;
        }
        if self.cursor >= self.members.len() {
            self.cursor = 0;
        }
        let pos = self.cursor;
        let unit = self.members[pos];
        self.cursor = (self.cursor + 1) % self.members.len();
        Some((unit, pos))
    }
}

/// Observable state of one pool, for diagnostics and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    /// Current members in hand-out order.
    pub members: Vec<UnitId>,
    /// Next hand-out position.
    pub cursor: usize,
    /// Configured capacity, `None` when unbounded.
    pub capacity: Option<usize>,
    /// Number of membership refresh scans performed so far.
    pub refreshes: u64,
}

#[derive(Default)]
struct PoolsInner {
    pools: HashMap<Scope, PoolEntry>,
    owners: HashMap<ControllerId, OwnerBinding>,
    claims: HashMap<UnitId, Scope>,
}

impl PoolsInner {
    fn has_claimer(&self, scope: &Scope) -> bool {
        self.owners
            .values()
            .any(|binding| binding.claim.as_ref() == Some(scope))
    }

    fn member_still_good(&self, world: &UnitWorld, scope: &Scope, unit: UnitId) -> bool {
        world.is_valid(unit) && self.claims.get(&unit) == Some(scope)
    }

    /// Drop members that died or were reclaimed elsewhere, releasing their
    /// claims when this scope still held them.
    fn prune(&mut self, world: &UnitWorld, scope: &Scope) {
        let PoolsInner { pools, claims, .. } = self;
        let Some(pool) = pools.get_mut(scope) else {
            return;
        };
        let mut pos = 0;
        while pos < pool.members.len() {
            let unit = pool.members[pos];
            if world.is_valid(unit) && claims.get(&unit) == Some(scope) {
                pos += 1;
                continue;
            }
            if claims.get(&unit) == Some(scope) {
                claims.remove(&unit);
                world.set_controlled(unit, false);
            }
            pool.remove_at(pos);
        }
    }

    /// Full membership refresh: prune, then top up from the population in
    /// spawn order until capacity is reached.
    fn refresh(
        &mut self,
        world: &UnitWorld,
        scope: &Scope,
        kind: Option<UnitKind>,
        team: Team,
        privileged: bool,
    ) {
        self.prune(world, scope);

        let PoolsInner { pools, claims, .. } = self;
        let Some(pool) = pools.get_mut(scope) else {
            return;
        };

        // Drop members whose kind no longer matches the selector.
        if let Some(kind) = kind {
            let mut pos = 0;
            while pos < pool.members.len() {
                let unit = pool.members[pos];
                if world.kind_of(unit) == Some(kind) {
                    pos += 1;
                    continue;
                }
                claims.remove(&unit);
                world.set_controlled(unit, false);
                pool.remove_at(pos);
            }
        }

        pool.refreshes += 1;
        let capacity = pool.capacity;

        for unit in world.population() {
            if let Some(cap) = capacity {
                if pool.members.len() >= cap {
                    break;
                }
            }
            if pool.members.contains(&unit) {
                continue;
            }
            if claims.contains_key(&unit) || world.is_controlled(unit) {
                continue;
            }
            if let Some(kind) = kind {
                if world.kind_of(unit) != Some(kind) {
                    continue;
                }
            }
            if !privileged && world.team_of(unit) != Some(team) {
                continue;
            }
            pool.members.push(unit);
            claims.insert(unit, scope.clone());
            world.set_controlled(unit, true);
            trace!(unit = %unit, ?scope, "unit claimed into pool");
        }
    }

    fn release_members(&mut self, world: &UnitWorld, scope: &Scope) {
        let PoolsInner { pools, claims, .. } = self;
        if let Some(pool) = pools.get_mut(scope) {
            for unit in pool.members.drain(..) {
                if claims.get(&unit) == Some(scope) {
                    claims.remove(&unit);
                    world.set_controlled(unit, false);
                }
            }
            pool.cursor = 0;
        }
    }
}

/// Shared manager of unit group pools and owner claims.
#[derive(Default)]
pub struct UnitPools {
    inner: Mutex<PoolsInner>,
}

impl UnitPools {
    /// Create an empty pool manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind the caller to a pool member, creating or refreshing membership
    /// in claim mode, or reading an existing named pool in access mode.
    ///
    /// Returns the unit under the round-robin cursor and its member index.
    pub fn bind(&self, world: &UnitWorld, req: BindRequest<'_>) -> BindResult<(UnitId, usize)> {
        match req.mode {
            BindMode::Claim => self.bind_claim(world, req),
            BindMode::Access => self.bind_access(world, req),
        }
    }

    fn bind_claim(&self, world: &UnitWorld, req: BindRequest<'_>) -> BindResult<(UnitId, usize)> {
        if req.count <= 0 {
            return Err(BindError::InvalidCount);
        }
        let count = req.count as usize;

        let kind = match req.kind_name {
            Some(name) => Some(world.resolve_kind(name).ok_or(BindError::UnitTypeNotFound)?),
            None => None,
        };

        let scope = match req.scope_name {
            Some(name) if !name.is_empty() => Scope::Named(name.to_string()),
            _ => Scope::Private(req.owner),
        };

        let mut inner = self.inner.lock();

        // First claimant wins; later claimants are rejected every tick until
        // the binding is released, and must not touch the existing pool.
        if let Scope::Named(_) = &scope {
            let conflicting = inner.owners.iter().any(|(owner, binding)| {
                *owner != req.owner && binding.claim.as_ref() == Some(&scope)
            });
            if conflicting {
                debug!(?scope, owner = %req.owner, "scope name already claimed");
                return Err(BindError::GroupConflict);
            }
        }

        let snapshot = BindSnapshot {
            kind,
            count,
            scope: scope.clone(),
        };
        let now = Instant::now();
        let unchanged = matches!(
            inner.owners.get(&req.owner),
            Some(binding) if binding.snapshot.as_ref() == Some(&snapshot)
        );
        let binding = OwnerBinding {
            claim: Some(scope.clone()),
            snapshot: Some(snapshot),
            last_seen: now,
        };
        inner.owners.insert(req.owner, binding);

        let pool_intact = unchanged
            && match inner.pools.get(&scope) {
                Some(pool) => {
                    !pool.members.is_empty()
                        && pool
                            .members
                            .iter()
                            .all(|&unit| inner.member_still_good(world, &scope, unit))
                }
                None => false,
            };

        if !pool_intact {
            inner
                .pools
                .entry(scope.clone())
                .or_insert_with(|| PoolEntry::new(Some(count)))
                .capacity = Some(count);
            inner.refresh(world, &scope, kind, req.team, req.privileged);
        }

        let pool = inner
            .pools
            .get_mut(&scope)
            .ok_or(BindError::NoUnitsAvailable)?;
        pool.take_next().ok_or(BindError::NoUnitsAvailable)
    }

    fn bind_access(&self, world: &UnitWorld, req: BindRequest<'_>) -> BindResult<(UnitId, usize)> {
        let name = match req.scope_name {
            Some(name) if !name.is_empty() => name,
            _ => return Err(BindError::GroupNotExist),
        };
        let scope = Scope::Named(name.to_string());

        let mut inner = self.inner.lock();
        if !inner.pools.contains_key(&scope) {
            return Err(BindError::GroupNotExist);
        }

        // Access never creates or tops up; it only drops members that are
        // no longer usable.
        inner.prune(world, &scope);

        if let Some(binding) = inner.owners.get_mut(&req.owner) {
            binding.last_seen = Instant::now();
        }

        let pool = inner.pools.get_mut(&scope).ok_or(BindError::GroupNotExist)?;
        pool.take_next().ok_or(BindError::EmptyGroup)
    }

    /// Release a unit: clear its controlled marker and remove it from every
    /// pool that contains it, fixing up cursors.
    pub fn release(&self, world: &UnitWorld, unit: UnitId) {
        let mut inner = self.inner.lock();
        inner.claims.remove(&unit);
        world.set_controlled(unit, false);
        for pool in inner.pools.values_mut() {
            if let Some(pos) = pool.members.iter().position(|&member| member == unit) {
                pool.remove_at(pos);
            }
        }
    }

    /// Periodic reclamation: drop bindings of dead owners, release the
    /// members of pools left without a live claiming owner, delete pools
    /// that are both empty and unclaimed, and prune the rest.
    pub fn sweep<F>(&self, world: &UnitWorld, live: F)
    where
        F: Fn(ControllerId) -> bool,
    {
        let mut inner = self.inner.lock();

        let before = inner.owners.len();
        inner.owners.retain(|owner, binding| {
            let keep = live(*owner);
            if !keep {
                trace!(owner = %owner, last_seen = ?binding.last_seen.elapsed(), "dropping dead owner binding");
            }
            keep
        });
        if inner.owners.len() != before {
            debug!(
                dropped = before - inner.owners.len(),
                "swept dead owner bindings"
            );
        }

        let scopes: Vec<Scope> = inner.pools.keys().cloned().collect();
        for scope in &scopes {
            if !inner.has_claimer(scope) {
                inner.release_members(world, scope);
            }
        }

        // Pools stay alive while claimed, even when transiently empty.
        let mut removable: Vec<Scope> = Vec::new();
        for (scope, pool) in inner.pools.iter() {
            if pool.members.is_empty() && !inner.has_claimer(scope) {
                removable.push(scope.clone());
            }
        }
        for scope in removable {
            inner.pools.remove(&scope);
        }

        let scopes: Vec<Scope> = inner.pools.keys().cloned().collect();
        for scope in &scopes {
            inner.prune(world, scope);
        }
    }

    /// Snapshot of a named pool, if it exists.
    pub fn stats(&self, name: &str) -> Option<PoolStats> {
        let inner = self.inner.lock();
        let pool = inner.pools.get(&Scope::Named(name.to_string()))?;
        Some(PoolStats {
            members: pool.members.clone(),
            cursor: pool.cursor,
            capacity: pool.capacity,
            refreshes: pool.refreshes,
        })
    }

    /// Snapshot of a controller's private pool, if it exists.
    pub fn private_stats(&self, owner: ControllerId) -> Option<PoolStats> {
        let inner = self.inner.lock();
        let pool = inner.pools.get(&Scope::Private(owner))?;
        Some(PoolStats {
            members: pool.members.clone(),
            cursor: pool.cursor,
            capacity: pool.capacity,
            refreshes: pool.refreshes,
        })
    }

    /// Scope currently claiming a unit, if any.
    pub fn claim_of(&self, unit: UnitId) -> Option<Scope> {
        self.inner.lock().claims.get(&unit).cloned()
    }
}
