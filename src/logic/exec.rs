use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, trace};

use crate::runtime::error::{BindError, BindResult};
use crate::runtime::pools::{BindMode, BindRequest};
use crate::runtime::units::{ControllerId, Team, UnitId};
use crate::runtime::{ControllerRegistry, Services};

use super::call::{CallSite, DepthGuard};
use super::program::{Instr, JumpCond, NONE_TOKEN, Program};
use super::value::{LValue, ObjRef};

/// Registration of a live controller, retired on drop.
struct LiveGuard {
    id: ControllerId,
    controllers: Arc<ControllerRegistry>,
}

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.controllers.retire(self.id);
    }
}

/// One program instance: variable slots, instruction counter, and the
/// caller context shared with any nested programs it invokes.
///
/// A processor executes its instruction list once per simulation tick,
/// bounded by the configured instruction budget. Instruction failures never
/// abort the tick; they produce error-code outputs or degrade to no-ops.
pub struct Processor {
    controller: ControllerId,
    team: Team,
    privileged: bool,
    program: Program,
    counter: usize,
    vars: HashMap<String, LValue>,
    links: Arc<Vec<(String, LValue)>>,
    unit: Option<UnitId>,
    services: Services,
    call_sites: HashMap<usize, CallSite>,
    _live: Option<LiveGuard>,
}

impl Processor {
    /// Create a registered program instance wired to the given services.
    pub fn spawn(services: Services, program: Program, team: Team, privileged: bool) -> Processor {
        let controller = ControllerId::new();
        services.controllers.register(controller);
        let live = LiveGuard {
            id: controller,
            controllers: Arc::clone(&services.controllers),
        };
        Processor {
            controller,
            team,
            privileged,
            program,
            counter: 0,
            vars: HashMap::new(),
            links: Arc::new(Vec::new()),
            unit: None,
            services,
            call_sites: HashMap::new(),
            _live: Some(live),
        }
    }

    /// Create an unregistered sub-interpreter sharing the caller's
    /// controller identity. Context fields are re-bound on every invocation.
    pub(crate) fn nested(
        services: Services,
        program: Program,
        controller: ControllerId,
    ) -> Processor {
        Processor {
            controller,
            team: Team(0),
            privileged: false,
            program,
            counter: 0,
            vars: HashMap::new(),
            links: Arc::new(Vec::new()),
            unit: None,
            services,
            call_sites: HashMap::new(),
            _live: None,
        }
    }

    /// This instance's controller identity.
    pub fn controller(&self) -> ControllerId {
        self.controller
    }

    /// Currently bound unit, if any.
    pub fn bound_unit(&self) -> Option<UnitId> {
        self.unit
    }

    /// Replace the resource-link table visible to this program.
    pub fn set_links(&mut self, links: Vec<(String, LValue)>) {
        self.links = Arc::new(links);
    }

    /// Read a variable, `Null` when unset.
    pub fn var(&self, name: &str) -> LValue {
        self.vars.get(name).cloned().unwrap_or(LValue::Null)
    }

    /// Write a variable from the host side.
    pub fn set_var(&mut self, name: &str, value: LValue) {
        self.vars.insert(name.to_string(), value);
    }

    #[cfg(test)]
    pub(crate) fn program_len(&self) -> usize {
        self.program.len()
    }

    /// Execute one tick's slice under the configured instruction budget.
    pub fn run_tick(&mut self) {
        let mut budget = self.services.config.tick_budget;
        self.run_slice(&mut budget);
    }

    /// Drive instructions until the program completes one pass, an `end`
    /// executes, or the shared budget runs out.
    pub(crate) fn run_slice(&mut self, budget: &mut usize) {
        while *budget > 0 {
            if self.counter >= self.program.len() {
                self.counter = 0;
                return;
            }
            let site_idx = self.counter;
            let Some(instr) = self.program.get(site_idx).cloned() else {
                self.counter = 0;
                return;
            };
            self.counter += 1;
            *budget -= 1;

            match instr {
                Instr::Set { dest, value } => {
                    let resolved = self.resolve(&value);
                    self.write_var(&dest, resolved);
                }
                Instr::Op { op, dest, a, b } => {
                    let result = op.apply(self.resolve(&a).as_num(), self.resolve(&b).as_num());
                    self.write_var(&dest, LValue::Num(result));
                }
                Instr::Jump { target, cond, a, b } => {
                    if self.jump_taken(cond, &a, &b) {
                        self.counter = target.min(self.program.len());
                    }
                }
                Instr::End => {
                    self.counter = 0;
                    return;
                }
                Instr::Push {
                    value,
                    index,
                    stack,
                } => self.exec_push(&value, &index, &stack),
                Instr::Pop { dest, index, stack } => self.exec_pop(&dest, &index, &stack),
                Instr::Call { source, name } => self.exec_call(site_idx, &source, &name, budget),
                Instr::Bind {
                    mode,
                    kind,
                    count,
                    scope,
                    unit_dest,
                    index_dest,
                } => self.exec_bind(&mode, &kind, &count, &scope, &unit_dest, &index_dest),
            }
        }
    }

    /// Resolve an operand token: builtin constants, then the link table,
    /// then variables, then literal coercion.
    fn resolve(&self, token: &str) -> LValue {
        match token {
            "@this" => return LValue::Obj(ObjRef::Controller(self.controller)),
            "@unit" => {
                return self
                    .unit
                    .map(|unit| LValue::Obj(ObjRef::Unit(unit)))
                    .unwrap_or(LValue::Null);
            }
            "@links" => return LValue::Num(self.links.len() as f64),
            "@team" => return LValue::Num(self.team.0 as f64),
            _ => {}
        }
        if let Some((_, value)) = self.links.iter().find(|(name, _)| name == token) {
            return value.clone();
        }
        if let Some(value) = self.vars.get(token) {
            return value.clone();
        }
        LValue::coerce(token)
    }

    /// Variable write; `@` constants are not assignable.
    fn write_var(&mut self, dest: &str, value: LValue) {
        if dest.starts_with('@') {
            trace!(dest, "ignoring write to builtin constant");
            return;
        }
        self.vars.insert(dest.to_string(), value);
    }

    fn jump_taken(&self, cond: JumpCond, a: &str, b: &str) -> bool {
        match cond {
            JumpCond::Always => true,
            JumpCond::Eq => values_equal(&self.resolve(a), &self.resolve(b)),
            JumpCond::NotEq => !values_equal(&self.resolve(a), &self.resolve(b)),
            JumpCond::LessThan => self.resolve(a).as_num() < self.resolve(b).as_num(),
            JumpCond::GreaterThan => self.resolve(a).as_num() > self.resolve(b).as_num(),
        }
    }

    fn exec_push(&mut self, value: &str, index: &str, stack: &str) {
        let resolved = self.resolve(value);
        let index = self.resolve(index).as_num() as i64;
        let stack = name_token(stack);
        self.services.stacks.write(&stack, index, resolved);
    }

    fn exec_pop(&mut self, dest: &str, index: &str, stack: &str) {
        let index = self.resolve(index).as_num() as i64;
        let stack = name_token(stack);
        let value = self
            .services
            .stacks
            .read(&stack, index)
            .unwrap_or(LValue::Null);
        self.write_var(dest, value);
    }

    /// Drive a nested program against this call site's cached
    /// sub-interpreter, sharing the caller's context and budget.
    fn exec_call(&mut self, site_idx: usize, source: &str, name: &str, budget: &mut usize) {
        let Some(_depth) = DepthGuard::enter(self.services.config.max_call_depth) else {
            trace!(name, "nested call depth limit reached, skipping");
            return;
        };

        let hash = blake3::hash(source.as_bytes());
        let mut site = match self.call_sites.remove(&site_idx) {
            Some(site) if site.source_hash == hash => site,
            _ => CallSite::prepare(source, name, &self.services, self.controller),
        };

        // Re-bind the mutable caller context on every invocation.
        site.processor.team = self.team;
        site.processor.privileged = self.privileged;
        site.processor.links = Arc::clone(&self.links);
        site.processor.unit = self.unit;
        site.processor.counter = 0;

        site.processor.run_slice(budget);
        self.call_sites.insert(site_idx, site);
    }

    fn exec_bind(
        &mut self,
        mode: &str,
        kind: &str,
        count: &str,
        scope: &str,
        unit_dest: &str,
        index_dest: &str,
    ) {
        match self.group_bind(mode, kind, count, scope) {
            Ok((unit, pos)) => {
                self.unit = Some(unit);
                self.write_var(unit_dest, LValue::Obj(ObjRef::Unit(unit)));
                self.write_var(index_dest, LValue::Num(pos as f64));
            }
            Err(err) => {
                if self.services.config.debug {
                    debug!(error = %err, code = err.code(), "group bind failed");
                }
                self.unit = None;
                self.write_var(unit_dest, LValue::Null);
                self.write_var(index_dest, LValue::Num(err.code() as f64));
            }
        }
    }

    fn group_bind(
        &mut self,
        mode: &str,
        kind: &str,
        count: &str,
        scope: &str,
    ) -> BindResult<(UnitId, usize)> {
        if !self.services.controllers.is_live(self.controller) {
            return Err(BindError::InvalidController);
        }
        let mode = match mode {
            "claim" => BindMode::Claim,
            "access" => BindMode::Access,
            _ => return Err(BindError::InvalidMode),
        };
        let kind_name = (kind != NONE_TOKEN).then(|| name_token(kind));
        let scope_name = (scope != NONE_TOKEN).then(|| name_token(scope));
        let count = self.resolve(count).as_num() as i64;

        self.services.pools.bind(
            &self.services.world,
            BindRequest {
                owner: self.controller,
                team: self.team,
                privileged: self.privileged,
                scope_name: scope_name.as_deref(),
                kind_name: kind_name.as_deref(),
                count,
                mode,
            },
        )
    }
}

/// Strip surrounding quotes from a name operand, if present.
fn name_token(token: &str) -> String {
    if token.len() >= 2 && token.starts_with('"') && token.ends_with('"') {
        token[1..token.len() - 1].to_string()
    } else {
        token.to_string()
    }
}

/// Equality used by jump conditions: numeric with tolerance for numbers,
/// structural otherwise.
fn values_equal(a: &LValue, b: &LValue) -> bool {
    match (a, b) {
        (LValue::Num(x), LValue::Num(y)) => (x - y).abs() < 1e-6,
        _ => a == b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::units::Team;
    use crate::runtime::{Runtime, RuntimeConfig};

    fn runtime() -> Runtime {
        Runtime::new(RuntimeConfig::default()).expect("runtime")
    }

    fn processor_for(runtime: &Runtime, source: &str) -> Processor {
        let program = Program::compile(source).expect("compile");
        runtime.spawn_processor(program, Team(1), false)
    }

    #[test]
    fn set_and_op_update_variables() {
        let runtime = runtime();
        let mut proc = processor_for(&runtime, "set x 5\nop add y x 2");
        proc.run_tick();
        assert_eq!(proc.var("x"), LValue::Num(5.0));
        assert_eq!(proc.var("y"), LValue::Num(7.0));
    }

    #[test]
    fn jump_loops_until_condition_flips() {
        let runtime = runtime();
        let source = "op add i i 1\njump 0 lessThan i 5";
        let mut proc = processor_for(&runtime, source);
        proc.run_tick();
        assert_eq!(proc.var("i"), LValue::Num(5.0));
    }

    #[test]
    fn budget_bounds_infinite_loops() {
        let config = RuntimeConfig {
            tick_budget: 50,
            ..Default::default()
        };
        let runtime = Runtime::new(config).expect("runtime");
        let mut proc = processor_for(&runtime, "op add i i 1\njump 0 always");
        proc.run_tick();
        // One pass of the loop is two instructions; 50 budget = 25 passes.
        assert_eq!(proc.var("i"), LValue::Num(25.0));
    }

    #[test]
    fn end_finishes_the_slice_early() {
        let runtime = runtime();
        let mut proc = processor_for(&runtime, "set x 1\nend\nset y 1");
        proc.run_tick();
        assert_eq!(proc.var("x"), LValue::Num(1.0));
        assert_eq!(proc.var("y"), LValue::Null);
    }

    #[test]
    fn push_pop_round_trip_with_coercion() {
        let runtime = runtime();
        let mut proc = processor_for(
            &runtime,
            "push 5 0 mailbox\npush \"hello\" 1 mailbox\npop num 0 mailbox\npop text 1 mailbox",
        );
        proc.run_tick();
        // Literal "5" coerces to the number 5, quoted text drops its quotes.
        assert_eq!(proc.var("num"), LValue::Num(5.0));
        assert_eq!(proc.var("text"), LValue::Str("hello".into()));
    }

    #[test]
    fn push_prefers_variable_resolution_over_coercion() {
        let runtime = runtime();
        let mut proc = processor_for(&runtime, "set speed 42\npush speed 0 mailbox\npop out 0 mailbox");
        proc.run_tick();
        assert_eq!(proc.var("out"), LValue::Num(42.0));
    }

    #[test]
    fn pop_of_missing_slot_clears_the_variable() {
        let runtime = runtime();
        let mut proc = processor_for(&runtime, "set out 9\npop out 3 nowhere");
        proc.run_tick();
        assert_eq!(proc.var("out"), LValue::Null);
    }

    #[test]
    fn bind_claim_sets_unit_and_index_outputs() {
        let runtime = runtime();
        let kind = runtime.world().register_kind("mono");
        let unit = runtime.world().spawn(kind, Team(1));

        let mut proc = processor_for(&runtime, "bind claim _ 1 alpha u idx");
        proc.run_tick();
        assert_eq!(proc.var("u"), LValue::Obj(ObjRef::Unit(unit)));
        assert_eq!(proc.var("idx"), LValue::Num(0.0));
        assert_eq!(proc.bound_unit(), Some(unit));
    }

    #[test]
    fn bind_failure_clears_unit_and_reports_code() {
        let runtime = runtime();
        let mut proc = processor_for(&runtime, "bind claim _ 1 alpha u idx");
        proc.run_tick();
        assert_eq!(proc.var("u"), LValue::Null);
        assert_eq!(
            proc.var("idx"),
            LValue::Num(BindError::NoUnitsAvailable.code() as f64)
        );
        assert_eq!(proc.bound_unit(), None);
    }

    #[test]
    fn bind_with_bad_mode_reports_invalid_mode() {
        let runtime = runtime();
        let mut proc = processor_for(&runtime, "bind borrow _ 1 alpha u idx");
        proc.run_tick();
        assert_eq!(
            proc.var("idx"),
            LValue::Num(BindError::InvalidMode.code() as f64)
        );
    }

    #[test]
    fn links_and_builtins_resolve() {
        let runtime = runtime();
        let mut proc = processor_for(&runtime, "set a @links\nset b node1");
        proc.set_links(vec![("node1".into(), LValue::Num(88.0))]);
        proc.run_tick();
        assert_eq!(proc.var("a"), LValue::Num(1.0));
        assert_eq!(proc.var("b"), LValue::Num(88.0));
    }

    #[test]
    fn dropping_a_processor_retires_its_controller() {
        let runtime = runtime();
        let proc = processor_for(&runtime, "set x 1");
        let id = proc.controller();
        assert!(runtime.controllers().is_live(id));
        drop(proc);
        assert!(!runtime.controllers().is_live(id));
    }
}
