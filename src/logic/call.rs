use std::cell::Cell;
use tracing::debug;

use crate::runtime::Services;
use crate::runtime::units::ControllerId;

use super::exec::Processor;
use super::program::Program;

thread_local! {
    static CALL_DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// Scoped hold on the per-thread nested-call depth counter.
///
/// The counter is thread-local so unrelated program instances executing on
/// other worker threads never trip each other's limit. Dropping the guard
/// always decrements, even when the nested program panics out of its slice.
pub(crate) struct DepthGuard(());

impl DepthGuard {
    /// Enter one nesting level, or `None` when the limit is reached.
    pub(crate) fn enter(max_depth: usize) -> Option<DepthGuard> {
        CALL_DEPTH.with(|depth| {
            if depth.get() >= max_depth {
                return None;
            }
            depth.set(depth.get() + 1);
            Some(DepthGuard(()))
        })
    }

    #[cfg(test)]
    pub(crate) fn current() -> usize {
        CALL_DEPTH.with(Cell::get)
    }
}

impl Drop for DepthGuard {
    fn drop(&mut self) {
        CALL_DEPTH.with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

/// Cached compiled program and live sub-interpreter for one call site.
///
/// Owned by the processor whose instruction created it; never shared across
/// program instances. The source hash keys recompilation: an unchanged hash
/// reuses both the compiled program and the sub-interpreter's state.
pub(crate) struct CallSite {
    pub(crate) source_hash: blake3::Hash,
    pub(crate) processor: Processor,
}

impl CallSite {
    /// Compile the nested source and build its sub-interpreter.
    ///
    /// Compilation failure degrades to the empty program: the call becomes a
    /// silent no-op on every invocation rather than an error the caller
    /// could trip over.
    pub(crate) fn prepare(
        source: &str,
        name: &str,
        services: &Services,
        controller: ControllerId,
    ) -> CallSite {
        let source_hash = blake3::hash(source.as_bytes());
        let program = match Program::compile(source) {
            Ok(program) => program,
            Err(err) => {
                if services.config.debug {
                    debug!(name, error = %err, "nested program failed to compile, degrading to no-op");
                }
                Program::empty()
            }
        };
        CallSite {
            source_hash,
            processor: Processor::nested(services.clone(), program, controller),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{Runtime, RuntimeConfig};

    fn services() -> Services {
        Runtime::new(RuntimeConfig::default())
            .expect("runtime")
            .services()
    }

    #[test]
    fn depth_guard_enforces_the_limit() {
        assert_eq!(DepthGuard::current(), 0);
        let first = DepthGuard::enter(2).expect("level 1");
        let second = DepthGuard::enter(2).expect("level 2");
        assert!(DepthGuard::enter(2).is_none(), "third level refused");

        drop(second);
        let again = DepthGuard::enter(2).expect("level freed");
        drop(again);
        drop(first);
        assert_eq!(DepthGuard::current(), 0);
    }

    #[test]
    fn bad_source_compiles_to_empty_program() {
        let services = services();
        let site = CallSite::prepare("frobnicate 1", "worker", &services, ControllerId::new());
        assert_eq!(site.processor.program_len(), 0);
    }

    #[test]
    fn hash_distinguishes_sources() {
        let services = services();
        let owner = ControllerId::new();
        let a = CallSite::prepare("set x 1", "a", &services, owner);
        let b = CallSite::prepare("set x 2", "b", &services, owner);
        assert_ne!(a.source_hash, b.source_hash);
    }
}
