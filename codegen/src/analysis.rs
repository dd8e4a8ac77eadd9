//! Memoized per-function analyses.
//!
//! The [`AnalysisManager`] caches analysis results keyed by `(function,
//! analysis type)`. A pass asks for `get::<DominatorTree>(fr, module)` and
//! either receives the cached tree or triggers a build; a pass that mutates
//! a function's control flow or SSA form must call
//! [`AnalysisManager::invalidate`] before anyone asks again.
//!
//! The manager is a context object threaded through the pipeline, not a
//! process singleton. The per-type identifier is [`core::any::TypeId`],
//! which is stable for the whole run, and the cache stores `Rc<dyn Any>` so
//! dropping an entry reclaims the analysis without a hand-rolled deleter
//! table. Analyses are read-only after construction, and the manager is
//! deliberately not thread-safe; compilation is single-threaded per module.

use crate::dominance::{DominatorTree, PostDominatorTree};
use crate::flowgraph::ControlFlowGraph;
use crate::fx::FxHashMap;
use crate::ir::{FuncRef, Function, Module};
use crate::loop_analysis::LoopAnalysis;
use std::any::{Any, TypeId};
use std::rc::Rc;

/// Process-stable identifier of an analysis type.
pub type AnalysisId = TypeId;

/// An analysis that can be computed for a single function.
pub trait FunctionAnalysis: Any {
    /// Build this analysis for `func`. Dependencies are requested through
    /// the manager, so they are cached too.
    fn build(func: &Function, func_ref: FuncRef, am: &mut AnalysisManager, module: &Module)
        -> Self;
}

/// The analysis cache.
#[derive(Default)]
pub struct AnalysisManager {
    cache: FxHashMap<(FuncRef, AnalysisId), Rc<dyn Any>>,
}

impl AnalysisManager {
    /// Create an empty manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the `A` analysis of `func_ref`, building and caching it on a
    /// miss.
    pub fn get<A: FunctionAnalysis>(&mut self, func_ref: FuncRef, module: &Module) -> Rc<A> {
        let key = (func_ref, TypeId::of::<A>());
        if let Some(cached) = self.cache.get(&key) {
            return cached.clone().downcast::<A>().ok().expect("analysis id clash");
        }
        let func = module.functions[func_ref]
            .body()
            .expect("analysis requested for an imported function");
        let built = Rc::new(A::build(func, func_ref, self, module));
        self.cache.insert(key, built.clone());
        built
    }

    /// Drop every cached analysis of `func_ref`. Mandatory after any
    /// structural mutation of the function.
    pub fn invalidate(&mut self, func_ref: FuncRef) {
        self.cache.retain(|&(fr, _), _| fr != func_ref);
    }

    /// Drop everything.
    pub fn clear(&mut self) {
        self.cache.clear();
    }

    /// Number of live cache entries, for tests.
    pub fn num_cached(&self) -> usize {
        self.cache.len()
    }
}

impl FunctionAnalysis for ControlFlowGraph {
    fn build(func: &Function, _: FuncRef, _: &mut AnalysisManager, _: &Module) -> Self {
        ControlFlowGraph::with_function(func)
    }
}

impl FunctionAnalysis for DominatorTree {
    fn build(func: &Function, fr: FuncRef, am: &mut AnalysisManager, module: &Module) -> Self {
        let cfg = am.get::<ControlFlowGraph>(fr, module);
        DominatorTree::with_function(func, &cfg)
    }
}

impl FunctionAnalysis for PostDominatorTree {
    fn build(func: &Function, fr: FuncRef, am: &mut AnalysisManager, module: &Module) -> Self {
        let cfg = am.get::<ControlFlowGraph>(fr, module);
        PostDominatorTree::with_function(func, &cfg)
    }
}

impl FunctionAnalysis for LoopAnalysis {
    fn build(func: &Function, fr: FuncRef, am: &mut AnalysisManager, module: &Module) -> Self {
        let cfg = am.get::<ControlFlowGraph>(fr, module);
        let domtree = am.get::<DominatorTree>(fr, module);
        LoopAnalysis::with_function(func, &cfg, &domtree)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{types::I32, Function, Operand, Signature};

    fn tiny_module() -> (Module, FuncRef) {
        let mut module = Module::new();
        let mut func = Function::with_name_signature("f", Signature::new(vec![I32], I32));
        let entry = func.entry_block();
        let p = func.params[0];
        func.ret(entry, Some(Operand::Value(p)));
        let fr = module.define_function(func);
        (module, fr)
    }

    #[test]
    fn caching_and_invalidation() {
        let (module, fr) = tiny_module();
        let mut am = AnalysisManager::new();

        let cfg1 = am.get::<ControlFlowGraph>(fr, &module);
        let cfg2 = am.get::<ControlFlowGraph>(fr, &module);
        assert!(Rc::ptr_eq(&cfg1, &cfg2));
        assert_eq!(am.num_cached(), 1);

        // Dominator tree pulls in the CFG dependency; both are cached.
        let _dt = am.get::<DominatorTree>(fr, &module);
        assert_eq!(am.num_cached(), 2);

        am.invalidate(fr);
        assert_eq!(am.num_cached(), 0);
        let cfg3 = am.get::<ControlFlowGraph>(fr, &module);
        assert!(!Rc::ptr_eq(&cfg1, &cfg3));
    }

    #[test]
    fn loop_analysis_builds_dependencies() {
        let (module, fr) = tiny_module();
        let mut am = AnalysisManager::new();
        let la = am.get::<LoopAnalysis>(fr, &module);
        assert_eq!(la.num_loops(), 0);
        // CFG + DomTree + LoopAnalysis.
        assert_eq!(am.num_cached(), 3);
    }
}
