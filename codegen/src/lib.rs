//! The Carve code generator: an SSA middle end and a retargetable back end
//! for a C-like source language.
//!
//! The crate starts where the front end stops: it consumes a well-formed SSA
//! [`ir::Module`], runs the optimization pipeline over it, and lowers the
//! result to textual assembly through instruction selection, PHI
//! elimination, linear-scan register allocation, and frame lowering. The
//! only target currently wired up is RISC-V 64; everything above
//! [`isa`] is target-independent.
//!
//! The usual entry point is [`Context`], which owns the pass
//! pipeline and hands the optimized module to a [`isa::TargetIsa`].

#![warn(missing_docs)]

pub use crate::context::Context;
pub use crate::result::{CodegenError, CodegenResult};

pub mod analysis;
mod context;
pub mod dominance;
pub mod flowgraph;
mod fx;
pub mod ir;
pub mod isa;
pub mod isel;
pub mod loop_analysis;
pub mod mir;
pub mod opt;
pub mod phi_elim;
pub mod regalloc;
mod result;
pub mod settings;
pub mod verifier;

/// Version number of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
