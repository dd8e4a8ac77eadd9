//! IR entity references.
//!
//! Instructions need to reference other parts of the function (values,
//! blocks) and of the module (globals, functions). These references are not
//! Rust references: ownership and mutability rules would make the graph
//! unworkable, and 64-bit pointers waste space. Instead each entity is a
//! `u32` index into a table owned by the function or module, wrapped in a
//! distinct newtype for type safety. The all-ones index is reserved so a
//! `PackedOption` of any entity stays four bytes.

use carve_entity::entity_impl;

/// An opaque reference to a basic block in a function.
///
/// Blocks are numbered densely from 0; block 0 is always the entry.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Block(u32);
entity_impl!(Block, "block");

/// An opaque reference to an SSA value.
///
/// Every value has exactly one definition: either an instruction result or
/// a function parameter.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Value(u32);
entity_impl!(Value, "v");

/// An opaque reference to an instruction in a function.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Inst(u32);
entity_impl!(Inst, "inst");

/// An opaque reference to a function known to the module, either defined in
/// it or imported.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FuncRef(u32);
entity_impl!(FuncRef, "fn");

/// An opaque reference to a global variable.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GlobalVar(u32);
entity_impl!(GlobalVar, "gv");
