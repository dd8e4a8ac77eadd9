//! Representation of SSA intermediate code.
//!
//! A [`Module`] owns global variables, external function declarations, and
//! defined functions. The IR builder (an external collaborator) constructs
//! the module; the passes in [`crate::opt`] mutate it in place; the back
//! end consumes it.

pub mod condcodes;
pub mod dfg;
pub mod entities;
pub mod function;
pub mod immediates;
pub mod instructions;
pub mod layout;
pub mod types;

pub use self::condcodes::{CondCode, FloatCC, IntCC};
pub use self::dfg::{DataFlowGraph, ValueDef};
pub use self::entities::{Block, FuncRef, GlobalVar, Inst, Value};
pub use self::function::{BlockData, Function, Signature};
pub use self::immediates::Ieee32;
pub use self::instructions::{CallArgs, InstructionData, Opcode, Operand, PhiArgs};
pub use self::layout::Layout;
pub use self::types::Type;

use carve_entity::PrimaryMap;
use std::fmt;

/// A source file position, tracked per instruction and preserved into
/// assembly comments. The compiler never interprets it.
#[derive(Copy, Clone, Default, PartialEq, Eq, Debug)]
pub struct SourceLoc(u32);

impl SourceLoc {
    /// Create a source location with the given line number.
    pub fn new(line: u32) -> Self {
        Self(line)
    }

    /// Is this the default (unknown) location?
    pub fn is_default(self) -> bool {
        self.0 == 0
    }

    /// The line number.
    pub fn line(self) -> u32 {
        self.0
    }
}

impl fmt::Display for SourceLoc {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "line {}", self.0)
    }
}

/// A global variable: a scalar or a flat array of one element type.
#[derive(Clone, Debug)]
pub struct GlobalVarData {
    /// Symbol name.
    pub name: String,
    /// Element type.
    pub ty: Type,
    /// Array dimensions; empty for scalars.
    pub dims: Vec<u32>,
    /// Initializer words, one bit pattern per element. Empty means
    /// zero-initialized.
    pub init: Vec<i64>,
}

impl GlobalVarData {
    /// Total number of elements.
    pub fn elems(&self) -> u32 {
        self.dims.iter().product::<u32>().max(1)
    }

    /// Total size in bytes.
    pub fn size(&self) -> u32 {
        self.elems() * self.ty.bytes()
    }
}

/// An external function known only by name and signature.
#[derive(Clone, Debug)]
pub struct ExtFuncData {
    /// Symbol name.
    pub name: String,
    /// Signature of the function.
    pub signature: Signature,
}

/// A function in the module: imported or defined.
#[derive(Clone)]
pub enum FuncDecl {
    /// Declared but defined elsewhere.
    Import(ExtFuncData),
    /// Defined in this module.
    Defined(Function),
}

impl FuncDecl {
    /// Symbol name.
    pub fn name(&self) -> &str {
        match self {
            Self::Import(data) => &data.name,
            Self::Defined(func) => &func.name,
        }
    }

    /// Signature of the function.
    pub fn signature(&self) -> &Signature {
        match self {
            Self::Import(data) => &data.signature,
            Self::Defined(func) => &func.signature,
        }
    }

    /// The body, when defined in this module.
    pub fn body(&self) -> Option<&Function> {
        match self {
            Self::Import(_) => None,
            Self::Defined(func) => Some(func),
        }
    }

    /// The body, mutable edition.
    pub fn body_mut(&mut self) -> Option<&mut Function> {
        match self {
            Self::Import(_) => None,
            Self::Defined(func) => Some(func),
        }
    }
}

/// A compilation unit: globals, declarations, and defined functions.
#[derive(Clone, Default)]
pub struct Module {
    /// Global variables.
    pub globals: PrimaryMap<GlobalVar, GlobalVarData>,
    /// All functions the module knows about.
    pub functions: PrimaryMap<FuncRef, FuncDecl>,
}

impl Module {
    /// Create an empty module.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a global variable.
    pub fn declare_global(&mut self, data: GlobalVarData) -> GlobalVar {
        self.globals.push(data)
    }

    /// Declare an external function.
    pub fn declare_function(&mut self, name: impl Into<String>, signature: Signature) -> FuncRef {
        self.functions.push(FuncDecl::Import(ExtFuncData {
            name: name.into(),
            signature,
        }))
    }

    /// Add a defined function.
    pub fn define_function(&mut self, func: Function) -> FuncRef {
        self.functions.push(FuncDecl::Defined(func))
    }

    /// Look up a function by symbol name.
    pub fn function_by_name(&self, name: &str) -> Option<FuncRef> {
        self.functions
            .iter()
            .find(|(_, decl)| decl.name() == name)
            .map(|(fr, _)| fr)
    }

    /// Iterate over the refs of defined functions.
    pub fn defined_functions(&self) -> impl Iterator<Item = FuncRef> + '_ {
        self.functions
            .iter()
            .filter(|(_, decl)| decl.body().is_some())
            .map(|(fr, _)| fr)
    }
}
