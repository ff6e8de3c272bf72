//! Function and module descriptors
//!
//! Modules and their functions are owned by the registry that loaded them.
//! The stack only needs enough of them to compare module identity, resolve
//! per-module state, and print backtraces.

use serde::Serialize;
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Kind of activation a frame represents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameKind {
    /// Marshals arguments and results across the VM boundary.
    /// Has no source location of its own.
    External,
    /// Host function without persistent register storage.
    Native,
    /// Bytecode function using register storage in the frame.
    Bytecode,
}

impl FrameKind {
    /// Whether a function declared as `declared` may run in a frame of this kind.
    ///
    /// External frames wrap calls into any function; native and bytecode
    /// frames must match the declaration.
    pub fn accepts(self, declared: FrameKind) -> bool {
        self == FrameKind::External || self == declared
    }
}

impl fmt::Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameKind::External => write!(f, "external"),
            FrameKind::Native => write!(f, "native"),
            FrameKind::Bytecode => write!(f, "bytecode"),
        }
    }
}

/// Registry-assigned module identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ModuleId(pub u32);

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Position in source code a bytecode offset maps back to
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceLocation {
    pub file: String,
    pub line: u32,
    pub column: u32,
}

impl SourceLocation {
    pub fn new(file: impl Into<String>, line: u32, column: u32) -> Self {
        Self {
            file: file.into(),
            line,
            column,
        }
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.file, self.line, self.column)
    }
}

/// A loaded module, as seen by the stack
pub trait Module: fmt::Debug {
    /// Identity used to decide whether two functions share module state
    fn id(&self) -> ModuleId;

    /// Module name for diagnostics
    fn name(&self) -> &str;

    /// Name of the function at `ordinal`, if the module keeps names
    fn function_name(&self, _ordinal: u32) -> Option<&str> {
        None
    }

    /// Map a program counter inside a function to a source location
    fn source_location(&self, _ordinal: u32, _pc: u64) -> Option<SourceLocation> {
        None
    }
}

/// A function descriptor: module plus ordinal, with the frame kind it was declared for
#[derive(Debug, Clone)]
pub struct Function {
    module: Arc<dyn Module>,
    ordinal: u32,
    kind: FrameKind,
}

impl Function {
    pub fn new(module: Arc<dyn Module>, ordinal: u32, kind: FrameKind) -> Self {
        Self {
            module,
            ordinal,
            kind,
        }
    }

    pub fn module(&self) -> &Arc<dyn Module> {
        &self.module
    }

    pub fn module_id(&self) -> ModuleId {
        self.module.id()
    }

    pub fn ordinal(&self) -> u32 {
        self.ordinal
    }

    /// Kind of frame this function was declared to run in
    pub fn kind(&self) -> FrameKind {
        self.kind
    }

    /// Function name, if known
    pub fn name(&self) -> Option<&str> {
        self.module.function_name(self.ordinal)
    }

    /// Source location for `pc`, if the module can resolve it
    pub fn source_location(&self, pc: u64) -> Option<SourceLocation> {
        self.module.source_location(self.ordinal, pc)
    }
}

impl PartialEq for Function {
    fn eq(&self, other: &Self) -> bool {
        self.module_id() == other.module_id()
            && self.ordinal == other.ordinal
            && self.kind == other.kind
    }
}

impl Eq for Function {}

/// `module.function`, or `module.#ordinal` for unnamed functions
impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{}.{}", self.module.name(), name),
            None => write!(f, "{}.#{}", self.module.name(), self.ordinal),
        }
    }
}

/// Opaque per-module execution state handed out by a state resolver
///
/// Cloning shares the same state.
#[derive(Clone)]
pub struct ModuleState(Arc<dyn Any + Send + Sync>);

impl ModuleState {
    pub fn new<T: Any + Send + Sync>(state: T) -> Self {
        Self(Arc::new(state))
    }

    /// Borrow the state as `T`, if that is its concrete type
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }

    /// Whether both handles refer to the same state instance
    pub fn ptr_eq(&self, other: &ModuleState) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for ModuleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ModuleState({:p})", Arc::as_ptr(&self.0))
    }
}
