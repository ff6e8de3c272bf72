//! Backtrace rendering
//!
//! Walks the frame chain from the topmost frame down to the base:
//!
//! ```text
//! [0] app.compute:12 compute.vm:3:5
//! [1] app.dispatch:0 [native]
//! [2] app.main:0 [external]
//! ```

use crate::error::StackError;
use crate::frame::Frame;
use crate::module::{FrameKind, SourceLocation};
use crate::stack::Stack;
use serde::Serialize;
use std::fmt::{self, Write};

/// One rendered frame
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BacktraceEntry {
    /// Position from the top; 0 is the innermost frame
    pub index: usize,
    pub depth: usize,
    pub kind: FrameKind,
    pub module: String,
    /// Function name, or `#<ordinal>` when the module has none
    pub function: String,
    pub pc: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<SourceLocation>,
}

impl BacktraceEntry {
    fn from_frame(index: usize, frame: &Frame<'_>) -> Self {
        let function = frame.function();
        let location = match frame.kind() {
            FrameKind::Bytecode => function.source_location(frame.pc()),
            FrameKind::External | FrameKind::Native => None,
        };
        Self {
            index,
            depth: frame.depth(),
            kind: frame.kind(),
            module: function.module().name().to_string(),
            function: function
                .name()
                .map(str::to_string)
                .unwrap_or_else(|| format!("#{}", function.ordinal())),
            pc: frame.pc(),
            location,
        }
    }
}

impl fmt::Display for BacktraceEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {}.{}:{} ",
            self.index, self.module, self.function, self.pc
        )?;
        match (&self.location, self.kind) {
            (Some(location), _) => write!(f, "{}", location),
            (None, FrameKind::External) => f.write_str("[external]"),
            (None, FrameKind::Native) => f.write_str("[native]"),
            (None, FrameKind::Bytecode) => f.write_str("[bytecode]"),
        }
    }
}

/// Snapshot of a stack's frames, innermost first
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Backtrace {
    pub frames: Vec<BacktraceEntry>,
}

impl Backtrace {
    pub fn capture(stack: &Stack<'_>) -> Self {
        Self {
            frames: stack
                .walk()
                .enumerate()
                .map(|(index, frame)| BacktraceEntry::from_frame(index, &frame))
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Write one line per frame, separated by newlines
    pub fn write_to<W: Write>(&self, out: &mut W) -> fmt::Result {
        for (i, entry) in self.frames.iter().enumerate() {
            if i > 0 {
                out.write_char('\n')?;
            }
            write!(out, "{}", entry)?;
        }
        Ok(())
    }

    /// Serialize for debugger clients
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

impl fmt::Display for Backtrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.write_to(f)
    }
}

impl Stack<'_> {
    /// Structured backtrace of the live frames
    pub fn backtrace(&self) -> Backtrace {
        Backtrace::capture(self)
    }

    /// Write the backtrace into `out`
    pub fn write_backtrace<W: Write>(&self, out: &mut W) -> fmt::Result {
        self.backtrace().write_to(out)
    }

    /// Backtrace text; empty for an empty stack
    pub fn format_backtrace(&self) -> String {
        let mut text = String::new();
        if self.write_backtrace(&mut text).is_err() {
            text.clear();
        }
        text
    }

    /// Attach the current backtrace to `error`.
    ///
    /// Best effort: the error comes back unchanged when the stack is empty,
    /// annotation is disabled, the error already carries a backtrace, or
    /// rendering fails. The error's kind never changes.
    #[cfg(feature = "backtrace")]
    pub fn annotate_backtrace(&self, error: StackError) -> StackError {
        if !self.flags().annotate_backtraces
            || self.is_empty()
            || matches!(error, StackError::Annotated { .. })
        {
            return error;
        }

        let mut text = String::new();
        match self.write_backtrace(&mut text) {
            Ok(()) => StackError::Annotated {
                source: Box::new(error),
                backtrace: text,
            },
            Err(_) => error,
        }
    }

    /// Backtraces are compiled out; returns `error` unchanged.
    #[cfg(not(feature = "backtrace"))]
    pub fn annotate_backtrace(&self, error: StackError) -> StackError {
        error
    }
}
