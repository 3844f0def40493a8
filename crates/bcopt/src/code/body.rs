use serde::{Deserialize, Serialize};

use super::{Instruction, Value, decode};
use crate::Result;

pub const CO_OPTIMIZED: u32 = 0x0001;
pub const CO_NEWLOCALS: u32 = 0x0002;
pub const CO_VARARGS: u32 = 0x0004;
pub const CO_VARKEYWORDS: u32 = 0x0008;
pub const CO_NESTED: u32 = 0x0010;
pub const CO_GENERATOR: u32 = 0x0020;
pub const CO_NOFREE: u32 = 0x0040;
pub const CO_COROUTINE: u32 = 0x0080;
pub const CO_ITERABLE_COROUTINE: u32 = 0x0100;
pub const CO_ASYNC_GENERATOR: u32 = 0x0200;

const MARKER: &str = "<optimized> ";

/// Metadata carried through the optimizer untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceMeta {
    pub filename: String,
    pub name: String,
    #[serde(default)]
    pub first_line: u32,
    #[serde(default)]
    pub line_table: Vec<u8>,
}

/// A compiled function (or module) body: encoded instructions plus the
/// tables its operands index into.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionBody {
    pub arg_count: u32,
    #[serde(default)]
    pub kw_only_arg_count: u32,
    #[serde(default)]
    pub flags: u32,
    pub code: Vec<u8>,
    #[serde(default)]
    pub names: Vec<String>,
    #[serde(default)]
    pub locals: Vec<String>,
    #[serde(default)]
    pub constants: Vec<Value>,
    #[serde(default)]
    pub free_vars: Vec<String>,
    #[serde(default)]
    pub cell_vars: Vec<String>,
    #[serde(default)]
    pub stack_size: u32,
    pub source: SourceMeta,
}

impl FunctionBody {
    /// Empty body with the given declared name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            arg_count: 0,
            kw_only_arg_count: 0,
            flags: 0,
            code: Vec::new(),
            names: Vec::new(),
            locals: Vec::new(),
            constants: Vec::new(),
            free_vars: Vec::new(),
            cell_vars: Vec::new(),
            stack_size: 0,
            source: SourceMeta {
                name: name.into(),
                ..SourceMeta::default()
            },
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.source.name
    }

    pub fn instructions(&self) -> Result<Vec<Instruction>> {
        decode(&self.code)
    }

    /// Local slots that hold arguments on entry.
    #[must_use]
    pub fn parameter_count(&self) -> usize {
        let mut count = self.arg_count as usize + self.kw_only_arg_count as usize;
        if self.flags & CO_VARARGS != 0 {
            count += 1;
        }
        if self.flags & CO_VARKEYWORDS != 0 {
            count += 1;
        }
        count
    }

    #[must_use]
    pub const fn is_function(&self) -> bool {
        self.flags & CO_OPTIMIZED != 0
    }

    #[must_use]
    pub const fn is_generator_like(&self) -> bool {
        self.flags & (CO_GENERATOR | CO_COROUTINE | CO_ITERABLE_COROUTINE | CO_ASYNC_GENERATOR)
            != 0
    }

    /// Name of the cell or free variable a `FreeRef` operand indexes.
    #[must_use]
    pub fn deref_name(&self, index: u32) -> Option<&str> {
        let index = index as usize;
        self.cell_vars
            .get(index)
            .or_else(|| self.free_vars.get(index.checked_sub(self.cell_vars.len())?))
            .map(String::as_str)
    }

    /// Nested bodies in the constant table, with their indices.
    pub fn nested(&self) -> impl Iterator<Item = (usize, &FunctionBody)> {
        self.constants
            .iter()
            .enumerate()
            .filter_map(|(i, c)| c.as_code().map(|body| (i, body)))
    }
}

/// Mark a declared name as optimizer-produced.
///
/// `f` becomes `<optimized> f` and `<module>` becomes `<optimized module>`;
/// names already carrying the marker are returned unchanged.
#[must_use]
pub fn decorate_name(name: &str) -> String {
    if is_decorated(name) {
        return name.to_owned();
    }
    match name.strip_prefix('<') {
        Some(rest) => format!("<optimized {rest}"),
        None => format!("{MARKER}{name}"),
    }
}

/// Inverse of [`decorate_name`].
#[must_use]
pub fn undecorated_name(name: &str) -> String {
    if let Some(rest) = name.strip_prefix(MARKER) {
        return rest.to_owned();
    }
    match name.strip_prefix("<optimized ") {
        Some(rest) if rest.ends_with('>') => format!("<{rest}"),
        _ => name.to_owned(),
    }
}

fn is_decorated(name: &str) -> bool {
    name.starts_with(MARKER) || (name.starts_with("<optimized ") && name.ends_with('>'))
}
