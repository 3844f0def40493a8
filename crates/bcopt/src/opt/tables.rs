use super::Function;
use crate::code::OperandKind;
use crate::{Error, Result};

/// One operand table being rebuilt in first-use order.
struct Compactor<'a, T> {
    source: &'a [T],
    table: Vec<T>,
    remap: Vec<Option<u32>>,
    deduplicate: bool,
}

impl<'a, T: Clone + PartialEq> Compactor<'a, T> {
    fn new(source: &'a [T], deduplicate: bool) -> Self {
        Self {
            source,
            table: Vec::with_capacity(source.len()),
            remap: vec![None; source.len()],
            deduplicate,
        }
    }

    /// Keep the first `count` entries at their current indices.
    fn seed(&mut self, count: usize) {
        for index in 0..count.min(self.source.len()) {
            self.table.push(self.source[index].clone());
            self.remap[index] = u32::try_from(index).ok();
        }
    }

    fn intern(&mut self, index: u32) -> Option<u32> {
        let slot = index as usize;
        let value = self.source.get(slot)?;
        if let Some(new) = self.remap[slot] {
            return Some(new);
        }
        let existing = if self.deduplicate {
            self.table.iter().position(|v| v == value)
        } else {
            None
        };
        let new = existing.unwrap_or_else(|| {
            self.table.push(value.clone());
            self.table.len() - 1
        });
        let new = u32::try_from(new).ok()?;
        self.remap[slot] = Some(new);
        Some(new)
    }
}

/// Rebuild names, locals and constants so they hold only what the
/// instructions reference, and rewrite every operand to the new indices.
///
/// Parameter slots always survive, and so does the docstring slot of a
/// function's constant table. Cell and free variable tables are left alone.
pub fn compact(function: &mut Function) -> Result<()> {
    let body = &function.body;
    let mut names = Compactor::new(&body.names, true);
    let mut locals = Compactor::new(&body.locals, false);
    let mut constants = Compactor::new(&body.constants, true);
    locals.seed(body.parameter_count());
    if body.is_function() {
        constants.seed(1);
    }

    for (position, instr) in function.instructions.iter_mut().enumerate() {
        let remapped = match instr.operand_kind() {
            OperandKind::NameRef => names.intern(instr.operand),
            OperandKind::LocalSlot => locals.intern(instr.operand),
            OperandKind::ConstRef => constants.intern(instr.operand),
            _ => continue,
        };
        instr.operand = remapped.ok_or(Error::OperandOutOfRange {
            position,
            opcode: instr.opcode.name(),
            operand: instr.operand,
        })?;
    }

    tracing::trace!(
        "Compacted tables of {}: names {} -> {}, locals {} -> {}, constants {} -> {}",
        body.name(),
        body.names.len(),
        names.table.len(),
        body.locals.len(),
        locals.table.len(),
        body.constants.len(),
        constants.table.len()
    );
    let (names, locals, constants) = (names.table, locals.table, constants.table);
    function.body.names = names;
    function.body.locals = locals;
    function.body.constants = constants;
    Ok(())
}
