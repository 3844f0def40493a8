use std::collections::BTreeSet;
use std::fmt;

use super::{CompareKind, FunctionBody, Instruction, Opcode, OperandKind};
use crate::Result;

/// Human-readable listing of a function body.
///
/// Jump targets are marked with `>>`; operands are annotated with the table
/// entry they refer to.
pub struct Disassembly<'a> {
    body: &'a FunctionBody,
    instructions: Vec<Instruction>,
    recursive: bool,
}

impl<'a> Disassembly<'a> {
    pub fn new(body: &'a FunctionBody) -> Result<Self> {
        Ok(Self {
            body,
            instructions: body.instructions()?,
            recursive: false,
        })
    }

    /// List an instruction sequence that has not been encoded yet.
    #[must_use]
    pub const fn of(body: &'a FunctionBody, instructions: Vec<Instruction>) -> Self {
        Self {
            body,
            instructions,
            recursive: false,
        }
    }

    /// Also list nested function bodies found in the constant table.
    #[must_use]
    pub const fn recursive(mut self, recursive: bool) -> Self {
        self.recursive = recursive;
        self
    }

    fn annotation(&self, instr: &Instruction) -> Option<String> {
        let body = self.body;
        let index = instr.operand as usize;
        let lookup = |entry: Option<&String>| entry.map_or_else(|| "?".to_owned(), Clone::clone);
        match instr.operand_kind() {
            OperandKind::NameRef => Some(lookup(body.names.get(index))),
            OperandKind::LocalSlot => Some(lookup(body.locals.get(index))),
            OperandKind::ConstRef => Some(
                body.constants
                    .get(index)
                    .map_or_else(|| "?".to_owned(), ToString::to_string),
            ),
            OperandKind::FreeRef => Some(body.deref_name(instr.operand).unwrap_or("?").to_owned()),
            OperandKind::RelativeJump => instr.raw_target().map(|t| format!("to {t}")),
            OperandKind::Immediate if instr.opcode == Opcode::CompareOp => Some(
                CompareKind::from_operand(instr.operand)
                    .map_or("?", CompareKind::symbol)
                    .to_owned(),
            ),
            _ => None,
        }
    }
}

impl fmt::Display for Disassembly<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let targets: BTreeSet<u32> = self
            .instructions
            .iter()
            .filter_map(Instruction::raw_target)
            .collect();

        writeln!(
            f,
            "Disassembly of {} ({} args, stack {}):",
            self.body.name(),
            self.body.arg_count,
            self.body.stack_size
        )?;
        for instr in &self.instructions {
            let marker = if targets.contains(&instr.offset) {
                ">>"
            } else {
                "  "
            };
            write!(f, "  {marker} {:>5} {:<22}", instr.offset, instr.opcode.name())?;
            if instr.opcode.has_argument() {
                write!(f, " {:>4}", instr.operand)?;
            }
            if let Some(note) = self.annotation(instr) {
                write!(f, " ({note})")?;
            }
            writeln!(f)?;
        }

        if self.recursive {
            for (_, nested) in self.body.nested() {
                writeln!(f)?;
                match Disassembly::new(nested) {
                    Ok(listing) => write!(f, "{}", listing.recursive(true))?,
                    Err(err) => writeln!(f, "Disassembly of {} failed: {err}", nested.name())?,
                }
            }
        }
        Ok(())
    }
}
