// Jump target resolution and the fixup that rewrites every jump operand to
// point at list positions once all structural edits are done.

use crate::code::{INSTRUCTION_WIDTH, Instruction, OperandKind};
use crate::{Error, Result};

/// Position of the first instruction whose offset is at least `raw`.
///
/// Offsets are non-decreasing, so a target whose instruction was deleted
/// resolves to the next survivor.
pub fn resolve(instructions: &[Instruction], raw: u32) -> Option<usize> {
    let position = instructions.partition_point(|instr| instr.offset < raw);
    (position < instructions.len()).then_some(position)
}

/// Resolved target position of the jump at `position`, if it is a jump.
pub fn target_of(instructions: &[Instruction], position: usize) -> Option<usize> {
    resolve(instructions, instructions[position].raw_target()?)
}

/// `mask[p]` is set when some jump lands on position `p`.
pub fn jump_targets(instructions: &[Instruction]) -> Vec<bool> {
    let mut mask = vec![false; instructions.len()];
    for position in 0..instructions.len() {
        if let Some(target) = target_of(instructions, position) {
            mask[target] = true;
        }
    }
    mask
}

/// Rewrite every jump operand in canonical form and re-tag offsets with the
/// positions' byte offsets.
///
/// Targets are resolved against the current offsets before anything is
/// rewritten. Absolute jumps encode `position * 2`; relative jumps encode
/// the distance from the following position.
pub fn fixup(instructions: &mut [Instruction]) -> Result<()> {
    let mut resolved = Vec::with_capacity(instructions.len());
    for (position, instr) in instructions.iter().enumerate() {
        let Some(raw) = instr.raw_target() else {
            resolved.push(None);
            continue;
        };
        let target = resolve(instructions, raw)
            .ok_or(Error::UnresolvedJumpTarget { position, target: raw })?;
        resolved.push(Some(target));
    }

    for (position, target) in resolved.into_iter().enumerate() {
        let Some(target) = target else { continue };
        let instr = &mut instructions[position];
        let units = match instr.operand_kind() {
            OperandKind::AbsoluteJump => target,
            _ => target
                .checked_sub(position + 1)
                .ok_or(Error::UnresolvedJumpTarget {
                    position,
                    target: byte_offset(target),
                })?,
        };
        instr.operand = byte_offset(units);
    }

    // Canonical operands measure from the next position, not from the end
    // of any prefixes the jump was decoded with.
    for (position, instr) in instructions.iter_mut().enumerate() {
        instr.offset = byte_offset(position);
        instr.prefixes = 0;
    }
    Ok(())
}

pub fn byte_offset(position: usize) -> u32 {
    u32::try_from(position)
        .unwrap_or(u32::MAX / INSTRUCTION_WIDTH)
        .saturating_mul(INSTRUCTION_WIDTH)
}
