use super::Function;
use super::jumps::target_of;
use crate::code::{Instruction, Opcode};

/// Drop everything after the first `RETURN_VALUE` that no earlier jump
/// reaches past. Block setups count as jumps, so handlers stay alive.
///
/// Returns the number of instructions removed.
pub fn run(function: &mut Function) -> usize {
    let Some(last) = last_reachable_return(&function.instructions) else {
        return 0;
    };
    let removed = function.instructions.len() - last - 1;
    if removed > 0 {
        tracing::trace!("Trimming {removed} unreachable instructions after position {last}");
    }
    function.instructions.truncate(last + 1);
    removed
}

fn last_reachable_return(instrs: &[Instruction]) -> Option<usize> {
    let mut furthest: Option<usize> = None;
    for (position, instr) in instrs.iter().enumerate() {
        if instr.opcode == Opcode::ReturnValue && furthest.is_none_or(|t| t <= position) {
            return Some(position);
        }
        if instr.opcode.is_jump() {
            // An unresolvable target may land anywhere.
            let target = target_of(instrs, position).unwrap_or(usize::MAX);
            furthest = Some(furthest.map_or(target, |t| t.max(target)));
        }
    }
    None
}
