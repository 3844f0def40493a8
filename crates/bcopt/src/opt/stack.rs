use super::jumps;
use crate::code::{Instruction, Opcode};

/// Depths beyond this are treated as runaway growth in malformed loops and
/// not propagated further.
const DEPTH_LIMIT: i64 = 1 << 20;

/// Running operand-stack depth with its high-water mark.
#[derive(Debug, Default)]
pub struct StackMachine {
    depth: i64,
    max_depth: i64,
}

impl StackMachine {
    pub const fn new() -> Self {
        Self {
            depth: 0,
            max_depth: 0,
        }
    }

    pub fn apply(&mut self, effect: i32) {
        self.depth += i64::from(effect);
        if self.depth > self.max_depth {
            self.max_depth = self.depth;
        }
    }

    #[must_use]
    pub const fn depth(&self) -> i64 {
        self.depth
    }

    #[must_use]
    pub const fn max_depth(&self) -> i64 {
        self.max_depth
    }
}

/// Sum of stack effects in list order, unknown effects counted as `1`.
pub fn linear_max_depth(instructions: &[Instruction]) -> i64 {
    let mut stack = StackMachine::new();
    for instr in instructions {
        stack.apply(instr.stack_effect_or_default());
    }
    stack.max_depth()
}

/// Stack depth on entry to every position reachable from the function
/// entry, following both edges of every branch.
///
/// Where paths merge the deeper one wins, so each value is an upper bound
/// on the depth any execution can have there.
pub fn entry_depths(instructions: &[Instruction]) -> Vec<Option<i64>> {
    let mut depths: Vec<Option<i64>> = vec![None; instructions.len()];
    if instructions.is_empty() {
        return depths;
    }
    depths[0] = Some(0);
    let mut worklist = vec![0usize];

    while let Some(position) = worklist.pop() {
        let Some(depth) = depths[position] else {
            continue;
        };
        for (successor, effect) in successors(instructions, position) {
            let next = depth + i64::from(effect.unwrap_or(1));
            if next > DEPTH_LIMIT {
                continue;
            }
            if depths[successor].is_none_or(|known| next > known) {
                depths[successor] = Some(next);
                worklist.push(successor);
            }
        }
    }
    depths
}

/// Control-flow successors of `position` with the stack effect along each
/// edge.
fn successors(instructions: &[Instruction], position: usize) -> Vec<(usize, Option<i32>)> {
    let instr = &instructions[position];
    let opcode = instr.opcode;
    let mut edges = Vec::with_capacity(2);
    let next = position + 1;

    if opcode.is_jump() {
        if let Some(target) = jumps::target_of(instructions, position) {
            edges.push((target, opcode.stack_effect(instr.operand, Some(true))));
        }
        if !opcode.is_unconditional_jump() && next < instructions.len() {
            edges.push((next, opcode.stack_effect(instr.operand, Some(false))));
        }
    } else if !matches!(
        opcode,
        Opcode::ReturnValue | Opcode::RaiseVarargs | Opcode::BreakLoop
    ) && next < instructions.len()
    {
        edges.push((next, Some(instr.stack_effect_or_default())));
    }
    edges
}

/// Declared stack size: the larger of the linear running maximum and the
/// deepest point of the flow-sensitive analysis.
pub fn stack_size(instructions: &[Instruction]) -> u32 {
    let linear = linear_max_depth(instructions);
    let mut flow = 0;
    let depths = entry_depths(instructions);
    for (instr, depth) in instructions.iter().zip(&depths) {
        let Some(depth) = depth else { continue };
        // Depth after the instruction, on its deepest edge.
        let after = depth + i64::from(instr.stack_effect_or_default());
        flow = flow.max(*depth).max(after);
    }
    u32::try_from(linear.max(flow).max(0)).unwrap_or(u32::MAX)
}
