// Store/load elision, constant folding and dead-branch pruning.
//
// Runs before jump fixup: instructions still carry the offsets they were
// decoded with, and every rewrite keeps offsets non-decreasing so jumps into
// deleted code resolve to the next survivor.

use super::jumps::{self, jump_targets};
use super::{Function, fold, variable};
use crate::code::{Instruction, Opcode, Scope};

/// Apply all rewrites until none matches. Returns the number applied.
pub fn run(function: &mut Function) -> usize {
    let mut rewrites = 0;
    while elide_store_load(function) || fold_constants(function) || prune_branch(function) {
        rewrites += 1;
    }
    rewrites
}

/// `STORE_FAST s; LOAD_FAST s` where `s` is never touched again.
fn elide_store_load(function: &mut Function) -> bool {
    let instrs = &function.instructions;
    let targets = jump_targets(instrs);

    for i in 0..instrs.len().saturating_sub(1) {
        let (store, load) = (&instrs[i], &instrs[i + 1]);
        if store.opcode != Opcode::StoreFast
            || load.opcode != Opcode::LoadFast
            || store.operand != load.operand
            || targets[i + 1]
        {
            continue;
        }
        let slot = store.operand;
        let touches = |instr: &Instruction| {
            matches!(variable(instr), Some((Scope::Fast, _, s)) if s == slot)
        };
        if instrs[i + 2..].iter().any(touches) {
            continue;
        }
        // With an earlier access, a jump back over the store would make that
        // access observe the stored value on the next pass.
        if instrs[..i].iter().any(touches) && loops_back_over(instrs, i) {
            continue;
        }

        tracing::trace!("Eliding store/load of slot {slot} at position {i}");
        function.instructions.drain(i..i + 2);
        return true;
    }
    false
}

/// Whether a jump located after `position` lands at or before it.
fn loops_back_over(instrs: &[Instruction], position: usize) -> bool {
    (position + 1..instrs.len())
        .any(|p| jumps::target_of(instrs, p).is_some_and(|target| target <= position))
}

/// `LOAD_CONST a; LOAD_CONST b; <binary op or compare>` becomes
/// `LOAD_CONST (a op b)`.
fn fold_constants(function: &mut Function) -> bool {
    let targets = jump_targets(&function.instructions);

    for i in 0..function.instructions.len().saturating_sub(2) {
        let op = function.instructions[i + 2];
        if targets[i + 1] || targets[i + 2] {
            continue;
        }
        let (Some(lhs), Some(rhs)) = (
            function.constant(&function.instructions[i]),
            function.constant(&function.instructions[i + 1]),
        ) else {
            continue;
        };
        let folded = if op.opcode == Opcode::CompareOp {
            fold::compare(op.operand, lhs, rhs)
        } else if let Some(operator) = op.opcode.binary_operator() {
            fold::binary(operator, lhs, rhs)
        } else {
            continue;
        };
        let value = match folded {
            Ok(value) => value,
            Err(err) => {
                tracing::trace!("Not folding {} at position {i}: {err}", op.opcode);
                continue;
            }
        };

        tracing::trace!("Folded {} at position {i} to {value}", op.opcode);
        let offset = function.instructions[i].offset;
        let index = function.constant_index(value);
        function.instructions[i] = Instruction::new(Opcode::LoadConst, index).at(offset);
        function.instructions.drain(i + 1..i + 3);
        return true;
    }
    false
}

/// `LOAD_CONST c; POP_JUMP_IF_{TRUE,FALSE}` where `c` decides the branch.
fn prune_branch(function: &mut Function) -> bool {
    let instrs = &function.instructions;
    let targets = jump_targets(instrs);

    for i in 0..instrs.len().saturating_sub(1) {
        let jump = instrs[i + 1];
        let jump_if = match jump.opcode {
            Opcode::PopJumpIfTrue => true,
            Opcode::PopJumpIfFalse => false,
            _ => continue,
        };
        if targets[i + 1] {
            continue;
        }
        let Some(condition) = function.constant(&instrs[i]) else {
            continue;
        };

        if condition.is_truthy() != jump_if {
            tracing::trace!("Pruning never-taken branch at position {i}");
            function.instructions.drain(i..i + 2);
            return true;
        }

        let (Some(raw), Some(target)) = (jump.raw_target(), jumps::target_of(instrs, i + 1))
        else {
            continue;
        };
        if can_delete_range(instrs, i, target) {
            tracing::trace!("Pruning always-taken branch at position {i} up to {target}");
            function.instructions.drain(i..target);
        } else {
            tracing::trace!("Always-taken branch at position {i} becomes a jump");
            let offset = instrs[i].offset;
            function.instructions[i] = Instruction::new(Opcode::JumpAbsolute, raw).at(offset);
            function.instructions.remove(i + 1);
        }
        return true;
    }
    false
}

/// Whether `start..end` can be deleted outright: it lies strictly before
/// `end`, holds no block-stack instruction, and no jump from outside lands
/// inside it past `start`.
fn can_delete_range(instrs: &[Instruction], start: usize, end: usize) -> bool {
    if end <= start + 1 {
        return false;
    }
    if instrs[start..end].iter().any(|i| i.opcode.uses_block_stack()) {
        return false;
    }
    !(0..instrs.len())
        .filter(|p| !(start..end).contains(p))
        .any(|p| jumps::target_of(instrs, p).is_some_and(|t| t > start && t < end))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code::{CO_OPTIMIZED, FunctionBody, Value};

    fn function(constants: Vec<Value>, code: &[(Opcode, u32)]) -> Function {
        let mut body = FunctionBody::new("f");
        body.flags = CO_OPTIMIZED;
        body.arg_count = 1;
        body.locals = vec!["n".into(), "x".into()];
        body.constants = constants;
        let instructions = code
            .iter()
            .enumerate()
            .map(|(i, &(op, arg))| Instruction::new(op, arg).at(2 * i as u32))
            .collect();
        Function {
            instructions,
            body,
        }
    }

    fn ops(function: &Function) -> Vec<(Opcode, u32)> {
        function
            .instructions
            .iter()
            .map(|i| (i.opcode, i.operand))
            .collect()
    }

    #[test]
    fn store_then_load_of_dead_slot_is_elided() {
        // x = g(); return x
        let mut f = function(
            vec![Value::None],
            &[
                (Opcode::LoadGlobal, 0),
                (Opcode::CallFunction, 0),
                (Opcode::StoreFast, 1),
                (Opcode::LoadFast, 1),
                (Opcode::ReturnValue, 0),
            ],
        );
        assert_eq!(run(&mut f), 1);
        assert_eq!(
            ops(&f),
            vec![
                (Opcode::LoadGlobal, 0),
                (Opcode::CallFunction, 0),
                (Opcode::ReturnValue, 0),
            ]
        );
    }

    #[test]
    fn store_load_kept_when_slot_read_later() {
        let code = [
            (Opcode::StoreFast, 1),
            (Opcode::LoadFast, 1),
            (Opcode::LoadFast, 1),
            (Opcode::BinaryAdd, 0),
            (Opcode::ReturnValue, 0),
        ];
        let mut f = function(vec![Value::None], &code);
        assert_eq!(run(&mut f), 0);
    }

    #[test]
    fn store_load_kept_inside_loop_with_earlier_read() {
        // 0 LOAD_FAST x; 2 POP_TOP; 4 LOAD_FAST n; 6 STORE_FAST x;
        // 8 LOAD_FAST x; 10 POP_JUMP_IF_TRUE 0; 12 LOAD_CONST; 14 RETURN_VALUE
        let code = [
            (Opcode::LoadFast, 1),
            (Opcode::PopTop, 0),
            (Opcode::LoadFast, 0),
            (Opcode::StoreFast, 1),
            (Opcode::LoadFast, 1),
            (Opcode::PopJumpIfTrue, 0),
            (Opcode::LoadConst, 0),
            (Opcode::ReturnValue, 0),
        ];
        let mut f = function(vec![Value::None], &code);
        assert_eq!(run(&mut f), 0);
    }

    #[test]
    fn folds_arithmetic_and_appends_constant() {
        let mut f = function(
            vec![Value::Int(10), Value::Int(20)],
            &[
                (Opcode::LoadConst, 0),
                (Opcode::LoadConst, 1),
                (Opcode::BinaryAdd, 0),
                (Opcode::ReturnValue, 0),
            ],
        );
        assert_eq!(run(&mut f), 1);
        assert_eq!(ops(&f), vec![(Opcode::LoadConst, 2), (Opcode::ReturnValue, 0)]);
        assert_eq!(f.body.constants[2], Value::Int(30));
        assert_eq!(f.instructions[0].offset, 0);
    }

    #[test]
    fn fold_reuses_existing_constant() {
        let mut f = function(
            vec![Value::Int(2), Value::Int(3), Value::Int(6)],
            &[
                (Opcode::LoadConst, 0),
                (Opcode::LoadConst, 1),
                (Opcode::BinaryMultiply, 0),
                (Opcode::ReturnValue, 0),
            ],
        );
        run(&mut f);
        assert_eq!(ops(&f), vec![(Opcode::LoadConst, 2), (Opcode::ReturnValue, 0)]);
        assert_eq!(f.body.constants.len(), 3);
    }

    #[test]
    fn failing_fold_is_skipped() {
        let code = [
            (Opcode::LoadConst, 0),
            (Opcode::LoadConst, 1),
            (Opcode::BinaryTrueDivide, 0),
            (Opcode::ReturnValue, 0),
        ];
        let mut f = function(vec![Value::Int(1), Value::Int(0)], &code);
        assert_eq!(run(&mut f), 0);
        assert_eq!(ops(&f), code.to_vec());
    }

    #[test]
    fn constant_comparison_prunes_to_taken_side() {
        // if 3 < 5: return 'a'
        // return 'b'
        let mut f = function(
            vec![Value::Int(3), Value::Int(5), "a".into(), "b".into()],
            &[
                (Opcode::LoadConst, 0),
                (Opcode::LoadConst, 1),
                (Opcode::CompareOp, 0),
                (Opcode::PopJumpIfFalse, 14),
                (Opcode::LoadConst, 2),
                (Opcode::ReturnValue, 0),
                (Opcode::Nop, 0),
                (Opcode::LoadConst, 3),
                (Opcode::ReturnValue, 0),
            ],
        );
        assert_eq!(run(&mut f), 2);
        assert_eq!(
            ops(&f)[..2],
            [(Opcode::LoadConst, 2), (Opcode::ReturnValue, 0)]
        );
    }

    #[test]
    fn always_taken_branch_deletes_skipped_code() {
        // 0 LOAD_CONST 0; 2 POP_JUMP_IF_FALSE 8; 4 LOAD_CONST 1; 6 RETURN_VALUE;
        // 8 LOAD_CONST 2; 10 RETURN_VALUE
        let mut f = function(
            vec![Value::Int(0), "a".into(), "b".into()],
            &[
                (Opcode::LoadConst, 0),
                (Opcode::PopJumpIfFalse, 8),
                (Opcode::LoadConst, 1),
                (Opcode::ReturnValue, 0),
                (Opcode::LoadConst, 2),
                (Opcode::ReturnValue, 0),
            ],
        );
        assert_eq!(run(&mut f), 1);
        assert_eq!(ops(&f), vec![(Opcode::LoadConst, 2), (Opcode::ReturnValue, 0)]);
        assert_eq!(f.instructions[0].offset, 8);
    }

    #[test]
    fn backward_branch_becomes_plain_jump() {
        // 0 LOAD_FAST n; 2 POP_TOP; 4 LOAD_CONST True; 6 POP_JUMP_IF_TRUE 0;
        // 8 LOAD_CONST None; 10 RETURN_VALUE
        let mut f = function(
            vec![Value::Bool(true), Value::None],
            &[
                (Opcode::LoadFast, 0),
                (Opcode::PopTop, 0),
                (Opcode::LoadConst, 0),
                (Opcode::PopJumpIfTrue, 0),
                (Opcode::LoadConst, 1),
                (Opcode::ReturnValue, 0),
            ],
        );
        assert_eq!(run(&mut f), 1);
        assert_eq!(f.instructions[2].opcode, Opcode::JumpAbsolute);
        assert_eq!(f.instructions[2].operand, 0);
        assert_eq!(f.instructions[2].offset, 4);
        assert_eq!(f.instructions.len(), 5);
    }

    #[test]
    fn branch_into_pruned_range_becomes_plain_jump() {
        // 0 LOAD_FAST n; 2 POP_JUMP_IF_TRUE 10; 4 LOAD_CONST 1;
        // 6 POP_JUMP_IF_TRUE 14; 8 NOP; 10 NOP; 12 NOP; 14 LOAD_CONST 0;
        // 16 RETURN_VALUE
        let mut f = function(
            vec![Value::None, Value::Int(1)],
            &[
                (Opcode::LoadFast, 0),
                (Opcode::PopJumpIfTrue, 10),
                (Opcode::LoadConst, 1),
                (Opcode::PopJumpIfTrue, 14),
                (Opcode::Nop, 0),
                (Opcode::Nop, 0),
                (Opcode::Nop, 0),
                (Opcode::LoadConst, 0),
                (Opcode::ReturnValue, 0),
            ],
        );
        assert_eq!(run(&mut f), 1);
        assert_eq!(f.instructions[2].opcode, Opcode::JumpAbsolute);
        assert_eq!(f.instructions[2].operand, 14);
        assert_eq!(f.instructions.len(), 8);
    }
}
