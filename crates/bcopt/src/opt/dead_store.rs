// Dead-store elimination and single-use inlining.
//
// Three rewrites run to a fixed point, one rewrite per scan:
// - `load X; STORE_FAST S` where S is read exactly once further down the
//   same straight-line region: the read becomes `load X` and the pair goes.
// - A store whose next access is another store, or a return, becomes
//   `POP_TOP`.
// - A push that can neither fail nor run code, followed by `POP_TOP`, is
//   deleted as a pair.

use super::jumps::jump_targets;
use super::{Function, variable};
use crate::code::{Access, Instruction, Opcode, Scope};

/// Apply all rewrites until none matches. Returns the number applied.
pub fn run(function: &mut Function) -> usize {
    let mut rewrites = 0;
    while inline_single_use(function)
        || remove_dead_store(function)
        || collapse_push_pop(function)
    {
        rewrites += 1;
    }
    rewrites
}

fn inline_single_use(function: &mut Function) -> bool {
    let instrs = &function.instructions;
    let targets = jump_targets(instrs);

    for i in 0..instrs.len().saturating_sub(1) {
        let (load, store) = (instrs[i], instrs[i + 1]);
        if store.opcode != Opcode::StoreFast
            || !matches!(
                load.opcode,
                Opcode::LoadConst | Opcode::LoadFast | Opcode::LoadName | Opcode::LoadGlobal
            )
        {
            continue;
        }
        let slot = store.operand;
        if load.opcode == Opcode::LoadFast && load.operand == slot {
            continue;
        }

        let mut reads = instrs
            .iter()
            .enumerate()
            .filter(|(_, instr)| instr.opcode == Opcode::LoadFast && instr.operand == slot)
            .map(|(position, _)| position);
        let (Some(use_at), None) = (reads.next(), reads.next()) else {
            continue;
        };
        if use_at <= i + 1 || function.slot_ever_deleted(slot) {
            continue;
        }

        let between = i + 2..use_at;
        if (i + 1..=use_at).any(|p| targets[p])
            || between.clone().any(|p| instrs[p].opcode.is_jump())
            || between.clone().any(|p| writes_local(&instrs[p], slot))
        {
            continue;
        }
        if load.opcode == Opcode::LoadFast
            && between.clone().any(|p| writes_local(&instrs[p], load.operand))
        {
            continue;
        }
        // A load that can fail must still fail before anything else can.
        let infallible = load.opcode == Opcode::LoadConst || function.is_parameter_load(&load);
        if !infallible && !between.clone().all(|p| is_quiet(function, &instrs[p])) {
            continue;
        }

        tracing::trace!(
            "Inlining {} into read of slot {slot} at position {use_at}",
            load.opcode
        );
        let offset = instrs[use_at].offset;
        function.instructions[use_at] = Instruction::new(load.opcode, load.operand).at(offset);
        function.instructions.drain(i..i + 2);
        return true;
    }
    false
}

fn remove_dead_store(function: &mut Function) -> bool {
    let instrs = &function.instructions;
    if instrs.iter().any(|i| i.opcode.uses_block_stack()) {
        return false;
    }
    let targets = jump_targets(instrs);

    for p in 0..instrs.len() {
        let Some((scope, Access::Store, operand)) = variable(&instrs[p]) else {
            continue;
        };
        let candidate = match scope {
            Scope::Fast => true,
            Scope::Name => function
                .body
                .names
                .get(operand as usize)
                .is_some_and(|name| function.body.locals.contains(name)),
            Scope::Global | Scope::Deref => false,
        };
        if candidate && is_dead_store(instrs, &targets, p, scope, operand) {
            tracing::trace!("Dead {} at position {p}", instrs[p].opcode);
            let offset = instrs[p].offset;
            function.instructions[p] = Instruction::new(Opcode::PopTop, 0).at(offset);
            return true;
        }
    }
    false
}

/// Follow straight-line code from the store at `position` to its next
/// access. Anything that can transfer control elsewhere keeps it live.
fn is_dead_store(
    instrs: &[Instruction],
    targets: &[bool],
    position: usize,
    scope: Scope,
    operand: u32,
) -> bool {
    for q in position + 1..instrs.len() {
        if targets[q] {
            return false;
        }
        let instr = &instrs[q];
        if let Some((s, access, o)) = variable(instr)
            && s == scope
            && o == operand
        {
            return access == Access::Store;
        }
        if instr.opcode.is_jump() {
            return false;
        }
        if matches!(instr.opcode, Opcode::ReturnValue | Opcode::RaiseVarargs) {
            return true;
        }
    }
    true
}

fn collapse_push_pop(function: &mut Function) -> bool {
    let instrs = &function.instructions;
    let targets = jump_targets(instrs);
    for i in 0..instrs.len().saturating_sub(1) {
        if instrs[i + 1].opcode == Opcode::PopTop
            && !targets[i + 1]
            && is_pure_push(function, &instrs[i])
        {
            tracing::trace!("Collapsing {} + POP_TOP at position {i}", instrs[i].opcode);
            function.instructions.drain(i..i + 2);
            return true;
        }
    }
    false
}

fn is_pure_push(function: &Function, instr: &Instruction) -> bool {
    matches!(
        instr.opcode,
        Opcode::LoadConst | Opcode::DupTop | Opcode::LoadClosure
    ) || function.is_parameter_load(instr)
}

/// Instructions that can neither raise nor run user code.
fn is_quiet(function: &Function, instr: &Instruction) -> bool {
    matches!(
        instr.opcode,
        Opcode::LoadConst
            | Opcode::StoreFast
            | Opcode::PopTop
            | Opcode::RotTwo
            | Opcode::RotThree
            | Opcode::DupTop
            | Opcode::DupTopTwo
            | Opcode::Nop
            | Opcode::BuildTuple
    ) || function.is_parameter_load(instr)
}

fn writes_local(instr: &Instruction, slot: u32) -> bool {
    matches!(instr.opcode, Opcode::StoreFast | Opcode::DeleteFast) && instr.operand == slot
}
