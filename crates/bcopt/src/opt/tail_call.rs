// Self tail calls become jumps back to the entry.
//
// `load self; <args>; CALL_FUNCTION n; RETURN_VALUE` is rewritten to
// `<args>; STORE_FAST n-1 .. STORE_FAST 0; JUMP_ABSOLUTE 0`. The function
// object load goes too, so the argument region must provably leave exactly
// the callee plus `n` values on an otherwise empty stack.

use super::jumps::jump_targets;
use super::{Function, finalize, stack, variable};
use crate::code::{
    Access, CO_VARARGS, CO_VARKEYWORDS, FunctionBody, Instruction, Opcode, Scope, Value,
    undecorated_name,
};
use crate::{Error, OptimizerConfig, Result};

/// Rewrite self tail calls to a fixed point. `LOAD_DEREF` self references
/// are only followed when `free_self_reference` is set, i.e. when the
/// enclosing body has shown that the binding is never rebound.
pub fn run(function: &mut Function, free_self_reference: bool) -> usize {
    if !is_eligible(&function.body, &function.instructions) {
        return 0;
    }
    let name = undecorated_name(function.body.name());
    let mut rewrites = 0;
    while rewrite_one(function, &name, free_self_reference) {
        rewrites += 1;
    }
    rewrites
}

/// Plain positional functions without block-stack use. Cell variables are
/// excluded because parameters living in cells are copied in only on entry.
fn is_eligible(body: &FunctionBody, instructions: &[Instruction]) -> bool {
    body.is_function()
        && body.kw_only_arg_count == 0
        && body.flags & (CO_VARARGS | CO_VARKEYWORDS) == 0
        && !body.is_generator_like()
        && body.cell_vars.is_empty()
        && body.locals.len() >= body.arg_count as usize
        && !instructions.iter().any(|i| i.opcode.uses_block_stack())
}

fn rewrite_one(function: &mut Function, name: &str, free_self_reference: bool) -> bool {
    let instrs = &function.instructions;
    let arg_count = function.body.arg_count;
    let targets = jump_targets(instrs);
    let depths = stack::entry_depths(instrs);

    for call_at in 1..instrs.len().saturating_sub(1) {
        let call = instrs[call_at];
        if call.opcode != Opcode::CallFunction
            || call.operand != arg_count
            || instrs[call_at + 1].opcode != Opcode::ReturnValue
            || targets[call_at]
            || targets[call_at + 1]
        {
            continue;
        }
        let Some(load_at) = (0..call_at).rev().find(|&l| {
            is_self_reference(&function.body, &instrs[l], name, free_self_reference)
                && depths[l] == Some(0)
                && arguments_match(instrs, &targets, l, call_at, arg_count)
        }) else {
            continue;
        };

        tracing::trace!(
            "Tail call to {name} at position {call_at} (callee loaded at {load_at})"
        );
        let call_offset = call.offset;
        let return_offset = instrs[call_at + 1].offset;
        let mut replacement: Vec<Instruction> = (0..arg_count)
            .rev()
            .map(|slot| Instruction::new(Opcode::StoreFast, slot).at(call_offset))
            .collect();
        replacement.push(Instruction::new(Opcode::JumpAbsolute, 0).at(return_offset));
        function
            .instructions
            .splice(call_at..call_at + 2, replacement);
        function.instructions.remove(load_at);
        return true;
    }
    false
}

fn is_self_reference(
    body: &FunctionBody,
    instr: &Instruction,
    name: &str,
    free_self_reference: bool,
) -> bool {
    match instr.opcode {
        Opcode::LoadGlobal => body
            .names
            .get(instr.operand as usize)
            .is_some_and(|n| n == name),
        Opcode::LoadDeref => {
            free_self_reference
                && instr.operand as usize >= body.cell_vars.len()
                && body.deref_name(instr.operand) == Some(name)
        }
        _ => false,
    }
}

/// Simulate `load_at + 1 .. call_at` on top of the callee: nothing may reach
/// below it, and exactly `arg_count` values must sit above it at the call.
fn arguments_match(
    instrs: &[Instruction],
    targets: &[bool],
    load_at: usize,
    call_at: usize,
    arg_count: u32,
) -> bool {
    let mut depth: i64 = 1;
    for position in load_at + 1..call_at {
        let instr = &instrs[position];
        if targets[position] || instr.opcode.is_jump() {
            return false;
        }
        let (Some(popped), Some(effect)) = (
            pops(instr),
            instr.opcode.stack_effect(instr.operand, None),
        ) else {
            return false;
        };
        let popped = i64::from(popped);
        if popped > depth - 1 {
            return false;
        }
        depth += i64::from(effect);
    }
    depth == i64::from(arg_count) + 1
}

/// Values an instruction consumes, for the instructions allowed between a
/// callee load and its call.
fn pops(instr: &Instruction) -> Option<u32> {
    use Opcode::*;
    let arg = instr.operand;
    if instr.opcode.binary_operator().is_some() {
        return Some(2);
    }
    Some(match instr.opcode {
        LoadConst | LoadFast | LoadGlobal | LoadName | LoadDeref | LoadClosure
        | LoadClassderef | Nop => 0,
        UnaryPositive | UnaryNegative | UnaryNot | UnaryInvert | LoadAttr | LoadMethod
        | GetIter | DupTop => 1,
        RotTwo | CompareOp => 2,
        RotThree => 3,
        FormatValue => 1 + u32::from(arg & 0x04 != 0),
        BuildTuple | BuildList | BuildSet | BuildString | BuildSlice => arg,
        BuildMap => arg.checked_mul(2)?,
        BuildConstKeyMap => arg.checked_add(1)?,
        CallFunction => arg.checked_add(1)?,
        CallFunctionKw | CallMethod => arg.checked_add(2)?,
        CallFunctionEx => 2 + (arg & 0x01),
        _ => return None,
    })
}

/// Rewrite tail calls inside nested closures bound through a cell that the
/// enclosing body never rebinds:
/// `LOAD_CONST code; LOAD_CONST qualname; MAKE_FUNCTION; STORE_DEREF name`.
pub fn rewrite_nested_closures(function: &mut Function, config: &OptimizerConfig) -> Result<usize> {
    let mut rewrites = 0;
    for make_at in 2..function.instructions.len().saturating_sub(1) {
        let instrs = &function.instructions;
        let (code_load, qualname_load, binding) =
            (instrs[make_at - 2], instrs[make_at - 1], instrs[make_at + 1]);
        if instrs[make_at].opcode != Opcode::MakeFunction
            || code_load.opcode != Opcode::LoadConst
            || qualname_load.opcode != Opcode::LoadConst
            || binding.opcode != Opcode::StoreDeref
        {
            continue;
        }
        let Some(Value::Code(nested)) = function.body.constants.get(code_load.operand as usize)
        else {
            continue;
        };
        let name = undecorated_name(nested.name());
        if function.body.deref_name(binding.operand) != Some(name.as_str()) {
            continue;
        }
        let rebound = instrs.iter().enumerate().any(|(p, instr)| {
            p != make_at + 1
                && matches!(
                    variable(instr),
                    Some((Scope::Deref, Access::Store | Access::Delete, o)) if o == binding.operand
                )
        });
        if rebound {
            continue;
        }

        let nested = (**nested).clone();
        let Some(rewritten) =
            tail_call_nested(nested, config).map_err(|source| Error::Nested {
                name: name.clone(),
                source: Box::new(source),
            })?
        else {
            continue;
        };
        tracing::debug!("Rewrote tail calls in nested closure {name}");
        let index = function.constant_index(Value::Code(Box::new(rewritten)));
        function.instructions[make_at - 2].operand = index;
        rewrites += 1;
    }
    Ok(rewrites)
}

fn tail_call_nested(body: FunctionBody, config: &OptimizerConfig) -> Result<Option<FunctionBody>> {
    let mut nested = Function::decode(body)?;
    if run(&mut nested, true) == 0 {
        return Ok(None);
    }
    finalize(nested, config).map(Some)
}
