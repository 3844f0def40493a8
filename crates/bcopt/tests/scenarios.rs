//! End-to-end scenarios: hand-assembled bodies run through the whole
//! pipeline, checked both structurally and against the reference
//! interpreter.

use bcopt::test_harness::*;
use bcopt::{Error, FunctionBody, Opcode, OptimizerConfig, Value, optimize, try_optimize};

fn config() -> OptimizerConfig {
    OptimizerConfig::default()
}

fn countdown() -> FunctionBody {
    // def f(n): return f(n - 1) if n > 0 else n
    FunctionBuilder::new("f").params(&["n"]).asm(
        "
        LOAD_FAST n
        LOAD_CONST 0
        COMPARE_OP >
        POP_JUMP_IF_FALSE base
        LOAD_GLOBAL f
        LOAD_FAST n
        LOAD_CONST 1
        BINARY_SUBTRACT
        CALL_FUNCTION 1
        RETURN_VALUE
        base:
        LOAD_FAST n
        RETURN_VALUE
        ",
    )
}

// =============================================================================
// The six reference scenarios
// =============================================================================

#[test]
fn constant_bindings_fold_to_a_single_constant() {
    // x = 10; y = 20; z = x + y; return z
    let body = FunctionBuilder::new("f").asm(
        "
        LOAD_CONST 10
        STORE_FAST x
        LOAD_CONST 20
        STORE_FAST y
        LOAD_FAST x
        LOAD_FAST y
        BINARY_ADD
        STORE_FAST z
        LOAD_FAST z
        RETURN_VALUE
        ",
    );
    let optimized = assert_same_behavior(&body, &config(), &[&[]]);
    assert_eq!(
        ops(&optimized),
        vec![(Opcode::LoadConst, 1), (Opcode::ReturnValue, 0)]
    );
    assert_eq!(optimized.constants, vec![Value::None, Value::Int(30)]);
    assert!(optimized.locals.is_empty());
    assert_eq!(optimized.stack_size, 1);
    assert_eq!(run(&optimized, &[]).result, Ok(Value::Int(30)));
}

#[test]
fn call_result_is_returned_directly() {
    // x = compute(); return x
    let body = FunctionBuilder::new("f").asm(
        "
        LOAD_GLOBAL compute
        CALL_FUNCTION 0
        STORE_FAST x
        LOAD_FAST x
        RETURN_VALUE
        ",
    );
    let optimized = assert_same_behavior(&body, &config(), &[&[]]);
    assert_eq!(
        ops(&optimized),
        vec![
            (Opcode::LoadGlobal, 0),
            (Opcode::CallFunction, 0),
            (Opcode::ReturnValue, 0),
        ]
    );
    let outcome = run(&optimized, &[]);
    assert_eq!(outcome.result, Ok(Value::Int(42)));
    assert_eq!(outcome.effects, vec!["compute()".to_owned()]);
}

#[test]
fn self_tail_call_becomes_jump_to_entry() {
    let body = countdown();
    let optimized = assert_same_behavior(
        &body,
        &config(),
        &[&[Value::Int(5)], &[Value::Int(0)], &[Value::Int(-3)], &[Value::Int(40)]],
    );
    let code = decoded(&optimized);
    assert!(!has_opcode(&code, Opcode::CallFunction));
    assert!(!has_opcode(&code, Opcode::LoadGlobal));
    assert_has_pattern(
        &code,
        &[
            InstructionPattern::with(Opcode::StoreFast, 0),
            InstructionPattern::with(Opcode::JumpAbsolute, 0),
        ],
    );
    assert!(optimized.names.is_empty());
    assert_jumps_valid(&optimized);
}

#[test]
fn tail_call_removes_the_recursion_limit() {
    let body = countdown();
    assert_eq!(run(&body, &[Value::Int(200)]).result, Err(Fault::RecursionLimit));
    let optimized = try_optimize(&body, &config()).expect("optimize");
    assert_eq!(run(&optimized, &[Value::Int(200)]).result, Ok(Value::Int(0)));
}

#[test]
fn unused_binding_leaves_no_instructions() {
    // x = 5; return None
    let body = FunctionBuilder::new("f").asm(
        "
        LOAD_CONST 5
        STORE_FAST x
        LOAD_CONST None
        RETURN_VALUE
        ",
    );
    let optimized = assert_same_behavior(&body, &config(), &[&[]]);
    assert_eq!(
        ops(&optimized),
        vec![(Opcode::LoadConst, 0), (Opcode::ReturnValue, 0)]
    );
    assert_eq!(optimized.constants, vec![Value::None]);
}

#[test]
fn code_after_return_is_trimmed_unless_targeted() {
    let unreachable = FunctionBuilder::new("f").asm(
        "
        LOAD_CONST 1
        RETURN_VALUE
        LOAD_CONST 2
        RETURN_VALUE
        ",
    );
    let optimized = assert_same_behavior(&unreachable, &config(), &[&[]]);
    assert_eq!(
        ops(&optimized),
        vec![(Opcode::LoadConst, 1), (Opcode::ReturnValue, 0)]
    );
    assert_eq!(optimized.constants, vec![Value::None, Value::Int(1)]);

    let targeted = FunctionBuilder::new("g").params(&["n"]).asm(
        "
        LOAD_FAST n
        POP_JUMP_IF_FALSE other
        LOAD_CONST 1
        RETURN_VALUE
        other:
        LOAD_CONST 2
        RETURN_VALUE
        ",
    );
    let optimized = assert_same_behavior(
        &targeted,
        &config(),
        &[&[Value::Int(0)], &[Value::Int(1)]],
    );
    assert_eq!(decoded(&optimized).len(), 6);
    assert_jumps_valid(&optimized);
}

#[test]
fn constant_comparison_prunes_to_the_taken_side() {
    // if 3 < 5: return 'yes' else: return 'no'
    let body = FunctionBuilder::new("f").asm(
        "
        LOAD_CONST 3
        LOAD_CONST 5
        COMPARE_OP <
        POP_JUMP_IF_FALSE no
        LOAD_CONST 'yes'
        RETURN_VALUE
        no:
        LOAD_CONST 'no'
        RETURN_VALUE
        ",
    );
    let optimized = assert_same_behavior(&body, &config(), &[&[]]);
    assert_eq!(
        ops(&optimized),
        vec![(Opcode::LoadConst, 1), (Opcode::ReturnValue, 0)]
    );
    assert_eq!(
        optimized.constants,
        vec![Value::None, Value::Str("yes".into())]
    );
}

// =============================================================================
// Nested closures
// =============================================================================

fn closure_inner() -> FunctionBody {
    FunctionBuilder::new("f").params(&["n"]).free_vars(&["f"]).asm(
        "
        LOAD_FAST n
        LOAD_CONST 0
        COMPARE_OP >
        POP_JUMP_IF_FALSE base
        LOAD_DEREF f
        LOAD_FAST n
        LOAD_CONST 1
        BINARY_SUBTRACT
        CALL_FUNCTION 1
        RETURN_VALUE
        base:
        LOAD_FAST n
        RETURN_VALUE
        ",
    )
}

#[test]
fn nested_closure_tail_calls_are_rewritten() {
    let outer = FunctionBuilder::new("outer")
        .cell_vars(&["f"])
        .constant(Value::Code(Box::new(closure_inner())))
        .asm(
            "
            LOAD_CLOSURE f
            BUILD_TUPLE 1
            LOAD_CONST #1
            LOAD_CONST 'outer.<locals>.f'
            MAKE_FUNCTION 8
            STORE_DEREF f
            LOAD_DEREF f
            LOAD_CONST 10
            CALL_FUNCTION 1
            RETURN_VALUE
            ",
        );
    let optimized = assert_same_behavior(&outer, &config(), &[&[]]);

    let nested: Vec<&FunctionBody> = optimized.nested().map(|(_, body)| body).collect();
    assert_eq!(nested.len(), 1);
    let inner = nested[0];
    assert_eq!(inner.name(), "<optimized> f");
    let code = decoded(inner);
    assert!(!has_opcode(&code, Opcode::CallFunction));
    assert!(!has_opcode(&code, Opcode::LoadDeref));
    assert_jumps_valid(inner);
    assert_tables_minimal(&optimized);
}

#[test]
fn rebound_closure_keeps_its_calls() {
    let outer = FunctionBuilder::new("outer")
        .cell_vars(&["f"])
        .constant(Value::Code(Box::new(closure_inner())))
        .asm(
            "
            LOAD_CLOSURE f
            BUILD_TUPLE 1
            LOAD_CONST #1
            LOAD_CONST 'outer.<locals>.f'
            MAKE_FUNCTION 8
            STORE_DEREF f
            LOAD_DEREF f
            LOAD_GLOBAL identity
            STORE_DEREF f
            LOAD_CONST 3
            CALL_FUNCTION 1
            RETURN_VALUE
            ",
        );
    let optimized = assert_same_behavior(&outer, &config(), &[&[]]);
    let (_, inner) = optimized.nested().next().expect("nested body");
    assert!(has_opcode(&decoded(inner), Opcode::CallFunction));
}

#[test]
fn nested_bodies_are_optimized_bottom_up() {
    let inner = FunctionBuilder::new("helper").asm(
        "
        LOAD_CONST 2
        LOAD_CONST 3
        BINARY_MULTIPLY
        RETURN_VALUE
        ",
    );
    let module = FunctionBuilder::module("<module>")
        .constant(Value::Code(Box::new(inner)))
        .asm(
            "
            LOAD_CONST #0
            LOAD_CONST 'helper'
            MAKE_FUNCTION 0
            STORE_NAME helper
            LOAD_CONST None
            RETURN_VALUE
            ",
        );
    let optimized = assert_same_behavior(&module, &config(), &[&[]]);
    assert_eq!(optimized.name(), "<optimized module>");
    let (_, helper) = optimized.nested().next().expect("nested body");
    assert_eq!(helper.name(), "<optimized> helper");
    assert_eq!(
        ops(helper),
        vec![(Opcode::LoadConst, 1), (Opcode::ReturnValue, 0)]
    );
    assert_eq!(helper.constants[1], Value::Int(6));
}

// =============================================================================
// Guards and fallbacks
// =============================================================================

#[test]
fn failing_fold_is_left_for_runtime() {
    let body = FunctionBuilder::new("f").asm(
        "
        LOAD_CONST 1
        LOAD_CONST 0
        BINARY_TRUE_DIVIDE
        RETURN_VALUE
        ",
    );
    let optimized = assert_same_behavior(&body, &config(), &[&[]]);
    assert!(has_opcode(&decoded(&optimized), Opcode::BinaryTrueDivide));
    assert!(matches!(
        run(&optimized, &[]).result,
        Err(Fault::Operation(_))
    ));
}

#[test]
fn store_read_after_a_loop_back_is_kept() {
    let body = FunctionBuilder::new("f").params(&["n"]).asm(
        "
        LOAD_CONST 0
        STORE_FAST total
        SETUP_LOOP after
        top:
        LOAD_FAST n
        LOAD_CONST 0
        COMPARE_OP >
        POP_JUMP_IF_FALSE exit
        LOAD_FAST total
        LOAD_FAST n
        INPLACE_ADD
        STORE_FAST total
        LOAD_FAST n
        LOAD_CONST 1
        INPLACE_SUBTRACT
        STORE_FAST n
        JUMP_ABSOLUTE top
        exit:
        POP_BLOCK
        after:
        LOAD_FAST total
        RETURN_VALUE
        ",
    );
    let optimized = assert_same_behavior(
        &body,
        &config(),
        &[&[Value::Int(0)], &[Value::Int(4)], &[Value::Int(10)]],
    );
    assert_eq!(run(&optimized, &[Value::Int(4)]).result, Ok(Value::Int(10)));
    assert_jumps_valid(&optimized);
}

#[test]
fn long_jumps_use_extended_arguments() {
    let mut source = String::from("LOAD_FAST n\nPOP_JUMP_IF_FALSE end\n");
    for _ in 0..200 {
        source.push_str("NOP\n");
    }
    source.push_str("end:\nLOAD_CONST None\nRETURN_VALUE\n");
    let body = FunctionBuilder::new("f").params(&["n"]).asm(&source);
    assert!(body.code.contains(&(Opcode::ExtendedArg as u8)));

    let optimized = assert_same_behavior(
        &body,
        &config(),
        &[&[Value::Int(0)], &[Value::Int(1)]],
    );
    assert_jumps_valid(&optimized);
    assert_eq!(decoded(&optimized).len(), 204);
}

#[test]
fn long_relative_jumps_land_past_their_prefixes() {
    let mut source = String::from("LOAD_FAST n\nPOP_JUMP_IF_FALSE other\nJUMP_FORWARD end\nother:\n");
    for _ in 0..200 {
        source.push_str("NOP\n");
    }
    source.push_str("LOAD_CONST 'left'\nRETURN_VALUE\nend:\nLOAD_CONST 'right'\nRETURN_VALUE\n");
    let body = FunctionBuilder::new("f").params(&["n"]).asm(&source);

    let code = decoded(&body);
    assert_eq!(code[2].opcode, Opcode::JumpForward);
    assert_eq!(code[2].prefixes, 1);
    let end = code.len() - 2;
    assert_eq!(code[2].raw_target(), Some(code[end].offset));
    assert_eq!(run(&body, &[Value::Int(1)]).result, Ok("right".into()));
    assert_eq!(run(&body, &[Value::Int(0)]).result, Ok("left".into()));

    let optimized = assert_same_behavior(
        &body,
        &config(),
        &[&[Value::Int(0)], &[Value::Int(1)]],
    );
    assert_jumps_valid(&optimized);
    assert!(has_opcode(&decoded(&optimized), Opcode::JumpForward));
}

#[test]
fn malformed_nested_body_falls_back_whole() {
    let mut broken = FunctionBody::new("broken");
    broken.code = vec![Opcode::LoadConst as u8];
    let outer = FunctionBuilder::new("outer")
        .constant(Value::Code(Box::new(broken)))
        .asm("LOAD_CONST 1\nLOAD_CONST 2\nBINARY_ADD\nRETURN_VALUE");

    let result = optimize(&outer, &config());
    assert_eq!(result.body, outer);
    match result.diagnostic {
        Some(Error::Nested { name, source }) => {
            assert_eq!(name, "broken");
            assert!(matches!(*source, Error::MalformedInstructionStream { .. }));
        }
        other => panic!("unexpected diagnostic {other:?}"),
    }
}

#[test]
fn disabled_passes_leave_code_alone() {
    let body = FunctionBuilder::new("f").asm(
        "
        LOAD_CONST 10
        STORE_FAST x
        LOAD_FAST x
        RETURN_VALUE
        ",
    );
    let optimized = assert_same_behavior(&body, &OptimizerConfig::passthrough(), &[&[]]);
    assert_eq!(optimized.code, body.code);
    assert_eq!(optimized.name(), "<optimized> f");
}

#[test]
fn optimized_bodies_round_trip_through_json() {
    let optimized = try_optimize(&countdown(), &config()).expect("optimize");
    let json = serde_json::to_string(&optimized).expect("serialize");
    let back: FunctionBody = serde_json::from_str(&json).expect("deserialize");
    assert_eq!(back, optimized);
}
