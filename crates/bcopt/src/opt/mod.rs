mod dead_store;
pub mod fold;
pub mod jumps;
mod peephole;
pub mod stack;
mod tables;
mod tail_call;
mod trim;

use std::fmt;

use crate::code::{
    Access, Disassembly, FunctionBody, Instruction, Opcode, Scope, Value, decorate_name, encode,
};
use crate::{Error, OptimizerConfig, Result};

/// A body being optimized: the editable instruction list plus a private copy
/// of the tables its operands index into.
#[derive(Debug, Clone)]
pub struct Function {
    pub instructions: Vec<Instruction>,
    pub body: FunctionBody,
}

impl Function {
    pub fn decode(body: FunctionBody) -> Result<Self> {
        Ok(Self {
            instructions: body.instructions()?,
            body,
        })
    }

    /// Index of `value` in the constant table, appending it if absent.
    pub fn constant_index(&mut self, value: Value) -> u32 {
        let index = match self.body.constants.iter().position(|c| *c == value) {
            Some(index) => index,
            None => {
                self.body.constants.push(value);
                self.body.constants.len() - 1
            }
        };
        u32::try_from(index).unwrap_or(u32::MAX)
    }

    pub fn constant(&self, instr: &Instruction) -> Option<&Value> {
        (instr.opcode == Opcode::LoadConst)
            .then(|| self.body.constants.get(instr.operand as usize))
            .flatten()
    }

    /// Whether any instruction deletes local slot `slot`.
    pub fn slot_ever_deleted(&self, slot: u32) -> bool {
        self.instructions
            .iter()
            .any(|i| i.opcode == Opcode::DeleteFast && i.operand == slot)
    }

    /// `LOAD_FAST` of a parameter slot that is never deleted, which always
    /// succeeds.
    pub fn is_parameter_load(&self, instr: &Instruction) -> bool {
        instr.opcode == Opcode::LoadFast
            && (instr.operand as usize) < self.body.parameter_count()
            && !self.slot_ever_deleted(instr.operand)
    }

    pub fn listing(&self) -> Disassembly<'_> {
        Disassembly::of(&self.body, self.instructions.clone())
    }
}

/// Variable an instruction touches, with the access kind.
pub fn variable(instr: &Instruction) -> Option<(Scope, Access, u32)> {
    instr
        .opcode
        .variable_access()
        .map(|(scope, access)| (scope, access, instr.operand))
}

/// Pipeline states, in the order a body moves through them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Decoded,
    DeadStoreDone,
    TailCallDone,
    PeepholeDone,
    TrimDone,
    JumpsFixed,
    TablesCompacted,
    StackSized,
    Encoded,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

fn enter(stage: Stage, function: &Function) {
    tracing::trace!(
        "{} -> {stage} ({} instructions)",
        function.body.name(),
        function.instructions.len()
    );
}

/// Optimize `body` and every function body nested in its constants.
pub fn optimize_body(body: &FunctionBody, config: &OptimizerConfig) -> Result<FunctionBody> {
    config.validate()?;
    let mut current = body.clone();
    for iteration in 0..config.iterations {
        current = run_pipeline(current, config, iteration == 0)?;
    }
    tracing::debug!(
        "Optimized {}: {} -> {} bytes of code",
        body.name(),
        body.code.len(),
        current.code.len()
    );
    Ok(current)
}

fn run_pipeline(
    body: FunctionBody,
    config: &OptimizerConfig,
    first_iteration: bool,
) -> Result<FunctionBody> {
    let mut function = Function::decode(body)?;
    if first_iteration {
        optimize_nested(&mut function, config)?;
    }
    enter(Stage::Decoded, &function);

    if config.remove_dead_stores {
        let rewrites = dead_store::run(&mut function);
        tracing::debug!("Dead stores in {}: {rewrites} rewrites", function.body.name());
    }
    enter(Stage::DeadStoreDone, &function);

    if config.tail_call_optimize {
        let rewrites = tail_call::run(&mut function, false);
        let closures = if first_iteration {
            tail_call::rewrite_nested_closures(&mut function, config)?
        } else {
            0
        };
        tracing::debug!(
            "Tail calls in {}: {rewrites} rewritten, {closures} nested closures",
            function.body.name()
        );
    }
    enter(Stage::TailCallDone, &function);

    if config.optimize_accessors_and_constants {
        let rewrites = peephole::run(&mut function);
        tracing::debug!("Peephole on {}: {rewrites} rewrites", function.body.name());
    }
    enter(Stage::PeepholeDone, &function);

    if config.optimize_accessors_and_constants {
        trim::run(&mut function);
    }
    enter(Stage::TrimDone, &function);

    finalize(function, config)
}

/// Replace every nested function body in the constant table with its
/// optimized form.
fn optimize_nested(function: &mut Function, config: &OptimizerConfig) -> Result<()> {
    for constant in &mut function.body.constants {
        if let Value::Code(nested) = constant {
            let optimized = optimize_body(nested, config).map_err(|source| Error::Nested {
                name: nested.name().to_owned(),
                source: Box::new(source),
            })?;
            **nested = optimized;
        }
    }
    Ok(())
}

/// Jump fixup, table compaction, stack sizing and encoding.
pub(crate) fn finalize(mut function: Function, config: &OptimizerConfig) -> Result<FunctionBody> {
    jumps::fixup(&mut function.instructions)?;
    enter(Stage::JumpsFixed, &function);

    if config.compact_tables {
        tables::compact(&mut function)?;
    }
    enter(Stage::TablesCompacted, &function);

    function.body.stack_size = stack::stack_size(&function.instructions);
    enter(Stage::StackSized, &function);

    tracing::trace!("{}", function.listing());
    function.body.code = encode(&function.instructions)?;
    function.body.source.name = decorate_name(function.body.name());
    enter(Stage::Encoded, &function);

    Ok(function.body)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(code: Vec<u8>, constants: Vec<Value>) -> FunctionBody {
        let mut body = FunctionBody::new("f");
        body.flags = crate::code::CO_OPTIMIZED;
        body.code = code;
        body.constants = constants;
        body
    }

    #[test]
    fn constant_index_deduplicates_strictly() {
        let mut function =
            Function::decode(body(vec![100, 0, 83, 0], vec![Value::Int(1)])).expect("decode");
        assert_eq!(function.constant_index(Value::Int(1)), 0);
        assert_eq!(function.constant_index(Value::Float(1.0)), 1);
        assert_eq!(function.constant_index(Value::Bool(true)), 2);
        assert_eq!(function.body.constants.len(), 3);
    }

    #[test]
    fn output_name_is_decorated_once() {
        let config = OptimizerConfig::default();
        let once = optimize_body(&body(vec![100, 0, 83, 0], vec![Value::None]), &config)
            .expect("optimize");
        assert_eq!(once.name(), "<optimized> f");
        let twice = optimize_body(&once, &config).expect("optimize");
        assert_eq!(twice.name(), "<optimized> f");
        assert_eq!(twice.code, once.code);
    }

    #[test]
    fn nested_failures_name_the_nested_body() {
        let mut broken = FunctionBody::new("inner");
        broken.code = vec![100];
        let outer = body(
            vec![100, 0, 83, 0],
            vec![Value::Code(Box::new(broken))],
        );
        let err = optimize_body(&outer, &OptimizerConfig::default()).unwrap_err();
        assert!(matches!(err, Error::Nested { ref name, .. } if name == "inner"));
    }

    #[test]
    fn trimming_follows_the_peephole_toggle() {
        // LOAD_CONST 0; RETURN_VALUE; LOAD_CONST 0; RETURN_VALUE
        let code = vec![100, 0, 83, 0, 100, 0, 83, 0];
        let config = OptimizerConfig {
            optimize_accessors_and_constants: false,
            ..OptimizerConfig::default()
        };
        let kept = optimize_body(&body(code.clone(), vec![Value::None]), &config)
            .expect("optimize");
        assert_eq!(kept.code, code);

        let trimmed = optimize_body(&body(code, vec![Value::None]), &OptimizerConfig::default())
            .expect("optimize");
        assert_eq!(trimmed.code, vec![100, 0, 83, 0]);
    }

    #[test]
    fn zero_iterations_is_rejected() {
        let config = OptimizerConfig {
            iterations: 0,
            ..OptimizerConfig::default()
        };
        let err = optimize_body(&body(vec![100, 0, 83, 0], vec![Value::None]), &config)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }
}
