//! Test harness for bcopt unit and integration tests
//!
//! Three pieces:
//! - [`FunctionBuilder`] assembles function bodies from a small text format
//!   with symbolic labels, locals, names and literal constants.
//! - [`Interpreter`] executes the supported opcode subset so the behavior of
//!   a body can be compared before and after optimization.
//! - Pattern helpers ([`Pat`], [`InstructionPattern`], [`assert_has_pattern`])
//!   for asserting on the instructions a body ends up with.
//!
//! # Example
//!
//! ```rust
//! use bcopt::test_harness::*;
//! use bcopt::{OptimizerConfig, Opcode, Value};
//!
//! let body = FunctionBuilder::new("f").asm(
//!     "
//!     LOAD_CONST 10
//!     STORE_FAST x
//!     LOAD_CONST 20
//!     STORE_FAST y
//!     LOAD_FAST x
//!     LOAD_FAST y
//!     BINARY_ADD
//!     RETURN_VALUE
//!     ",
//! );
//!
//! let optimized = assert_same_behavior(&body, &OptimizerConfig::default(), &[&[]]);
//! assert_eq!(ops(&optimized), vec![(Opcode::LoadConst, 1), (Opcode::ReturnValue, 0)]);
//! assert_eq!(run(&optimized, &[]).result, Ok(Value::Int(30)));
//! ```
//!
//! # Assembly format
//!
//! One instruction per line, `MNEMONIC [operand]`. `name:` on its own line
//! labels the next instruction. `;` starts a comment. Operands are read
//! according to the opcode:
//! - jumps take a label;
//! - `LOAD_FAST`/`STORE_FAST`/`DELETE_FAST` take a local name (added on
//!   first use), global and attribute opcodes take a name;
//! - cell/free opcodes take a cell or free variable name;
//! - `LOAD_CONST` takes a literal (`None`, `True`, `False`, `...`, ints,
//!   floats, `'str'`, `b'bytes'`) or `#N` for an entry added with
//!   [`FunctionBuilder::constant`];
//! - `COMPARE_OP` takes a comparison symbol such as `<` or `not in`;
//! - everything else takes a plain integer.

#![allow(
    clippy::match_same_arms,
    clippy::must_use_candidate,
    clippy::manual_assert,
    clippy::missing_panics_doc,
    clippy::uninlined_format_args
)]

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::code::{
    CO_NESTED, CO_NEWLOCALS, CO_NOFREE, CO_OPTIMIZED, CompareKind, FunctionBody, INSTRUCTION_WIDTH,
    Instruction, Opcode, OperandKind, Value, encode, undecorated_name,
};
use crate::error::FoldError;
use crate::opt::{fold, jumps, stack};
use crate::{OptimizerConfig, try_optimize};

// ---------------------------------------------------------------------------
// Assembler
// ---------------------------------------------------------------------------

/// Builds a [`FunctionBody`] from assembly text.
#[derive(Debug, Clone)]
pub struct FunctionBuilder {
    body: FunctionBody,
}

impl FunctionBuilder {
    /// A function body: `CO_OPTIMIZED`, with `None` as its docstring slot.
    pub fn new(name: &str) -> Self {
        let mut body = FunctionBody::new(name);
        body.flags = CO_OPTIMIZED | CO_NEWLOCALS | CO_NOFREE;
        body.constants = vec![Value::None];
        Self { body }
    }

    /// A module-level body: names instead of fast locals, no docstring slot.
    pub fn module(name: &str) -> Self {
        Self {
            body: FunctionBody::new(name),
        }
    }

    pub fn params(mut self, names: &[&str]) -> Self {
        self.body.arg_count = names.len() as u32;
        let mut locals: Vec<String> = names.iter().map(|n| (*n).to_owned()).collect();
        locals.extend(
            self.body
                .locals
                .drain(..)
                .filter(|l| !names.contains(&l.as_str())),
        );
        self.body.locals = locals;
        self
    }

    pub fn flags(mut self, flags: u32) -> Self {
        self.body.flags |= flags;
        self
    }

    pub fn constant(mut self, value: impl Into<Value>) -> Self {
        self.body.constants.push(value.into());
        self
    }

    pub fn cell_vars(mut self, names: &[&str]) -> Self {
        self.body.cell_vars = names.iter().map(|n| (*n).to_owned()).collect();
        self.body.flags &= !CO_NOFREE;
        self
    }

    pub fn free_vars(mut self, names: &[&str]) -> Self {
        self.body.free_vars = names.iter().map(|n| (*n).to_owned()).collect();
        self.body.flags &= !CO_NOFREE;
        self.body.flags |= CO_NESTED;
        self
    }

    /// Assemble `source` into the body's code, filling tables as operands
    /// name new entries and computing the stack size.
    pub fn asm(mut self, source: &str) -> FunctionBody {
        let mut labels: HashMap<String, usize> = HashMap::new();
        let mut pending: Vec<(Opcode, String, usize)> = Vec::new();

        for (line_no, line) in source.lines().enumerate() {
            let line = line.split(';').next().unwrap_or_default().trim();
            if line.is_empty() {
                continue;
            }
            if let Some(label) = line.strip_suffix(':')
                && !label.contains(char::is_whitespace)
            {
                if labels.insert(label.to_owned(), pending.len()).is_some() {
                    panic!("line {}: duplicate label {label}", line_no + 1);
                }
                continue;
            }
            let (mnemonic, operand) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
            let opcode = Opcode::from_name(mnemonic)
                .unwrap_or_else(|| panic!("line {}: unknown mnemonic {mnemonic}", line_no + 1));
            pending.push((opcode, operand.trim().to_owned(), line_no + 1));
        }

        let mut instructions = Vec::with_capacity(pending.len());
        for (position, (opcode, operand, line_no)) in pending.iter().enumerate() {
            let operand = match opcode.operand_kind() {
                OperandKind::AbsoluteJump | OperandKind::RelativeJump => {
                    let target = *labels
                        .get(operand.as_str())
                        .unwrap_or_else(|| panic!("line {line_no}: unknown label {operand}"));
                    if target >= pending.len() {
                        panic!("line {line_no}: label {operand} labels nothing");
                    }
                    let units = if opcode.operand_kind() == OperandKind::AbsoluteJump {
                        target
                    } else {
                        target.checked_sub(position + 1).unwrap_or_else(|| {
                            panic!("line {line_no}: relative jump to {operand} goes backwards")
                        })
                    };
                    jumps::byte_offset(units)
                }
                OperandKind::LocalSlot => intern(&mut self.body.locals, operand),
                OperandKind::NameRef => intern(&mut self.body.names, operand),
                OperandKind::FreeRef => self.deref_index(operand, *line_no),
                OperandKind::ConstRef => self.constant_operand(operand, *line_no),
                OperandKind::Immediate if *opcode == Opcode::CompareOp => {
                    compare_operand(operand, *line_no)
                }
                OperandKind::Immediate => int_operand(operand, *line_no),
                OperandKind::None => 0,
            };
            instructions.push(Instruction::new(*opcode, operand).at(jumps::byte_offset(position)));
        }

        self.body.stack_size = stack::stack_size(&instructions);
        self.body.code = encode(&instructions)
            .unwrap_or_else(|err| panic!("cannot encode {}: {err}", self.body.name()));
        self.body
    }

    fn deref_index(&self, name: &str, line_no: usize) -> u32 {
        self.body
            .cell_vars
            .iter()
            .chain(&self.body.free_vars)
            .position(|v| v == name)
            .unwrap_or_else(|| panic!("line {line_no}: {name} is not a cell or free variable"))
            as u32
    }

    fn constant_operand(&mut self, text: &str, line_no: usize) -> u32 {
        if let Some(index) = text.strip_prefix('#') {
            return int_operand(index, line_no);
        }
        let value = parse_literal(text)
            .unwrap_or_else(|| panic!("line {line_no}: cannot parse constant {text}"));
        let constants = &mut self.body.constants;
        let index = constants.iter().position(|c| *c == value).unwrap_or_else(|| {
            constants.push(value);
            constants.len() - 1
        });
        index as u32
    }
}

fn intern(table: &mut Vec<String>, name: &str) -> u32 {
    let index = table.iter().position(|n| n == name).unwrap_or_else(|| {
        table.push(name.to_owned());
        table.len() - 1
    });
    index as u32
}

fn int_operand(text: &str, line_no: usize) -> u32 {
    text.parse()
        .unwrap_or_else(|_| panic!("line {line_no}: expected an integer operand, got {text:?}"))
}

fn compare_operand(text: &str, line_no: usize) -> u32 {
    CompareKind::from_symbol(text)
        .map(|kind| kind as u32)
        .unwrap_or_else(|| int_operand(text, line_no))
}

/// Parse a constant literal as written in assembly.
pub fn parse_literal(text: &str) -> Option<Value> {
    let quoted = |s: &str| {
        s.strip_prefix('\'')
            .and_then(|s| s.strip_suffix('\''))
            .or_else(|| s.strip_prefix('"').and_then(|s| s.strip_suffix('"')))
            .map(str::to_owned)
    };
    Some(match text {
        "None" => Value::None,
        "True" => Value::Bool(true),
        "False" => Value::Bool(false),
        "..." => Value::Ellipsis,
        _ => {
            if let Some(bytes) = text.strip_prefix('b').and_then(quoted) {
                Value::Bytes(bytes.into_bytes())
            } else if let Some(s) = quoted(text) {
                Value::Str(s)
            } else if let Ok(i) = text.parse::<i64>() {
                Value::Int(i)
            } else {
                Value::Float(text.parse::<f64>().ok()?)
            }
        }
    })
}

/// `(opcode, operand)` pairs of an encoded body.
pub fn ops(body: &FunctionBody) -> Vec<(Opcode, u32)> {
    decoded(body).iter().map(|i| (i.opcode, i.operand)).collect()
}

/// Decoded instructions of a body, panicking on malformed code.
pub fn decoded(body: &FunctionBody) -> Vec<Instruction> {
    body.instructions()
        .unwrap_or_else(|err| panic!("{} does not decode: {err}", body.name()))
}

// ---------------------------------------------------------------------------
// Reference interpreter
// ---------------------------------------------------------------------------

/// Native callable: receives the call arguments, returns the result.
pub type Native = fn(&[Value]) -> Value;

/// Execution steps before a run is abandoned.
pub const STEP_LIMIT: u64 = 200_000;

/// Deepest call nesting before a run faults.
pub const MAX_CALL_DEPTH: usize = 64;

/// Why a run stopped without returning.
#[derive(Debug, Clone, PartialEq)]
pub enum Fault {
    NameError(String),
    UnboundLocal(String),
    TypeError(String),
    Operation(FoldError),
    Unsupported(&'static str),
    Malformed(String),
    StackUnderflow,
    /// The operand stack grew past the body's declared size.
    StackOverflow { declared: u32, reached: usize },
    StepLimit,
    RecursionLimit,
}

/// Everything observable about one run.
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    pub result: Result<Value, Fault>,
    /// Native calls and global stores, in order.
    pub effects: Vec<String>,
}

type Cell = Rc<RefCell<Option<Object>>>;

#[derive(Debug)]
struct Closure {
    body: FunctionBody,
    cells: Vec<Cell>,
}

#[derive(Debug, Clone)]
enum Object {
    Value(Value),
    Function(Rc<Closure>),
    Native(&'static str, Native),
    Cell(Cell),
    Cells(Vec<Cell>),
}

impl Object {
    fn is_truthy(&self) -> bool {
        match self {
            Self::Value(v) => v.is_truthy(),
            Self::Cells(cells) => !cells.is_empty(),
            _ => true,
        }
    }

    fn into_value(self) -> Value {
        match self {
            Self::Value(v) => v,
            Self::Function(f) => Value::Str(format!(
                "<function {}>",
                undecorated_name(f.body.name())
            )),
            Self::Native(name, _) => Value::Str(format!("<built-in {name}>")),
            Self::Cell(_) | Self::Cells(_) => Value::Str("<cell>".into()),
        }
    }

    fn as_value(&self) -> Result<&Value, Fault> {
        match self {
            Self::Value(v) => Ok(v),
            _ => Err(Fault::TypeError("operand is not a plain value".into())),
        }
    }
}

/// Executes function bodies over a global namespace of values, functions and
/// natives.
#[derive(Debug)]
pub struct Interpreter {
    globals: HashMap<String, Object>,
    effects: Vec<String>,
    steps: u64,
    depth: usize,
}

impl Default for Interpreter {
    fn default() -> Self {
        Self::new()
    }
}

impl Interpreter {
    /// Interpreter with the natives `print` (returns `None`), `identity`
    /// (returns its first argument) and `compute` (returns `42`).
    pub fn new() -> Self {
        Self {
            globals: HashMap::new(),
            effects: Vec::new(),
            steps: 0,
            depth: 0,
        }
        .native("print", |_| Value::None)
        .native("identity", |args| args.first().cloned().unwrap_or(Value::None))
        .native("compute", |_| Value::Int(42))
    }

    pub fn native(mut self, name: &'static str, f: Native) -> Self {
        self.globals.insert(name.to_owned(), Object::Native(name, f));
        self
    }

    pub fn global(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.globals
            .insert(name.to_owned(), Object::Value(value.into()));
        self
    }

    /// Bind `body` as a global function under `name`.
    pub fn function(mut self, name: &str, body: &FunctionBody) -> Self {
        let closure = Closure {
            body: body.clone(),
            cells: Vec::new(),
        };
        self.globals
            .insert(name.to_owned(), Object::Function(Rc::new(closure)));
        self
    }

    /// Call `body` with positional `args`.
    pub fn call(mut self, body: &FunctionBody, args: &[Value]) -> Outcome {
        let closure = Closure {
            body: body.clone(),
            cells: Vec::new(),
        };
        let args = args.iter().cloned().map(Object::Value).collect();
        let result = self.execute(&closure, args).map(Object::into_value);
        Outcome {
            result,
            effects: self.effects,
        }
    }

    fn execute(&mut self, closure: &Closure, args: Vec<Object>) -> Result<Object, Fault> {
        if self.depth >= MAX_CALL_DEPTH {
            return Err(Fault::RecursionLimit);
        }
        self.depth += 1;
        let result = self.run_frame(closure, args);
        self.depth -= 1;
        result
    }

    fn run_frame(&mut self, closure: &Closure, args: Vec<Object>) -> Result<Object, Fault> {
        let body = &closure.body;
        let code = body
            .instructions()
            .map_err(|err| Fault::Malformed(err.to_string()))?;
        if args.len() != body.arg_count as usize
            || body.kw_only_arg_count != 0
            || body.parameter_count() != args.len()
        {
            return Err(Fault::TypeError(format!(
                "{} takes {} positional arguments but {} were given",
                undecorated_name(body.name()),
                body.arg_count,
                args.len()
            )));
        }

        let mut locals: Vec<Option<Object>> = vec![None; body.locals.len()];
        for (slot, arg) in args.into_iter().enumerate() {
            *locals.get_mut(slot).ok_or_else(|| malformed("parameter without a slot"))? =
                Some(arg);
        }
        let mut cells: Vec<Cell> = body
            .cell_vars
            .iter()
            .map(|name| {
                let initial = body.locals[..body.arg_count as usize]
                    .iter()
                    .position(|l| l == name)
                    .and_then(|slot| locals[slot].clone());
                Rc::new(RefCell::new(initial))
            })
            .collect();
        cells.extend(closure.cells.iter().cloned());

        let mut stack: Vec<Object> = Vec::new();
        let mut pc = 0;
        loop {
            self.steps += 1;
            if self.steps > STEP_LIMIT {
                return Err(Fault::StepLimit);
            }
            let position = pc;
            let instr = *code
                .get(position)
                .ok_or_else(|| malformed("execution ran past the last instruction"))?;
            pc += 1;
            let arg = instr.operand as usize;

            match instr.opcode {
                // Without break/continue support the block stack has
                // nothing to unwind, so it is not modelled.
                Opcode::Nop | Opcode::SetupLoop | Opcode::PopBlock => {}
                Opcode::PopTop => {
                    pop(&mut stack)?;
                }
                Opcode::RotTwo => {
                    let top = pop(&mut stack)?;
                    let second = pop(&mut stack)?;
                    stack.push(top);
                    stack.push(second);
                }
                Opcode::RotThree => {
                    let top = pop(&mut stack)?;
                    let second = pop(&mut stack)?;
                    let third = pop(&mut stack)?;
                    stack.extend([top, third, second]);
                }
                Opcode::DupTop => {
                    let top = peek(&stack)?.clone();
                    stack.push(top);
                }
                Opcode::DupTopTwo => {
                    let top = pop(&mut stack)?;
                    let second = pop(&mut stack)?;
                    stack.extend([second.clone(), top.clone(), second, top]);
                }
                Opcode::LoadConst => {
                    let value = body
                        .constants
                        .get(arg)
                        .ok_or_else(|| malformed("constant index out of range"))?;
                    stack.push(Object::Value(value.clone()));
                }
                Opcode::LoadFast => {
                    let value = locals
                        .get(arg)
                        .ok_or_else(|| malformed("local slot out of range"))?
                        .clone()
                        .ok_or_else(|| Fault::UnboundLocal(body.locals[arg].clone()))?;
                    stack.push(value);
                }
                Opcode::StoreFast => {
                    let value = pop(&mut stack)?;
                    *locals
                        .get_mut(arg)
                        .ok_or_else(|| malformed("local slot out of range"))? = Some(value);
                }
                Opcode::DeleteFast => {
                    let slot = locals
                        .get_mut(arg)
                        .ok_or_else(|| malformed("local slot out of range"))?;
                    if slot.take().is_none() {
                        return Err(Fault::UnboundLocal(body.locals[arg].clone()));
                    }
                }
                Opcode::LoadGlobal | Opcode::LoadName => {
                    let name = table_name(&body.names, arg)?;
                    let value = self
                        .globals
                        .get(name)
                        .cloned()
                        .ok_or_else(|| Fault::NameError(name.to_owned()))?;
                    stack.push(value);
                }
                Opcode::StoreGlobal | Opcode::StoreName => {
                    let name = table_name(&body.names, arg)?.to_owned();
                    let value = pop(&mut stack)?;
                    self.effects
                        .push(format!("{name} = {}", value.clone().into_value()));
                    self.globals.insert(name, value);
                }
                Opcode::DeleteGlobal | Opcode::DeleteName => {
                    let name = table_name(&body.names, arg)?;
                    if self.globals.remove(name).is_none() {
                        return Err(Fault::NameError(name.to_owned()));
                    }
                    self.effects.push(format!("del {name}"));
                }
                Opcode::LoadClosure => {
                    let cell = cells
                        .get(arg)
                        .ok_or_else(|| malformed("cell index out of range"))?;
                    stack.push(Object::Cell(Rc::clone(cell)));
                }
                Opcode::LoadDeref => {
                    let cell = cells
                        .get(arg)
                        .ok_or_else(|| malformed("cell index out of range"))?;
                    let value = cell.borrow().clone().ok_or_else(|| {
                        Fault::NameError(body.deref_name(instr.operand).unwrap_or("?").to_owned())
                    })?;
                    stack.push(value);
                }
                Opcode::StoreDeref => {
                    let value = pop(&mut stack)?;
                    let cell = cells
                        .get(arg)
                        .ok_or_else(|| malformed("cell index out of range"))?;
                    *cell.borrow_mut() = Some(value);
                }
                Opcode::UnaryNot => {
                    let value = pop(&mut stack)?;
                    stack.push(Object::Value(Value::Bool(!value.is_truthy())));
                }
                Opcode::UnaryNegative => {
                    let value = pop(&mut stack)?;
                    let negated = match value.as_value()? {
                        Value::Int(i) => Value::Int(i.checked_neg().ok_or_else(|| {
                            Fault::Unsupported("negation beyond the integer range")
                        })?),
                        Value::Bool(b) => Value::Int(-i64::from(*b)),
                        Value::Float(f) => Value::Float(-f),
                        other => {
                            return Err(Fault::TypeError(format!(
                                "bad operand type for unary -: {}",
                                other.type_name()
                            )));
                        }
                    };
                    stack.push(Object::Value(negated));
                }
                Opcode::CompareOp => {
                    let rhs = pop(&mut stack)?;
                    let lhs = pop(&mut stack)?;
                    let result = compare(instr.operand, lhs.as_value()?, rhs.as_value()?)?;
                    stack.push(Object::Value(result));
                }
                Opcode::BuildTuple => {
                    let items = pop_n(&mut stack, arg)?;
                    stack.push(build_tuple(items)?);
                }
                Opcode::JumpAbsolute | Opcode::JumpForward => {
                    pc = jump_target(&code, position)?;
                }
                Opcode::PopJumpIfFalse | Opcode::PopJumpIfTrue => {
                    let value = pop(&mut stack)?;
                    if value.is_truthy() == (instr.opcode == Opcode::PopJumpIfTrue) {
                        pc = jump_target(&code, position)?;
                    }
                }
                Opcode::JumpIfFalseOrPop | Opcode::JumpIfTrueOrPop => {
                    let truthy = peek(&stack)?.is_truthy();
                    if truthy == (instr.opcode == Opcode::JumpIfTrueOrPop) {
                        pc = jump_target(&code, position)?;
                    } else {
                        pop(&mut stack)?;
                    }
                }
                Opcode::ReturnValue => return pop(&mut stack),
                Opcode::CallFunction => {
                    let args = pop_n(&mut stack, arg)?;
                    let callee = pop(&mut stack)?;
                    let result = self.call_object(callee, args)?;
                    stack.push(result);
                }
                Opcode::MakeFunction => {
                    if instr.operand & !0x08 != 0 {
                        return Err(Fault::Unsupported("MAKE_FUNCTION with defaults"));
                    }
                    let _qualname = pop(&mut stack)?;
                    let nested = match pop(&mut stack)? {
                        Object::Value(Value::Code(nested)) => *nested,
                        _ => return Err(Fault::TypeError("MAKE_FUNCTION needs a code object".into())),
                    };
                    let cells = if instr.operand & 0x08 == 0 {
                        Vec::new()
                    } else {
                        match pop(&mut stack)? {
                            Object::Cells(cells) => cells,
                            Object::Value(Value::Tuple(items)) if items.is_empty() => Vec::new(),
                            _ => return Err(Fault::TypeError("closure must be a tuple of cells".into())),
                        }
                    };
                    stack.push(Object::Function(Rc::new(Closure {
                        body: nested,
                        cells,
                    })));
                }
                opcode => {
                    if let Some(op) = opcode.binary_operator() {
                        let rhs = pop(&mut stack)?;
                        let lhs = pop(&mut stack)?;
                        let result = fold::binary(op, lhs.as_value()?, rhs.as_value()?)
                            .map_err(Fault::Operation)?;
                        stack.push(Object::Value(result));
                    } else {
                        return Err(Fault::Unsupported(opcode.name()));
                    }
                }
            }

            if stack.len() > body.stack_size as usize {
                return Err(Fault::StackOverflow {
                    declared: body.stack_size,
                    reached: stack.len(),
                });
            }
        }
    }

    fn call_object(&mut self, callee: Object, args: Vec<Object>) -> Result<Object, Fault> {
        match callee {
            Object::Function(closure) => self.execute(&closure, args),
            Object::Native(name, f) => {
                let values = args
                    .into_iter()
                    .map(|a| a.as_value().cloned())
                    .collect::<Result<Vec<_>, _>>()?;
                let rendered: Vec<String> = values.iter().map(ToString::to_string).collect();
                self.effects.push(format!("{name}({})", rendered.join(", ")));
                Ok(Object::Value(f(&values)))
            }
            _ => Err(Fault::TypeError("object is not callable".into())),
        }
    }
}

fn malformed(reason: &str) -> Fault {
    Fault::Malformed(reason.to_owned())
}

fn pop(stack: &mut Vec<Object>) -> Result<Object, Fault> {
    stack.pop().ok_or(Fault::StackUnderflow)
}

fn peek(stack: &[Object]) -> Result<&Object, Fault> {
    stack.last().ok_or(Fault::StackUnderflow)
}

fn pop_n(stack: &mut Vec<Object>, count: usize) -> Result<Vec<Object>, Fault> {
    let start = stack
        .len()
        .checked_sub(count)
        .ok_or(Fault::StackUnderflow)?;
    Ok(stack.split_off(start))
}

fn table_name(table: &[String], index: usize) -> Result<&str, Fault> {
    table
        .get(index)
        .map(String::as_str)
        .ok_or_else(|| malformed("name index out of range"))
}

fn jump_target(code: &[Instruction], position: usize) -> Result<usize, Fault> {
    let raw = code[position]
        .raw_target()
        .ok_or_else(|| malformed("not a jump"))?;
    match jumps::resolve(code, raw) {
        Some(target) if code[target].offset == raw => Ok(target),
        _ => Err(Fault::Malformed(format!(
            "jump at position {position} to {raw} lands between instructions"
        ))),
    }
}

fn build_tuple(items: Vec<Object>) -> Result<Object, Fault> {
    if items.iter().all(|i| matches!(i, Object::Cell(_))) && !items.is_empty() {
        let cells = items
            .into_iter()
            .filter_map(|i| match i {
                Object::Cell(cell) => Some(cell),
                _ => None,
            })
            .collect();
        return Ok(Object::Cells(cells));
    }
    let values = items
        .into_iter()
        .map(|i| match i {
            Object::Value(v) => Ok(v),
            _ => Err(Fault::Unsupported("tuples of non-constant objects")),
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Object::Value(Value::Tuple(values)))
}

fn compare(operand: u32, lhs: &Value, rhs: &Value) -> Result<Value, Fault> {
    match CompareKind::from_operand(operand) {
        Some(kind @ (CompareKind::Is | CompareKind::IsNot)) => {
            let singleton = |v: &Value| matches!(v, Value::None | Value::Bool(_) | Value::Ellipsis);
            if !singleton(lhs) && !singleton(rhs) {
                return Err(Fault::Unsupported("identity comparison of non-singletons"));
            }
            Ok(Value::Bool((lhs == rhs) == (kind == CompareKind::Is)))
        }
        _ => fold::compare(operand, lhs, rhs).map_err(Fault::Operation),
    }
}

/// Run `body` with `args` on a fresh interpreter, with `body` bound as a
/// global under its undecorated name so it can call itself.
pub fn run(body: &FunctionBody, args: &[Value]) -> Outcome {
    let name = undecorated_name(body.name());
    Interpreter::new().function(&name, body).call(body, args)
}

/// Optimize `body` with `config`, check that every argument list behaves the
/// same before and after, and return the optimized body.
pub fn assert_same_behavior(
    body: &FunctionBody,
    config: &OptimizerConfig,
    arg_lists: &[&[Value]],
) -> FunctionBody {
    let optimized = try_optimize(body, config)
        .unwrap_or_else(|err| panic!("optimizing {} failed: {err}", body.name()));
    for args in arg_lists {
        let before = run(body, args);
        let after = run(&optimized, args);
        if before != after {
            panic!(
                "Behavior changed for arguments {:?}.\n\nBefore: {:?}\nAfter:  {:?}\n\nOriginal:\n{}\nOptimized:\n{}",
                args,
                before,
                after,
                format_instructions(&decoded(body)),
                format_instructions(&decoded(&optimized))
            );
        }
    }
    optimized
}

/// Assert every jump in `body` lands exactly on an instruction boundary.
pub fn assert_jumps_valid(body: &FunctionBody) {
    let code = decoded(body);
    for (position, instr) in code.iter().enumerate() {
        if instr.opcode.is_jump()
            && let Err(fault) = jump_target(&code, position)
        {
            panic!(
                "Invalid jump in {}: {:?}\n\n{}",
                body.name(),
                fault,
                format_instructions(&code)
            );
        }
    }
}

/// Assert that every non-parameter local, every name and every constant
/// (besides a function's docstring slot) is referenced by some instruction.
pub fn assert_tables_minimal(body: &FunctionBody) {
    let code = decoded(body);
    let used = |kind: OperandKind, index: usize| {
        code.iter()
            .any(|i| i.operand_kind() == kind && i.operand as usize == index)
    };
    for index in 0..body.names.len() {
        assert!(used(OperandKind::NameRef, index), "unused name {}", body.names[index]);
    }
    for index in body.parameter_count()..body.locals.len() {
        assert!(used(OperandKind::LocalSlot, index), "unused local {}", body.locals[index]);
    }
    let first = usize::from(body.is_function());
    for index in first..body.constants.len() {
        assert!(
            used(OperandKind::ConstRef, index),
            "unused constant {}",
            body.constants[index]
        );
    }
}

// ---------------------------------------------------------------------------
// Instruction patterns
// ---------------------------------------------------------------------------

/// Operand matcher used by [`InstructionPattern`].
#[derive(Debug, Clone)]
pub enum Pat<T> {
    Any,
    Exact(T),
    Predicate(fn(&T) -> bool),
}

impl<T: PartialEq> Pat<T> {
    pub fn matches(&self, value: &T) -> bool {
        match self {
            Pat::Any => true,
            Pat::Exact(expected) => value == expected,
            Pat::Predicate(accepts) => accepts(value),
        }
    }
}

/// An exact opcode plus an operand matcher.
#[derive(Debug, Clone)]
pub struct InstructionPattern {
    pub opcode: Opcode,
    pub operand: Pat<u32>,
}

impl InstructionPattern {
    /// `opcode` with any operand.
    pub const fn op(opcode: Opcode) -> Self {
        Self {
            opcode,
            operand: Pat::Any,
        }
    }

    /// `opcode` with exactly `operand`.
    pub const fn with(opcode: Opcode, operand: u32) -> Self {
        Self {
            opcode,
            operand: Pat::Exact(operand),
        }
    }

    pub fn matches(&self, instr: &Instruction) -> bool {
        instr.opcode == self.opcode && self.operand.matches(&instr.operand)
    }
}

/// Position where `pattern` first occurs as a contiguous run.
pub fn find_pattern(instructions: &[Instruction], pattern: &[InstructionPattern]) -> Option<usize> {
    if pattern.is_empty() {
        return Some(0);
    }
    instructions.windows(pattern.len()).position(|window| {
        window
            .iter()
            .zip(pattern)
            .all(|(instr, expected)| expected.matches(instr))
    })
}

/// Panic with both listings unless `pattern` occurs in `instructions`.
pub fn assert_has_pattern(instructions: &[Instruction], pattern: &[InstructionPattern]) {
    if find_pattern(instructions, pattern).is_some() {
        return;
    }
    let wanted: Vec<String> = pattern.iter().map(|p| format!("  {p:?}")).collect();
    panic!(
        "no run matching\n{}\n\nin\n{}",
        wanted.join("\n"),
        format_instructions(instructions)
    );
}

fn format_instructions(instructions: &[Instruction]) -> String {
    instructions
        .iter()
        .map(|i| format!("  {:>5} {} {}", i.offset, i.opcode.name(), i.operand))
        .collect::<Vec<_>>()
        .join("\n")
}

/// How many instructions carry `opcode`.
pub fn count_opcode(instructions: &[Instruction], opcode: Opcode) -> usize {
    instructions.iter().filter(|i| i.opcode == opcode).count()
}

/// Whether any instruction carries `opcode`.
pub fn has_opcode(instructions: &[Instruction], opcode: Opcode) -> bool {
    instructions.iter().any(|i| i.opcode == opcode)
}

/// Byte length of `count` instructions without prefixes.
pub const fn code_len(count: u32) -> u32 {
    count * INSTRUCTION_WIDTH
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assembler_resolves_labels_and_tables() {
        let body = FunctionBuilder::new("f").params(&["n"]).asm(
            "
            LOAD_FAST n
            POP_JUMP_IF_FALSE done
            LOAD_GLOBAL print
            LOAD_CONST 'hi'
            CALL_FUNCTION 1
            POP_TOP
            done:
            LOAD_CONST None
            RETURN_VALUE
            ",
        );
        assert_eq!(
            ops(&body),
            vec![
                (Opcode::LoadFast, 0),
                (Opcode::PopJumpIfFalse, 12),
                (Opcode::LoadGlobal, 0),
                (Opcode::LoadConst, 1),
                (Opcode::CallFunction, 1),
                (Opcode::PopTop, 0),
                (Opcode::LoadConst, 0),
                (Opcode::ReturnValue, 0),
            ]
        );
        assert_eq!(body.names, vec!["print".to_owned()]);
        assert_eq!(body.constants, vec![Value::None, Value::Str("hi".into())]);
        assert_eq!(body.stack_size, 2);
        assert_eq!(body.code.len(), code_len(8) as usize);
    }

    #[test]
    fn test_relative_jumps_and_compare_symbols() {
        let body = FunctionBuilder::new("f").asm(
            "
            LOAD_CONST 1
            LOAD_CONST 2
            COMPARE_OP not in
            JUMP_FORWARD end
            NOP
            end:
            RETURN_VALUE
            ",
        );
        let code = ops(&body);
        assert_eq!(code[2], (Opcode::CompareOp, 7));
        assert_eq!(code[3], (Opcode::JumpForward, 2));
    }

    #[test]
    fn test_literals() {
        assert_eq!(parse_literal("-3"), Some(Value::Int(-3)));
        assert_eq!(parse_literal("2.5"), Some(Value::Float(2.5)));
        assert_eq!(parse_literal("b'ab'"), Some(Value::Bytes(b"ab".to_vec())));
        assert_eq!(parse_literal("\"a b\""), Some(Value::Str("a b".into())));
        assert_eq!(parse_literal("..."), Some(Value::Ellipsis));
        assert_eq!(parse_literal("nope"), None);
    }

    #[test]
    fn test_interpreter_runs_loops_and_natives() {
        let body = FunctionBuilder::new("f").params(&["n"]).asm(
            "
            LOAD_CONST 0
            STORE_FAST total
            top:
            LOAD_FAST n
            POP_JUMP_IF_FALSE done
            LOAD_FAST total
            LOAD_FAST n
            INPLACE_ADD
            STORE_FAST total
            LOAD_FAST n
            LOAD_CONST 1
            INPLACE_SUBTRACT
            STORE_FAST n
            JUMP_ABSOLUTE top
            done:
            LOAD_GLOBAL print
            LOAD_FAST total
            CALL_FUNCTION 1
            POP_TOP
            LOAD_FAST total
            RETURN_VALUE
            ",
        );
        let outcome = run(&body, &[Value::Int(4)]);
        assert_eq!(outcome.result, Ok(Value::Int(10)));
        assert_eq!(outcome.effects, vec!["print(10)".to_owned()]);
    }

    #[test]
    fn test_interpreter_faults() {
        let unbound = FunctionBuilder::new("f").asm("LOAD_FAST x\nRETURN_VALUE");
        assert_eq!(
            run(&unbound, &[]).result,
            Err(Fault::UnboundLocal("x".into()))
        );

        let missing = FunctionBuilder::new("f").asm("LOAD_GLOBAL nothing\nRETURN_VALUE");
        assert_eq!(
            run(&missing, &[]).result,
            Err(Fault::NameError("nothing".into()))
        );

        let mut undersized = FunctionBuilder::new("f").asm("LOAD_CONST 1\nLOAD_CONST 2\nBINARY_ADD\nRETURN_VALUE");
        undersized.stack_size = 1;
        assert_eq!(
            run(&undersized, &[]).result,
            Err(Fault::StackOverflow {
                declared: 1,
                reached: 2
            })
        );

        let spin = FunctionBuilder::new("f").asm("top:\nJUMP_ABSOLUTE top");
        assert_eq!(run(&spin, &[]).result, Err(Fault::StepLimit));
    }

    #[test]
    fn test_recursion_is_bounded() {
        let body = FunctionBuilder::new("f").params(&["n"]).asm(
            "
            LOAD_GLOBAL f
            LOAD_FAST n
            CALL_FUNCTION 1
            RETURN_VALUE
            ",
        );
        assert_eq!(
            run(&body, &[Value::Int(1)]).result,
            Err(Fault::RecursionLimit)
        );
    }

    #[test]
    fn test_instruction_pattern_matching() {
        let instr = Instruction::new(Opcode::LoadConst, 3);
        assert!(InstructionPattern::with(Opcode::LoadConst, 3).matches(&instr));
        assert!(InstructionPattern::op(Opcode::LoadConst).matches(&instr));
        assert!(!InstructionPattern::op(Opcode::LoadFast).matches(&instr));
        let small = InstructionPattern {
            opcode: Opcode::LoadConst,
            operand: Pat::Predicate(|v| *v < 2),
        };
        assert!(!small.matches(&instr));
    }

    #[test]
    fn test_find_pattern() {
        let instructions = vec![
            Instruction::new(Opcode::LoadConst, 0),
            Instruction::new(Opcode::LoadConst, 1),
            Instruction::new(Opcode::BinaryAdd, 0),
            Instruction::new(Opcode::ReturnValue, 0),
        ];
        let pattern = [
            InstructionPattern::op(Opcode::LoadConst),
            InstructionPattern::op(Opcode::BinaryAdd),
        ];
        assert_eq!(find_pattern(&instructions, &pattern), Some(1));
        assert_eq!(count_opcode(&instructions, Opcode::LoadConst), 2);
        assert!(!has_opcode(&instructions, Opcode::LoadFast));
    }
}
