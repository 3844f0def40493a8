mod body;
mod display;
mod instruction;
pub mod opcode;
mod value;

pub use body::{
    CO_ASYNC_GENERATOR, CO_COROUTINE, CO_GENERATOR, CO_ITERABLE_COROUTINE, CO_NESTED,
    CO_NEWLOCALS, CO_NOFREE, CO_OPTIMIZED, CO_VARARGS, CO_VARKEYWORDS, FunctionBody, SourceMeta,
    decorate_name, undecorated_name,
};
pub use display::Disassembly;
pub use instruction::{INSTRUCTION_WIDTH, Instruction, decode, encode};
pub use opcode::{Access, BinaryOperator, CompareKind, Opcode, OperandKind, Scope};
pub use value::Value;
