use std::fmt;

/// First opcode that consumes its argument byte.
pub const HAVE_ARGUMENT: u8 = 90;

macro_rules! opcodes {
    ($($variant:ident = $value:literal => $name:literal,)*) => {
        /// Opcodes of the 3.7 word-code stack machine.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u8)]
        pub enum Opcode {
            $($variant = $value,)*
        }

        impl Opcode {
            /// All opcodes in numeric order.
            pub const ALL: &'static [Opcode] = &[$(Opcode::$variant,)*];

            #[must_use]
            pub const fn from_u8(byte: u8) -> Option<Self> {
                match byte {
                    $($value => Some(Self::$variant),)*
                    _ => None,
                }
            }

            #[must_use]
            pub const fn name(self) -> &'static str {
                match self {
                    $(Self::$variant => $name,)*
                }
            }

            #[must_use]
            pub fn from_name(name: &str) -> Option<Self> {
                match name {
                    $($name => Some(Self::$variant),)*
                    _ => None,
                }
            }
        }
    };
}

opcodes! {
    PopTop = 1 => "POP_TOP",
    RotTwo = 2 => "ROT_TWO",
    RotThree = 3 => "ROT_THREE",
    DupTop = 4 => "DUP_TOP",
    DupTopTwo = 5 => "DUP_TOP_TWO",
    Nop = 9 => "NOP",
    UnaryPositive = 10 => "UNARY_POSITIVE",
    UnaryNegative = 11 => "UNARY_NEGATIVE",
    UnaryNot = 12 => "UNARY_NOT",
    UnaryInvert = 15 => "UNARY_INVERT",
    BinaryMatrixMultiply = 16 => "BINARY_MATRIX_MULTIPLY",
    InplaceMatrixMultiply = 17 => "INPLACE_MATRIX_MULTIPLY",
    BinaryPower = 19 => "BINARY_POWER",
    BinaryMultiply = 20 => "BINARY_MULTIPLY",
    BinaryModulo = 22 => "BINARY_MODULO",
    BinaryAdd = 23 => "BINARY_ADD",
    BinarySubtract = 24 => "BINARY_SUBTRACT",
    BinarySubscr = 25 => "BINARY_SUBSCR",
    BinaryFloorDivide = 26 => "BINARY_FLOOR_DIVIDE",
    BinaryTrueDivide = 27 => "BINARY_TRUE_DIVIDE",
    InplaceFloorDivide = 28 => "INPLACE_FLOOR_DIVIDE",
    InplaceTrueDivide = 29 => "INPLACE_TRUE_DIVIDE",
    GetAiter = 50 => "GET_AITER",
    GetAnext = 51 => "GET_ANEXT",
    BeforeAsyncWith = 52 => "BEFORE_ASYNC_WITH",
    InplaceAdd = 55 => "INPLACE_ADD",
    InplaceSubtract = 56 => "INPLACE_SUBTRACT",
    InplaceMultiply = 57 => "INPLACE_MULTIPLY",
    InplaceModulo = 59 => "INPLACE_MODULO",
    StoreSubscr = 60 => "STORE_SUBSCR",
    DeleteSubscr = 61 => "DELETE_SUBSCR",
    BinaryLshift = 62 => "BINARY_LSHIFT",
    BinaryRshift = 63 => "BINARY_RSHIFT",
    BinaryAnd = 64 => "BINARY_AND",
    BinaryXor = 65 => "BINARY_XOR",
    BinaryOr = 66 => "BINARY_OR",
    InplacePower = 67 => "INPLACE_POWER",
    GetIter = 68 => "GET_ITER",
    GetYieldFromIter = 69 => "GET_YIELD_FROM_ITER",
    PrintExpr = 70 => "PRINT_EXPR",
    LoadBuildClass = 71 => "LOAD_BUILD_CLASS",
    YieldFrom = 72 => "YIELD_FROM",
    GetAwaitable = 73 => "GET_AWAITABLE",
    InplaceLshift = 75 => "INPLACE_LSHIFT",
    InplaceRshift = 76 => "INPLACE_RSHIFT",
    InplaceAnd = 77 => "INPLACE_AND",
    InplaceXor = 78 => "INPLACE_XOR",
    InplaceOr = 79 => "INPLACE_OR",
    BreakLoop = 80 => "BREAK_LOOP",
    WithCleanupStart = 81 => "WITH_CLEANUP_START",
    WithCleanupFinish = 82 => "WITH_CLEANUP_FINISH",
    ReturnValue = 83 => "RETURN_VALUE",
    ImportStar = 84 => "IMPORT_STAR",
    SetupAnnotations = 85 => "SETUP_ANNOTATIONS",
    YieldValue = 86 => "YIELD_VALUE",
    PopBlock = 87 => "POP_BLOCK",
    EndFinally = 88 => "END_FINALLY",
    PopExcept = 89 => "POP_EXCEPT",
    StoreName = 90 => "STORE_NAME",
    DeleteName = 91 => "DELETE_NAME",
    UnpackSequence = 92 => "UNPACK_SEQUENCE",
    ForIter = 93 => "FOR_ITER",
    UnpackEx = 94 => "UNPACK_EX",
    StoreAttr = 95 => "STORE_ATTR",
    DeleteAttr = 96 => "DELETE_ATTR",
    StoreGlobal = 97 => "STORE_GLOBAL",
    DeleteGlobal = 98 => "DELETE_GLOBAL",
    LoadConst = 100 => "LOAD_CONST",
    LoadName = 101 => "LOAD_NAME",
    BuildTuple = 102 => "BUILD_TUPLE",
    BuildList = 103 => "BUILD_LIST",
    BuildSet = 104 => "BUILD_SET",
    BuildMap = 105 => "BUILD_MAP",
    LoadAttr = 106 => "LOAD_ATTR",
    CompareOp = 107 => "COMPARE_OP",
    ImportName = 108 => "IMPORT_NAME",
    ImportFrom = 109 => "IMPORT_FROM",
    JumpForward = 110 => "JUMP_FORWARD",
    JumpIfFalseOrPop = 111 => "JUMP_IF_FALSE_OR_POP",
    JumpIfTrueOrPop = 112 => "JUMP_IF_TRUE_OR_POP",
    JumpAbsolute = 113 => "JUMP_ABSOLUTE",
    PopJumpIfFalse = 114 => "POP_JUMP_IF_FALSE",
    PopJumpIfTrue = 115 => "POP_JUMP_IF_TRUE",
    LoadGlobal = 116 => "LOAD_GLOBAL",
    ContinueLoop = 119 => "CONTINUE_LOOP",
    SetupLoop = 120 => "SETUP_LOOP",
    SetupExcept = 121 => "SETUP_EXCEPT",
    SetupFinally = 122 => "SETUP_FINALLY",
    LoadFast = 124 => "LOAD_FAST",
    StoreFast = 125 => "STORE_FAST",
    DeleteFast = 126 => "DELETE_FAST",
    RaiseVarargs = 130 => "RAISE_VARARGS",
    CallFunction = 131 => "CALL_FUNCTION",
    MakeFunction = 132 => "MAKE_FUNCTION",
    BuildSlice = 133 => "BUILD_SLICE",
    LoadClosure = 135 => "LOAD_CLOSURE",
    LoadDeref = 136 => "LOAD_DEREF",
    StoreDeref = 137 => "STORE_DEREF",
    DeleteDeref = 138 => "DELETE_DEREF",
    CallFunctionKw = 141 => "CALL_FUNCTION_KW",
    CallFunctionEx = 142 => "CALL_FUNCTION_EX",
    SetupWith = 143 => "SETUP_WITH",
    ExtendedArg = 144 => "EXTENDED_ARG",
    ListAppend = 145 => "LIST_APPEND",
    SetAdd = 146 => "SET_ADD",
    MapAdd = 147 => "MAP_ADD",
    LoadClassderef = 148 => "LOAD_CLASSDEREF",
    BuildListUnpack = 149 => "BUILD_LIST_UNPACK",
    BuildMapUnpack = 150 => "BUILD_MAP_UNPACK",
    BuildMapUnpackWithCall = 151 => "BUILD_MAP_UNPACK_WITH_CALL",
    BuildTupleUnpack = 152 => "BUILD_TUPLE_UNPACK",
    BuildSetUnpack = 153 => "BUILD_SET_UNPACK",
    SetupAsyncWith = 154 => "SETUP_ASYNC_WITH",
    FormatValue = 155 => "FORMAT_VALUE",
    BuildConstKeyMap = 156 => "BUILD_CONST_KEY_MAP",
    BuildString = 157 => "BUILD_STRING",
    BuildTupleUnpackWithCall = 158 => "BUILD_TUPLE_UNPACK_WITH_CALL",
    LoadMethod = 160 => "LOAD_METHOD",
    CallMethod = 161 => "CALL_METHOD",
}

/// What an instruction's operand refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandKind {
    /// The argument byte is ignored.
    None,
    /// A plain count, flag set or comparison kind.
    Immediate,
    /// Index into the names table.
    NameRef,
    /// Index into the local-variable table.
    LocalSlot,
    /// Index into the constants table.
    ConstRef,
    /// Index into cell variables followed by free variables.
    FreeRef,
    /// Absolute byte offset of the target.
    AbsoluteJump,
    /// Byte distance from the next instruction to the target.
    RelativeJump,
}

/// Scope a variable access goes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    Fast,
    Name,
    Global,
    Deref,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Load,
    Store,
    Delete,
}

/// Binary operators reachable from `BINARY_*` and `INPLACE_*` opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOperator {
    Power,
    Multiply,
    MatrixMultiply,
    Modulo,
    Add,
    Subtract,
    Subscript,
    FloorDivide,
    TrueDivide,
    LeftShift,
    RightShift,
    And,
    Xor,
    Or,
}

impl BinaryOperator {
    #[must_use]
    pub const fn symbol(self) -> &'static str {
        match self {
            Self::Power => "**",
            Self::Multiply => "*",
            Self::MatrixMultiply => "@",
            Self::Modulo => "%",
            Self::Add => "+",
            Self::Subtract => "-",
            Self::Subscript => "[]",
            Self::FloorDivide => "//",
            Self::TrueDivide => "/",
            Self::LeftShift => "<<",
            Self::RightShift => ">>",
            Self::And => "&",
            Self::Xor => "^",
            Self::Or => "|",
        }
    }
}

/// Comparator selected by the `COMPARE_OP` argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareKind {
    Lt,
    Le,
    Eq,
    Ne,
    Gt,
    Ge,
    In,
    NotIn,
    Is,
    IsNot,
    ExceptionMatch,
}

impl CompareKind {
    pub const SYMBOLS: [&'static str; 11] = [
        "<",
        "<=",
        "==",
        "!=",
        ">",
        ">=",
        "in",
        "not in",
        "is",
        "is not",
        "exception match",
    ];

    #[must_use]
    pub const fn from_operand(operand: u32) -> Option<Self> {
        Some(match operand {
            0 => Self::Lt,
            1 => Self::Le,
            2 => Self::Eq,
            3 => Self::Ne,
            4 => Self::Gt,
            5 => Self::Ge,
            6 => Self::In,
            7 => Self::NotIn,
            8 => Self::Is,
            9 => Self::IsNot,
            10 => Self::ExceptionMatch,
            _ => return None,
        })
    }

    #[must_use]
    pub const fn symbol(self) -> &'static str {
        Self::SYMBOLS[self as usize]
    }

    #[must_use]
    pub fn from_symbol(symbol: &str) -> Option<Self> {
        let index = Self::SYMBOLS.iter().position(|s| *s == symbol)?;
        Self::from_operand(index as u32)
    }
}

impl Opcode {
    #[must_use]
    pub const fn has_argument(self) -> bool {
        self as u8 >= HAVE_ARGUMENT
    }

    #[must_use]
    pub const fn operand_kind(self) -> OperandKind {
        use Opcode::*;
        match self {
            StoreName | DeleteName | StoreAttr | DeleteAttr | StoreGlobal | DeleteGlobal
            | LoadName | LoadAttr | ImportName | ImportFrom | LoadGlobal | LoadMethod => {
                OperandKind::NameRef
            }
            LoadFast | StoreFast | DeleteFast => OperandKind::LocalSlot,
            LoadConst => OperandKind::ConstRef,
            LoadClosure | LoadDeref | StoreDeref | DeleteDeref | LoadClassderef => {
                OperandKind::FreeRef
            }
            JumpIfFalseOrPop | JumpIfTrueOrPop | JumpAbsolute | PopJumpIfFalse
            | PopJumpIfTrue | ContinueLoop => OperandKind::AbsoluteJump,
            ForIter | JumpForward | SetupLoop | SetupExcept | SetupFinally | SetupWith
            | SetupAsyncWith => OperandKind::RelativeJump,
            _ if self.has_argument() => OperandKind::Immediate,
            _ => OperandKind::None,
        }
    }

    #[must_use]
    pub const fn is_jump(self) -> bool {
        matches!(
            self.operand_kind(),
            OperandKind::AbsoluteJump | OperandKind::RelativeJump
        )
    }

    /// Jumps that never fall through to the next instruction.
    #[must_use]
    pub const fn is_unconditional_jump(self) -> bool {
        matches!(
            self,
            Self::JumpAbsolute | Self::JumpForward | Self::ContinueLoop
        )
    }

    /// Instructions after which execution never reaches the next position.
    #[must_use]
    pub const fn is_terminating(self) -> bool {
        self.is_unconditional_jump()
            || matches!(
                self,
                Self::ReturnValue | Self::RaiseVarargs | Self::BreakLoop
            )
    }

    /// Instructions that push or pop entries of the block stack.
    #[must_use]
    pub const fn uses_block_stack(self) -> bool {
        matches!(
            self,
            Self::SetupLoop
                | Self::SetupExcept
                | Self::SetupFinally
                | Self::SetupWith
                | Self::SetupAsyncWith
                | Self::PopBlock
                | Self::PopExcept
                | Self::EndFinally
                | Self::BreakLoop
                | Self::ContinueLoop
                | Self::ForIter
        )
    }

    /// Variable scope and access mode, for instructions that read or write a
    /// variable.
    #[must_use]
    pub const fn variable_access(self) -> Option<(Scope, Access)> {
        use Opcode::*;
        Some(match self {
            LoadFast => (Scope::Fast, Access::Load),
            StoreFast => (Scope::Fast, Access::Store),
            DeleteFast => (Scope::Fast, Access::Delete),
            LoadName => (Scope::Name, Access::Load),
            StoreName => (Scope::Name, Access::Store),
            DeleteName => (Scope::Name, Access::Delete),
            LoadGlobal => (Scope::Global, Access::Load),
            StoreGlobal => (Scope::Global, Access::Store),
            DeleteGlobal => (Scope::Global, Access::Delete),
            LoadDeref | LoadClassderef | LoadClosure => (Scope::Deref, Access::Load),
            StoreDeref => (Scope::Deref, Access::Store),
            DeleteDeref => (Scope::Deref, Access::Delete),
            _ => return None,
        })
    }

    #[must_use]
    pub const fn binary_operator(self) -> Option<BinaryOperator> {
        use Opcode::*;
        Some(match self {
            BinaryPower | InplacePower => BinaryOperator::Power,
            BinaryMultiply | InplaceMultiply => BinaryOperator::Multiply,
            BinaryMatrixMultiply | InplaceMatrixMultiply => BinaryOperator::MatrixMultiply,
            BinaryModulo | InplaceModulo => BinaryOperator::Modulo,
            BinaryAdd | InplaceAdd => BinaryOperator::Add,
            BinarySubtract | InplaceSubtract => BinaryOperator::Subtract,
            BinarySubscr => BinaryOperator::Subscript,
            BinaryFloorDivide | InplaceFloorDivide => BinaryOperator::FloorDivide,
            BinaryTrueDivide | InplaceTrueDivide => BinaryOperator::TrueDivide,
            BinaryLshift | InplaceLshift => BinaryOperator::LeftShift,
            BinaryRshift | InplaceRshift => BinaryOperator::RightShift,
            BinaryAnd | InplaceAnd => BinaryOperator::And,
            BinaryXor | InplaceXor => BinaryOperator::Xor,
            BinaryOr | InplaceOr => BinaryOperator::Or,
            _ => return None,
        })
    }

    /// Net stack effect of executing this instruction.
    ///
    /// For branching instructions `jump` selects the taken (`Some(true)`) or
    /// fall-through (`Some(false)`) edge; `None` yields the larger of the two.
    /// Returns `None` when the effect cannot be computed.
    #[must_use]
    pub fn stack_effect(self, operand: u32, jump: Option<bool>) -> Option<i32> {
        use Opcode::*;
        let arg = i32::try_from(operand).ok();
        let branch = |taken: i32, fallthrough: i32| match jump {
            Some(true) => taken,
            Some(false) => fallthrough,
            None => taken.max(fallthrough),
        };
        Some(match self {
            Nop | RotTwo | RotThree | UnaryPositive | UnaryNegative | UnaryNot
            | UnaryInvert | GetIter | GetYieldFromIter | SetupAnnotations | YieldValue
            | PopBlock | PopExcept | BreakLoop | DeleteName | DeleteGlobal | LoadAttr
            | JumpForward | JumpAbsolute | ContinueLoop | SetupLoop | DeleteFast
            | DeleteDeref | GetAwaitable | GetAiter => 0,

            DupTop | LoadBuildClass | LoadConst | LoadName | LoadGlobal | LoadFast
            | LoadClosure | LoadDeref | LoadClassderef | ImportFrom | BeforeAsyncWith
            | GetAnext | LoadMethod | WithCleanupStart => 1,
            DupTopTwo => 2,

            PopTop | PrintExpr | ReturnValue | ImportStar | YieldFrom | StoreName
            | StoreGlobal | StoreFast | StoreDeref | DeleteAttr | CompareOp | ImportName
            | ListAppend | SetAdd | EndFinally | WithCleanupFinish => -1,
            MapAdd | StoreAttr | DeleteSubscr => -2,
            StoreSubscr => -3,

            BinaryMatrixMultiply | InplaceMatrixMultiply | BinaryPower | BinaryMultiply
            | BinaryModulo | BinaryAdd | BinarySubtract | BinarySubscr | BinaryFloorDivide
            | BinaryTrueDivide | InplaceFloorDivide | InplaceTrueDivide | InplaceAdd
            | InplaceSubtract | InplaceMultiply | InplaceModulo | BinaryLshift
            | BinaryRshift | BinaryAnd | BinaryXor | BinaryOr | InplacePower
            | InplaceLshift | InplaceRshift | InplaceAnd | InplaceXor | InplaceOr => -1,

            UnpackSequence => arg? - 1,
            UnpackEx => i32::try_from((operand & 0xFF) + (operand >> 8)).ok()?,
            BuildTuple | BuildList | BuildSet | BuildString | BuildListUnpack
            | BuildTupleUnpack | BuildTupleUnpackWithCall | BuildSetUnpack
            | BuildMapUnpack | BuildMapUnpackWithCall => 1 - arg?,
            BuildMap => 1 - arg?.checked_mul(2)?,
            BuildConstKeyMap => -arg?,
            RaiseVarargs => -arg?,
            CallFunction => -arg?,
            CallFunctionKw => -arg? - 1,
            CallMethod => -arg? - 1,
            CallFunctionEx => -1 - i32::from(operand & 0x01 != 0),
            MakeFunction => -1 - (operand & 0x0F).count_ones() as i32,
            BuildSlice => {
                if operand == 3 {
                    -2
                } else {
                    -1
                }
            }
            FormatValue => {
                if operand & 0x04 == 0x04 {
                    -1
                } else {
                    0
                }
            }

            ForIter => branch(-1, 1),
            JumpIfFalseOrPop | JumpIfTrueOrPop => branch(0, -1),
            PopJumpIfFalse | PopJumpIfTrue => -1,
            SetupExcept | SetupFinally => branch(6, 0),
            SetupWith => branch(6, 1),
            SetupAsyncWith => branch(5, 0),

            ExtendedArg => return None,
        })
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl TryFrom<u8> for Opcode {
    type Error = u8;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        Self::from_u8(byte).ok_or(byte)
    }
}
