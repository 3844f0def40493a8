use super::Opcode;
use super::opcode::OperandKind;
use crate::{Error, Result};

/// Bytes per code unit: one opcode byte and one argument byte.
pub const INSTRUCTION_WIDTH: u32 = 2;

/// One decoded instruction.
///
/// `offset` is the byte offset the instruction had in the buffer it was
/// decoded from. Passes never change it; instructions they synthesize take
/// the offset of the instruction they replace, so offsets stay
/// non-decreasing along the list and jump targets expressed as byte offsets
/// can be resolved against them until the jump fixup runs.
///
/// `prefixes` counts the `EXTENDED_ARG` units folded into the instruction.
/// Jumps land on `offset`, the first prefix, but the VM measures relative
/// jumps from the end of the whole prefixed unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction {
    pub opcode: Opcode,
    pub operand: u32,
    pub offset: u32,
    pub prefixes: u32,
}

impl Instruction {
    #[must_use]
    pub const fn new(opcode: Opcode, operand: u32) -> Self {
        Self {
            opcode,
            operand,
            offset: 0,
            prefixes: 0,
        }
    }

    #[must_use]
    pub const fn at(mut self, offset: u32) -> Self {
        self.offset = offset;
        self
    }

    #[must_use]
    pub const fn operand_kind(&self) -> OperandKind {
        self.opcode.operand_kind()
    }

    /// Byte offset just past the instruction and its prefixes.
    #[must_use]
    pub fn end(&self) -> Option<u32> {
        let units = self.prefixes.checked_add(1)?;
        self.offset
            .checked_add(units.checked_mul(INSTRUCTION_WIDTH)?)
    }

    /// Absolute byte offset this jump lands on, measured in the buffer the
    /// instruction was decoded from.
    #[must_use]
    pub fn raw_target(&self) -> Option<u32> {
        match self.operand_kind() {
            OperandKind::AbsoluteJump => Some(self.operand),
            OperandKind::RelativeJump => self.end()?.checked_add(self.operand),
            _ => None,
        }
    }

    /// Net stack effect, with `1` standing in for effects that cannot be
    /// computed.
    #[must_use]
    pub fn stack_effect_or_default(&self) -> i32 {
        self.opcode.stack_effect(self.operand, None).unwrap_or(1)
    }
}

/// Decode a flat word-code buffer into instructions tagged with their byte
/// offsets.
///
/// `EXTENDED_ARG` prefixes are folded into the operand of the instruction
/// they precede, which keeps the offset of the first prefix.
pub fn decode(code: &[u8]) -> Result<Vec<Instruction>> {
    if code.len() % INSTRUCTION_WIDTH as usize != 0 {
        return Err(Error::MalformedInstructionStream {
            offset: code.len() - 1,
            reason: "truncated instruction (odd trailing byte)".into(),
        });
    }

    let mut instructions = Vec::with_capacity(code.len() / 2);
    let mut extended: u64 = 0;
    let mut prefix_offset: Option<usize> = None;
    let mut prefixes = 0;

    for (index, pair) in code.chunks_exact(INSTRUCTION_WIDTH as usize).enumerate() {
        let offset = index * INSTRUCTION_WIDTH as usize;
        let opcode =
            Opcode::from_u8(pair[0]).ok_or_else(|| Error::MalformedInstructionStream {
                offset,
                reason: format!("unknown opcode {}", pair[0]),
            })?;
        let operand = (extended << 8) | u64::from(pair[1]);
        if operand > u64::from(u32::MAX) {
            return Err(Error::MalformedInstructionStream {
                offset,
                reason: "more than three EXTENDED_ARG prefixes".into(),
            });
        }

        if opcode == Opcode::ExtendedArg {
            extended = operand;
            prefix_offset.get_or_insert(offset);
            prefixes += 1;
            continue;
        }

        let start = prefix_offset.take().unwrap_or(offset);
        instructions.push(Instruction {
            opcode,
            operand: operand as u32,
            offset: start as u32,
            prefixes,
        });
        extended = 0;
        prefixes = 0;
    }

    if let Some(offset) = prefix_offset {
        return Err(Error::MalformedInstructionStream {
            offset,
            reason: "EXTENDED_ARG without a following instruction".into(),
        });
    }

    Ok(instructions)
}

/// Encode instructions in list order.
///
/// Jump operands must be in canonical form: the target's list position times
/// [`INSTRUCTION_WIDTH`], relative jumps measured from the following
/// position. When operands need `EXTENDED_ARG` prefixes the extra code units
/// shift every later instruction, so jump operands are re-laid out until the
/// prefix counts stop growing.
pub fn encode(instructions: &[Instruction]) -> Result<Vec<u8>> {
    let targets = canonical_targets(instructions)?;
    let mut operands: Vec<u32> = instructions.iter().map(|i| i.operand).collect();
    let mut widths: Vec<u32> = instructions
        .iter()
        .map(|i| {
            if i.opcode.is_jump() {
                1
            } else {
                units_for(i.operand)
            }
        })
        .collect();

    if widths.iter().any(|&w| w > 1) || operands.iter().any(|&op| op > 0xFF) {
        loop {
            let starts = unit_starts(&widths);
            let mut grew = false;
            for (position, target) in targets.iter().enumerate() {
                let Some(target) = *target else { continue };
                let units = match instructions[position].operand_kind() {
                    OperandKind::AbsoluteJump => starts[target],
                    _ => starts[target] - (starts[position] + widths[position]),
                };
                let operand = scaled(units, position, instructions[position].opcode)?;
                operands[position] = operand;
                let width = units_for(operand);
                if width > widths[position] {
                    widths[position] = width;
                    grew = true;
                }
            }
            if !grew {
                break;
            }
        }
    }

    let total: u32 = widths.iter().sum();
    let mut code = Vec::with_capacity(total as usize * INSTRUCTION_WIDTH as usize);
    for (instr, (&operand, &width)) in instructions.iter().zip(operands.iter().zip(&widths)) {
        for shift in (1..width).rev() {
            code.push(Opcode::ExtendedArg as u8);
            code.push((operand >> (8 * shift)) as u8);
        }
        code.push(instr.opcode as u8);
        code.push(operand as u8);
    }
    Ok(code)
}

/// Target list position of every jump, read from canonical operands.
fn canonical_targets(instructions: &[Instruction]) -> Result<Vec<Option<usize>>> {
    instructions
        .iter()
        .enumerate()
        .map(|(position, instr)| {
            let units = (instr.operand / INSTRUCTION_WIDTH) as usize;
            let target = match instr.operand_kind() {
                OperandKind::AbsoluteJump => units,
                OperandKind::RelativeJump => position + 1 + units,
                _ => return Ok(None),
            };
            if target >= instructions.len() {
                return Err(Error::UnresolvedJumpTarget {
                    position,
                    target: instr.operand,
                });
            }
            Ok(Some(target))
        })
        .collect()
}

fn unit_starts(widths: &[u32]) -> Vec<u32> {
    let mut starts = Vec::with_capacity(widths.len() + 1);
    let mut running = 0;
    for &w in widths {
        starts.push(running);
        running += w;
    }
    starts.push(running);
    starts
}

fn scaled(units: u32, position: usize, opcode: Opcode) -> Result<u32> {
    units
        .checked_mul(INSTRUCTION_WIDTH)
        .ok_or(Error::OperandOverflow {
            position,
            opcode: opcode.name(),
            operand: u64::from(units) * u64::from(INSTRUCTION_WIDTH),
        })
}

/// Code units needed to carry `operand`, prefixes included.
const fn units_for(operand: u32) -> u32 {
    match operand {
        0..=0xFF => 1,
        0x100..=0xFFFF => 2,
        0x1_0000..=0xFF_FFFF => 3,
        _ => 4,
    }
}
