#[allow(clippy::module_inception)]
mod vm;
pub mod disasm;

pub use vm::{Vm, VmError};

/// Bytecode opcodes. The numeric values are part of the code word format
/// shared between the parser, interpreter, disassembler and decompiler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum OpCode {
    Add = 0,
    Sub = 1,
    Mul = 2,
    Div = 3,
    LoadNumber = 4,
    LoadZero = 5,
    LoadSlot = 6,
    Pop = 7,
    Return = 8,
    Call = 9,
    Jz = 10,
    Jmp = 11,
    Gt = 12,
    Lt = 13,
    Eq = 14,
    Ne = 15,
    SetSlot = 16,
}

impl OpCode {
    /// Decode a raw code word into an opcode.
    pub fn from_word(word: u32) -> Option<OpCode> {
        match word {
            0 => Some(OpCode::Add),
            1 => Some(OpCode::Sub),
            2 => Some(OpCode::Mul),
            3 => Some(OpCode::Div),
            4 => Some(OpCode::LoadNumber),
            5 => Some(OpCode::LoadZero),
            6 => Some(OpCode::LoadSlot),
            7 => Some(OpCode::Pop),
            8 => Some(OpCode::Return),
            9 => Some(OpCode::Call),
            10 => Some(OpCode::Jz),
            11 => Some(OpCode::Jmp),
            12 => Some(OpCode::Gt),
            13 => Some(OpCode::Lt),
            14 => Some(OpCode::Eq),
            15 => Some(OpCode::Ne),
            16 => Some(OpCode::SetSlot),
            _ => None,
        }
    }

    /// Number of operand words following the opcode word.
    pub fn operand_words(self) -> usize {
        match self {
            OpCode::LoadNumber | OpCode::Call => 2,
            OpCode::LoadSlot | OpCode::SetSlot | OpCode::Jz | OpCode::Jmp => 1,
            _ => 0,
        }
    }
}

/// What role a function plays in a program.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionKind {
    /// The synthetic top-level scope, run once before `Main`.
    Global,
    /// The program entry point.
    Main,
    /// Any other user-defined function.
    Virtual,
}

/// A compiled function: a name plus a flat array of 32-bit code words.
#[derive(Debug, Clone)]
pub struct Function {
    pub name: String,
    pub code: Vec<u32>,
    pub index: usize,
    pub kind: FunctionKind,
}

/// A compiled program.
#[derive(Debug, Clone)]
pub struct Program {
    pub functions: Vec<Function>,
    /// Index of the synthetic global scope (always 0).
    pub global: usize,
    /// Index of `Main`.
    pub main: usize,
}

/// Split an f64 into the two code words `load_number` carries, low half
/// first.
pub fn encode_number(value: f64) -> (u32, u32) {
    let bits = value.to_bits();
    (bits as u32, (bits >> 32) as u32)
}

/// Reassemble an f64 from the two `load_number` operand words.
pub fn decode_number(lo: u32, hi: u32) -> f64 {
    f64::from_bits(((hi as u64) << 32) | lo as u64)
}
