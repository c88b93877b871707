//! The reference bytecode interpreter.
//!
//! Executes the flat `u32` code words of a [`Program`](super::Program) on an
//! f64 operand stack. This is the semantic baseline the JIT is checked
//! against.

use super::{decode_number, OpCode, Program};

/// Maximum operand stack depth.
const STACK_LIMIT: usize = 255;

/// Error type for interpreter execution.
#[derive(Debug, Clone, PartialEq)]
pub enum VmError {
    StackUnderflow,
    StackOverflow,
    InvalidInstruction(u32),
    InvalidSlot(usize),
    InvalidFunction(usize),
    TruncatedCode,
}

impl std::fmt::Display for VmError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VmError::StackUnderflow => write!(f, "stack underflow"),
            VmError::StackOverflow => write!(f, "maximum stack size exceeded"),
            VmError::InvalidInstruction(word) => write!(f, "invalid instruction '{}'", word),
            VmError::InvalidSlot(slot) => write!(f, "invalid frame slot {}", slot),
            VmError::InvalidFunction(index) => write!(f, "invalid function index {}", index),
            VmError::TruncatedCode => write!(f, "code ended without a return"),
        }
    }
}

impl std::error::Error for VmError {}

/// A call frame saved across `call`.
#[derive(Debug)]
struct Frame {
    func: usize,
    pc: usize,
    base: usize,
}

/// The turbine virtual machine.
pub struct Vm {
    stack: Vec<f64>,
    frames: Vec<Frame>,
}

impl Vm {
    pub fn new() -> Self {
        Self {
            stack: Vec::with_capacity(STACK_LIMIT),
            frames: Vec::new(),
        }
    }

    /// Run a program: execute the global scope (its slots stay on the stack
    /// bottom), then `Main`, and return Main's value.
    pub fn run(&mut self, program: &Program) -> Result<f64, VmError> {
        self.stack.clear();
        self.frames.clear();

        self.execute(program, program.global)?;
        self.execute(program, program.main)
    }

    /// Execute one function to its top-level `return`.
    ///
    /// The frame base is the current stack bottom, so global slots populated
    /// by an earlier call remain addressable.
    pub fn execute(&mut self, program: &Program, func_index: usize) -> Result<f64, VmError> {
        let mut func = func_index;
        let mut code: &[u32] = &program
            .functions
            .get(func)
            .ok_or(VmError::InvalidFunction(func))?
            .code;
        let mut pc = 0usize;
        let mut base = 0usize;

        loop {
            let word = *code.get(pc).ok_or(VmError::TruncatedCode)?;
            pc += 1;

            let op = OpCode::from_word(word).ok_or(VmError::InvalidInstruction(word))?;
            match op {
                OpCode::Add => self.arith_op(|a, b| a + b)?,
                OpCode::Sub => self.arith_op(|a, b| a - b)?,
                OpCode::Mul => self.arith_op(|a, b| a * b)?,
                OpCode::Div => self.arith_op(|a, b| a / b)?,
                OpCode::Gt => self.compare_op(|a, b| a > b)?,
                OpCode::Lt => self.compare_op(|a, b| a < b)?,
                OpCode::Eq => self.compare_op(|a, b| a == b)?,
                OpCode::Ne => self.compare_op(|a, b| a != b)?,
                OpCode::LoadNumber => {
                    let lo = *code.get(pc).ok_or(VmError::TruncatedCode)?;
                    let hi = *code.get(pc + 1).ok_or(VmError::TruncatedCode)?;
                    pc += 2;
                    self.push(decode_number(lo, hi))?;
                }
                OpCode::LoadZero => self.push(0.0)?,
                OpCode::LoadSlot => {
                    let slot = *code.get(pc).ok_or(VmError::TruncatedCode)? as usize;
                    pc += 1;
                    let value = *self
                        .stack
                        .get(base + slot)
                        .ok_or(VmError::InvalidSlot(slot))?;
                    self.push(value)?;
                }
                OpCode::SetSlot => {
                    let slot = *code.get(pc).ok_or(VmError::TruncatedCode)? as usize;
                    pc += 1;
                    let value = *self.stack.last().ok_or(VmError::StackUnderflow)?;
                    *self
                        .stack
                        .get_mut(base + slot)
                        .ok_or(VmError::InvalidSlot(slot))? = value;
                }
                OpCode::Pop => {
                    self.pop()?;
                }
                OpCode::Return => {
                    let return_value = self.pop()?;

                    let Some(frame) = self.frames.pop() else {
                        return Ok(return_value);
                    };

                    self.stack.truncate(base);
                    func = frame.func;
                    code = &program.functions[func].code;
                    pc = frame.pc;
                    base = frame.base;

                    self.push(return_value)?;
                }
                OpCode::Call => {
                    let callee = *code.get(pc).ok_or(VmError::TruncatedCode)? as usize;
                    let arg_count = *code.get(pc + 1).ok_or(VmError::TruncatedCode)? as usize;
                    pc += 2;

                    self.frames.push(Frame { func, pc, base });

                    func = callee;
                    code = &program
                        .functions
                        .get(func)
                        .ok_or(VmError::InvalidFunction(func))?
                        .code;
                    pc = 0;
                    base = self
                        .stack
                        .len()
                        .checked_sub(arg_count)
                        .ok_or(VmError::StackUnderflow)?;
                }
                OpCode::Jz => {
                    let offset = *code.get(pc).ok_or(VmError::TruncatedCode)? as i32;
                    pc += 1;
                    let top = *self.stack.last().ok_or(VmError::StackUnderflow)?;
                    if top == 0.0 {
                        pc = (pc as i64 + offset as i64) as usize;
                    }
                }
                OpCode::Jmp => {
                    let offset = *code.get(pc).ok_or(VmError::TruncatedCode)? as i32;
                    pc += 1;
                    pc = (pc as i64 + offset as i64) as usize;
                }
            }
        }
    }

    fn push(&mut self, value: f64) -> Result<(), VmError> {
        if self.stack.len() >= STACK_LIMIT {
            return Err(VmError::StackOverflow);
        }
        self.stack.push(value);
        Ok(())
    }

    fn pop(&mut self) -> Result<f64, VmError> {
        self.stack.pop().ok_or(VmError::StackUnderflow)
    }

    fn arith_op(&mut self, op: impl Fn(f64, f64) -> f64) -> Result<(), VmError> {
        let b = self.pop()?;
        let a = self.pop()?;
        self.push(op(a, b))
    }

    fn compare_op(&mut self, op: impl Fn(f64, f64) -> bool) -> Result<(), VmError> {
        let b = self.pop()?;
        let a = self.pop()?;
        self.push(if op(a, b) { 1.0 } else { 0.0 })
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}
