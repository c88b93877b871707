//! Bytecode disassembler.
//!
//! Renders a [`Program`](super::Program) as per-function opcode listings
//! with word addresses and decoded operands.

use super::{decode_number, OpCode, Program};

/// One decoded instruction.
#[derive(Debug, Clone)]
pub struct DisasmOp {
    /// Word offset of the opcode within the function.
    pub address: usize,
    /// Total length in words, operands included.
    pub length: usize,
    pub name: &'static str,
    pub args: String,
}

/// A disassembled function.
#[derive(Debug, Clone)]
pub struct DisasmFunction {
    pub name: String,
    pub opcodes: Vec<DisasmOp>,
}

/// A disassembled program.
#[derive(Debug, Clone)]
pub struct Disassembly {
    pub functions: Vec<DisasmFunction>,
}

/// Disassemble a whole program. Returns `None` on an opcode word the
/// decoder does not know or on truncated operands.
pub fn disassemble(program: &Program) -> Option<Disassembly> {
    let mut functions = Vec::with_capacity(program.functions.len());

    for function in &program.functions {
        let mut opcodes = Vec::new();
        let code = &function.code;
        let mut cursor = 0usize;

        while cursor < code.len() {
            let address = cursor;
            let op = OpCode::from_word(code[cursor])?;
            cursor += 1;

            if cursor + op.operand_words() > code.len() {
                return None;
            }

            let args = match op {
                OpCode::LoadNumber => {
                    let value = decode_number(code[cursor], code[cursor + 1]);
                    cursor += 2;
                    format!("{}", value)
                }
                OpCode::LoadSlot | OpCode::SetSlot => {
                    let slot = code[cursor];
                    cursor += 1;
                    format!("{}", slot)
                }
                OpCode::Call => {
                    let func = code[cursor];
                    let arg_count = code[cursor + 1];
                    cursor += 2;
                    format!("{}, {}", func, arg_count)
                }
                OpCode::Jz | OpCode::Jmp => {
                    let offset = code[cursor] as i32;
                    cursor += 1;
                    // Word address the jump lands on.
                    let target = cursor as i64 + offset as i64;
                    format!("{}, -> {}", offset, target)
                }
                _ => String::new(),
            };

            opcodes.push(DisasmOp {
                address,
                length: cursor - address,
                name: op_name(op),
                args,
            });
        }

        functions.push(DisasmFunction {
            name: function.name.clone(),
            opcodes,
        });
    }

    Some(Disassembly { functions })
}

fn op_name(op: OpCode) -> &'static str {
    match op {
        OpCode::Add => "op_add",
        OpCode::Sub => "op_sub",
        OpCode::Mul => "op_mul",
        OpCode::Div => "op_div",
        OpCode::LoadNumber => "op_load_number",
        OpCode::LoadZero => "op_load_zero",
        OpCode::LoadSlot => "op_load_slot",
        OpCode::Pop => "op_pop",
        OpCode::Return => "op_return",
        OpCode::Call => "op_call",
        OpCode::Jz => "op_jz",
        OpCode::Jmp => "op_jmp",
        OpCode::Gt => "op_gt",
        OpCode::Lt => "op_lt",
        OpCode::Eq => "op_eq",
        OpCode::Ne => "op_ne",
        OpCode::SetSlot => "op_set_slot",
    }
}

impl std::fmt::Display for Disassembly {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for function in &self.functions {
            writeln!(f)?;
            writeln!(f, "Function {}:", function.name)?;

            for op in &function.opcodes {
                if op.args.is_empty() {
                    writeln!(f, "{:04} {:<30}", op.address, op.name)?;
                } else {
                    writeln!(f, "{:04} {:<30} [{}]", op.address, op.name, op.args)?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::{encode_number, Function, FunctionKind};

    #[test]
    fn test_disassemble_listing() {
        let (lo, hi) = encode_number(2.5);
        let code = vec![
            OpCode::LoadNumber as u32,
            lo,
            hi,
            OpCode::LoadSlot as u32,
            0,
            OpCode::Add as u32,
            OpCode::Return as u32,
        ];
        let program = Program {
            functions: vec![Function {
                name: "Main".to_string(),
                code,
                index: 0,
                kind: FunctionKind::Main,
            }],
            global: 0,
            main: 0,
        };

        let disasm = disassemble(&program).unwrap();
        let ops = &disasm.functions[0].opcodes;
        assert_eq!(ops.len(), 4);
        assert_eq!(ops[0].name, "op_load_number");
        assert_eq!(ops[0].args, "2.5");
        assert_eq!(ops[0].address, 0);
        assert_eq!(ops[0].length, 3);
        assert_eq!(ops[1].name, "op_load_slot");
        assert_eq!(ops[1].address, 3);
        assert_eq!(ops[2].name, "op_add");
        assert_eq!(ops[3].name, "op_return");
    }

    #[test]
    fn test_disassemble_rejects_unknown_words() {
        let program = Program {
            functions: vec![Function {
                name: "Main".to_string(),
                code: vec![42],
                index: 0,
                kind: FunctionKind::Main,
            }],
            global: 0,
            main: 0,
        };
        assert!(disassemble(&program).is_none());
    }
}
