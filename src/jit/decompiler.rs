//! Bytecode decompiler.
//!
//! Recovers an AST forest from a function's flat code words by symbolic
//! stack execution: a compile-time stack mirrors what the interpreter's
//! operand stack would hold, but each entry carries the identifier of the
//! value and the id of the node that produced it. Forward `jz` ranges are
//! parsed recursively into `If`/`While` list nodes; a nested backward `jmp`
//! marks the range as a loop body.

use std::collections::HashSet;

use super::ast::{AstArena, AstNode, NodeId, NodeKind};
use crate::vm::{decode_number, Function, OpCode};

/// Error type for decompilation. `at` is the word offset of the offending
/// instruction within the function.
#[derive(Debug, Clone, PartialEq)]
pub enum DecompileError {
    UnknownOpcode { word: u32, at: usize },
    UnsupportedInstruction { op: &'static str, at: usize },
    StackUnderflow { at: usize },
    NodeNotFound { at: usize },
    InvalidSlot { slot: usize, at: usize },
    BackwardJz { at: usize },
    MissingCondPop { at: usize },
    TruncatedCode { at: usize },
}

impl std::fmt::Display for DecompileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecompileError::UnknownOpcode { word, at } => {
                write!(f, "unknown opcode {} at word {}", word, at)
            }
            DecompileError::UnsupportedInstruction { op, at } => {
                write!(f, "instruction '{}' at word {} is not decompilable", op, at)
            }
            DecompileError::StackUnderflow { at } => {
                write!(f, "symbolic stack underflow at word {}", at)
            }
            DecompileError::NodeNotFound { at } => {
                write!(f, "stack entry without a producing node at word {}", at)
            }
            DecompileError::InvalidSlot { slot, at } => {
                write!(f, "slot {} out of range at word {}", slot, at)
            }
            DecompileError::BackwardJz { at } => {
                write!(f, "backward jz at word {}", at)
            }
            DecompileError::MissingCondPop { at } => {
                write!(f, "expected pop after conditional body at word {}", at)
            }
            DecompileError::TruncatedCode { at } => {
                write!(f, "code ends inside an instruction at word {}", at)
            }
        }
    }
}

impl std::error::Error for DecompileError {}

/// A symbolic mirror of one interpreter stack slot.
#[derive(Debug, Clone)]
struct StackValue {
    var_id: String,
    node_id: NodeId,
}

/// How a block's instruction range ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockExit {
    /// Ran off the end of the range.
    FellThrough,
    /// Hit a `return`.
    Returned,
    /// Hit a backward `jmp` (a loop back-edge).
    BackJump,
}

/// A decompiled function: the node arena plus the ordered top-level roots.
#[derive(Debug)]
pub struct DecompiledFunction {
    pub arena: AstArena,
    pub roots: Vec<NodeId>,
}

/// Decompile one function's bytecode into an AST forest.
///
/// Unreachable nodes (popped pure expressions and block-local temporaries)
/// are swept from the arena before returning.
pub fn decompile(function: &Function) -> Result<DecompiledFunction, DecompileError> {
    let mut decompiler = Decompiler::new();
    let mut stack = Vec::new();
    let mut nodes = Vec::new();

    decompiler.parse_block(&function.code, &mut stack, &mut nodes, 0)?;

    let mut arena = decompiler.arena;
    arena.prune(&nodes);

    Ok(DecompiledFunction {
        arena,
        roots: nodes,
    })
}

/// The decompiler state: the node arena and the identifier name source.
struct Decompiler {
    arena: AstArena,
    next_var: u32,
    next_copy: u32,
}

impl Decompiler {
    fn new() -> Self {
        Self {
            arena: AstArena::new(),
            next_var: 0,
            next_copy: 0,
        }
    }

    fn gen_var_id(&mut self) -> String {
        let id = format!("var_{}", self.next_var);
        self.next_var += 1;
        id
    }

    fn gen_var_copy_id(&mut self, original: &str) -> String {
        let id = format!("{}_copy_{}", original, self.next_copy);
        self.next_copy += 1;
        id
    }

    /// Parse one instruction range. `stack` and `nodes` are the inherited
    /// symbolic stack and flat emitted-nodes list; `base` is the absolute
    /// word offset of `code[0]` for error reporting.
    fn parse_block(
        &mut self,
        code: &[u32],
        stack: &mut Vec<StackValue>,
        nodes: &mut Vec<NodeId>,
        base: usize,
    ) -> Result<BlockExit, DecompileError> {
        let mut cursor = 0usize;

        while cursor < code.len() {
            let at = base + cursor;
            let word = code[cursor];
            cursor += 1;

            let op = OpCode::from_word(word)
                .ok_or(DecompileError::UnknownOpcode { word, at })?;

            match op {
                OpCode::LoadNumber => {
                    let lo = *code.get(cursor).ok_or(DecompileError::TruncatedCode { at })?;
                    let hi = *code
                        .get(cursor + 1)
                        .ok_or(DecompileError::TruncatedCode { at })?;
                    cursor += 2;
                    self.push_const(stack, nodes, decode_number(lo, hi));
                }
                OpCode::LoadZero => {
                    self.push_const(stack, nodes, 0.0);
                }
                OpCode::LoadSlot => {
                    let slot = *code.get(cursor).ok_or(DecompileError::TruncatedCode { at })?
                        as usize;
                    cursor += 1;

                    let source = stack
                        .get(slot)
                        .ok_or(DecompileError::InvalidSlot { slot, at })?
                        .clone();
                    let var_id = self.gen_var_copy_id(&source.var_id);

                    let node_id = self.arena.alloc(AstNode {
                        kind: NodeKind::Identifier,
                        children: Vec::new(),
                        var_id_from: Some(source.var_id),
                        var_id_to: Some(var_id.clone()),
                        constant: 0.0,
                    });
                    nodes.push(node_id);
                    stack.push(StackValue { var_id, node_id });
                }
                OpCode::SetSlot => {
                    let slot = *code.get(cursor).ok_or(DecompileError::TruncatedCode { at })?
                        as usize;
                    cursor += 1;

                    let (value, value_node) = self.pop_expression(stack, nodes, at)?;
                    let target = stack
                        .get(slot)
                        .ok_or(DecompileError::InvalidSlot { slot, at })?
                        .var_id
                        .clone();

                    let node_id = self.arena.alloc(AstNode {
                        kind: NodeKind::Assign,
                        children: vec![value_node],
                        var_id_from: Some(value.var_id),
                        var_id_to: Some(target),
                        constant: 0.0,
                    });
                    nodes.push(node_id);

                    // The interpreter leaves the assigned value on its stack;
                    // mirror that with a placeholder, so the statement's
                    // value-of can be consumed without dropping the node.
                    let placeholder = self.gen_var_id();
                    stack.push(StackValue {
                        var_id: placeholder,
                        node_id,
                    });
                }
                OpCode::Add
                | OpCode::Sub
                | OpCode::Mul
                | OpCode::Div
                | OpCode::Eq
                | OpCode::Ne
                | OpCode::Lt
                | OpCode::Gt => {
                    let (_, right) = self.pop_expression(stack, nodes, at)?;
                    let (_, left) = self.pop_expression(stack, nodes, at)?;

                    let kind = match op {
                        OpCode::Add => NodeKind::Add,
                        OpCode::Sub => NodeKind::Sub,
                        OpCode::Mul => NodeKind::Mul,
                        OpCode::Div => NodeKind::Div,
                        OpCode::Eq => NodeKind::Eq,
                        OpCode::Ne => NodeKind::Ne,
                        OpCode::Lt => NodeKind::Lt,
                        OpCode::Gt => NodeKind::Gt,
                        _ => unreachable!(),
                    };

                    let var_id = self.gen_var_id();
                    let node_id = self.arena.alloc(AstNode {
                        kind,
                        children: vec![left, right],
                        var_id_from: None,
                        var_id_to: Some(var_id.clone()),
                        constant: 0.0,
                    });
                    nodes.push(node_id);
                    stack.push(StackValue { var_id, node_id });
                }
                OpCode::Pop => {
                    self.pop_discard(stack, nodes, at)?;
                }
                OpCode::Return => {
                    let (_, value_node) = self.pop_expression(stack, nodes, at)?;

                    let node_id = self.arena.alloc(AstNode {
                        kind: NodeKind::Return,
                        children: vec![value_node],
                        var_id_from: None,
                        var_id_to: None,
                        constant: 0.0,
                    });
                    nodes.push(node_id);

                    return Ok(BlockExit::Returned);
                }
                OpCode::Jmp => {
                    let offset = *code.get(cursor).ok_or(DecompileError::TruncatedCode { at })?
                        as i32;
                    cursor += 1;

                    if offset < 0 {
                        // A loop back-edge; the enclosing jz handler turns
                        // the block into a While.
                        return Ok(BlockExit::BackJump);
                    }
                    cursor += offset as usize;
                }
                OpCode::Jz => {
                    let offset = *code.get(cursor).ok_or(DecompileError::TruncatedCode { at })?
                        as i32;
                    cursor += 1;

                    if offset < 0 {
                        return Err(DecompileError::BackwardJz { at });
                    }
                    let body_end = cursor + offset as usize;
                    if body_end > code.len() {
                        return Err(DecompileError::TruncatedCode { at });
                    }

                    // Condition: producer of the current top of stack.
                    let cond = stack
                        .last()
                        .ok_or(DecompileError::StackUnderflow { at })?
                        .node_id;
                    if !nodes.contains(&cond) {
                        return Err(DecompileError::NodeNotFound { at });
                    }

                    let snapshot: HashSet<NodeId> = nodes.iter().copied().collect();

                    // Parse the guarded range with the inherited stack and
                    // nodes; the copies' final state is discarded, only the
                    // nodes that first appeared inside the range survive as
                    // the body.
                    let mut body_stack = stack.clone();
                    let mut body_nodes = nodes.clone();
                    let exit = self.parse_block(
                        &code[cursor..body_end],
                        &mut body_stack,
                        &mut body_nodes,
                        base + cursor,
                    )?;

                    let kind = if exit == BlockExit::BackJump {
                        NodeKind::While
                    } else {
                        NodeKind::If
                    };

                    let mut children = vec![cond];
                    children.extend(
                        body_nodes
                            .iter()
                            .copied()
                            .filter(|id| !snapshot.contains(id)),
                    );

                    let node_id = self.arena.alloc(AstNode {
                        kind,
                        children,
                        var_id_from: None,
                        var_id_to: None,
                        constant: 0.0,
                    });
                    nodes.push(node_id);

                    cursor = body_end;

                    // The front-end pops the condition's zero residue on the
                    // false path; an else-branch is not modeled.
                    let pop_at = base + cursor;
                    match code.get(cursor).copied().map(OpCode::from_word) {
                        Some(Some(OpCode::Pop)) => cursor += 1,
                        Some(_) => return Err(DecompileError::MissingCondPop { at: pop_at }),
                        None => return Err(DecompileError::TruncatedCode { at: pop_at }),
                    }
                    self.pop_discard(stack, nodes, pop_at)?;
                }
                OpCode::Call => {
                    return Err(DecompileError::UnsupportedInstruction { op: "op_call", at });
                }
            }
        }

        Ok(BlockExit::FellThrough)
    }

    fn push_const(&mut self, stack: &mut Vec<StackValue>, nodes: &mut Vec<NodeId>, value: f64) {
        let var_id = self.gen_var_id();
        let node_id = self.arena.alloc(AstNode {
            kind: NodeKind::Const,
            children: Vec::new(),
            var_id_from: None,
            var_id_to: Some(var_id.clone()),
            constant: value,
        });
        nodes.push(node_id);
        stack.push(StackValue { var_id, node_id });
    }

    /// Pop the top stack entry as an expression operand: the producing node
    /// is removed from the flat list so it can become a child.
    fn pop_expression(
        &mut self,
        stack: &mut Vec<StackValue>,
        nodes: &mut Vec<NodeId>,
        at: usize,
    ) -> Result<(StackValue, NodeId), DecompileError> {
        let value = stack.pop().ok_or(DecompileError::StackUnderflow { at })?;
        let position = nodes
            .iter()
            .position(|&id| id == value.node_id)
            .ok_or(DecompileError::NodeNotFound { at })?;
        let node_id = nodes.remove(position);
        Ok((value, node_id))
    }

    /// Pop the top stack entry and discard the value. A statement's node
    /// stays in the flat list; a pure expression is dropped.
    fn pop_discard(
        &mut self,
        stack: &mut Vec<StackValue>,
        nodes: &mut Vec<NodeId>,
        at: usize,
    ) -> Result<(), DecompileError> {
        let value = stack.pop().ok_or(DecompileError::StackUnderflow { at })?;
        let position = nodes
            .iter()
            .position(|&id| id == value.node_id)
            .ok_or(DecompileError::NodeNotFound { at })?;

        let is_statement = self
            .arena
            .get(nodes[position])
            .map(|node| node.kind.is_statement())
            .unwrap_or(false);
        if !is_statement {
            nodes.remove(position);
        }
        Ok(())
    }
}
