//! JIT compiler for decompiled turbine functions on x86-64.
//!
//! Walks the AST forest left to right and emits a niladic C-ABI function
//! returning its result in xmm0. Expression values live in identifiers
//! bound to xmm0..xmm7 or to spill slots on the native frame; the constant
//! pool is reached through a base register loaded once in the prologue.
//!
//! Register conventions:
//! - RCX: constant table base (clobbered, caller-saved in both SysV and
//!   Win64)
//! - RAX: scratch for the movabs in the prologue
//! - RBP: frame pointer (saved and restored)
//! - XMM0..XMM7: allocatable; the return value ends in XMM0

use std::collections::HashSet;

use super::ast::{AstArena, AstNode, NodeId, NodeKind};
use super::codebuf::CodeBuffer;
use super::memory::{ExecutableMemory, MemoryError};
use super::x86_64::{Cond, Reg, X86_64Assembler, Xmm};

/// The register holding the constant pool base.
pub const CONST_TABLE_REG: Reg = Reg::Rcx;

/// Allocatable scalar registers.
const XMM_COUNT: u8 = 8;

/// Constant pool capacity per function.
const CONST_POOL_CAPACITY: usize = 32;

/// Error type for code generation.
#[derive(Debug, Clone, PartialEq)]
pub enum JitError {
    /// A node is structurally unusable (vacated id, wrong child count,
    /// missing identifier fields).
    MalformedNode { node: NodeId },
    /// A node kind appeared in a position the generator cannot compile.
    UnsupportedNode { node: NodeId },
    IdentifierNotFound { name: String },
    ConstantPoolOverflow,
    BranchOutOfRange { at: usize },
    Memory(MemoryError),
}

impl std::fmt::Display for JitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JitError::MalformedNode { node } => write!(f, "malformed AST node {}", node),
            JitError::UnsupportedNode { node } => {
                write!(f, "AST node {} is not compilable in this position", node)
            }
            JitError::IdentifierNotFound { name } => {
                write!(f, "identifier '{}' not found", name)
            }
            JitError::ConstantPoolOverflow => {
                write!(f, "more than {} distinct constants", CONST_POOL_CAPACITY)
            }
            JitError::BranchOutOfRange { at } => {
                write!(f, "branch displacement out of range at byte {}", at)
            }
            JitError::Memory(e) => write!(f, "executable memory: {}", e),
        }
    }
}

impl std::error::Error for JitError {}

impl From<MemoryError> for JitError {
    fn from(e: MemoryError) -> Self {
        JitError::Memory(e)
    }
}

/// Options recognized by the JIT.
#[derive(Debug, Clone, Copy)]
pub struct JitOptions {
    /// Enables identifier aliasing for static copies and constant-in-memory
    /// operand folding in arithmetic.
    pub use_optimizations: bool,
}

impl Default for JitOptions {
    fn default() -> Self {
        Self {
            use_optimizations: true,
        }
    }
}

/// The native signature of a compiled function.
pub type JitEntryFn = unsafe extern "C" fn() -> f64;

/// A compiled function: the executable pages, the constant pool the
/// emitted prologue points into, and the typed entry pointer. The three
/// live and die together; the pool must not move while the code is
/// callable.
#[derive(Debug)]
pub struct JitFunction {
    memory: ExecutableMemory,
    constants: Box<[f64]>,
    entry: JitEntryFn,
    code_len: usize,
}

impl JitFunction {
    /// Invoke the compiled function.
    #[cfg(target_arch = "x86_64")]
    pub fn call(&self) -> f64 {
        // The buffer holds a complete niladic double-returning function and
        // has been flipped to read+execute.
        unsafe { (self.entry)() }
    }

    pub fn entry(&self) -> JitEntryFn {
        self.entry
    }

    pub fn constants(&self) -> &[f64] {
        &self.constants
    }

    pub fn code_len(&self) -> usize {
        self.code_len
    }

    /// The emitted machine code bytes.
    pub fn code(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.memory.as_ptr(), self.code_len) }
    }
}

/// Where an identifier's value currently lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Location {
    Register(Xmm),
    /// An 8-byte frame slot, addressed as `[rsp + 8*index]`.
    Stack(usize),
}

/// A live value during code generation.
#[derive(Debug)]
struct Ident {
    /// Symbolic names referring to this storage; aliasing appends here.
    names: Vec<String>,
    location: Location,
    /// Timestamp of the last hydrate, for LRU spill choice.
    hydrate_count: u64,
    /// Never an assignment target; permits name aliasing.
    is_static: bool,
    /// The pool constant this value was loaded from, while still known.
    constant: Option<f64>,
}

/// JIT compiler for one decompiled function.
pub struct JitCompiler<'a> {
    arena: &'a AstArena,
    options: JitOptions,
    buf: CodeBuffer,
    idents: Vec<Ident>,
    constants: Vec<f64>,
    /// Names that are assignment targets somewhere in the forest.
    assigned: HashSet<String>,
    spill_count: usize,
    hydrate_clock: u64,
}

impl<'a> JitCompiler<'a> {
    pub fn new(arena: &'a AstArena, options: JitOptions) -> Self {
        Self {
            arena,
            options,
            buf: CodeBuffer::new(),
            idents: Vec::new(),
            constants: Vec::new(),
            assigned: HashSet::new(),
            spill_count: 0,
            hydrate_clock: 0,
        }
    }

    /// Compile the forest into a callable function.
    pub fn compile(mut self, roots: &[NodeId]) -> Result<JitFunction, JitError> {
        self.collect_assigned(roots);

        // Prologue. The constant table base and the frame reservation are
        // patched once their final values are known.
        let const_base_patch = self.buf.len() + 2;
        self.asm().mov_ri64(Reg::Rax, 0);
        self.asm().mov_rr(CONST_TABLE_REG, Reg::Rax);

        self.asm().push(Reg::Rbp);
        self.asm().mov_rr(Reg::Rbp, Reg::Rsp);
        let frame_size_patch = self.buf.len() + 3;
        self.asm().sub_ri32_wide(Reg::Rsp, 0);

        for &root in roots {
            self.gen_node(root)?;
        }

        // Finalize: pin the pool, patch the placeholders, freeze the code.
        let constants = std::mem::take(&mut self.constants).into_boxed_slice();
        self.buf.patch_u64(const_base_patch, constants.as_ptr() as u64);
        self.buf
            .patch_u32(frame_size_patch, (self.spill_count * 8) as u32);

        let code = self.buf.into_code();
        let mut memory = ExecutableMemory::new(code.len())?;
        memory.write(&code)?;
        memory.make_executable()?;

        let entry = unsafe { std::mem::transmute::<*const u8, JitEntryFn>(memory.as_ptr()) };

        Ok(JitFunction {
            memory,
            constants,
            entry,
            code_len: code.len(),
        })
    }

    fn asm(&mut self) -> X86_64Assembler<'_> {
        X86_64Assembler::new(&mut self.buf)
    }

    fn collect_assigned(&mut self, roots: &[NodeId]) {
        let mut worklist: Vec<NodeId> = roots.to_vec();
        while let Some(id) = worklist.pop() {
            let Some(node) = self.arena.get(id) else {
                continue;
            };
            if node.kind == NodeKind::Assign {
                if let Some(target) = &node.var_id_to {
                    self.assigned.insert(target.clone());
                }
            }
            worklist.extend(node.children.iter().copied());
        }
    }

    fn is_static(&self, name: &str) -> bool {
        !self.assigned.contains(name)
    }

    // ==================== Node emission ====================

    fn gen_node(&mut self, id: NodeId) -> Result<(), JitError> {
        let node = self
            .arena
            .get(id)
            .ok_or(JitError::MalformedNode { node: id })?;

        match node.kind {
            NodeKind::Const => self.gen_const(id, node),
            NodeKind::Identifier => self.gen_identifier(id, node),
            NodeKind::Add | NodeKind::Sub | NodeKind::Mul | NodeKind::Div => {
                self.gen_arithmetic(id, node)
            }
            NodeKind::Eq | NodeKind::Ne | NodeKind::Lt | NodeKind::Gt => {
                self.gen_compare(id, node)
            }
            NodeKind::Assign => self.gen_assign(id, node),
            NodeKind::Return => self.gen_return(id, node),
            NodeKind::If => self.gen_conditional(id, node, false),
            NodeKind::While => self.gen_conditional(id, node, true),
        }
    }

    fn gen_const(&mut self, id: NodeId, node: &AstNode) -> Result<(), JitError> {
        let name = node
            .var_id_to
            .clone()
            .ok_or(JitError::MalformedNode { node: id })?;

        let index = self.add_constant(node.constant)?;
        let xmm = self.alloc_xmm()?;
        self.asm()
            .movsd_xm(xmm, CONST_TABLE_REG, (index * 8) as i32);

        let is_static = self.is_static(&name);
        let count = self.next_clock();
        self.idents.push(Ident {
            names: vec![name],
            location: Location::Register(xmm),
            hydrate_count: count,
            is_static,
            constant: Some(node.constant),
        });
        Ok(())
    }

    fn gen_identifier(&mut self, id: NodeId, node: &AstNode) -> Result<(), JitError> {
        let source = node
            .var_id_from
            .as_ref()
            .ok_or(JitError::MalformedNode { node: id })?;
        let name = node
            .var_id_to
            .clone()
            .ok_or(JitError::MalformedNode { node: id })?;

        let source_index = self.find_ident(source)?;

        // Two statically-const names may share storage: the copy costs
        // nothing, the source just answers to one more name.
        if self.options.use_optimizations
            && self.idents[source_index].is_static
            && self.is_static(&name)
        {
            self.idents[source_index].names.push(name);
            return Ok(());
        }

        let source_xmm = self.hydrate(source_index)?;
        let xmm = self.alloc_xmm()?;
        self.asm().movsd_xx(xmm, source_xmm);

        let constant = self.idents[source_index].constant;
        let is_static = self.is_static(&name);
        let count = self.next_clock();
        self.idents.push(Ident {
            names: vec![name],
            location: Location::Register(xmm),
            hydrate_count: count,
            is_static,
            constant,
        });
        Ok(())
    }

    fn gen_arithmetic(&mut self, id: NodeId, node: &AstNode) -> Result<(), JitError> {
        let &[left, right] = node.children.as_slice() else {
            return Err(JitError::MalformedNode { node: id });
        };
        let result_name = node
            .var_id_to
            .clone()
            .ok_or(JitError::MalformedNode { node: id })?;

        let commutative = matches!(node.kind, NodeKind::Add | NodeKind::Mul);

        // A constant operand already in the pool and not live in a register
        // folds into a memory operand instead of being materialized. Each
        // fold decision is made at the point where that operand would
        // otherwise be loaded.
        if self.options.use_optimizations && commutative {
            if let Some(pool_index) = self.fold_candidate(left) {
                self.gen_node(right)?;
                let right_name = self.value_name(right)?;
                let xmm = self.claim_for_write(&right_name)?;
                self.emit_arith_mem(id, node.kind, xmm, pool_index)?;
                self.free_name(&right_name)?;
                self.bind_result(result_name, xmm);
                return Ok(());
            }
        }

        self.gen_node(left)?;

        if self.options.use_optimizations {
            if let Some(pool_index) = self.fold_candidate(right) {
                let left_name = self.value_name(left)?;
                let xmm = self.claim_for_write(&left_name)?;
                self.emit_arith_mem(id, node.kind, xmm, pool_index)?;
                self.free_name(&left_name)?;
                self.bind_result(result_name, xmm);
                return Ok(());
            }
        }

        self.gen_node(right)?;

        let left_name = self.value_name(left)?;
        let right_name = self.value_name(right)?;

        // The operation lands in the left register, so the left name must
        // own it exclusively; the right operand is only read.
        let left_xmm = self.claim_for_write(&left_name)?;
        let right_xmm = self.hydrate_name(&right_name)?;

        match node.kind {
            NodeKind::Add => self.asm().addsd_xx(left_xmm, right_xmm),
            NodeKind::Sub => self.asm().subsd_xx(left_xmm, right_xmm),
            NodeKind::Mul => self.asm().mulsd_xx(left_xmm, right_xmm),
            NodeKind::Div => self.asm().divsd_xx(left_xmm, right_xmm),
            _ => return Err(JitError::UnsupportedNode { node: id }),
        }

        self.free_name(&left_name)?;
        self.free_name(&right_name)?;
        self.bind_result(result_name, left_xmm);
        Ok(())
    }

    fn emit_arith_mem(
        &mut self,
        id: NodeId,
        kind: NodeKind,
        xmm: Xmm,
        pool_index: usize,
    ) -> Result<(), JitError> {
        let disp = (pool_index * 8) as i32;
        match kind {
            NodeKind::Add => self.asm().addsd_xm(xmm, CONST_TABLE_REG, disp),
            NodeKind::Sub => self.asm().subsd_xm(xmm, CONST_TABLE_REG, disp),
            NodeKind::Mul => self.asm().mulsd_xm(xmm, CONST_TABLE_REG, disp),
            NodeKind::Div => self.asm().divsd_xm(xmm, CONST_TABLE_REG, disp),
            _ => return Err(JitError::UnsupportedNode { node: id }),
        }
        Ok(())
    }

    fn hydrate_name(&mut self, name: &str) -> Result<Xmm, JitError> {
        let index = self.find_ident(name)?;
        self.hydrate(index)
    }

    /// Make `name` the sole owner of a register, so an in-place operation
    /// may overwrite it. A name sharing an aliased identifier is split off
    /// into a private copy first; the remaining names keep the original
    /// storage and its value.
    fn claim_for_write(&mut self, name: &str) -> Result<Xmm, JitError> {
        let index = self.find_ident(name)?;
        let shared_xmm = self.hydrate(index)?;
        if self.idents[index].names.len() == 1 {
            return Ok(shared_xmm);
        }

        self.idents[index].names.retain(|n| n != name);
        let constant = self.idents[index].constant;

        let xmm = self.alloc_xmm()?;
        self.asm().movsd_xx(xmm, shared_xmm);

        let is_static = self.is_static(name);
        let count = self.next_clock();
        self.idents.push(Ident {
            names: vec![name.to_string()],
            location: Location::Register(xmm),
            hydrate_count: count,
            is_static,
            constant,
        });
        Ok(xmm)
    }

    /// Pool index for a foldable constant operand, if the child is a
    /// `Const` whose value is already pooled and not live in any register.
    fn fold_candidate(&self, child: NodeId) -> Option<usize> {
        let node = self.arena.get(child)?;
        if node.kind != NodeKind::Const {
            return None;
        }
        let index = self.pool_index_of(node.constant)?;
        if self.constant_in_register(node.constant) {
            return None;
        }
        Some(index)
    }

    fn gen_compare(&mut self, id: NodeId, node: &AstNode) -> Result<(), JitError> {
        let &[left, right] = node.children.as_slice() else {
            return Err(JitError::MalformedNode { node: id });
        };
        let result_name = node
            .var_id_to
            .clone()
            .ok_or(JitError::MalformedNode { node: id })?;

        self.gen_node(left)?;
        self.gen_node(right)?;

        let left_name = self.value_name(left)?;
        let right_name = self.value_name(right)?;

        // Both arms of the diamond write into the left register, so the
        // left name must own it exclusively.
        let left_xmm = self.claim_for_write(&left_name)?;
        let right_xmm = self.hydrate_name(&right_name)?;

        self.asm().ucomisd_xx(left_xmm, right_xmm);

        // Branch diamond: the taken edge jumps to the write of
        // `taken_value`, the fall-through writes the opposite, both rejoin.
        let (cond, taken_value) = match node.kind {
            NodeKind::Eq => (Cond::E, 1.0),
            NodeKind::Ne => (Cond::E, 0.0),
            NodeKind::Lt => (Cond::B, 1.0),
            NodeKind::Gt => (Cond::A, 1.0),
            _ => return Err(JitError::UnsupportedNode { node: id }),
        };
        let one_index = self.add_constant(1.0)?;

        let jcc_at = self.buf.len() + 1;
        self.asm().jcc_rel8(cond, 0);

        self.emit_bool_value(left_xmm, 1.0 - taken_value, one_index);
        let jmp_at = self.buf.len() + 1;
        self.asm().jmp_rel8(0);

        let target = self.buf.len();
        self.patch_rel8(jcc_at, target)?;
        self.emit_bool_value(left_xmm, taken_value, one_index);

        let join = self.buf.len();
        self.patch_rel8(jmp_at, join)?;

        // The right operand dies; the left identifier becomes the result.
        self.free_name(&right_name)?;
        let left_index = self.find_ident(&left_name)?;
        self.idents[left_index].names.retain(|n| n != &left_name);
        self.idents[left_index].names.push(result_name);
        self.idents[left_index].constant = None;
        Ok(())
    }

    /// Write 0.0 or 1.0 into a register on one arm of a compare diamond.
    fn emit_bool_value(&mut self, xmm: Xmm, value: f64, one_index: usize) {
        if value == 0.0 {
            self.asm().pxor_xx(xmm, xmm);
        } else {
            self.asm()
                .movsd_xm(xmm, CONST_TABLE_REG, (one_index * 8) as i32);
        }
    }

    fn gen_assign(&mut self, id: NodeId, node: &AstNode) -> Result<(), JitError> {
        let &[child] = node.children.as_slice() else {
            return Err(JitError::MalformedNode { node: id });
        };
        let source = node
            .var_id_from
            .clone()
            .ok_or(JitError::MalformedNode { node: id })?;
        let target = node
            .var_id_to
            .clone()
            .ok_or(JitError::MalformedNode { node: id })?;

        self.gen_node(child)?;

        let source_xmm = self.hydrate_name(&source)?;
        let target_index = self.find_ident(&target)?;
        let target_xmm = self.hydrate(target_index)?;

        self.asm().movsd_xx(target_xmm, source_xmm);

        self.idents[target_index].constant = None;
        self.free_name(&source)?;
        Ok(())
    }

    fn gen_return(&mut self, id: NodeId, node: &AstNode) -> Result<(), JitError> {
        let &[child] = node.children.as_slice() else {
            return Err(JitError::MalformedNode { node: id });
        };

        self.gen_node(child)?;

        let name = self.value_name(child)?;
        let xmm = self.hydrate_name(&name)?;

        self.asm().movsd_xx(0, xmm);

        // Epilogue
        self.asm().mov_rr(Reg::Rsp, Reg::Rbp);
        self.asm().pop(Reg::Rbp);
        self.asm().ret();

        self.free_name(&name)?;
        Ok(())
    }

    fn gen_conditional(
        &mut self,
        id: NodeId,
        node: &AstNode,
        is_loop: bool,
    ) -> Result<(), JitError> {
        let Some((&cond, body)) = node.children.split_first() else {
            return Err(JitError::MalformedNode { node: id });
        };

        let loop_top = self.buf.len();

        self.gen_node(cond)?;
        let cond_name = self.value_name(cond)?;
        let cond_index = self.find_ident(&cond_name)?;
        let cond_xmm = self.hydrate(cond_index)?;

        let zero_index = self.add_constant(0.0)?;
        self.asm()
            .ucomisd_xm(cond_xmm, CONST_TABLE_REG, (zero_index * 8) as i32);

        let exit_at = self.buf.len() + 2;
        self.asm().jcc_rel32(Cond::E, 0);

        self.free_name(&cond_name)?;

        for &child in body {
            self.gen_node(child)?;
        }

        if is_loop {
            let back_at = self.buf.len() + 1;
            self.asm().jmp_rel32(0);
            self.patch_rel32(back_at, loop_top)?;
        }

        let exit = self.buf.len();
        self.patch_rel32(exit_at, exit)?;
        Ok(())
    }

    // ==================== Identifier table ====================

    /// The identifier a child node's value answers to.
    fn value_name(&self, id: NodeId) -> Result<String, JitError> {
        let node = self
            .arena
            .get(id)
            .ok_or(JitError::MalformedNode { node: id })?;
        node.var_id_to
            .clone()
            .ok_or(JitError::UnsupportedNode { node: id })
    }

    fn find_ident(&self, name: &str) -> Result<usize, JitError> {
        self.idents
            .iter()
            .position(|ident| ident.names.iter().any(|n| n == name))
            .ok_or_else(|| JitError::IdentifierNotFound {
                name: name.to_string(),
            })
    }

    /// Drop one name; storage is released when the last name goes.
    fn free_name(&mut self, name: &str) -> Result<(), JitError> {
        let index = self.find_ident(name)?;
        self.idents[index].names.retain(|n| n != name);
        if self.idents[index].names.is_empty() {
            self.idents.remove(index);
        }
        Ok(())
    }

    /// Bind a fresh identifier to `xmm`. The register must be unowned:
    /// every caller first frees the claimed operand that produced it.
    fn bind_result(&mut self, name: String, xmm: Xmm) {
        let is_static = self.is_static(&name);
        let count = self.next_clock();
        self.idents.push(Ident {
            names: vec![name],
            location: Location::Register(xmm),
            hydrate_count: count,
            is_static,
            constant: None,
        });
    }

    fn next_clock(&mut self) -> u64 {
        self.hydrate_clock += 1;
        self.hydrate_clock
    }

    // ==================== Register allocation ====================

    /// Hand out a free register, spilling the least recently hydrated
    /// identifier to a fresh frame slot when all eight are bound.
    fn alloc_xmm(&mut self) -> Result<Xmm, JitError> {
        let mut used = [false; XMM_COUNT as usize];
        for ident in &self.idents {
            if let Location::Register(xmm) = ident.location {
                used[xmm as usize] = true;
            }
        }
        if let Some(free) = (0..XMM_COUNT).find(|&xmm| !used[xmm as usize]) {
            return Ok(free);
        }

        let victim = self
            .idents
            .iter()
            .enumerate()
            .filter(|(_, ident)| matches!(ident.location, Location::Register(_)))
            .min_by_key(|(_, ident)| ident.hydrate_count)
            .map(|(index, _)| index);
        let Some(victim) = victim else {
            // All eight registers bound implies a register-located entry.
            unreachable!();
        };
        let Location::Register(xmm) = self.idents[victim].location else {
            unreachable!();
        };

        let slot = self.spill_count;
        self.asm().movq_mx(Reg::Rsp, (slot * 8) as i32, xmm);
        self.spill_count += 1;
        self.idents[victim].location = Location::Stack(slot);
        Ok(xmm)
    }

    /// Ensure an identifier is register-resident. Every hydrate, even a
    /// no-op one, advances the clock so spilling stays LRU.
    fn hydrate(&mut self, index: usize) -> Result<Xmm, JitError> {
        let count = self.next_clock();
        self.idents[index].hydrate_count = count;

        match self.idents[index].location {
            Location::Register(xmm) => Ok(xmm),
            Location::Stack(slot) => {
                let xmm = self.alloc_xmm()?;
                self.asm().movq_xm(xmm, Reg::Rsp, (slot * 8) as i32);
                self.idents[index].location = Location::Register(xmm);
                Ok(xmm)
            }
        }
    }

    // ==================== Constant pool ====================

    fn pool_index_of(&self, value: f64) -> Option<usize> {
        self.constants
            .iter()
            .position(|c| c.to_bits() == value.to_bits())
    }

    fn constant_in_register(&self, value: f64) -> bool {
        self.idents.iter().any(|ident| {
            matches!(ident.location, Location::Register(_))
                && ident.constant.map(f64::to_bits) == Some(value.to_bits())
        })
    }

    /// Deduplicating pool insert.
    fn add_constant(&mut self, value: f64) -> Result<usize, JitError> {
        if let Some(index) = self.pool_index_of(value) {
            return Ok(index);
        }
        if self.constants.len() >= CONST_POOL_CAPACITY {
            return Err(JitError::ConstantPoolOverflow);
        }
        self.constants.push(value);
        Ok(self.constants.len() - 1)
    }

    // ==================== Branch patching ====================

    fn patch_rel8(&mut self, at: usize, target: usize) -> Result<(), JitError> {
        let disp = target as i64 - (at as i64 + 1);
        if disp < i8::MIN as i64 || disp > i8::MAX as i64 {
            return Err(JitError::BranchOutOfRange { at });
        }
        self.buf.patch_u8(at, disp as i8 as u8);
        Ok(())
    }

    fn patch_rel32(&mut self, at: usize, target: usize) -> Result<(), JitError> {
        let disp = target as i64 - (at as i64 + 4);
        if disp < i32::MIN as i64 || disp > i32::MAX as i64 {
            return Err(JitError::BranchOutOfRange { at });
        }
        self.buf.patch_u32(at, disp as i32 as u32);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler;
    use crate::jit::decompiler::decompile;

    fn jit_source(source: &str, options: JitOptions) -> JitFunction {
        let program = compiler::compile("test.tb", source).unwrap();
        let decompiled = decompile(&program.functions[program.main]).unwrap();
        JitCompiler::new(&decompiled.arena, options)
            .compile(&decompiled.roots)
            .unwrap()
    }

    fn jit_default(source: &str) -> JitFunction {
        jit_source(source, JitOptions::default())
    }

    #[test]
    fn test_constant_pool_dedup() {
        let function = jit_default("Fn Main: Return 2 + 2; End Fn");
        assert_eq!(function.constants(), &[2.0]);
    }

    #[test]
    fn test_constant_pool_order() {
        let function = jit_default("Fn Main: Return 1 + 2 * 3; End Fn");
        assert_eq!(function.constants(), &[1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_aliasing_shrinks_code() {
        let source = "Fn Main: Const x = 10; Return x + x; End Fn";
        let optimized = jit_source(source, JitOptions { use_optimizations: true });
        let plain = jit_source(source, JitOptions { use_optimizations: false });
        assert!(
            optimized.code_len() < plain.code_len(),
            "aliasing should drop both copy instructions ({} vs {})",
            optimized.code_len(),
            plain.code_len()
        );
    }

    #[test]
    fn test_spill_pressure_emits_movq() {
        // Nine operands held live at once: two must go to the frame.
        let source = "Fn Main: Return 1 - (2 - (3 - (4 - (5 - (6 - (7 - (8 - (9 - 10)))))))); End Fn";
        let function = jit_default(source);

        // MOVQ [RSP+...], xmm is 66 0F D6.
        let spills = function
            .code()
            .windows(3)
            .filter(|w| w[0] == 0x66 && w[1] == 0x0F && w[2] == 0xD6)
            .count();
        assert!(spills >= 2, "expected at least two spills, saw {}", spills);

        // And the reloads: F3 0F 7E.
        let reloads = function
            .code()
            .windows(3)
            .filter(|w| w[0] == 0xF3 && w[1] == 0x0F && w[2] == 0x7E)
            .count();
        assert!(reloads >= 2, "expected reloads, saw {}", reloads);
    }

    #[test]
    fn test_prologue_shape() {
        let function = jit_default("Fn Main: Return 0; End Fn");
        let code = function.code();

        // movabs rax, imm64
        assert_eq!(&code[0..2], &[0x48, 0xB8]);
        let base = u64::from_le_bytes(code[2..10].try_into().unwrap());
        assert_eq!(base, function.constants().as_ptr() as u64);
        // mov rcx, rax; push rbp; mov rbp, rsp; sub rsp, imm32
        assert_eq!(&code[10..13], &[0x48, 0x89, 0xC1]);
        assert_eq!(code[13], 0x55);
        assert_eq!(&code[14..17], &[0x48, 0x89, 0xE5]);
        assert_eq!(&code[17..20], &[0x48, 0x81, 0xEC]);
        // No spills here: zero reservation.
        assert_eq!(&code[20..24], &[0, 0, 0, 0]);
    }

    #[test]
    fn test_epilogue_shape() {
        let function = jit_default("Fn Main: Return 0; End Fn");
        let code = function.code();
        let n = code.len();
        // mov rsp, rbp; pop rbp; ret
        assert_eq!(&code[n - 5..], &[0x48, 0x89, 0xEC, 0x5D, 0xC3]);
    }

    #[test]
    fn test_too_many_constants() {
        let terms: Vec<String> = (1..=33).map(|i| format!("{}", i)).collect();
        let source = format!("Fn Main: Return {}; End Fn", terms.join(" + "));

        let program = compiler::compile("test.tb", &source).unwrap();
        let decompiled = decompile(&program.functions[program.main]).unwrap();
        let result = JitCompiler::new(&decompiled.arena, JitOptions::default())
            .compile(&decompiled.roots);
        assert_eq!(result.unwrap_err(), JitError::ConstantPoolOverflow);
    }

    #[cfg(target_arch = "x86_64")]
    mod execution {
        use super::*;

        #[test]
        fn test_pure_arithmetic() {
            let function = jit_default("Fn Main: Return 1 + 2 * 3; End Fn");
            assert_eq!(function.call(), 7.0);
        }

        #[test]
        fn test_division() {
            let function = jit_default("Fn Main: Return 1 / 8; End Fn");
            assert_eq!(function.call(), 0.125);
        }

        #[test]
        fn test_const_reuse_with_aliasing() {
            let function = jit_default("Fn Main: Const x = 10; Return x + x; End Fn");
            assert_eq!(function.call(), 20.0);
        }

        #[test]
        fn test_const_reuse_without_optimizations() {
            let function = jit_source(
                "Fn Main: Const x = 10; Return x + x; End Fn",
                JitOptions { use_optimizations: false },
            );
            assert_eq!(function.call(), 20.0);
        }

        #[test]
        fn test_chained_reads_of_aliased_const() {
            // Three reads through separate operations: each consuming op
            // must split its operand off the shared register instead of
            // clobbering the constant.
            let function = jit_default("Fn Main: Const x = 10; Return x + x + x; End Fn");
            assert_eq!(function.call(), 30.0);

            let function =
                jit_default("Fn Main: Const x = 2.5; Const y = 4; Return x * y + x; End Fn");
            assert_eq!(function.call(), 12.5);
        }

        #[test]
        fn test_const_readable_after_compare() {
            // The compare diamond writes into its left operand's register;
            // the constant itself must survive it.
            let function = jit_default(
                "Fn Main: Const x = 1; If x == 2 Then Return 100; End If Return x; End Fn",
            );
            assert_eq!(function.call(), 1.0);
        }

        #[test]
        fn test_assignments() {
            let function =
                jit_default("Fn Main: Any a = 0; a = 5; a = a + 3; Return a; End Fn");
            assert_eq!(function.call(), 8.0);
        }

        #[test]
        fn test_if_false_path() {
            let function = jit_default(
                "Fn Main: Const x = 1; If x == 2 Then Return 100; End If Return 7; End Fn",
            );
            assert_eq!(function.call(), 7.0);
        }

        #[test]
        fn test_if_true_path() {
            let function = jit_default(
                "Fn Main: Const x = 2; If x == 2 Then Return 100; End If Return 7; End Fn",
            );
            assert_eq!(function.call(), 100.0);
        }

        #[test]
        fn test_comparisons_produce_booleans() {
            for (source, expected) in [
                ("Fn Main: Return 1 < 2; End Fn", 1.0),
                ("Fn Main: Return 2 < 1; End Fn", 0.0),
                ("Fn Main: Return 2 > 1; End Fn", 1.0),
                ("Fn Main: Return 1 > 2; End Fn", 0.0),
                ("Fn Main: Return 3 == 3; End Fn", 1.0),
                ("Fn Main: Return 3 == 4; End Fn", 0.0),
                ("Fn Main: Return 3 != 4; End Fn", 1.0),
                ("Fn Main: Return 3 != 3; End Fn", 0.0),
            ] {
                let function = jit_default(source);
                assert_eq!(function.call(), expected, "{}", source);
            }
        }

        #[test]
        fn test_while_countdown() {
            let function = jit_default(
                "Fn Main: Any i = 5; Any s = 0; \
                 While i > 0 Then s = s + i; i = i - 1; End While \
                 Return s; End Fn",
            );
            assert_eq!(function.call(), 15.0);
        }

        #[test]
        fn test_spilled_values_survive() {
            let function = jit_default(
                "Fn Main: Return 1 - (2 - (3 - (4 - (5 - (6 - (7 - (8 - (9 - 10)))))))); End Fn",
            );
            assert_eq!(function.call(), -5.0);
        }

        #[test]
        fn test_fractional_result() {
            let function = jit_default("Fn Main: Return 10 / 4 + 0.5; End Fn");
            assert_eq!(function.call(), 3.0);
        }
    }
}
