//! AArch64 backend
//!
//! Little-endian RISC with 31 general-purpose registers, SIMD FP
//! registers usable as 32- or 64-bit, 16-byte stack alignment, stack
//! growing down. Emits GAS syntax for ELF and Darwin (the dialect
//! changes the symbol prefix, section names, and page-relative
//! relocation spelling).
//!
//! Frame shape: `stp x29, x30, [sp, #-16]!` establishes the saved
//! FP/LR pair and x29 points at it; the locals/spill region and the
//! outgoing argument area live below, reached with positive offsets from
//! sp. Leaves that need no frame skip the prologue entirely.
//!
//! Emission is always-spill: operands load into x9/x10 (d0/d1 for
//! floats), the result lands back in its stack slot. A comparison whose
//! only consumer is the immediately following conditional branch fuses
//! into `cmp` + `b.cond` (or `cbz`/`cbnz` against zero) with no
//! materialized 0/1.

use super::frame::{self, FrameLayout};
use super::{ArchInfo, Backend, CodeGenError};
use crate::ir::*;
use crate::types::{round_up, TargetLayout};
use std::collections::HashSet;
use std::fmt::Write as _;

pub struct Arm64Backend {
    arch: ArchInfo,
    darwin: bool,
    out: String,
    frame: FrameLayout,
    frame_size: u64,
    outgoing: u64,
    has_frame: bool,
    func_name: String,
    /// Comparisons that fuse into the following conditional branch.
    fused: HashSet<ValueId>,
    label_counter: u32,
}

impl Arm64Backend {
    pub fn new(darwin: bool) -> Self {
        Arm64Backend {
            arch: ArchInfo {
                name: if darwin { "arm64-darwin" } else { "arm64" },
                ptr_bytes: 8,
                addr_bits: 64,
                word_bytes: 8,
                gpr_count: 31,
                fpr_count: 32,
                big_endian: false,
                stack_align: 16,
                stack_grows_down: true,
                has_condition_codes: true,
                has_delay_slots: false,
                layout: TargetLayout::lp64(),
            },
            darwin,
            out: String::new(),
            frame: FrameLayout::default(),
            frame_size: 0,
            outgoing: 0,
            has_frame: false,
            func_name: String::new(),
            fused: HashSet::new(),
            label_counter: 0,
        }
    }

    fn sym(&self, name: &str) -> String {
        if self.darwin {
            format!("_{}", name)
        } else {
            name.to_string()
        }
    }

    fn str_label(&self, index: usize) -> String {
        if self.darwin {
            format!("L_.str.{}", index)
        } else {
            format!(".Lstr.{}", index)
        }
    }

    fn block_label(&self, block: BlockId) -> String {
        if self.darwin {
            format!("LBB_{}_{}", self.func_name, block.0)
        } else {
            format!(".LBB_{}_{}", self.func_name, block.0)
        }
    }

    fn local_label(&mut self, hint: &str) -> String {
        self.label_counter += 1;
        if self.darwin {
            format!("L{}_{}_{}", hint, self.func_name, self.label_counter)
        } else {
            format!(".L{}_{}_{}", hint, self.func_name, self.label_counter)
        }
    }

    /// Stack offset of a value's home, from sp.
    fn slot_offset(&self, v: ValueId) -> Result<u64, CodeGenError> {
        self.frame
            .slot(v)
            .map(|o| self.outgoing + o)
            .ok_or_else(|| CodeGenError::Logic(format!("value %{} has no stack slot", v.0)))
    }

    /// Materialize an arbitrary immediate into `reg` with movz/movk.
    fn emit_mov_imm(&mut self, reg: &str, value: i64) -> Result<(), CodeGenError> {
        let v = value as u64;
        if v <= 0xffff {
            writeln!(self.out, "\tmov\t{}, #{}", reg, v)?;
            return Ok(());
        }
        if value < 0 && value >= -0xffff {
            writeln!(self.out, "\tmov\t{}, #{}", reg, value)?;
            return Ok(());
        }
        let mut first = true;
        for shift in [0u32, 16, 32, 48] {
            let chunk = (v >> shift) & 0xffff;
            if chunk == 0 && !(first && shift == 48) {
                continue;
            }
            if first {
                writeln!(self.out, "\tmovz\t{}, #{}, lsl #{}", reg, chunk, shift)?;
                first = false;
            } else {
                writeln!(self.out, "\tmovk\t{}, #{}, lsl #{}", reg, chunk, shift)?;
            }
        }
        if first {
            writeln!(self.out, "\tmov\t{}, #0", reg)?;
        }
        Ok(())
    }

    /// Materialize a symbol address page-relative.
    fn emit_sym_addr(&mut self, reg: &str, label: &str) -> Result<(), CodeGenError> {
        if self.darwin {
            writeln!(self.out, "\tadrp\t{}, {}@PAGE", reg, label)?;
            writeln!(self.out, "\tadd\t{}, {}, {}@PAGEOFF", reg, reg, label)?;
        } else {
            writeln!(self.out, "\tadrp\t{}, {}", reg, label)?;
            writeln!(self.out, "\tadd\t{}, {}, :lo12:{}", reg, reg, label)?;
        }
        Ok(())
    }

    /// Load an integer (or pointer) value into the named x-register.
    fn load_int(&mut self, func: &Function, v: ValueId, reg: &str) -> Result<(), CodeGenError> {
        match &func.value(v).kind {
            ValueKind::ConstInt(value) => self.emit_mov_imm(reg, *value),
            ValueKind::ConstNull => {
                writeln!(self.out, "\tmov\t{}, #0", reg)?;
                Ok(())
            }
            ValueKind::ConstFloat(value) => {
                // Bit pattern through a GPR (caller moves to an FP reg).
                self.emit_mov_imm(reg, value.to_bits() as i64)
            }
            ValueKind::ConstString(i) => {
                let label = self.str_label(*i);
                self.emit_sym_addr(reg, &label)
            }
            ValueKind::Global(name) => {
                let label = self.sym(name);
                self.emit_sym_addr(reg, &label)
            }
            ValueKind::FuncRef(name) => {
                let label = self.sym(name);
                self.emit_sym_addr(reg, &label)
            }
            ValueKind::Param(i) => {
                if *i < 8 {
                    writeln!(self.out, "\tmov\t{}, x{}", reg, i)?;
                } else {
                    // Caller-pushed: above the saved fp/lr pair.
                    writeln!(self.out, "\tldr\t{}, [x29, #{}]", reg, 16 + 8 * (i - 8))?;
                }
                Ok(())
            }
            ValueKind::Inst(inst) => {
                if inst.op == Opcode::Alloca {
                    let off = self.slot_offset(v)?;
                    writeln!(self.out, "\tadd\t{}, sp, #{}", reg, off)?;
                } else {
                    let off = self.slot_offset(v)?;
                    writeln!(self.out, "\tldr\t{}, [sp, #{}]", reg, off)?;
                }
                Ok(())
            }
        }
    }

    /// Load a float value into the named d/s-register.
    fn load_flt(
        &mut self,
        func: &Function,
        v: ValueId,
        reg: &str,
        is_f32: bool,
    ) -> Result<(), CodeGenError> {
        match &func.value(v).kind {
            ValueKind::ConstFloat(value) => {
                if is_f32 {
                    let bits = (*value as f32).to_bits() as i64;
                    self.emit_mov_imm("x9", bits)?;
                    writeln!(self.out, "\tfmov\t{}, w9", reg)?;
                } else {
                    self.emit_mov_imm("x9", value.to_bits() as i64)?;
                    writeln!(self.out, "\tfmov\t{}, x9", reg)?;
                }
                Ok(())
            }
            ValueKind::Param(i) => {
                if *i < 8 {
                    writeln!(self.out, "\tfmov\t{}, {}{}", reg, fp_class(is_f32), i)?;
                } else {
                    writeln!(self.out, "\tldr\t{}, [x29, #{}]", reg, 16 + 8 * (i - 8))?;
                }
                Ok(())
            }
            _ => {
                let off = self.slot_offset(v)?;
                writeln!(self.out, "\tldr\t{}, [sp, #{}]", reg, off)?;
                Ok(())
            }
        }
    }

    /// Store the canonical result register to the value's slot.
    fn store_result(&mut self, func: &Function, v: ValueId) -> Result<(), CodeGenError> {
        let ty = func.value(v).ty.clone();
        if ty == IrType::Void {
            return Ok(());
        }
        let off = self.slot_offset(v)?;
        match ty {
            IrType::F32 => writeln!(self.out, "\tstr\ts0, [sp, #{}]", off)?,
            IrType::F64 => writeln!(self.out, "\tstr\td0, [sp, #{}]", off)?,
            _ => writeln!(self.out, "\tstr\tx9, [sp, #{}]", off)?,
        }
        Ok(())
    }

    /// φ nodes at the start of a block.
    fn phis_of(func: &Function, block: BlockId) -> Vec<ValueId> {
        func.block(block)
            .insts
            .iter()
            .copied()
            .take_while(|&v| {
                func.inst(v)
                    .map(|i| i.op == Opcode::Phi || i.op == Opcode::Nop)
                    .unwrap_or(false)
            })
            .filter(|&v| func.inst(v).map(|i| i.op == Opcode::Phi).unwrap_or(false))
            .collect()
    }

    /// Copy the incoming values for `target`'s φs on the edge from
    /// `from`.
    fn emit_phi_copies(
        &mut self,
        func: &Function,
        from: BlockId,
        target: BlockId,
    ) -> Result<(), CodeGenError> {
        for phi in Self::phis_of(func, target) {
            let inst = func.inst(phi).expect("phi instruction");
            let Some((value, _)) = inst.incoming.iter().find(|(_, b)| *b == from) else {
                continue;
            };
            let value = *value;
            let ty = func.value(phi).ty.clone();
            let off = self.slot_offset(phi)?;
            match ty {
                IrType::F32 => {
                    self.load_flt(func, value, "s0", true)?;
                    writeln!(self.out, "\tstr\ts0, [sp, #{}]", off)?;
                }
                IrType::F64 => {
                    self.load_flt(func, value, "d0", false)?;
                    writeln!(self.out, "\tstr\td0, [sp, #{}]", off)?;
                }
                _ => {
                    self.load_int(func, value, "x9")?;
                    writeln!(self.out, "\tstr\tx9, [sp, #{}]", off)?;
                }
            }
        }
        Ok(())
    }

    fn has_phis(func: &Function, block: BlockId) -> bool {
        !Self::phis_of(func, block).is_empty()
    }

    fn emit_epilogue(&mut self) -> Result<(), CodeGenError> {
        if self.has_frame {
            writeln!(self.out, "\tmov\tsp, x29")?;
            writeln!(self.out, "\tldp\tx29, x30, [sp], #16")?;
        }
        writeln!(self.out, "\tret")?;
        Ok(())
    }

    /// Pre-scan for compare-branch fusion: a comparison immediately
    /// followed by the conditional branch that is its only use.
    fn find_fusions(func: &Function) -> HashSet<ValueId> {
        let uses = func.use_counts();
        let mut fused = HashSet::new();
        for block in &func.blocks {
            let live: Vec<ValueId> = block
                .insts
                .iter()
                .copied()
                .filter(|&v| func.inst(v).map(|i| i.op != Opcode::Nop).unwrap_or(false))
                .collect();
            for w in 0..live.len().saturating_sub(1) {
                let cmp = live[w];
                let br = live[w + 1];
                let (Some(cmp_inst), Some(br_inst)) = (func.inst(cmp), func.inst(br)) else {
                    continue;
                };
                if cmp_inst.op.is_comparison()
                    && br_inst.op == Opcode::BrCond
                    && br_inst.args.first() == Some(&cmp)
                    && uses[cmp.index()] == 1
                {
                    fused.insert(cmp);
                }
            }
        }
        fused
    }

    fn emit_function(&mut self, func: &Function, module: &Module) -> Result<(), CodeGenError> {
        self.frame = frame::analyze(func, self.arch.ptr_bytes);
        self.outgoing = if self.frame.has_call {
            8 * self.frame.max_call_args as u64
        } else {
            0
        };
        self.frame_size = round_up(
            self.outgoing + self.frame.locals_size,
            self.arch.stack_align,
        );
        self.has_frame = self.frame.has_call || self.frame_size > 0;
        self.func_name = func.name.clone();
        self.fused = Self::find_fusions(func);

        let sym = self.sym(&func.name);
        writeln!(self.out)?;
        if self.darwin {
            writeln!(self.out, "\t.globl\t{}", sym)?;
            writeln!(self.out, "\t.p2align\t2")?;
        } else {
            writeln!(self.out, "\t.globl\t{}", sym)?;
            writeln!(self.out, "\t.p2align\t2")?;
            writeln!(self.out, "\t.type\t{}, @function", sym)?;
        }
        writeln!(self.out, "{}:", sym)?;

        // Prologue. A leaf with no frame needs none at all.
        if self.has_frame {
            writeln!(self.out, "\tstp\tx29, x30, [sp, #-16]!")?;
            writeln!(self.out, "\tmov\tx29, sp")?;
            if self.frame_size > 0 {
                writeln!(self.out, "\tsub\tsp, sp, #{}", self.frame_size)?;
            }
        }

        for (bi, _) in func.blocks.iter().enumerate() {
            let block = BlockId(bi as u32);
            if bi != 0 {
                let label = self.block_label(block);
                writeln!(self.out, "{}:", label)?;
            }
            self.emit_block(func, module, block)?;
        }
        Ok(())
    }

    fn emit_block(
        &mut self,
        func: &Function,
        module: &Module,
        block: BlockId,
    ) -> Result<(), CodeGenError> {
        let insts: Vec<ValueId> = func.block(block).insts.clone();
        for vid in insts {
            self.emit_inst(func, module, block, vid)?;
        }
        Ok(())
    }

    fn emit_inst(
        &mut self,
        func: &Function,
        module: &Module,
        block: BlockId,
        vid: ValueId,
    ) -> Result<(), CodeGenError> {
        let inst = func
            .inst(vid)
            .ok_or_else(|| CodeGenError::Logic("non-instruction in block".into()))?
            .clone();
        let result_ty = func.value(vid).ty.clone();
        let is32 = int_is32(&result_ty);
        let (r9, r10, r11) = if is32 {
            ("w9", "w10", "w11")
        } else {
            ("x9", "x10", "x11")
        };

        match inst.op {
            Opcode::Nop | Opcode::Alloca | Opcode::Phi => {}

            // A fused comparison emits nothing here; the branch picks it
            // up.
            op if op.is_comparison() && self.fused.contains(&vid) => {}

            Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::And | Opcode::Or | Opcode::Xor
            | Opcode::Shl | Opcode::Shr | Opcode::Sar | Opcode::Sdiv | Opcode::Udiv => {
                self.load_int(func, inst.args[0], "x9")?;
                self.load_int(func, inst.args[1], "x10")?;
                let mnemonic = match inst.op {
                    Opcode::Add => "add",
                    Opcode::Sub => "sub",
                    Opcode::Mul => "mul",
                    Opcode::And => "and",
                    Opcode::Or => "orr",
                    Opcode::Xor => "eor",
                    Opcode::Shl => "lsl",
                    Opcode::Shr => "lsr",
                    Opcode::Sar => "asr",
                    Opcode::Sdiv => "sdiv",
                    _ => "udiv",
                };
                writeln!(self.out, "\t{}\t{}, {}, {}", mnemonic, r9, r9, r10)?;
                self.store_result(func, vid)?;
            }
            Opcode::Smod | Opcode::Umod => {
                // Divide, then multiply-subtract.
                self.load_int(func, inst.args[0], "x9")?;
                self.load_int(func, inst.args[1], "x10")?;
                let div = if inst.op == Opcode::Smod {
                    "sdiv"
                } else {
                    "udiv"
                };
                writeln!(self.out, "\t{}\t{}, {}, {}", div, r11, r9, r10)?;
                writeln!(self.out, "\tmsub\t{}, {}, {}, {}", r9, r11, r10, r9)?;
                self.store_result(func, vid)?;
            }
            Opcode::Neg => {
                self.load_int(func, inst.args[0], "x9")?;
                writeln!(self.out, "\tneg\t{}, {}", r9, r9)?;
                self.store_result(func, vid)?;
            }
            Opcode::Not => {
                self.load_int(func, inst.args[0], "x9")?;
                writeln!(self.out, "\tmvn\t{}, {}", r9, r9)?;
                self.store_result(func, vid)?;
            }

            Opcode::Load => {
                self.load_int(func, inst.args[0], "x9")?;
                let pointee = func
                    .value(inst.args[0])
                    .ty
                    .pointee()
                    .cloned()
                    .unwrap_or(IrType::I64);
                match pointee {
                    IrType::I8 => writeln!(self.out, "\tldrsb\tx9, [x9]")?,
                    IrType::U8 => writeln!(self.out, "\tldrb\tw9, [x9]")?,
                    IrType::I16 => writeln!(self.out, "\tldrsh\tx9, [x9]")?,
                    IrType::U16 => writeln!(self.out, "\tldrh\tw9, [x9]")?,
                    IrType::I32 => writeln!(self.out, "\tldrsw\tx9, [x9]")?,
                    IrType::U32 => writeln!(self.out, "\tldr\tw9, [x9]")?,
                    IrType::F32 => {
                        writeln!(self.out, "\tldr\ts0, [x9]")?;
                        self.store_result(func, vid)?;
                        return Ok(());
                    }
                    IrType::F64 => {
                        writeln!(self.out, "\tldr\td0, [x9]")?;
                        self.store_result(func, vid)?;
                        return Ok(());
                    }
                    IrType::Struct(_) | IrType::Array(..) => {
                        // Aggregate "value": its address stands in; the
                        // consuming store performs the copy.
                    }
                    _ => writeln!(self.out, "\tldr\tx9, [x9]")?,
                }
                self.store_result(func, vid)?;
            }
            Opcode::Store => {
                let value = inst.args[0];
                let addr = inst.args[1];
                let vty = func.value(value).ty.clone();
                match vty {
                    IrType::F32 => {
                        self.load_flt(func, value, "s0", true)?;
                        self.load_int(func, addr, "x10")?;
                        writeln!(self.out, "\tstr\ts0, [x10]")?;
                    }
                    IrType::F64 => {
                        self.load_flt(func, value, "d0", false)?;
                        self.load_int(func, addr, "x10")?;
                        writeln!(self.out, "\tstr\td0, [x10]")?;
                    }
                    IrType::Struct(_) | IrType::Array(..) => {
                        // Aggregate copy, word at a time.
                        self.load_int(func, value, "x9")?;
                        self.load_int(func, addr, "x10")?;
                        let size = vty.size(self.arch.ptr_bytes);
                        let mut off = 0;
                        while off + 8 <= size {
                            writeln!(self.out, "\tldr\tx11, [x9, #{}]", off)?;
                            writeln!(self.out, "\tstr\tx11, [x10, #{}]", off)?;
                            off += 8;
                        }
                        while off < size {
                            writeln!(self.out, "\tldrb\tw11, [x9, #{}]", off)?;
                            writeln!(self.out, "\tstrb\tw11, [x10, #{}]", off)?;
                            off += 1;
                        }
                    }
                    _ => {
                        self.load_int(func, value, "x9")?;
                        self.load_int(func, addr, "x10")?;
                        let pointee = func
                            .value(addr)
                            .ty
                            .pointee()
                            .cloned()
                            .unwrap_or(vty.clone());
                        match pointee.size(self.arch.ptr_bytes) {
                            1 => writeln!(self.out, "\tstrb\tw9, [x10]")?,
                            2 => writeln!(self.out, "\tstrh\tw9, [x10]")?,
                            4 => writeln!(self.out, "\tstr\tw9, [x10]")?,
                            _ => writeln!(self.out, "\tstr\tx9, [x10]")?,
                        }
                    }
                }
            }
            Opcode::Gep => {
                self.load_int(func, inst.args[0], "x9")?;
                self.load_int(func, inst.args[1], "x10")?;
                let elem = inst.aux.clone().unwrap_or(IrType::I8);
                let size = elem.size(self.arch.ptr_bytes).max(1);
                if size == 1 {
                    writeln!(self.out, "\tadd\tx9, x9, x10")?;
                } else {
                    self.emit_mov_imm("x11", size as i64)?;
                    writeln!(self.out, "\tmadd\tx9, x10, x11, x9")?;
                }
                self.store_result(func, vid)?;
            }
            Opcode::StructGep => {
                self.load_int(func, inst.args[0], "x9")?;
                let offset = match &inst.aux {
                    Some(IrType::Struct(s)) => {
                        s.offsets.get(inst.field as usize).copied().unwrap_or(0)
                    }
                    _ => 0,
                };
                if offset > 0 {
                    writeln!(self.out, "\tadd\tx9, x9, #{}", offset)?;
                }
                self.store_result(func, vid)?;
            }

            op if op.is_comparison() => {
                self.emit_compare(func, &inst, "x9", "x10")?;
                let cond = cond_of(op, inst.fpred);
                writeln!(self.out, "\tcset\tx9, {}", cond)?;
                self.store_result(func, vid)?;
            }

            Opcode::Select => {
                self.load_int(func, inst.args[0], "x9")?;
                self.load_int(func, inst.args[1], "x10")?;
                self.load_int(func, inst.args[2], "x11")?;
                writeln!(self.out, "\tcmp\tx9, #0")?;
                writeln!(self.out, "\tcsel\tx9, x10, x11, ne")?;
                self.store_result(func, vid)?;
            }

            Opcode::Trunc | Opcode::Bitcast | Opcode::Ptrtoint | Opcode::Inttoptr => {
                let src = inst.args[0];
                let src_ty = func.value(src).ty.clone();
                if src_ty.is_float() || result_ty.is_float() {
                    // Bit-pattern move between register files.
                    if src_ty.is_float() {
                        self.load_flt(func, src, fp_reg(&src_ty), src_ty == IrType::F32)?;
                        writeln!(
                            self.out,
                            "\tfmov\t{}, {}",
                            if src_ty == IrType::F32 { "w9" } else { "x9" },
                            fp_reg(&src_ty)
                        )?;
                    } else {
                        self.load_int(func, src, "x9")?;
                        writeln!(
                            self.out,
                            "\tfmov\t{}, {}",
                            fp_reg(&result_ty),
                            if result_ty == IrType::F32 { "w9" } else { "x9" }
                        )?;
                    }
                } else {
                    self.load_int(func, src, "x9")?;
                    if inst.op == Opcode::Trunc {
                        match result_ty.size(8) {
                            1 => writeln!(self.out, "\tand\tx9, x9, #0xff")?,
                            2 => writeln!(self.out, "\tand\tx9, x9, #0xffff")?,
                            4 => writeln!(self.out, "\tmov\tw9, w9")?,
                            _ => {}
                        }
                    }
                }
                self.store_result(func, vid)?;
            }
            Opcode::Sext => {
                let src = inst.args[0];
                let src_size = func.value(src).ty.size(8);
                self.load_int(func, src, "x9")?;
                match src_size {
                    1 => writeln!(self.out, "\tsxtb\tx9, w9")?,
                    2 => writeln!(self.out, "\tsxth\tx9, w9")?,
                    4 => writeln!(self.out, "\tsxtw\tx9, w9")?,
                    _ => {}
                }
                self.store_result(func, vid)?;
            }
            Opcode::Zext => {
                let src = inst.args[0];
                let src_size = func.value(src).ty.size(8);
                self.load_int(func, src, "x9")?;
                match src_size {
                    1 => writeln!(self.out, "\tand\tx9, x9, #0xff")?,
                    2 => writeln!(self.out, "\tand\tx9, x9, #0xffff")?,
                    4 => writeln!(self.out, "\tmov\tw9, w9")?,
                    _ => {}
                }
                self.store_result(func, vid)?;
            }

            Opcode::Fadd | Opcode::Fsub | Opcode::Fmul | Opcode::Fdiv => {
                let is_f32 = result_ty == IrType::F32;
                let (a, b) = if is_f32 { ("s0", "s1") } else { ("d0", "d1") };
                self.load_flt(func, inst.args[0], a, is_f32)?;
                self.load_flt(func, inst.args[1], b, is_f32)?;
                let mnemonic = match inst.op {
                    Opcode::Fadd => "fadd",
                    Opcode::Fsub => "fsub",
                    Opcode::Fmul => "fmul",
                    _ => "fdiv",
                };
                writeln!(self.out, "\t{}\t{}, {}, {}", mnemonic, a, a, b)?;
                self.store_result(func, vid)?;
            }
            Opcode::Fneg | Opcode::Fabs => {
                let is_f32 = result_ty == IrType::F32;
                let a = if is_f32 { "s0" } else { "d0" };
                self.load_flt(func, inst.args[0], a, is_f32)?;
                let mnemonic = if inst.op == Opcode::Fneg { "fneg" } else { "fabs" };
                writeln!(self.out, "\t{}\t{}, {}", mnemonic, a, a)?;
                self.store_result(func, vid)?;
            }
            Opcode::Sitofp | Opcode::Uitofp => {
                self.load_int(func, inst.args[0], "x9")?;
                let dst = fp_reg(&result_ty);
                let cvt = if inst.op == Opcode::Sitofp {
                    "scvtf"
                } else {
                    "ucvtf"
                };
                writeln!(self.out, "\t{}\t{}, x9", cvt, dst)?;
                self.store_result(func, vid)?;
            }
            Opcode::Fptosi | Opcode::Fptoui => {
                let src = inst.args[0];
                let src_ty = func.value(src).ty.clone();
                let is_f32 = src_ty == IrType::F32;
                let sreg = fp_reg(&src_ty);
                self.load_flt(func, src, sreg, is_f32)?;
                let cvt = if inst.op == Opcode::Fptosi {
                    "fcvtzs"
                } else {
                    "fcvtzu"
                };
                writeln!(self.out, "\t{}\tx9, {}", cvt, sreg)?;
                self.store_result(func, vid)?;
            }
            Opcode::Fpext => {
                self.load_flt(func, inst.args[0], "s0", true)?;
                writeln!(self.out, "\tfcvt\td0, s0")?;
                self.store_result(func, vid)?;
            }
            Opcode::Fptrunc => {
                self.load_flt(func, inst.args[0], "d0", false)?;
                writeln!(self.out, "\tfcvt\ts0, d0")?;
                self.store_result(func, vid)?;
            }

            Opcode::Call => self.emit_call(func, module, vid, &inst)?,
            Opcode::Ret => {
                if let Some(&value) = inst.args.first() {
                    let ty = func.value(value).ty.clone();
                    match ty {
                        IrType::F32 => self.load_flt(func, value, "s0", true)?,
                        IrType::F64 => self.load_flt(func, value, "d0", false)?,
                        _ => self.load_int(func, value, "x0")?,
                    }
                }
                self.emit_epilogue()?;
            }
            Opcode::Br => {
                let target = inst.blocks[0].expect("br target");
                self.emit_phi_copies(func, block, target)?;
                writeln!(self.out, "\tb\t{}", self.block_label(target))?;
            }
            Opcode::BrCond => self.emit_br_cond(func, block, &inst)?,
            _ => {
                return Err(CodeGenError::Logic(format!(
                    "arm64: unhandled opcode {}",
                    inst.op.mnemonic()
                )))
            }
        }
        Ok(())
    }

    /// Emit the flag-setting compare for a comparison instruction.
    fn emit_compare(
        &mut self,
        func: &Function,
        inst: &Inst,
        r0: &str,
        r1: &str,
    ) -> Result<(), CodeGenError> {
        let lhs_ty = func.value(inst.args[0]).ty.clone();
        if lhs_ty.is_float() {
            let is_f32 = lhs_ty == IrType::F32;
            let (a, b) = if is_f32 { ("s0", "s1") } else { ("d0", "d1") };
            self.load_flt(func, inst.args[0], a, is_f32)?;
            self.load_flt(func, inst.args[1], b, is_f32)?;
            writeln!(self.out, "\tfcmp\t{}, {}", a, b)?;
        } else {
            self.load_int(func, inst.args[0], r0)?;
            self.load_int(func, inst.args[1], r1)?;
            let is32 = int_is32(&lhs_ty);
            let (a, b) = if is32 {
                (r0.replacen('x', "w", 1), r1.replacen('x', "w", 1))
            } else {
                (r0.to_string(), r1.to_string())
            };
            writeln!(self.out, "\tcmp\t{}, {}", a, b)?;
        }
        Ok(())
    }

    fn emit_br_cond(
        &mut self,
        func: &Function,
        block: BlockId,
        inst: &Inst,
    ) -> Result<(), CodeGenError> {
        let true_b = inst.blocks[0].expect("br_cond true target");
        let false_b = inst.blocks[1].expect("br_cond false target");
        let cond = inst.args[0];

        // Both-side φs need a short critical-edge block for the taken
        // side; the fall-through side copies inline.
        let true_phis = Self::has_phis(func, true_b);
        let false_phis = Self::has_phis(func, false_b);
        let true_label = if true_phis {
            self.local_label("edge")
        } else {
            self.block_label(true_b)
        };

        // Condition: fused compare or a truthiness test.
        let fused_cmp = func.inst(cond).filter(|_| self.fused.contains(&cond));
        match fused_cmp {
            Some(cmp_inst) => {
                let cmp_inst = cmp_inst.clone();
                // Compare against zero collapses to cbz/cbnz.
                let zero_arg = cmp_zero_operand(func, &cmp_inst);
                match zero_arg {
                    Some(nonzero)
                        if matches!(cmp_inst.op, Opcode::CmpEq | Opcode::CmpNe)
                            && !func.value(nonzero).ty.is_float() =>
                    {
                        self.load_int(func, nonzero, "x9")?;
                        let reg = if int_is32(&func.value(nonzero).ty) {
                            "w9"
                        } else {
                            "x9"
                        };
                        let mnemonic = if cmp_inst.op == Opcode::CmpEq {
                            "cbz"
                        } else {
                            "cbnz"
                        };
                        writeln!(self.out, "\t{}\t{}, {}", mnemonic, reg, true_label)?;
                    }
                    _ => {
                        self.emit_compare(func, &cmp_inst, "x9", "x10")?;
                        let cond_code = cond_of(cmp_inst.op, cmp_inst.fpred);
                        writeln!(self.out, "\tb.{}\t{}", cond_code, true_label)?;
                    }
                }
            }
            None => {
                self.load_int(func, cond, "x9")?;
                writeln!(self.out, "\tcbnz\tx9, {}", true_label)?;
            }
        }

        // Fall-through: false edge.
        if false_phis {
            self.emit_phi_copies(func, block, false_b)?;
        }
        writeln!(self.out, "\tb\t{}", self.block_label(false_b))?;

        if true_phis {
            writeln!(self.out, "{}:", true_label)?;
            self.emit_phi_copies(func, block, true_b)?;
            writeln!(self.out, "\tb\t{}", self.block_label(true_b))?;
        }
        Ok(())
    }

    fn emit_call(
        &mut self,
        func: &Function,
        _module: &Module,
        vid: ValueId,
        inst: &Inst,
    ) -> Result<(), CodeGenError> {
        let callee = inst.args[0];
        let args = &inst.args[1..];

        // Callee signature decides variadic handling.
        let sig = match &func.value(callee).ty {
            IrType::Func(sig) => Some(sig.clone()),
            IrType::Ptr(inner) => match inner.as_ref() {
                IrType::Func(sig) => Some(sig.clone()),
                _ => None,
            },
            _ => None,
        };
        let fixed = sig.as_ref().map(|s| s.params.len()).unwrap_or(args.len());
        let variadic = sig.as_ref().map(|s| s.variadic).unwrap_or(false);

        let mut int_reg = 0usize;
        let mut flt_reg = 0usize;
        let mut stack_off = 0u64;
        for (i, &arg) in args.iter().enumerate() {
            let ty = func.value(arg).ty.clone();
            // Darwin passes every variadic argument on the stack, even
            // with registers to spare.
            let on_stack = (self.darwin && variadic && i >= fixed)
                || (ty.is_float() && flt_reg >= 8)
                || (!ty.is_float() && int_reg >= 8);
            if on_stack {
                match ty {
                    IrType::F32 => {
                        self.load_flt(func, arg, "s1", true)?;
                        writeln!(self.out, "\tstr\ts1, [sp, #{}]", stack_off)?;
                    }
                    IrType::F64 => {
                        self.load_flt(func, arg, "d1", false)?;
                        writeln!(self.out, "\tstr\td1, [sp, #{}]", stack_off)?;
                    }
                    _ => {
                        self.load_int(func, arg, "x9")?;
                        writeln!(self.out, "\tstr\tx9, [sp, #{}]", stack_off)?;
                    }
                }
                stack_off += 8;
            } else if ty.is_float() {
                let reg = format!("{}{}", fp_class(ty == IrType::F32), flt_reg);
                self.load_flt(func, arg, &reg, ty == IrType::F32)?;
                flt_reg += 1;
            } else {
                let reg = format!("x{}", int_reg);
                self.load_int(func, arg, &reg)?;
                int_reg += 1;
            }
        }

        match &func.value(callee).kind {
            ValueKind::FuncRef(name) => {
                let label = self.sym(name);
                writeln!(self.out, "\tbl\t{}", label)?;
            }
            _ => {
                // Indirect: the pointer loads last so argument setup
                // cannot clobber it.
                self.load_int(func, callee, "x16")?;
                writeln!(self.out, "\tblr\tx16")?;
            }
        }

        let ret_ty = func.value(vid).ty.clone();
        if ret_ty != IrType::Void {
            let off = self.slot_offset(vid)?;
            match ret_ty {
                IrType::F32 => writeln!(self.out, "\tstr\ts0, [sp, #{}]", off)?,
                IrType::F64 => writeln!(self.out, "\tstr\td0, [sp, #{}]", off)?,
                _ => writeln!(self.out, "\tstr\tx0, [sp, #{}]", off)?,
            }
        }
        Ok(())
    }

    fn emit_globals(&mut self, module: &Module) -> Result<(), CodeGenError> {
        // Initialized data first, zero-fill after.
        let (data, bss): (Vec<&Global>, Vec<&Global>) = module
            .globals
            .iter()
            .partition(|g| !g.init.is_zero());

        if !data.is_empty() {
            if self.darwin {
                writeln!(self.out, "\n\t.section\t__DATA,__data")?;
            } else {
                writeln!(self.out, "\n\t.data")?;
            }
            for global in data {
                let sym = self.sym(&global.name);
                if !global.is_static {
                    writeln!(self.out, "\t.globl\t{}", sym)?;
                }
                writeln!(self.out, "\t.p2align\t{}", global.align.trailing_zeros())?;
                writeln!(self.out, "{}:", sym)?;
                self.emit_init(&global.init, &global.ty)?;
            }
        }
        if !bss.is_empty() {
            if self.darwin {
                for global in bss {
                    let sym = self.sym(&global.name);
                    let size = global.ty.size(8).max(1);
                    writeln!(
                        self.out,
                        "\t.zerofill\t__DATA,__bss,{},{},{}",
                        sym,
                        size,
                        global.align.trailing_zeros()
                    )?;
                }
            } else {
                writeln!(self.out, "\n\t.bss")?;
                for global in bss {
                    let sym = self.sym(&global.name);
                    if !global.is_static {
                        writeln!(self.out, "\t.globl\t{}", sym)?;
                    }
                    writeln!(self.out, "\t.p2align\t{}", global.align.trailing_zeros())?;
                    writeln!(self.out, "{}:", sym)?;
                    writeln!(self.out, "\t.zero\t{}", global.ty.size(8).max(1))?;
                }
            }
        }
        Ok(())
    }

    fn emit_init(&mut self, init: &GlobalInit, ty: &IrType) -> Result<(), CodeGenError> {
        match init {
            GlobalInit::Zero => {
                writeln!(self.out, "\t.zero\t{}", ty.size(8).max(1))?;
            }
            GlobalInit::Int(v) => match ty.size(8) {
                1 => writeln!(self.out, "\t.byte\t{}", v)?,
                2 => writeln!(self.out, "\t.hword\t{}", v)?,
                4 => writeln!(self.out, "\t.word\t{}", v)?,
                _ => writeln!(self.out, "\t.xword\t{}", v)?,
            },
            GlobalInit::Float(v) => match ty {
                IrType::F32 => writeln!(
                    self.out,
                    "\t.word\t0x{:08x}",
                    (*v as f32).to_bits()
                )?,
                _ => writeln!(self.out, "\t.xword\t0x{:016x}", v.to_bits())?,
            },
            GlobalInit::StrPtr(i) => {
                let label = self.str_label(*i);
                writeln!(self.out, "\t.xword\t{}", label)?;
            }
            GlobalInit::Array(items) => {
                let elem = match ty {
                    IrType::Array(elem, _) => (**elem).clone(),
                    IrType::Struct(_) => IrType::I64,
                    other => other.clone(),
                };
                if let IrType::Struct(s) = ty {
                    for (i, item) in items.iter().enumerate() {
                        let fty = s.fields.get(i).cloned().unwrap_or(IrType::I64);
                        self.emit_init(item, &fty)?;
                    }
                } else {
                    for item in items {
                        self.emit_init(item, &elem)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn emit_strings(&mut self, module: &Module) -> Result<(), CodeGenError> {
        if module.strings.is_empty() {
            return Ok(());
        }
        if self.darwin {
            writeln!(self.out, "\n\t.section\t__TEXT,__cstring,cstring_literals")?;
        } else {
            writeln!(self.out, "\n\t.section\t.rodata")?;
        }
        for (i, bytes) in module.strings.iter().enumerate() {
            let label = self.str_label(i);
            writeln!(self.out, "{}:", label)?;
            writeln!(self.out, "\t.asciz\t\"{}\"", escape_gas(bytes))?;
        }
        Ok(())
    }
}

impl Backend for Arm64Backend {
    fn arch_info(&self) -> &ArchInfo {
        &self.arch
    }

    fn reset(&mut self) {
        self.out.clear();
        self.frame = FrameLayout::default();
        self.fused.clear();
        self.label_counter = 0;
        self.func_name.clear();
    }

    fn codegen_module(&mut self, module: &Module) -> Result<String, CodeGenError> {
        self.reset();
        if self.darwin {
            writeln!(
                self.out,
                "\t.section\t__TEXT,__text,regular,pure_instructions"
            )?;
        } else {
            writeln!(self.out, "\t.text")?;
        }
        for func in &module.functions {
            if !func.is_declaration {
                self.emit_function(func, module)?;
            }
        }
        self.emit_globals(module)?;
        self.emit_strings(module)?;
        Ok(std::mem::take(&mut self.out))
    }

    fn codegen_func(&mut self, func: &Function, module: &Module) -> Result<String, CodeGenError> {
        self.reset();
        self.emit_function(func, module)?;
        Ok(std::mem::take(&mut self.out))
    }
}

fn int_is32(ty: &IrType) -> bool {
    matches!(
        ty,
        IrType::I8 | IrType::U8 | IrType::I16 | IrType::U16 | IrType::I32 | IrType::U32
    )
}

fn fp_class(is_f32: bool) -> &'static str {
    if is_f32 {
        "s"
    } else {
        "d"
    }
}

fn fp_reg(ty: &IrType) -> &'static str {
    if *ty == IrType::F32 {
        "s0"
    } else {
        "d0"
    }
}

/// When one comparison operand is a constant zero, return the other.
fn cmp_zero_operand(func: &Function, inst: &Inst) -> Option<ValueId> {
    let is_zero = |v: ValueId| {
        matches!(
            func.value(v).kind,
            ValueKind::ConstInt(0) | ValueKind::ConstNull
        )
    };
    if is_zero(inst.args[1]) {
        return Some(inst.args[0]);
    }
    if is_zero(inst.args[0]) {
        return Some(inst.args[1]);
    }
    None
}

/// Condition code for a comparison opcode.
fn cond_of(op: Opcode, fpred: Option<FloatPred>) -> &'static str {
    if let Some(pred) = fpred {
        return match pred {
            FloatPred::Oeq => "eq",
            FloatPred::One => "ne",
            FloatPred::Olt => "mi",
            FloatPred::Ole => "ls",
            FloatPred::Ogt => "gt",
            FloatPred::Oge => "ge",
        };
    }
    match op {
        Opcode::CmpEq => "eq",
        Opcode::CmpNe => "ne",
        Opcode::CmpLt => "lt",
        Opcode::CmpLe => "le",
        Opcode::CmpGt => "gt",
        Opcode::CmpGe => "ge",
        Opcode::CmpUlt => "lo",
        Opcode::CmpUle => "ls",
        Opcode::CmpUgt => "hi",
        Opcode::CmpUge => "hs",
        _ => "ne",
    }
}

/// Escape bytes for a GAS string literal.
fn escape_gas(bytes: &[u8]) -> String {
    let mut out = String::new();
    for &b in bytes {
        match b {
            b'"' => out.push_str("\\\""),
            b'\\' => out.push_str("\\\\"),
            b'\n' => out.push_str("\\n"),
            b'\t' => out.push_str("\\t"),
            b'\r' => out.push_str("\\r"),
            0x20..=0x7e => out.push(b as char),
            _ => {
                out.push_str(&format!("\\{:03o}", b));
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diag::Diagnostics;
    use crate::irgen::IrGen;
    use crate::lexer::Lexer;
    use crate::parser::Parser;
    use crate::sema::Sema;
    use crate::standard::Standard;
    use crate::symbols::SymbolTable;
    use crate::types::TypeTable;

    fn compile(src: &str, darwin: bool) -> String {
        let std = Standard::C99;
        let mut diags = Diagnostics::new(false, false, false);
        let mut types = TypeTable::new(TargetLayout::lp64());
        let mut symbols = SymbolTable::new();
        let tokens = Lexer::new("t.c", src, std).run(&mut diags);
        let mut unit = Parser::new(tokens, std, &mut types, &mut diags).parse();
        Sema::new(&mut types, &mut symbols, &mut diags, std).run(&mut unit);
        assert!(!diags.has_errors(), "{}", diags.render());
        let mut module = Module::new("t.c");
        IrGen::new(&types, &symbols, &mut module, &mut diags).lower_unit(&unit);
        assert!(module.verify().is_ok(), "{:?}", module.verify());
        let mut backend = Arm64Backend::new(darwin);
        backend.prepare_ir(&mut module, 1).unwrap();
        backend.codegen_module(&module).unwrap()
    }

    #[test]
    fn test_hello_world_assembly() {
        let asm = compile("int main(void) { return 0; }", false);
        assert!(asm.contains(".globl\tmain"));
        assert!(asm.contains("main:"));
        assert!(asm.contains("mov\tx0, #0"));
        assert!(asm.contains("ret"));
    }

    #[test]
    fn test_darwin_symbol_prefix() {
        let asm = compile("int main(void) { return 0; }", true);
        assert!(asm.contains(".globl\t_main"));
        assert!(asm.contains("_main:"));
        assert!(asm.contains("__TEXT,__text"));
    }

    #[test]
    fn test_leaf_without_frame_skips_prologue() {
        let asm = compile("int id(void) { return 7; }", false);
        // A frameless leaf omits the stp/ldp pair entirely.
        let func_part = asm.split("id:").nth(1).unwrap();
        let body: String = func_part
            .lines()
            .take_while(|l| !l.contains(".data") && !l.contains(".globl"))
            .collect::<Vec<_>>()
            .join("\n");
        assert!(!body.contains("stp"), "leaf should skip prologue:\n{}", body);
    }

    #[test]
    fn test_frame_alignment() {
        let asm = compile(
            "int f(int a) { int b[3]; b[0] = a; return b[0]; }",
            false,
        );
        // The sub sp adjustment must be 16-byte aligned.
        for line in asm.lines() {
            if let Some(rest) = line.trim().strip_prefix("sub\tsp, sp, #") {
                let n: u64 = rest.parse().unwrap();
                assert_eq!(n % 16, 0, "unaligned frame: {}", n);
            }
        }
        assert!(asm.contains("stp\tx29, x30, [sp, #-16]!"));
        assert!(asm.contains("ldp\tx29, x30, [sp], #16"));
    }

    #[test]
    fn test_compare_branch_fusion() {
        let asm = compile(
            "void g(void); int f(int a, int b) { if (a < b) g(); return 0; }",
            false,
        );
        assert!(asm.contains("b.lt"), "fused compare expected:\n{}", asm);
        assert!(!asm.contains("cset"), "no cset for fused compare:\n{}", asm);
    }

    #[test]
    fn test_compare_zero_uses_cbz() {
        let asm = compile(
            "void g(void); void f(int a) { if (a == 0) g(); }",
            false,
        );
        assert!(asm.contains("cbz"), "cbz expected:\n{}", asm);
    }

    #[test]
    fn test_divmod_sequence() {
        let asm = compile("int f(int a, int b) { return a % b; }", false);
        assert!(asm.contains("sdiv"));
        assert!(asm.contains("msub"));
    }

    #[test]
    fn test_global_emission() {
        let asm = compile("int x = 14; int zeroed; static int s = 3;", false);
        assert!(asm.contains(".data"));
        assert!(asm.contains("x:"));
        assert!(asm.contains(".word\t14"));
        // Zero-initialized goes to .bss.
        assert!(asm.contains(".bss"));
        assert!(asm.contains("zeroed:"));
        // Statics are not exported.
        let statics: Vec<&str> = asm.lines().filter(|l| l.contains(".globl\ts")).collect();
        assert!(statics.is_empty(), "static should not be .globl");
    }

    #[test]
    fn test_string_pool() {
        let asm = compile(
            "int puts(const char *); int main(void) { puts(\"hi\"); puts(\"hi\"); return 0; }",
            false,
        );
        assert!(asm.contains(".rodata"));
        assert_eq!(asm.matches(".asciz\t\"hi\"").count(), 1);
        assert!(asm.contains("bl\tputs"));
    }

    #[test]
    fn test_call_arguments_in_registers() {
        let asm = compile(
            "int add3(int a, int b, int c); int main(void) { return add3(1, 2, 3); }",
            false,
        );
        assert!(asm.contains("mov\tx0, #1"));
        assert!(asm.contains("mov\tx1, #2"));
        assert!(asm.contains("mov\tx2, #3"));
        assert!(asm.contains("bl\tadd3"));
    }

    #[test]
    fn test_ninth_argument_on_stack() {
        let asm = compile(
            "int f(int,int,int,int,int,int,int,int,int); \
             int main(void) { return f(1,2,3,4,5,6,7,8,9); }",
            false,
        );
        assert!(asm.contains("str\tx9, [sp, #0]"), "9th arg on stack:\n{}", asm);
    }

    #[test]
    fn test_darwin_variadic_on_stack() {
        let asm = compile(
            "int printf(const char *, ...); int main(void) { return printf(\"%d\", 5); }",
            true,
        );
        // The variadic argument goes to the stack even though x1 is free.
        assert!(asm.contains("str\tx9, [sp, #0]"), "variadic on stack:\n{}", asm);
    }

    #[test]
    fn test_float_emission() {
        let asm = compile("double f(double a, double b) { return a * b; }", false);
        assert!(asm.contains("fmul\td0, d0, d1"));
    }

    #[test]
    fn test_global_float_bit_pattern() {
        let asm = compile("double d = 1.5;", false);
        assert!(asm.contains(&format!("0x{:016x}", 1.5f64.to_bits())));
    }

    #[test]
    fn test_phi_copies_emitted() {
        let asm = compile("int f(int a, int b) { return a && b; }", false);
        // The short-circuit phi forces stores into the phi slot on both
        // edges.
        assert!(asm.contains("cbnz") || asm.contains("cbz") || asm.contains("b."));
    }
}
