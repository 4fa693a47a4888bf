//! Mainframe backend
//!
//! Big-endian S/370-style target: 16 general-purpose registers, 31-bit
//! addressing, hexadecimal floating point on the even-numbered FP
//! registers, 8-byte stack alignment, and a stack that grows upward
//! through chained save areas. Output is HLASM source.
//!
//! Linkage follows the MVS convention: the caller's R13 points at its
//! save area, the prologue stores R14/R15/R0-R12 at `12(13)`, picks up
//! the next available byte from the caller's frame, chains the new save
//! area both ways, and keeps the incoming R1 parameter list in R11.
//! Arguments travel as a list of 4-byte addresses; the high bit of the
//! last entry is the VL end-of-list marker.
//!
//! Notable instruction selection:
//! - multiplication and division work on even/odd register pairs
//!   (`MR`, and `SRDA 32` to sign-extend the dividend before `D`)
//! - a materialized comparison builds its 0/1 with a `BC cond,*+6` that
//!   skips exactly the 2-byte `SR` clearing the result
//! - integer to HFP conversion uses the exponent-aligning magic number
//!   (`X'4E...'`), store-and-load through the frame scratch slot
//!
//! Symbols are uppercased; block labels combine `FUNC$N` so they never
//! collide across functions.

use super::frame::{self, FrameLayout};
use super::{ArchInfo, Backend, CodeGenError};
use crate::ir::*;
use crate::types::{round_up, TargetLayout};
use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;

/// Frame offsets (from R13).
const SAVE_AREA_SIZE: u64 = 72;
const NAB_OFFSET: u64 = 76;
const SCRATCH_OFFSET: u64 = 80;
const LOCALS_BASE: u64 = 88;

/// Size of the statically reserved stack for the bootstrap frame chain.
const STACK_RESERVE: u64 = 65536;

pub struct S390Backend {
    arch: ArchInfo,
    out: String,
    frame: FrameLayout,
    frame_size: u64,
    /// Offset of the outgoing argument value slots.
    argv_base: u64,
    /// Offset of the outgoing argument address list.
    arglist_base: u64,
    func_label: String,
    fused: HashSet<ValueId>,
    mangled: HashMap<String, String>,
    used_names: HashSet<String>,
    edge_counter: u32,
    needs_stack: bool,
}

impl S390Backend {
    pub fn new() -> Self {
        S390Backend {
            arch: ArchInfo {
                name: "s390",
                ptr_bytes: 4,
                addr_bits: 31,
                word_bytes: 4,
                gpr_count: 16,
                fpr_count: 4,
                big_endian: true,
                stack_align: 8,
                stack_grows_down: false,
                has_condition_codes: true,
                has_delay_slots: false,
                layout: TargetLayout::ilp32(),
            },
            out: String::new(),
            frame: FrameLayout::default(),
            frame_size: 0,
            argv_base: 0,
            arglist_base: 0,
            func_label: String::new(),
            fused: HashSet::new(),
            mangled: HashMap::new(),
            used_names: HashSet::new(),
            edge_counter: 0,
            needs_stack: false,
        }
    }

    /// Uppercase a C identifier into a unique assembler symbol.
    fn mangle(&mut self, name: &str) -> String {
        if let Some(m) = self.mangled.get(name) {
            return m.clone();
        }
        let mut base: String = name
            .chars()
            .map(|c| match c {
                'a'..='z' => c.to_ascii_uppercase(),
                'A'..='Z' | '0'..='9' | '_' | '$' | '#' | '@' => c,
                _ => '$',
            })
            .collect();
        if base.is_empty() {
            base.push('@');
        }
        let mut unique = base.clone();
        let mut n = 1;
        while self.used_names.contains(&unique) {
            unique = format!("{}{}", base, n);
            n += 1;
        }
        self.used_names.insert(unique.clone());
        self.mangled.insert(name.to_string(), unique.clone());
        unique
    }

    fn line(&mut self, label: &str, op: &str, operands: &str) -> Result<(), CodeGenError> {
        if operands.is_empty() {
            writeln!(self.out, "{:<8} {}", label, op)?;
        } else {
            writeln!(self.out, "{:<8} {:<5} {}", label, op, operands)?;
        }
        Ok(())
    }

    fn op(&mut self, op: &str, operands: &str) -> Result<(), CodeGenError> {
        self.line("", op, operands)
    }

    fn comment(&mut self, text: &str) -> Result<(), CodeGenError> {
        writeln!(self.out, "*        {}", text)?;
        Ok(())
    }

    fn block_label(&self, block: BlockId) -> String {
        format!("{}${}", self.func_label, block.0)
    }

    fn slot_disp(&self, v: ValueId) -> Result<u64, CodeGenError> {
        self.frame
            .slot(v)
            .map(|o| LOCALS_BASE + o)
            .ok_or_else(|| CodeGenError::Logic(format!("value %{} has no stack slot", v.0)))
    }

    /// Load an integer (or pointer) value into a register.
    fn load_int(&mut self, func: &Function, v: ValueId, reg: u32) -> Result<(), CodeGenError> {
        match &func.value(v).kind {
            ValueKind::ConstInt(value) => {
                let word = *value as i32;
                self.op("L", &format!("{},=F'{}'", reg, word))
            }
            ValueKind::ConstNull => self.op("SR", &format!("{},{}", reg, reg)),
            ValueKind::ConstFloat(value) => {
                self.op("L", &format!("{},=F'{}'", reg, *value as i32))
            }
            ValueKind::ConstString(i) => self.op("L", &format!("{},=A(@STR{})", reg, i)),
            ValueKind::Global(name) => {
                let m = self.mangle(name);
                self.op("L", &format!("{},=A({})", reg, m))
            }
            ValueKind::FuncRef(name) => {
                let m = self.mangle(name);
                self.op("L", &format!("{},=V({})", reg, m))
            }
            ValueKind::Param(i) => {
                // R11 points at the list of argument addresses.
                self.op("L", &format!("{},{}(,11)", reg, 4 * i))?;
                self.op("L", &format!("{},0(,{})", reg, reg))
            }
            ValueKind::Inst(inst) => {
                let disp = self.slot_disp(v)?;
                if inst.op == Opcode::Alloca {
                    self.op("LA", &format!("{},{}(,13)", reg, disp))
                } else {
                    self.op("L", &format!("{},{}(,13)", reg, disp))
                }
            }
        }
    }

    /// Load a float value into an even FP register.
    fn load_flt(&mut self, func: &Function, v: ValueId, freg: u32) -> Result<(), CodeGenError> {
        match &func.value(v).kind {
            ValueKind::ConstFloat(value) => self.op("LD", &format!("{},=D'{}'", freg, value)),
            ValueKind::Param(i) => {
                self.op("L", &format!("2,{}(,11)", 4 * i))?;
                self.op("LD", &format!("{},0(,2)", freg))
            }
            _ => {
                let disp = self.slot_disp(v)?;
                self.op("LD", &format!("{},{}(,13)", freg, disp))
            }
        }
    }

    fn store_result(&mut self, func: &Function, v: ValueId, reg: u32) -> Result<(), CodeGenError> {
        let ty = func.value(v).ty.clone();
        if ty == IrType::Void {
            return Ok(());
        }
        let disp = self.slot_disp(v)?;
        if ty.is_float() {
            self.op("STD", &format!("0,{}(,13)", disp))
        } else {
            self.op("ST", &format!("{},{}(,13)", reg, disp))
        }
    }

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

    fn emit_phi_copies(
        &mut self,
        func: &Function,
        from: BlockId,
        target: BlockId,
    ) -> Result<(), CodeGenError> {
        for phi in Self::phis_of(func, target) {
            let inst = func.inst(phi).expect("phi instruction").clone();
            let Some((value, _)) = inst.incoming.iter().find(|(_, b)| *b == from) else {
                continue;
            };
            let value = *value;
            let disp = self.slot_disp(phi)?;
            if func.value(phi).ty.is_float() {
                self.load_flt(func, value, 0)?;
                self.op("STD", &format!("0,{}(,13)", disp))?;
            } else {
                self.load_int(func, value, 2)?;
                self.op("ST", &format!("2,{}(,13)", disp))?;
            }
        }
        Ok(())
    }

    fn has_phis(func: &Function, block: BlockId) -> bool {
        !Self::phis_of(func, block).is_empty()
    }

    /// BC mask for a comparison opcode (condition just set by CR/CLR/CD).
    fn mask_of(op: Opcode, fpred: Option<FloatPred>) -> u32 {
        if let Some(pred) = fpred {
            return match pred {
                FloatPred::Oeq => 8,
                FloatPred::One => 7,
                FloatPred::Olt => 4,
                FloatPred::Ole => 13,
                FloatPred::Ogt => 2,
                FloatPred::Oge => 11,
            };
        }
        match op {
            Opcode::CmpEq => 8,
            Opcode::CmpNe => 7,
            Opcode::CmpLt | Opcode::CmpUlt => 4,
            Opcode::CmpLe | Opcode::CmpUle => 13,
            Opcode::CmpGt | Opcode::CmpUgt => 2,
            Opcode::CmpGe | Opcode::CmpUge => 11,
            _ => 7,
        }
    }

    /// Emit the condition-setting compare for a comparison instruction.
    fn emit_compare(&mut self, func: &Function, inst: &Inst) -> Result<(), CodeGenError> {
        let lhs_ty = func.value(inst.args[0]).ty.clone();
        if lhs_ty.is_float() {
            self.load_flt(func, inst.args[0], 0)?;
            self.load_flt(func, inst.args[1], 2)?;
            self.op("CDR", "0,2")
        } else {
            self.load_int(func, inst.args[0], 2)?;
            self.load_int(func, inst.args[1], 3)?;
            let unsigned = matches!(
                inst.op,
                Opcode::CmpUlt | Opcode::CmpUle | Opcode::CmpUgt | Opcode::CmpUge
            );
            if unsigned {
                self.op("CLR", "2,3")
            } else {
                self.op("CR", "2,3")
            }
        }
    }

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
        self.argv_base = LOCALS_BASE + self.frame.locals_size;
        self.arglist_base = self.argv_base + 8 * self.frame.max_call_args as u64;
        self.frame_size = round_up(
            self.arglist_base + 4 * self.frame.max_call_args as u64,
            self.arch.stack_align,
        );
        self.func_label = self.mangle(&func.name);
        self.fused = Self::find_fusions(func);
        self.edge_counter = 0;

        let label = self.func_label.clone();
        writeln!(self.out, "*")?;
        self.line(&label, "CSECT", "")?;
        self.op("STM", "14,12,12(13)")?;
        self.op("LR", "12,15")?;
        self.line("", "USING", &format!("{},12", label))?;
        self.op("LR", "2,1")?;
        if func.name == "main" {
            // Entry frame: the operating system hands us a save area but
            // no frame chain, so the reserved stack bootstraps it.
            self.needs_stack = true;
            self.op("L", "1,=A(@STACK)")?;
        } else {
            self.op("L", &format!("1,{}(,13)", NAB_OFFSET))?;
        }
        self.op("ST", "13,4(,1)")?;
        self.op("ST", "1,8(,13)")?;
        self.op("LR", "13,1")?;
        self.op("L", &format!("0,=F'{}'", self.frame_size))?;
        self.op("ALR", "0,13")?;
        self.op("ST", &format!("0,{}(,13)", NAB_OFFSET))?;
        self.op("LR", "11,2")?;

        for (bi, _) in func.blocks.iter().enumerate() {
            let block = BlockId(bi as u32);
            if bi != 0 {
                let label = self.block_label(block);
                self.line(&label, "DS", "0H")?;
            }
            let insts: Vec<ValueId> = func.block(block).insts.clone();
            for vid in insts {
                self.emit_inst(func, module, block, vid)?;
            }
        }
        self.op("LTORG", "")?;
        Ok(())
    }

    fn emit_epilogue(&mut self) -> Result<(), CodeGenError> {
        // Result is already in R15 (or F0); restore everything else.
        self.op("L", "13,4(,13)")?;
        self.op("L", "14,12(,13)")?;
        self.op("LM", "0,12,20(13)")?;
        self.op("BR", "14")?;
        Ok(())
    }

    #[allow(clippy::too_many_lines)]
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

        match inst.op {
            Opcode::Nop | Opcode::Alloca | Opcode::Phi => {}
            op if op.is_comparison() && self.fused.contains(&vid) => {}

            Opcode::Add | Opcode::Sub | Opcode::And | Opcode::Or | Opcode::Xor => {
                self.load_int(func, inst.args[0], 2)?;
                self.load_int(func, inst.args[1], 3)?;
                let mnemonic = match inst.op {
                    Opcode::Add => "AR",
                    Opcode::Sub => "SR",
                    Opcode::And => "NR",
                    Opcode::Or => "OR",
                    _ => "XR",
                };
                self.op(mnemonic, "2,3")?;
                self.store_result(func, vid, 2)?;
            }
            Opcode::Mul => {
                // Even/odd pair: R2:R3 <- R3 * R4.
                self.load_int(func, inst.args[0], 3)?;
                self.load_int(func, inst.args[1], 4)?;
                self.op("MR", "2,4")?;
                self.op("LR", "2,3")?;
                self.store_result(func, vid, 2)?;
            }
            Opcode::Sdiv | Opcode::Udiv | Opcode::Smod | Opcode::Umod => {
                // Sign-extend the dividend across the even/odd pair.
                self.load_int(func, inst.args[0], 2)?;
                self.load_int(func, inst.args[1], 4)?;
                self.op("SRDA", "2,32")?;
                self.op("DR", "2,4")?;
                // Quotient lands in the odd register, remainder in the
                // even one.
                if matches!(inst.op, Opcode::Sdiv | Opcode::Udiv) {
                    self.op("LR", "2,3")?;
                }
                self.store_result(func, vid, 2)?;
            }
            Opcode::Neg => {
                self.load_int(func, inst.args[0], 2)?;
                self.op("LCR", "2,2")?;
                self.store_result(func, vid, 2)?;
            }
            Opcode::Not => {
                self.load_int(func, inst.args[0], 2)?;
                self.op("X", "2,=X'FFFFFFFF'")?;
                self.store_result(func, vid, 2)?;
            }
            Opcode::Shl | Opcode::Shr | Opcode::Sar => {
                self.load_int(func, inst.args[0], 2)?;
                self.load_int(func, inst.args[1], 3)?;
                let mnemonic = match inst.op {
                    Opcode::Shl => "SLL",
                    Opcode::Shr => "SRL",
                    _ => "SRA",
                };
                self.op(mnemonic, "2,0(3)")?;
                self.store_result(func, vid, 2)?;
            }

            Opcode::Load => {
                self.load_int(func, inst.args[0], 3)?;
                let pointee = func
                    .value(inst.args[0])
                    .ty
                    .pointee()
                    .cloned()
                    .unwrap_or(IrType::I32);
                match pointee {
                    IrType::I8 => {
                        self.op("SR", "2,2")?;
                        self.op("IC", "2,0(,3)")?;
                        self.op("SLL", "2,24")?;
                        self.op("SRA", "2,24")?;
                    }
                    IrType::U8 => {
                        self.op("SR", "2,2")?;
                        self.op("IC", "2,0(,3)")?;
                    }
                    IrType::I16 => self.op("LH", "2,0(,3)")?,
                    IrType::U16 => {
                        self.op("LH", "2,0(,3)")?;
                        self.op("N", "2,=X'0000FFFF'")?;
                    }
                    IrType::F32 => {
                        self.op("LE", "0,0(,3)")?;
                        self.store_result(func, vid, 2)?;
                        return Ok(());
                    }
                    IrType::F64 => {
                        self.op("LD", "0,0(,3)")?;
                        self.store_result(func, vid, 2)?;
                        return Ok(());
                    }
                    IrType::I64 | IrType::U64 => {
                        // Big-endian: the low word sits at offset 4.
                        self.op("L", "2,4(,3)")?;
                    }
                    IrType::Struct(_) | IrType::Array(..) => {
                        // Aggregate: the address stands in for the value.
                        self.op("LR", "2,3")?;
                    }
                    _ => self.op("L", "2,0(,3)")?,
                }
                self.store_result(func, vid, 2)?;
            }
            Opcode::Store => {
                let value = inst.args[0];
                let addr = inst.args[1];
                let vty = func.value(value).ty.clone();
                if vty.is_float() {
                    self.load_flt(func, value, 0)?;
                    self.load_int(func, addr, 3)?;
                    if vty == IrType::F32 {
                        self.op("STE", "0,0(,3)")?;
                    } else {
                        self.op("STD", "0,0(,3)")?;
                    }
                    return Ok(());
                }
                if matches!(vty, IrType::Struct(_) | IrType::Array(..)) {
                    // MVC copies up to 256 bytes at a time.
                    self.load_int(func, value, 2)?;
                    self.load_int(func, addr, 3)?;
                    let size = vty.size(self.arch.ptr_bytes);
                    let mut off = 0;
                    while off < size {
                        let chunk = (size - off).min(256);
                        self.op("MVC", &format!("{}({},3),{}(2)", off, chunk, off))?;
                        off += chunk;
                    }
                    return Ok(());
                }
                self.load_int(func, value, 2)?;
                self.load_int(func, addr, 3)?;
                let pointee = func
                    .value(addr)
                    .ty
                    .pointee()
                    .cloned()
                    .unwrap_or(vty.clone());
                match pointee.size(self.arch.ptr_bytes) {
                    1 => self.op("STC", "2,0(,3)")?,
                    2 => self.op("STH", "2,0(,3)")?,
                    8 => {
                        // Low word at offset 4, high word cleared.
                        self.op("SR", "4,4")?;
                        self.op("ST", "4,0(,3)")?;
                        self.op("ST", "2,4(,3)")?;
                    }
                    _ => self.op("ST", "2,0(,3)")?,
                }
            }
            Opcode::Gep => {
                self.load_int(func, inst.args[0], 2)?;
                self.load_int(func, inst.args[1], 3)?;
                let elem = inst.aux.clone().unwrap_or(IrType::I8);
                let size = elem.size(self.arch.ptr_bytes).max(1);
                if size == 1 {
                    self.op("AR", "2,3")?;
                } else if size.is_power_of_two() {
                    self.op("SLA", &format!("3,{}", size.trailing_zeros()))?;
                    self.op("AR", "2,3")?;
                } else {
                    self.op("LR", "5,3")?;
                    self.op("M", &format!("4,=F'{}'", size))?;
                    self.op("AR", "2,5")?;
                }
                self.store_result(func, vid, 2)?;
            }
            Opcode::StructGep => {
                self.load_int(func, inst.args[0], 2)?;
                let offset = match &inst.aux {
                    Some(IrType::Struct(s)) => {
                        s.offsets.get(inst.field as usize).copied().unwrap_or(0)
                    }
                    _ => 0,
                };
                if offset > 0 {
                    self.op("LA", &format!("2,{}(,2)", offset))?;
                }
                self.store_result(func, vid, 2)?;
            }

            op if op.is_comparison() => {
                // Materialize 0/1: assume true, then a 6-byte forward
                // skip over the 2-byte SR when the condition holds.
                self.emit_compare(func, &inst)?;
                let mask = Self::mask_of(inst.op, inst.fpred);
                self.op("LA", "2,1")?;
                self.op("BC", &format!("{},*+6", mask))?;
                self.op("SR", "2,2")?;
                self.store_result(func, vid, 2)?;
            }

            Opcode::Select => {
                self.load_int(func, inst.args[1], 3)?;
                self.load_int(func, inst.args[2], 4)?;
                self.load_int(func, inst.args[0], 2)?;
                self.op("LTR", "2,2")?;
                self.op("LR", "2,3")?;
                self.op("BC", "7,*+6")?;
                self.op("LR", "2,4")?;
                self.store_result(func, vid, 2)?;
            }

            Opcode::Trunc | Opcode::Zext | Opcode::Sext | Opcode::Bitcast | Opcode::Ptrtoint
            | Opcode::Inttoptr => {
                let result_ty = func.value(vid).ty.clone();
                let src = inst.args[0];
                let src_ty = func.value(src).ty.clone();
                if src_ty.is_float() || result_ty.is_float() {
                    return Err(CodeGenError::Logic(
                        "s390: float bitcast is not supported".into(),
                    ));
                }
                self.load_int(func, src, 2)?;
                match (inst.op, result_ty.size(4)) {
                    (Opcode::Trunc, 1) => {
                        self.op("N", "2,=X'000000FF'")?;
                    }
                    (Opcode::Trunc, 2) => {
                        self.op("N", "2,=X'0000FFFF'")?;
                    }
                    (Opcode::Sext, _) => match src_ty.size(4) {
                        1 => {
                            self.op("SLL", "2,24")?;
                            self.op("SRA", "2,24")?;
                        }
                        2 => {
                            self.op("SLL", "2,16")?;
                            self.op("SRA", "2,16")?;
                        }
                        _ => {}
                    },
                    (Opcode::Zext, _) => match src_ty.size(4) {
                        1 => {
                            self.op("N", "2,=X'000000FF'")?;
                        }
                        2 => {
                            self.op("N", "2,=X'0000FFFF'")?;
                        }
                        _ => {}
                    },
                    _ => {}
                }
                self.store_result(func, vid, 2)?;
            }

            Opcode::Fadd | Opcode::Fsub | Opcode::Fmul | Opcode::Fdiv => {
                self.load_flt(func, inst.args[0], 0)?;
                self.load_flt(func, inst.args[1], 2)?;
                let mnemonic = match inst.op {
                    Opcode::Fadd => "ADR",
                    Opcode::Fsub => "SDR",
                    Opcode::Fmul => "MDR",
                    _ => "DDR",
                };
                self.op(mnemonic, "0,2")?;
                self.store_result(func, vid, 2)?;
            }
            Opcode::Fneg => {
                self.load_flt(func, inst.args[0], 0)?;
                self.op("LCDR", "0,0")?;
                self.store_result(func, vid, 2)?;
            }
            Opcode::Fabs => {
                self.load_flt(func, inst.args[0], 0)?;
                self.op("LPDR", "0,0")?;
                self.store_result(func, vid, 2)?;
            }
            Opcode::Fpext | Opcode::Fptrunc => {
                // HFP short and long share the high-order bits; the move
                // is the conversion.
                self.load_flt(func, inst.args[0], 0)?;
                self.store_result(func, vid, 2)?;
            }
            Opcode::Sitofp | Opcode::Uitofp => {
                // Magic-number conversion: bias the integer, overlay the
                // X'4E' exponent, normalize by subtracting the magic
                // constant. Valid for the 32-bit value range.
                self.load_int(func, inst.args[0], 2)?;
                self.op("X", "2,=X'80000000'")?;
                self.op("ST", &format!("2,{}(,13)", SCRATCH_OFFSET + 4))?;
                self.op("MVC", &format!("{}(4,13),=X'4E000000'", SCRATCH_OFFSET))?;
                self.op("LD", &format!("0,{}(,13)", SCRATCH_OFFSET))?;
                self.op("SD", "0,=X'4E00000080000000'")?;
                self.store_result(func, vid, 2)?;
            }
            Opcode::Fptosi | Opcode::Fptoui => {
                // The reverse: unnormalized add of the magic, then the
                // low word is the biased integer. Overflows outside the
                // 32-bit window are silent.
                self.load_flt(func, inst.args[0], 0)?;
                self.op("AW", "0,=X'4E00000000000000'")?;
                self.op("STD", &format!("0,{}(,13)", SCRATCH_OFFSET))?;
                self.op("L", &format!("2,{}(,13)", SCRATCH_OFFSET + 4))?;
                self.op("X", "2,=X'80000000'")?;
                self.store_result(func, vid, 2)?;
            }

            Opcode::Call => self.emit_call(func, module, vid, &inst)?,
            Opcode::Ret => {
                if let Some(&value) = inst.args.first() {
                    if func.value(value).ty.is_float() {
                        self.load_flt(func, value, 0)?;
                    } else {
                        self.load_int(func, value, 15)?;
                    }
                } else {
                    self.op("SR", "15,15")?;
                }
                self.emit_epilogue()?;
            }
            Opcode::Br => {
                let target = inst.blocks[0].expect("br target");
                self.emit_phi_copies(func, block, target)?;
                let label = self.block_label(target);
                self.op("B", &label)?;
            }
            Opcode::BrCond => self.emit_br_cond(func, block, &inst)?,
            _ => {
                return Err(CodeGenError::Logic(format!(
                    "s390: unhandled opcode {}",
                    inst.op.mnemonic()
                )))
            }
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

        let true_phis = Self::has_phis(func, true_b);
        let false_phis = Self::has_phis(func, false_b);
        let true_label = if true_phis {
            self.edge_counter += 1;
            format!("{}$E{}", self.func_label, self.edge_counter)
        } else {
            self.block_label(true_b)
        };

        let fused_cmp = func.inst(cond).filter(|_| self.fused.contains(&cond));
        match fused_cmp {
            Some(cmp_inst) => {
                let cmp_inst = cmp_inst.clone();
                // Zero comparisons use LTR instead of a full compare.
                let zero = zero_operand(func, &cmp_inst);
                match zero {
                    Some(nonzero)
                        if matches!(cmp_inst.op, Opcode::CmpEq | Opcode::CmpNe)
                            && !func.value(nonzero).ty.is_float() =>
                    {
                        self.load_int(func, nonzero, 2)?;
                        self.op("LTR", "2,2")?;
                        let mask = if cmp_inst.op == Opcode::CmpEq { 8 } else { 7 };
                        self.op("BC", &format!("{},{}", mask, true_label))?;
                    }
                    _ => {
                        self.emit_compare(func, &cmp_inst)?;
                        let mask = Self::mask_of(cmp_inst.op, cmp_inst.fpred);
                        self.op("BC", &format!("{},{}", mask, true_label))?;
                    }
                }
            }
            None => {
                self.load_int(func, cond, 2)?;
                self.op("LTR", "2,2")?;
                self.op("BC", &format!("7,{}", true_label))?;
            }
        }

        if false_phis {
            self.emit_phi_copies(func, block, false_b)?;
        }
        let false_label = self.block_label(false_b);
        self.op("B", &false_label)?;

        if true_phis {
            self.line(&true_label.clone(), "DS", "0H")?;
            self.emit_phi_copies(func, block, true_b)?;
            let label = self.block_label(true_b);
            self.op("B", &label)?;
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

        // Build the argument values and the address list; the high bit
        // of the last address is the VL marker.
        for (i, &arg) in args.iter().enumerate() {
            let slot = self.argv_base + 8 * i as u64;
            let ty = func.value(arg).ty.clone();
            if ty.is_float() {
                self.load_flt(func, arg, 0)?;
                self.op("STD", &format!("0,{}(,13)", slot))?;
            } else {
                self.load_int(func, arg, 2)?;
                self.op("ST", &format!("2,{}(,13)", slot))?;
            }
            self.op("LA", &format!("2,{}(,13)", slot))?;
            self.op("ST", &format!("2,{}(,13)", self.arglist_base + 4 * i as u64))?;
        }
        if !args.is_empty() {
            let last = self.arglist_base + 4 * (args.len() as u64 - 1);
            self.op("OI", &format!("{}(13),X'80'", last))?;
            self.op("LA", &format!("1,{}(,13)", self.arglist_base))?;
        } else {
            self.op("SR", "1,1")?;
        }

        match &func.value(callee).kind {
            ValueKind::FuncRef(name) => {
                let m = self.mangle(name);
                self.op("L", &format!("15,=V({})", m))?;
            }
            _ => {
                self.load_int(func, callee, 15)?;
            }
        }
        self.op("BALR", "14,15")?;

        let ret_ty = func.value(vid).ty.clone();
        if ret_ty != IrType::Void {
            let disp = self.slot_disp(vid)?;
            if ret_ty.is_float() {
                self.op("STD", &format!("0,{}(,13)", disp))?;
            } else {
                self.op("ST", &format!("15,{}(,13)", disp))?;
            }
        }
        Ok(())
    }

    fn emit_globals(&mut self, module: &Module) -> Result<(), CodeGenError> {
        if module.globals.is_empty() && module.strings.is_empty() && !self.needs_stack {
            return Ok(());
        }
        writeln!(self.out, "*")?;
        self.line("@DATA", "CSECT", "")?;
        // Initialized storage first, zero-fill after.
        let order: Vec<usize> = {
            let mut initialized: Vec<usize> = Vec::new();
            let mut zeroed: Vec<usize> = Vec::new();
            for (i, g) in module.globals.iter().enumerate() {
                if g.init.is_zero() {
                    zeroed.push(i);
                } else {
                    initialized.push(i);
                }
            }
            initialized.into_iter().chain(zeroed).collect()
        };
        for i in order {
            let global = &module.globals[i];
            let label = self.mangle(&global.name);
            if global.init.is_zero() {
                let size = global.ty.size(4).max(1);
                self.line(&label, "DS", &format!("XL{}", size))?;
            } else {
                let ty = global.ty.clone();
                let init = global.init.clone();
                self.emit_init(&label, &init, &ty)?;
            }
        }
        for (i, bytes) in module.strings.iter().enumerate() {
            let label = format!("@STR{}", i);
            let operand = string_dc(bytes);
            self.line(&label, "DC", &operand)?;
        }
        if self.needs_stack {
            self.line("@STACK", "DS", &format!("XL{}", STACK_RESERVE))?;
        }
        Ok(())
    }

    fn emit_init(
        &mut self,
        label: &str,
        init: &GlobalInit,
        ty: &IrType,
    ) -> Result<(), CodeGenError> {
        match init {
            GlobalInit::Zero => {
                self.line(label, "DS", &format!("XL{}", ty.size(4).max(1)))?;
            }
            GlobalInit::Int(v) => {
                let operand = match ty.size(4) {
                    1 => format!("X'{:02X}'", *v as u8),
                    2 => format!("H'{}'", *v as i16),
                    _ => format!("F'{}'", *v as i32),
                };
                self.line(label, "DC", &operand)?;
            }
            GlobalInit::Float(v) => {
                let operand = if *ty == IrType::F32 {
                    format!("E'{}'", v)
                } else {
                    format!("D'{}'", v)
                };
                self.line(label, "DC", &operand)?;
            }
            GlobalInit::StrPtr(i) => {
                self.line(label, "DC", &format!("A(@STR{})", i))?;
            }
            GlobalInit::Array(items) => {
                let elem = match ty {
                    IrType::Array(elem, _) => (**elem).clone(),
                    _ => IrType::I32,
                };
                let mut first = true;
                if let IrType::Struct(s) = ty {
                    for (i, item) in items.iter().enumerate() {
                        let fty = s.fields.get(i).cloned().unwrap_or(IrType::I32);
                        let l = if first { label } else { "" };
                        self.emit_init(l, item, &fty)?;
                        first = false;
                    }
                } else {
                    for item in items {
                        let l = if first { label } else { "" };
                        self.emit_init(l, item, &elem)?;
                        first = false;
                    }
                }
            }
        }
        Ok(())
    }
}

impl Default for S390Backend {
    fn default() -> Self {
        S390Backend::new()
    }
}

impl Backend for S390Backend {
    fn arch_info(&self) -> &ArchInfo {
        &self.arch
    }

    fn reset(&mut self) {
        self.out.clear();
        self.frame = FrameLayout::default();
        self.fused.clear();
        self.mangled.clear();
        self.used_names.clear();
        self.edge_counter = 0;
        self.needs_stack = false;
        self.func_label.clear();
    }

    fn codegen_module(&mut self, module: &Module) -> Result<String, CodeGenError> {
        self.reset();
        writeln!(self.out, "*  {}", module.name)?;
        writeln!(self.out, "*  31-bit mainframe assembly")?;
        for func in &module.functions {
            if !func.is_declaration {
                self.emit_function(func, module)?;
            }
        }
        self.emit_globals(module)?;
        self.line("", "END", "")?;
        Ok(std::mem::take(&mut self.out))
    }

    fn codegen_func(&mut self, func: &Function, module: &Module) -> Result<String, CodeGenError> {
        self.reset();
        self.emit_function(func, module)?;
        Ok(std::mem::take(&mut self.out))
    }
}

/// When one comparison operand is a constant zero, return the other.
fn zero_operand(func: &Function, inst: &Inst) -> Option<ValueId> {
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

/// Render a string literal as a DC operand, splitting printable runs
/// from hex escapes. A NUL terminator always closes the constant.
fn string_dc(bytes: &[u8]) -> String {
    let mut parts: Vec<String> = Vec::new();
    let mut run = String::new();
    for &b in bytes {
        if (0x20..0x7f).contains(&b) && b != b'\'' && b != b'&' {
            run.push(b as char);
        } else {
            if !run.is_empty() {
                parts.push(format!("C'{}'", run));
                run.clear();
            }
            parts.push(format!("X'{:02X}'", b));
        }
    }
    if !run.is_empty() {
        parts.push(format!("C'{}'", run));
    }
    parts.push("X'00'".to_string());
    parts.join(",")
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

    fn compile(src: &str) -> String {
        let std = Standard::C89;
        let mut diags = Diagnostics::new(false, false, false);
        let mut types = TypeTable::new(TargetLayout::ilp32());
        let mut symbols = SymbolTable::new();
        let tokens = Lexer::new("t.c", src, std).run(&mut diags);
        let mut unit = Parser::new(tokens, std, &mut types, &mut diags).parse();
        Sema::new(&mut types, &mut symbols, &mut diags, std).run(&mut unit);
        assert!(!diags.has_errors(), "{}", diags.render());
        let mut module = Module::new("t.c");
        IrGen::new(&types, &symbols, &mut module, &mut diags).lower_unit(&unit);
        assert!(module.verify().is_ok(), "{:?}", module.verify());
        let mut backend = S390Backend::new();
        backend.prepare_ir(&mut module, 1).unwrap();
        backend.codegen_module(&module).unwrap()
    }

    #[test]
    fn test_save_area_linkage() {
        let asm = compile("int main() { return 0; }");
        assert!(asm.contains("STM   14,12,12(13)"));
        assert!(asm.contains("ST    13,4(,1)"), "back chain:\n{}", asm);
        assert!(asm.contains("ST    1,8(,13)"), "forward chain:\n{}", asm);
        assert!(asm.contains("LR    11,2"), "param list into R11:\n{}", asm);
        assert!(asm.contains("BR    14"));
    }

    #[test]
    fn test_symbols_uppercased() {
        let asm = compile("int my_func() { return 1; } int main() { return my_func(); }");
        assert!(asm.contains("MY_FUNC  CSECT"));
        assert!(asm.contains("=V(MY_FUNC)"));
    }

    #[test]
    fn test_block_labels_carry_function_name() {
        let asm = compile("int f(int n) { if (n) return 1; return 2; } int main() { return f(1); }");
        assert!(asm.contains("F$"), "FUNC$BLOCK labels:\n{}", asm);
    }

    #[test]
    fn test_multiply_uses_pair() {
        let asm = compile("int f(int a, int b) { return a * b; } int main() { return f(2,3); }");
        assert!(asm.contains("MR    2,4"));
    }

    #[test]
    fn test_divide_sign_extends_pair() {
        let asm = compile("int f(int a, int b) { return a / b; } int main() { return f(6,2); }");
        assert!(asm.contains("SRDA  2,32"));
        assert!(asm.contains("DR    2,4"));
    }

    #[test]
    fn test_comparison_skip_is_six_bytes() {
        let asm = compile(
            "int f(int a, int b) { int r; r = a < b; return r; } int main() { return f(1,2); }",
        );
        assert!(asm.contains("BC    4,*+6"), "6-byte skip:\n{}", asm);
        assert!(asm.contains("LA    2,1"));
        assert!(asm.contains("SR    2,2"));
    }

    #[test]
    fn test_zero_compare_uses_ltr() {
        let asm = compile(
            "int g(); int f(int a) { if (a == 0) return g(); return 1; } int main() { return f(0); }",
        );
        assert!(asm.contains("LTR   2,2"), "LTR for zero test:\n{}", asm);
    }

    #[test]
    fn test_vl_bit_on_last_argument() {
        let asm = compile(
            "int add(int a, int b) { return a + b; } int main() { return add(1, 2); }",
        );
        assert!(asm.contains("OI"), "VL bit:\n{}", asm);
        assert!(asm.contains("X'80'"));
        assert!(asm.contains("BALR  14,15"));
    }

    #[test]
    fn test_param_addresses_via_r11() {
        let asm = compile("int f(int a, int b) { return a + b; } int main() { return f(1,2); }");
        // First parameter: address from 0(,11), then the value.
        assert!(asm.contains("L     2,0(,11)"));
        assert!(asm.contains("L     3,4(,11)"));
    }

    #[test]
    fn test_hfp_magic_numbers() {
        let asm = compile(
            "double f(int i) { return (double)i; } int main() { return 0; }",
        );
        assert!(asm.contains("X'4E000000'"), "int->HFP magic:\n{}", asm);
        assert!(asm.contains("SD    0,=X'4E00000080000000'"));
        let asm = compile(
            "int f(double d) { return (int)d; } int main() { return 0; }",
        );
        assert!(asm.contains("AW    0,=X'4E00000000000000'"), "HFP->int magic:\n{}", asm);
    }

    #[test]
    fn test_globals_and_strings() {
        let asm = compile("int x = 14; char *s = \"hi\"; int zeroed; int main() { return x; }");
        assert!(asm.contains("X        DC    F'14'"));
        assert!(asm.contains("A(@STR0)"));
        assert!(asm.contains("C'hi',X'00'"));
        assert!(asm.contains("ZEROED   DS    XL4"));
    }

    #[test]
    fn test_ltorg_per_function() {
        let asm = compile("int main() { return 42; }");
        assert!(asm.contains("LTORG"));
        assert!(asm.contains("=F'42'"));
    }

    #[test]
    fn test_frame_size_eight_aligned() {
        let asm = compile("int f(int a) { int b[3]; b[0] = a; return b[0]; } int main() { return f(1); }");
        for line in asm.lines() {
            if let Some(rest) = line.trim().strip_prefix("L     0,=F'") {
                if let Some(num) = rest.strip_suffix('\'') {
                    // Frame-size loads happen right after the prologue
                    // chain; all must be 8-byte multiples.
                    if let Ok(n) = num.parse::<u64>() {
                        if n >= LOCALS_BASE {
                            assert_eq!(n % 8, 0, "unaligned frame {}", n);
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn test_main_bootstraps_stack() {
        let asm = compile("int main() { return 0; }");
        assert!(asm.contains("L     1,=A(@STACK)"));
        assert!(asm.contains("@STACK   DS"));
    }
}
