//! Frame analysis
//!
//! One scan over a function before emission: reserve storage for every
//! `alloca`, a spill slot for every instruction result, find the widest
//! outgoing call, and detect leaves. Offsets are relative to the start
//! of the locals region; each backend places that region inside its own
//! frame shape (below the frame pointer on the RISC target, after the
//! save area on the mainframe) and rounds the total to its ABI stack
//! alignment.

use crate::ir::{Function, IrType, Opcode, ValueId};
use crate::types::round_up;
use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct FrameLayout {
    /// Byte offset of each value's home within the locals region.
    /// Allocas map to their reserved storage; other instruction results
    /// map to an 8-byte spill slot.
    pub slots: HashMap<ValueId, u64>,
    /// Total size of the locals region (8-byte aligned).
    pub locals_size: u64,
    /// Maximum argument count over all calls (callee operand excluded).
    pub max_call_args: usize,
    /// False for leaf functions.
    pub has_call: bool,
    pub alloca_count: usize,
    pub spill_count: usize,
}

impl FrameLayout {
    pub fn is_leaf(&self) -> bool {
        !self.has_call
    }

    pub fn slot(&self, value: ValueId) -> Option<u64> {
        self.slots.get(&value).copied()
    }
}

pub fn analyze(func: &Function, ptr_bytes: u64) -> FrameLayout {
    let mut layout = FrameLayout::default();
    let mut offset: u64 = 0;

    for block in &func.blocks {
        for &vid in &block.insts {
            let Some(inst) = func.inst(vid) else { continue };
            match inst.op {
                Opcode::Alloca => {
                    let ty = inst.aux.clone().unwrap_or(IrType::I64);
                    let size = round_up(ty.size(ptr_bytes).max(1), 8);
                    let align = ty.align(ptr_bytes).max(8);
                    offset = round_up(offset, align);
                    layout.slots.insert(vid, offset);
                    offset += size;
                    layout.alloca_count += 1;
                }
                Opcode::Call => {
                    layout.has_call = true;
                    let args = inst.args.len().saturating_sub(1);
                    layout.max_call_args = layout.max_call_args.max(args);
                    if func.value(vid).ty != IrType::Void {
                        layout.slots.insert(vid, offset);
                        offset += 8;
                        layout.spill_count += 1;
                    }
                }
                Opcode::Store
                | Opcode::Br
                | Opcode::BrCond
                | Opcode::Ret
                | Opcode::Nop => {}
                _ => {
                    if func.value(vid).ty != IrType::Void {
                        layout.slots.insert(vid, offset);
                        offset += 8;
                        layout.spill_count += 1;
                    }
                }
            }
        }
    }
    layout.locals_size = round_up(offset, 8);
    layout
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{FuncType, Inst, Module};
    use std::rc::Rc;

    fn build(src: &str) -> Module {
        use crate::diag::Diagnostics;
        use crate::irgen::IrGen;
        use crate::lexer::Lexer;
        use crate::parser::Parser;
        use crate::sema::Sema;
        use crate::standard::Standard;
        use crate::symbols::SymbolTable;
        use crate::types::{TargetLayout, TypeTable};

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
        module
    }

    #[test]
    fn test_leaf_detection() {
        let module = build("int leaf(int a) { return a + 1; } \
                            int caller(void) { return leaf(2); }");
        let leaf = analyze(module.function("leaf").unwrap(), 8);
        assert!(leaf.is_leaf());
        let caller = analyze(module.function("caller").unwrap(), 8);
        assert!(!caller.is_leaf());
        assert_eq!(caller.max_call_args, 1);
    }

    #[test]
    fn test_alloca_storage_reserved() {
        let module = build("int f(void) { int a[4]; a[0] = 1; return a[0]; }");
        let layout = analyze(module.function("f").unwrap(), 8);
        // 16 bytes of array storage plus spill slots.
        assert!(layout.locals_size >= 16);
        assert_eq!(layout.alloca_count, 1);
        assert!(layout.spill_count > 0);
    }

    #[test]
    fn test_every_result_has_a_slot() {
        let module = build("int f(int a, int b) { return a * b + 7; }");
        let func = module.function("f").unwrap();
        let layout = analyze(func, 8);
        for block in &func.blocks {
            for &vid in &block.insts {
                let inst = func.inst(vid).unwrap();
                let needs_slot = !matches!(
                    inst.op,
                    Opcode::Store | Opcode::Br | Opcode::BrCond | Opcode::Ret | Opcode::Nop
                ) && func.value(vid).ty != IrType::Void;
                assert_eq!(layout.slot(vid).is_some(), needs_slot);
            }
        }
    }

    #[test]
    fn test_offsets_do_not_overlap() {
        let mut func = Function::new(
            "f",
            Rc::new(FuncType {
                ret: IrType::Void,
                params: vec![],
                variadic: false,
            }),
            false,
        );
        let entry = func.add_block("entry");
        let mut a1 = Inst::simple(Opcode::Alloca, vec![]);
        a1.aux = Some(IrType::Array(Box::new(IrType::I32), 3)); // 12 bytes
        let v1 = func.push_inst(entry, a1, IrType::Ptr(Box::new(IrType::I32)));
        let mut a2 = Inst::simple(Opcode::Alloca, vec![]);
        a2.aux = Some(IrType::I64);
        let v2 = func.push_inst(entry, a2, IrType::Ptr(Box::new(IrType::I64)));
        func.push_inst(entry, Inst::simple(Opcode::Ret, vec![]), IrType::Void);

        let layout = analyze(&func, 8);
        let o1 = layout.slot(v1).unwrap();
        let o2 = layout.slot(v2).unwrap();
        // 12 bytes round up to 16 before the next slot.
        assert_eq!(o1, 0);
        assert_eq!(o2, 16);
        assert_eq!(layout.locals_size % 8, 0);
    }
}
