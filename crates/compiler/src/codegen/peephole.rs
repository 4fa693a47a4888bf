//! Peephole rewrites
//!
//! Small window rewrites on the IR before emission. Rewritten
//! instructions become `nop` (the emitter skips them); nothing is ever
//! physically removed, so value ids stay stable. Patterns never touch
//! terminators and never look across a block boundary.
//!
//! Patterns:
//! - dead store: two consecutive stores to the same address, the earlier
//!   one goes
//! - load-store identity: a load from A immediately stored back to A
//! - forwarded store: a store of V to A followed by a load of A whose
//!   single use is one following instruction; the use reads V directly
//!   and the load goes
//!
//! The pass iterates to a fixed point with a bounded iteration count, so
//! running it twice never changes anything the first run did not.

use crate::ir::{Function, Module, Opcode, ValueId};

/// Bound on fixed-point iterations.
const MAX_PASSES: u32 = 10;

pub fn run_module(module: &mut Module) {
    for func in &mut module.functions {
        if !func.is_declaration {
            run_function(func);
        }
    }
}

pub fn run_function(func: &mut Function) -> u32 {
    let mut total = 0;
    for _ in 0..MAX_PASSES {
        let changed = pass(func);
        total += changed;
        if changed == 0 {
            break;
        }
    }
    total
}

/// One pass over every block. Returns the number of rewrites.
fn pass(func: &mut Function) -> u32 {
    let mut changed = 0;
    let uses = func.use_counts();
    let block_count = func.blocks.len();
    for b in 0..block_count {
        let insts: Vec<ValueId> = func.blocks[b].insts.clone();
        // Live instructions only, preserving order.
        let live: Vec<ValueId> = insts
            .iter()
            .copied()
            .filter(|&v| func.inst(v).map(|i| i.op != Opcode::Nop).unwrap_or(false))
            .collect();
        for w in 0..live.len().saturating_sub(1) {
            let cur = live[w];
            let next = live[w + 1];
            let (cur_op, cur_args) = {
                let inst = func.inst(cur).expect("live instruction");
                (inst.op, inst.args.clone())
            };
            let (next_op, next_args) = {
                let inst = func.inst(next).expect("live instruction");
                (inst.op, inst.args.clone())
            };

            // Dead store: store v1, A; store v2, A -> first is dead.
            if cur_op == Opcode::Store
                && next_op == Opcode::Store
                && cur_args[1] == next_args[1]
            {
                make_nop(func, cur);
                changed += 1;
                continue;
            }

            // Load-store identity: x = load A; store x, A -> both die,
            // provided the loaded value has no other use.
            if cur_op == Opcode::Load
                && next_op == Opcode::Store
                && next_args[0] == cur
                && next_args[1] == cur_args[0]
                && uses[cur.index()] == 1
            {
                make_nop(func, cur);
                make_nop(func, next);
                changed += 1;
                continue;
            }

            // Forwarded store: store V, A; x = load A; <one use of x in
            // the next instruction> -> rewrite the use to V, drop the
            // load.
            if cur_op == Opcode::Store
                && next_op == Opcode::Load
                && next_args[0] == cur_args[1]
            {
                let value = cur_args[0];
                if let Some(&user) = live.get(w + 2) {
                    if uses[next.index()] == 1 {
                        let user_inst = func.inst(user).expect("live instruction");
                        if !user_inst.op.is_terminator() && user_inst.args.contains(&next) {
                            if let Some(user_inst) = func.inst_mut(user) {
                                for arg in user_inst.args.iter_mut() {
                                    if *arg == next {
                                        *arg = value;
                                    }
                                }
                            }
                            make_nop(func, next);
                            changed += 1;
                            continue;
                        }
                    }
                }
            }
        }
    }
    changed
}

fn make_nop(func: &mut Function, id: ValueId) {
    if let Some(inst) = func.inst_mut(id) {
        debug_assert!(!inst.op.is_terminator(), "peephole must not remove terminators");
        inst.op = Opcode::Nop;
        inst.args.clear();
        inst.incoming.clear();
        inst.blocks = [None, None];
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{FuncType, Inst, IrType, ValueKind};
    use std::rc::Rc;

    fn func_with_slot() -> (Function, crate::ir::BlockId, ValueId) {
        let mut f = Function::new(
            "f",
            Rc::new(FuncType {
                ret: IrType::I32,
                params: vec![],
                variadic: false,
            }),
            false,
        );
        let entry = f.add_block("entry");
        let mut alloca = Inst::simple(Opcode::Alloca, vec![]);
        alloca.aux = Some(IrType::I32);
        let slot = f.push_inst(entry, alloca, IrType::Ptr(Box::new(IrType::I32)));
        (f, entry, slot)
    }

    fn count_op(f: &Function, op: Opcode) -> usize {
        f.blocks
            .iter()
            .flat_map(|b| b.insts.iter())
            .filter(|&&v| f.inst(v).map(|i| i.op == op).unwrap_or(false))
            .count()
    }

    #[test]
    fn test_dead_store_collapses() {
        let (mut f, entry, slot) = func_with_slot();
        // N identical stores collapse to one.
        for i in 0..4 {
            let v = f.add_value(ValueKind::ConstInt(i), IrType::I32);
            f.push_inst(entry, Inst::simple(Opcode::Store, vec![v, slot]), IrType::Void);
        }
        let ret_v = f.add_value(ValueKind::ConstInt(0), IrType::I32);
        f.push_inst(entry, Inst::simple(Opcode::Ret, vec![ret_v]), IrType::Void);

        run_function(&mut f);
        assert_eq!(count_op(&f, Opcode::Store), 1);
        assert_eq!(count_op(&f, Opcode::Nop), 3);
        assert!(f.verify().is_ok());
    }

    #[test]
    fn test_load_store_identity() {
        let (mut f, entry, slot) = func_with_slot();
        let loaded = f.push_inst(entry, Inst::simple(Opcode::Load, vec![slot]), IrType::I32);
        f.push_inst(
            entry,
            Inst::simple(Opcode::Store, vec![loaded, slot]),
            IrType::Void,
        );
        let ret_v = f.add_value(ValueKind::ConstInt(0), IrType::I32);
        f.push_inst(entry, Inst::simple(Opcode::Ret, vec![ret_v]), IrType::Void);

        run_function(&mut f);
        assert_eq!(count_op(&f, Opcode::Load), 0);
        assert_eq!(count_op(&f, Opcode::Store), 0);
    }

    #[test]
    fn test_load_with_other_uses_survives() {
        let (mut f, entry, slot) = func_with_slot();
        let loaded = f.push_inst(entry, Inst::simple(Opcode::Load, vec![slot]), IrType::I32);
        f.push_inst(
            entry,
            Inst::simple(Opcode::Store, vec![loaded, slot]),
            IrType::Void,
        );
        // Second use of the load: the identity rewrite must not fire.
        f.push_inst(entry, Inst::simple(Opcode::Ret, vec![loaded]), IrType::Void);

        run_function(&mut f);
        assert_eq!(count_op(&f, Opcode::Load), 1);
    }

    #[test]
    fn test_forwarded_store() {
        let (mut f, entry, slot) = func_with_slot();
        let v = f.add_value(ValueKind::ConstInt(41), IrType::I32);
        f.push_inst(entry, Inst::simple(Opcode::Store, vec![v, slot]), IrType::Void);
        let loaded = f.push_inst(entry, Inst::simple(Opcode::Load, vec![slot]), IrType::I32);
        let one = f.add_value(ValueKind::ConstInt(1), IrType::I32);
        let add = f.push_inst(
            entry,
            Inst::simple(Opcode::Add, vec![loaded, one]),
            IrType::I32,
        );
        f.push_inst(entry, Inst::simple(Opcode::Ret, vec![add]), IrType::Void);

        run_function(&mut f);
        assert_eq!(count_op(&f, Opcode::Load), 0);
        // The add now reads the stored value directly.
        let add_inst = f.inst(add).unwrap();
        assert_eq!(add_inst.args[0], v);
    }

    #[test]
    fn test_idempotent_at_fixed_point() {
        let (mut f, entry, slot) = func_with_slot();
        for i in 0..3 {
            let v = f.add_value(ValueKind::ConstInt(i), IrType::I32);
            f.push_inst(entry, Inst::simple(Opcode::Store, vec![v, slot]), IrType::Void);
        }
        let ret_v = f.add_value(ValueKind::ConstInt(0), IrType::I32);
        f.push_inst(entry, Inst::simple(Opcode::Ret, vec![ret_v]), IrType::Void);

        run_function(&mut f);
        let after_first: Vec<Opcode> = f
            .blocks
            .iter()
            .flat_map(|b| b.insts.iter())
            .map(|&v| f.inst(v).unwrap().op)
            .collect();
        let rewrites = run_function(&mut f);
        assert_eq!(rewrites, 0);
        let after_second: Vec<Opcode> = f
            .blocks
            .iter()
            .flat_map(|b| b.insts.iter())
            .map(|&v| f.inst(v).unwrap().op)
            .collect();
        assert_eq!(after_first, after_second);
    }

    #[test]
    fn test_never_crosses_blocks() {
        let (mut f, entry, slot) = func_with_slot();
        let v = f.add_value(ValueKind::ConstInt(1), IrType::I32);
        f.push_inst(entry, Inst::simple(Opcode::Store, vec![v, slot]), IrType::Void);
        let next = f.add_block("next");
        let mut br = Inst::simple(Opcode::Br, vec![]);
        br.blocks = [Some(next), None];
        f.push_inst(entry, br, IrType::Void);
        // Store in the next block: same address, but a block boundary in
        // between.
        let v2 = f.add_value(ValueKind::ConstInt(2), IrType::I32);
        f.push_inst(next, Inst::simple(Opcode::Store, vec![v2, slot]), IrType::Void);
        let ret_v = f.add_value(ValueKind::ConstInt(0), IrType::I32);
        f.push_inst(next, Inst::simple(Opcode::Ret, vec![ret_v]), IrType::Void);

        run_function(&mut f);
        assert_eq!(count_op(&f, Opcode::Store), 2);
    }
}
