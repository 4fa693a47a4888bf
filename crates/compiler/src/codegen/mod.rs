//! Backend framework
//!
//! Code generation is split into a target-neutral framework and one
//! module per target:
//!
//! - `mod.rs`: the `Backend` trait, the `ArchInfo` descriptor, the
//!   `-arch=` registry, and `CodeGenError`
//! - `frame.rs`: per-function frame analysis (alloca storage, spill
//!   slots, outgoing argument area, leaf detection)
//! - `peephole.rs`: target-neutral IR rewrites run from `prepare_ir`
//! - `arm64.rs`: little-endian RISC backend (AArch64, ELF and Darwin)
//! - `s390.rs`: big-endian mainframe backend (31-bit, HLASM, HFP)
//!
//! Emission follows an always-spill discipline: every instruction loads
//! its operands from their stack homes (or materializes constants),
//! performs the operation, and stores the result to the slot owned by
//! that value. Compare-and-branch fusion and the φ-copy preludes are the
//! only places where emission looks beyond a single instruction.

pub mod arm64;
pub mod frame;
pub mod peephole;
pub mod s390;

use crate::ir::Module;
use crate::types::TargetLayout;
use std::fmt;

/// Error type for code generation operations.
///
/// Logical errors (malformed IR reaching the backend, unsupported
/// constructs) and formatting errors from `writeln!` into the output
/// buffer both propagate with `?`.
#[derive(Debug)]
pub enum CodeGenError {
    Logic(String),
    Format(std::fmt::Error),
}

impl fmt::Display for CodeGenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodeGenError::Logic(s) => write!(f, "{}", s),
            CodeGenError::Format(e) => write!(f, "assembly generation error: {}", e),
        }
    }
}

impl std::error::Error for CodeGenError {}

impl From<String> for CodeGenError {
    fn from(s: String) -> Self {
        CodeGenError::Logic(s)
    }
}

impl From<std::fmt::Error> for CodeGenError {
    fn from(e: std::fmt::Error) -> Self {
        CodeGenError::Format(e)
    }
}

/// Architecture invariants that drive frame layout and instruction
/// selection.
#[derive(Debug, Clone)]
pub struct ArchInfo {
    pub name: &'static str,
    pub ptr_bytes: u64,
    pub addr_bits: u32,
    pub word_bytes: u64,
    pub gpr_count: u32,
    pub fpr_count: u32,
    pub big_endian: bool,
    pub stack_align: u64,
    pub stack_grows_down: bool,
    pub has_condition_codes: bool,
    pub has_delay_slots: bool,
    /// C data model for the front end.
    pub layout: TargetLayout,
}

/// One target backend. The framework owns exactly one at a time,
/// selected by the `-arch=` tag.
pub trait Backend {
    fn arch_info(&self) -> &ArchInfo;

    /// Called once before the backend sees any IR.
    fn init(&mut self) {
        self.reset();
    }

    /// Called after the last emission; drops whatever `reset` leaves.
    fn cleanup(&mut self) {
        self.reset();
    }

    /// Drop all per-module state so the backend can be reused.
    fn reset(&mut self);

    /// Pre-emission IR passes. The default runs the peephole rewrites at
    /// `-O1` and above.
    fn prepare_ir(&mut self, module: &mut Module, opt_level: u8) -> Result<(), CodeGenError> {
        if opt_level >= 1 {
            peephole::run_module(module);
        }
        Ok(())
    }

    /// Emit the whole module as assembly text.
    fn codegen_module(&mut self, module: &Module) -> Result<String, CodeGenError>;

    /// Emit a single function (used by tests and dump tooling).
    fn codegen_func(
        &mut self,
        func: &crate::ir::Function,
        module: &Module,
    ) -> Result<String, CodeGenError>;
}

/// Tags accepted by `-arch=`.
pub fn backend_names() -> &'static [&'static str] {
    &["arm64", "arm64-darwin", "s390"]
}

/// The C data model a tag implies, needed before the backend itself is
/// constructed (the type table is built from it).
pub fn target_layout(tag: &str) -> Option<TargetLayout> {
    match tag {
        "arm64" | "arm64-darwin" => Some(TargetLayout::lp64()),
        "s390" => Some(TargetLayout::ilp32()),
        _ => None,
    }
}

pub fn create_backend(tag: &str) -> Option<Box<dyn Backend>> {
    match tag {
        "arm64" => Some(Box::new(arm64::Arm64Backend::new(false))),
        "arm64-darwin" => Some(Box::new(arm64::Arm64Backend::new(true))),
        "s390" => Some(Box::new(s390::S390Backend::new())),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry() {
        for &name in backend_names() {
            let backend = create_backend(name).expect("registered backend");
            assert_eq!(backend.arch_info().layout, target_layout(name).unwrap());
        }
        assert!(create_backend("vax").is_none());
        assert!(target_layout("vax").is_none());
    }

    #[test]
    fn test_arch_invariants() {
        let arm = create_backend("arm64").unwrap();
        let info = arm.arch_info();
        assert_eq!(info.ptr_bytes, 8);
        assert_eq!(info.gpr_count, 31);
        assert!(info.stack_grows_down);
        assert!(!info.big_endian);
        assert_eq!(info.stack_align, 16);

        let s390 = create_backend("s390").unwrap();
        let info = s390.arch_info();
        assert_eq!(info.ptr_bytes, 4);
        assert_eq!(info.addr_bits, 31);
        assert_eq!(info.gpr_count, 16);
        assert!(!info.stack_grows_down);
        assert!(info.big_endian);
        assert_eq!(info.stack_align, 8);
    }
}
