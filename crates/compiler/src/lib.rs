//! rcc — a retargetable C compiler
//!
//! Compiles C89/C90/C99 (plus the GNU dialects) to textual assembly for
//! several very different targets: a little-endian 64-bit RISC (ELF and
//! Darwin dialects) and a big-endian 31-bit mainframe (HLASM, HFP).
//!
//! Pipeline per translation unit:
//!
//! ```text
//! source -> tokens -> AST -> analyzed AST -> IR module -> assembly
//!           lexer     parser  sema           irgen        backend
//! ```
//!
//! A [`Session`] drives the pipeline. Several files compile into a
//! single module: the symbol table, type table, and IR module live for
//! the whole session, so declarations in one file are visible in later
//! files. Phases check the diagnostic sink at their boundary and later
//! phases are skipped once an error is recorded.
//!
//! ```rust
//! use rcc::{Options, Session};
//!
//! let mut session = Session::new(Options::default()).unwrap();
//! session.add_virtual_file("t.c", "int main(void) { return 0; }");
//! session.compile_file("t.c");
//! let (output, diags) = session.finish();
//! assert_eq!(diags.error_count(), 0);
//! assert!(output.unwrap().contains("main"));
//! ```

pub mod ast;
pub mod codegen;
pub mod const_eval;
pub mod diag;
pub mod ir;
pub mod irgen;
pub mod lexer;
pub mod parser;
pub mod preprocessor;
pub mod sema;
pub mod standard;
pub mod symbols;
pub mod types;

pub use codegen::{backend_names, create_backend, Backend, CodeGenError};
pub use diag::{Diagnostic, Diagnostics, Severity, SourceLoc};
pub use standard::{has_feature, Feature, Standard};

use crate::ir::Module;
use crate::preprocessor::Preprocessor;
use crate::symbols::SymbolTable;
use crate::types::{TypeId, TypeTable};
use std::path::PathBuf;
use tracing::debug;

/// Compiler options, mirroring the command-line surface.
#[derive(Debug, Clone)]
pub struct Options {
    pub std: Standard,
    pub arch: String,
    pub opt_level: u8,
    pub include_paths: Vec<PathBuf>,
    pub defines: Vec<(String, Option<String>)>,
    pub wall: bool,
    pub wextra: bool,
    pub werror: bool,
    /// `-E`: stop after preprocessing.
    pub preprocess_only: bool,
    /// `-fsyntax-only`: parse and analyze, emit nothing.
    pub syntax_only: bool,
    pub dump_ast: bool,
    pub dump_sema: bool,
    pub dump_ir: bool,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            std: Standard::Gnu99,
            arch: "arm64".to_string(),
            opt_level: 1,
            include_paths: Vec::new(),
            defines: Vec::new(),
            wall: false,
            wextra: false,
            werror: false,
            preprocess_only: false,
            syntax_only: false,
            dump_ast: false,
            dump_sema: false,
            dump_ir: false,
        }
    }
}

/// One compilation: a fresh context per invocation, one or more input
/// files, one output.
pub struct Session {
    pub options: Options,
    pub diags: Diagnostics,
    types: TypeTable,
    symbols: SymbolTable,
    module: Module,
    /// File-scope typedefs carried across translation units.
    typedefs: Vec<(String, TypeId)>,
    /// In-memory sources (tests, driver-provided buffers).
    virtual_files: Vec<(String, String)>,
    /// Accumulated `-E` / dump output.
    text_output: String,
}

impl Session {
    pub fn new(options: Options) -> Result<Self, String> {
        let mut diags = Diagnostics::new(options.wall, options.wextra, options.werror);
        let Some(layout) = codegen::target_layout(&options.arch) else {
            return Err(diags.fatal(format!(
                "unsupported target '{}' (expected one of: {})",
                options.arch,
                backend_names().join(", ")
            )));
        };
        Ok(Session {
            types: TypeTable::new(layout),
            symbols: SymbolTable::new(),
            module: Module::new("rcc"),
            typedefs: Vec::new(),
            virtual_files: Vec::new(),
            text_output: String::new(),
            diags,
            options,
        })
    }

    /// Register an in-memory source file, shadowing the filesystem.
    pub fn add_virtual_file(&mut self, name: impl Into<String>, content: impl Into<String>) {
        self.virtual_files.push((name.into(), content.into()));
    }

    fn build_preprocessor(&mut self) -> Preprocessor {
        let mut pp = Preprocessor::new(self.options.std);
        for path in &self.options.include_paths {
            pp.add_include_path(path.clone());
        }
        for (name, content) in &self.virtual_files {
            pp.add_virtual_file(name.clone(), content.clone());
        }
        pp.define_builtins(&mut self.diags);
        let defines = self.options.defines.clone();
        for (name, value) in &defines {
            pp.define(name, value.as_deref(), &mut self.diags);
        }
        pp
    }

    /// Compile one translation unit into the session module.
    pub fn compile_file(&mut self, filename: &str) {
        debug!(file = filename, std = %self.options.std, "compiling translation unit");

        // Tokenize through the preprocessor (the lexer runs inside it).
        let mut pp = self.build_preprocessor();
        let tokens = match pp.run(filename, &mut self.diags) {
            Ok(tokens) => tokens,
            Err(_) => return,
        };
        debug!(tokens = tokens.len(), "preprocessed");

        if self.options.preprocess_only {
            self.text_output
                .push_str(&preprocessor::render_preprocessed(&tokens));
            return;
        }

        // Parse.
        let mut parser =
            parser::Parser::new(tokens, self.options.std, &mut self.types, &mut self.diags);
        parser.import_typedefs(self.typedefs.iter().cloned());
        let mut unit = parser.parse();
        self.typedefs = parser.export_typedefs();
        debug!(decls = unit.decls.len(), "parsed");

        if self.options.dump_ast {
            self.text_output.push_str(&ast::dump(&unit, &self.types));
        }
        if self.diags.has_errors() {
            return;
        }

        // Analyze.
        sema::Sema::new(
            &mut self.types,
            &mut self.symbols,
            &mut self.diags,
            self.options.std,
        )
        .run(&mut unit);
        debug!(errors = self.diags.error_count(), "analyzed");

        if self.options.dump_sema {
            self.text_output.push_str(&ast::dump(&unit, &self.types));
        }
        if self.diags.has_errors() || self.options.syntax_only {
            return;
        }

        // Lower to IR.
        irgen::IrGen::new(&self.types, &self.symbols, &mut self.module, &mut self.diags)
            .lower_unit(&unit);
        debug!(functions = self.module.functions.len(), "lowered");
    }

    /// Read a file from disk and compile it.
    pub fn compile_path(&mut self, path: &std::path::Path) {
        let name = path.to_string_lossy().into_owned();
        if self.virtual_files.iter().any(|(n, _)| *n == name) {
            self.compile_file(&name);
            return;
        }
        match std::fs::read_to_string(path) {
            Ok(content) => {
                self.add_virtual_file(name.clone(), content);
                self.compile_file(&name);
            }
            Err(e) => {
                let _ = self.diags.fatal(format!("cannot open '{}': {}", name, e));
            }
        }
    }

    /// Finish the session: run the backend over the accumulated module
    /// and return the output text (assembly, preprocessed source, or
    /// dumps, depending on the options).
    pub fn finish(mut self) -> (Option<String>, Diagnostics) {
        if self.options.preprocess_only || self.options.syntax_only {
            let out = (!self.diags.has_errors()).then_some(self.text_output);
            return (out, self.diags);
        }
        if self.options.dump_ast || self.options.dump_sema {
            let out = (!self.diags.has_errors()).then_some(self.text_output);
            return (out, self.diags);
        }
        if self.diags.has_errors() {
            return (None, self.diags);
        }
        if let Err(e) = self.module.verify() {
            self.diags.fatal(format!("internal: IR verification failed: {}", e));
            return (None, self.diags);
        }

        let Some(mut backend) = create_backend(&self.options.arch) else {
            self.diags
                .fatal(format!("unsupported target '{}'", self.options.arch));
            return (None, self.diags);
        };
        debug!(arch = backend.arch_info().name, "emitting");
        backend.init();
        if let Err(e) = backend.prepare_ir(&mut self.module, self.options.opt_level) {
            self.diags.fatal(format!("{}", e));
            return (None, self.diags);
        }
        if self.options.dump_ir {
            let out = self.module.dump();
            return (Some(out), self.diags);
        }
        let result = backend.codegen_module(&self.module);
        backend.cleanup();
        match result {
            Ok(asm) => (Some(asm), self.diags),
            Err(e) => {
                self.diags.fatal(format!("{}", e));
                (None, self.diags)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(src: &str, configure: impl FnOnce(&mut Options)) -> (Option<String>, Diagnostics) {
        let mut options = Options::default();
        configure(&mut options);
        let mut session = Session::new(options).unwrap();
        session.add_virtual_file("t.c", src);
        session.compile_file("t.c");
        session.finish()
    }

    #[test]
    fn test_end_to_end_assembly() {
        let (out, diags) = run("int main(void) { return 0; }", |_| {});
        assert_eq!(diags.error_count(), 0, "{}", diags.render());
        let asm = out.unwrap();
        assert!(asm.contains("main:"));
    }

    #[test]
    fn test_errors_block_emission() {
        let (out, diags) = run("int f(int); int g(void) { return f(1, 2); }", |_| {});
        assert!(diags.has_errors());
        assert!(out.is_none());
        assert!(diags.contains("function expects 1 arguments, got 2"));
    }

    #[test]
    fn test_preprocess_only() {
        let (out, diags) = run("#define N 3\nint x = N;", |o| o.preprocess_only = true);
        assert!(!diags.has_errors());
        assert!(out.unwrap().contains("int x = 3;"));
    }

    #[test]
    fn test_syntax_only_emits_nothing() {
        let (out, diags) = run("int main(void) { return 0; }", |o| o.syntax_only = true);
        assert!(!diags.has_errors());
        assert_eq!(out.unwrap(), "");
    }

    #[test]
    fn test_dump_ir() {
        let (out, diags) = run("int main(void) { return 1 + 2; }", |o| o.dump_ir = true);
        assert!(!diags.has_errors(), "{}", diags.render());
        let dump = out.unwrap();
        assert!(dump.contains("func @main"));
        assert!(dump.contains("ret"));
    }

    #[test]
    fn test_multi_file_session() {
        let mut session = Session::new(Options::default()).unwrap();
        session.add_virtual_file("a.c", "int shared(void) { return 5; }");
        session.add_virtual_file("b.c", "int shared(void); int main(void) { return shared(); }");
        session.compile_file("a.c");
        session.compile_file("b.c");
        let (out, diags) = session.finish();
        assert_eq!(diags.error_count(), 0, "{}", diags.render());
        let asm = out.unwrap();
        assert!(asm.contains("shared:"));
        assert!(asm.contains("main:"));
    }

    #[test]
    fn test_typedefs_cross_files() {
        let mut session = Session::new(Options::default()).unwrap();
        session.add_virtual_file("a.c", "typedef int myint;");
        session.add_virtual_file("b.c", "myint g(void) { return 3; }");
        session.compile_file("a.c");
        session.compile_file("b.c");
        let (_, diags) = session.finish();
        assert_eq!(diags.error_count(), 0, "{}", diags.render());
    }

    #[test]
    fn test_unknown_arch_is_fatal() {
        let mut options = Options::default();
        options.arch = "vax".into();
        assert!(Session::new(options).is_err());
    }

    #[test]
    fn test_s390_target() {
        let (out, diags) = run("int main() { return 0; }", |o| {
            o.arch = "s390".into();
            o.std = Standard::C89;
        });
        assert_eq!(diags.error_count(), 0, "{}", diags.render());
        assert!(out.unwrap().contains("MAIN     CSECT"));
    }

    #[test]
    fn test_werror_blocks_output() {
        let (out, diags) = run(
            "int main() { return foo(); }",
            |o| {
                o.std = Standard::C89;
                o.werror = true;
            },
        );
        assert!(diags.has_errors());
        assert!(out.is_none());
    }

    #[test]
    fn test_include_path_search() {
        let mut options = Options::default();
        options.include_paths.push(PathBuf::from("sub"));
        let mut session = Session::new(options).unwrap();
        session.add_virtual_file("sub/dep.h", "int dep(void);");
        session.add_virtual_file("t.c", "#include <dep.h>\nint main(void) { return dep(); }");
        session.compile_file("t.c");
        let (out, diags) = session.finish();
        assert_eq!(diags.error_count(), 0, "{}", diags.render());
        assert!(out.is_some());
    }
}
