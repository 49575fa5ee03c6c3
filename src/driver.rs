//! Build driver
//!
//! Orchestrates a whole build: parses each requested source, discovers its
//! transitive imports, compiles dependencies depth-first, reuses up-to-date
//! object files, and finally hands everything to the system linker.
//!
//! Compilation units are kept in insertion order; the import graph is
//! assumed acyclic.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::SystemTime;

use inkwell::context::Context;
use inkwell::module::Module;
use inkwell::passes::PassBuilderOptions;
use inkwell::targets::{
    CodeModel, FileType, InitializationConfig, RelocMode, Target, TargetMachine, TargetTriple,
};
use inkwell::OptimizationLevel;
use thiserror::Error;

use crate::ast::Stmt;
use crate::codegen::{Codegen, CodegenError};
use crate::metadata::MetadataError;
use crate::parser;

/// Errors that abort a build
#[derive(Error, Debug)]
pub enum BuildError {
    #[error("cannot read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("source file {} not found", .0.display())]
    MissingSource(PathBuf),

    #[error("module `{module}` not found: required file {} does not exist", .path.display())]
    MissingModule { module: String, path: PathBuf },

    #[error("compilation of {} failed with {count} parse error(s)", .path.display())]
    Parse { path: PathBuf, count: usize },

    #[error("module verification failed for {}:\n{message}", .path.display())]
    Verify { path: PathBuf, message: String },

    #[error(transparent)]
    Codegen(#[from] CodegenError),

    #[error(transparent)]
    Metadata(#[from] MetadataError),

    #[error("unsupported target: {0}")]
    UnknownTarget(String),

    #[error("could not create a target machine for {0}")]
    TargetMachine(String),

    #[error("object emission failed: {0}")]
    Emit(String),

    #[error("--emit-llvm only supports a single source file")]
    EmitLlvmMultipleInputs,

    #[error("import cycle detected: {0}")]
    ImportCycle(String),

    #[error("no C compiler driver found to link with (tried clang, cc, gcc)")]
    NoLinker,

    #[error("linking failed (exit code {0})")]
    Link(i32),
}

/// Options shaping one build, mirroring the CLI surface
#[derive(Debug, Clone)]
pub struct BuildOptions {
    /// Output filename; the object and executable names derive from it
    pub output: PathBuf,
    /// Target triple override; `None` means the host
    pub target_triple: Option<String>,
    /// Bare-metal mode: static relocation, no link step
    pub bare_metal: bool,
    /// Emit textual IR instead of objects
    pub emit_llvm: bool,
    /// Emit objects but skip the link step
    pub no_link: bool,
    /// 0-3, forwarded to the backend
    pub opt_level: u8,
    /// Reserved; no behavioral contract yet
    pub debug_info: bool,
    pub verbose: bool,
    pub quiet: bool,
    /// Bypass the timestamp check and always recompile
    pub force: bool,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            output: PathBuf::from("a.out"),
            target_triple: None,
            bare_metal: false,
            emit_llvm: false,
            no_link: false,
            opt_level: 0,
            debug_info: false,
            verbose: false,
            quiet: false,
            force: false,
        }
    }
}

/// One translation unit known to the driver
pub struct CompilationUnit {
    pub source_path: PathBuf,
    pub object_path: PathBuf,
    pub module_name: String,
    pub program: Vec<Stmt>,
    pub imports: Vec<String>,
    pub compiled: bool,
    pub is_imported: bool,
}

/// The multi-module build driver
pub struct Driver {
    options: BuildOptions,
    /// Units in insertion order
    units: Vec<CompilationUnit>,
    /// Module name to unit index
    index: HashMap<String, usize>,
    /// Units on the depth-first stack, for cycle detection
    stack: Vec<usize>,
}

impl Driver {
    pub fn new(options: BuildOptions) -> Self {
        Self {
            options,
            units: Vec::new(),
            index: HashMap::new(),
            stack: Vec::new(),
        }
    }

    /// Compile the given sources plus their transitive imports, then link
    /// unless a no-link mode is in effect
    pub fn build(&mut self, sources: &[PathBuf]) -> Result<(), BuildError> {
        if self.options.emit_llvm {
            return self.emit_llvm_only(sources);
        }

        for source in sources {
            if !source.exists() {
                return Err(BuildError::MissingSource(source.clone()));
            }

            let module_name = module_name_of(source);
            // A single linked build names its object after -o; everything
            // else gets a sibling .o next to its source.
            let object_path = if sources.len() == 1 && !self.options.no_link {
                object_file_name(&self.options.output)
            } else {
                source.with_extension("o")
            };

            self.add_unit(CompilationUnit {
                source_path: source.clone(),
                object_path,
                module_name,
                program: Vec::new(),
                imports: Vec::new(),
                compiled: false,
                is_imported: false,
            });
        }

        for idx in 0..self.units.len() {
            self.compile_unit(idx)?;
        }

        // Collect every object produced or reused, dependencies included.
        let objects: Vec<PathBuf> = self
            .units
            .iter()
            .filter(|unit| unit.compiled && unit.object_path.exists())
            .map(|unit| unit.object_path.clone())
            .collect();

        if self.options.no_link {
            let listed: Vec<String> = objects
                .iter()
                .map(|path| path.display().to_string())
                .collect();
            self.log(&format!("Objects: {}", listed.join(" ")));
            return Ok(());
        }

        let executable = executable_file_name(&self.options.output);
        self.link(&objects, &executable)
    }

    fn add_unit(&mut self, unit: CompilationUnit) -> usize {
        let idx = self.units.len();
        self.index.insert(unit.module_name.clone(), idx);
        self.units.push(unit);
        idx
    }

    fn compile_unit(&mut self, idx: usize) -> Result<(), BuildError> {
        if self.units[idx].compiled {
            return Ok(());
        }

        // The import graph must be acyclic; fail loudly instead of
        // recursing forever.
        if self.stack.contains(&idx) {
            let mut chain: Vec<&str> = self
                .stack
                .iter()
                .map(|&i| self.units[i].module_name.as_str())
                .collect();
            chain.push(&self.units[idx].module_name);
            return Err(BuildError::ImportCycle(chain.join(" -> ")));
        }

        self.stack.push(idx);
        let result = self.compile_unit_inner(idx);
        self.stack.pop();
        result
    }

    fn compile_unit_inner(&mut self, idx: usize) -> Result<(), BuildError> {
        self.log_verbose(&format!(
            "compiling module: {}",
            self.units[idx].module_name
        ));

        // Always parse, even when up to date, so imports are discovered.
        if self.units[idx].program.is_empty() {
            let source_path = self.units[idx].source_path.clone();
            let (program, imports) = load_and_parse(&source_path)?;
            self.units[idx].program = program;
            self.units[idx].imports = imports;
        }

        let source_path = self.units[idx].source_path.clone();
        let base_dir = base_dir_of(&source_path);
        let imports = self.units[idx].imports.clone();

        // Dependencies first, depth first. Missing import sources are fatal.
        for import in &imports {
            if let Some(&dep) = self.index.get(import) {
                self.compile_unit(dep)?;
            } else {
                let import_source =
                    base_dir.join(format!("{}.{}", import, crate::FILE_EXTENSION));
                if !import_source.exists() {
                    return Err(BuildError::MissingModule {
                        module: import.clone(),
                        path: import_source,
                    });
                }

                self.log_verbose(&format!("auto-compiling dependency: {}", import));
                let dep = self.add_unit(CompilationUnit {
                    object_path: import_source.with_extension("o"),
                    source_path: import_source,
                    module_name: import.clone(),
                    program: Vec::new(),
                    imports: Vec::new(),
                    compiled: false,
                    is_imported: true,
                });
                self.compile_unit(dep)?;
            }
        }

        let object_path = self.units[idx].object_path.clone();
        if !needs_recompilation(&source_path, &object_path, self.options.force) {
            self.log_verbose(&format!("skipping {} (up to date)", source_path.display()));
            self.units[idx].compiled = true;
            return Ok(());
        }

        self.log(&format!("Compiling {}...", source_path.display()));

        let module_name = self.units[idx].module_name.clone();
        let context = Context::create();
        let mut codegen = Codegen::new(&context, &module_name, &base_dir);
        for import in &imports {
            codegen.load_import(import)?;
        }
        codegen.generate(&self.units[idx].program)?;

        if let Err(message) = codegen.verify() {
            return Err(BuildError::Verify {
                path: source_path,
                message,
            });
        }

        if self.units[idx].program.iter().any(|stmt| stmt.is_exported()) {
            let path = metadata_path(&source_path);
            codegen.exports().save(&path)?;
            self.log_verbose(&format!("module metadata written to {}", path.display()));
        }

        emit_object(codegen.module(), &object_path, &self.options)?;
        self.log(&format!("Object file written to {}", object_path.display()));

        self.units[idx].compiled = true;
        Ok(())
    }

    /// `--emit-llvm`: lower a single unit and print the textual module
    fn emit_llvm_only(&mut self, sources: &[PathBuf]) -> Result<(), BuildError> {
        let [source] = sources else {
            return Err(BuildError::EmitLlvmMultipleInputs);
        };
        if !source.exists() {
            return Err(BuildError::MissingSource(source.clone()));
        }

        let (program, imports) = load_and_parse(source)?;
        let base_dir = base_dir_of(source);
        let module_name = module_name_of(source);

        let context = Context::create();
        let mut codegen = Codegen::new(&context, &module_name, &base_dir);
        for import in &imports {
            codegen.load_import(import)?;
        }
        codegen.generate(&program)?;

        if let Err(message) = codegen.verify() {
            return Err(BuildError::Verify {
                path: source.clone(),
                message,
            });
        }

        codegen
            .module()
            .print_to_file(&self.options.output)
            .map_err(|e| BuildError::Emit(e.to_string()))?;
        self.log(&format!(
            "LLVM IR written to {}",
            self.options.output.display()
        ));
        Ok(())
    }

    fn link(&self, objects: &[PathBuf], output: &Path) -> Result<(), BuildError> {
        let linker = find_linker().ok_or(BuildError::NoLinker)?;

        let mut command = Command::new(linker);
        command.args(objects).arg("-o").arg(output);
        self.log_verbose(&format!("linking with: {:?}", command));

        let status = command.status().map_err(|source| BuildError::Io {
            path: PathBuf::from(linker),
            source,
        })?;
        if !status.success() {
            return Err(BuildError::Link(status.code().unwrap_or(-1)));
        }

        self.log(&format!(
            "Linked executable written to {}",
            output.display()
        ));
        Ok(())
    }

    fn log(&self, message: &str) {
        if !self.options.quiet {
            println!("{}", message);
        }
    }

    fn log_verbose(&self, message: &str) {
        if self.options.verbose && !self.options.quiet {
            println!("[VERBOSE] {}", message);
        }
    }
}

/// Read and parse one source file, reporting parse errors by line
fn load_and_parse(path: &Path) -> Result<(Vec<Stmt>, Vec<String>), BuildError> {
    let source = fs::read_to_string(path).map_err(|source| BuildError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let (program, errors) = parser::parse(&source);
    if !errors.is_empty() {
        for error in &errors {
            eprintln!(
                "{}:{}: error: {}",
                path.display(),
                error.span().line(&source),
                error
            );
        }
        return Err(BuildError::Parse {
            path: path.to_path_buf(),
            count: errors.len(),
        });
    }

    let imports = program
        .iter()
        .filter_map(|stmt| stmt.as_import().map(str::to_string))
        .collect();
    Ok((program, imports))
}

/// Emit an object file for the module at the requested target and
/// optimization level
pub fn emit_object(
    module: &Module<'_>,
    path: &Path,
    options: &BuildOptions,
) -> Result<(), BuildError> {
    Target::initialize_all(&InitializationConfig::default());

    // `x86_64-bios` is the bare-metal alias; the backend knows the
    // equivalent triple as none-elf.
    let triple = if options.bare_metal {
        TargetTriple::create("x86_64-pc-none-elf")
    } else {
        match &options.target_triple {
            Some(triple) => TargetTriple::create(triple),
            None => TargetMachine::get_default_triple(),
        }
    };

    let target =
        Target::from_triple(&triple).map_err(|e| BuildError::UnknownTarget(e.to_string()))?;

    let opt_level = match options.opt_level {
        0 => OptimizationLevel::None,
        1 => OptimizationLevel::Less,
        2 => OptimizationLevel::Default,
        _ => OptimizationLevel::Aggressive,
    };
    // PIC for hosted builds; bare metal links with static relocation.
    let reloc = if options.bare_metal {
        RelocMode::Static
    } else {
        RelocMode::PIC
    };

    let machine = target
        .create_target_machine(&triple, "generic", "", opt_level, reloc, CodeModel::Default)
        .ok_or_else(|| {
            BuildError::TargetMachine(triple.as_str().to_string_lossy().into_owned())
        })?;

    module.set_triple(&triple);
    module.set_data_layout(&machine.get_target_data().get_data_layout());

    if options.opt_level > 0 {
        let passes = format!("default<O{}>", options.opt_level);
        module
            .run_passes(&passes, &machine, PassBuilderOptions::create())
            .map_err(|e| BuildError::Emit(e.to_string()))?;
    }

    machine
        .write_to_file(module, FileType::Object, path)
        .map_err(|e| BuildError::Emit(e.to_string()))
}

/// First C compiler driver available on PATH
fn find_linker() -> Option<&'static str> {
    ["clang", "cc", "gcc"].into_iter().find(|candidate| {
        Command::new(candidate)
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|status| status.success())
            .unwrap_or(false)
    })
}

/// Whether the unit must be recompiled: missing or stale object, or `--force`
pub fn needs_recompilation(source: &Path, object: &Path, force: bool) -> bool {
    if force {
        return true;
    }
    if !object.exists() {
        return true;
    }
    modification_time(source) > modification_time(object)
}

fn modification_time(path: &Path) -> SystemTime {
    fs::metadata(path)
        .and_then(|meta| meta.modified())
        .unwrap_or(SystemTime::UNIX_EPOCH)
}

/// Object file name derived from the requested output name
pub fn object_file_name(output: &Path) -> PathBuf {
    match output.extension().and_then(|ext| ext.to_str()) {
        Some("o") | Some("obj") => output.to_path_buf(),
        _ => output.with_extension("o"),
    }
}

/// Executable name derived from the requested output name
pub fn executable_file_name(output: &Path) -> PathBuf {
    match output.extension().and_then(|ext| ext.to_str()) {
        Some("o") | Some("obj") => output.with_extension(""),
        _ => output.to_path_buf(),
    }
}

/// Metadata sidecar path for a source file
pub fn metadata_path(source: &Path) -> PathBuf {
    source.with_extension(crate::METADATA_EXTENSION)
}

/// Module name: the source file's stem
pub fn module_name_of(source: &Path) -> String {
    source
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn base_dir_of(source: &Path) -> PathBuf {
    match source.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::time::Duration;

    #[test]
    fn test_object_file_name() {
        assert_eq!(object_file_name(Path::new("a.out")), Path::new("a.o"));
        assert_eq!(object_file_name(Path::new("foo.o")), Path::new("foo.o"));
        assert_eq!(object_file_name(Path::new("foo")), Path::new("foo.o"));
    }

    #[test]
    fn test_executable_file_name() {
        assert_eq!(executable_file_name(Path::new("foo.o")), Path::new("foo"));
        assert_eq!(executable_file_name(Path::new("app")), Path::new("app"));
        assert_eq!(executable_file_name(Path::new("a.out")), Path::new("a.out"));
    }

    #[test]
    fn test_metadata_path() {
        assert_eq!(
            metadata_path(Path::new("src/lib.rac")),
            Path::new("src/lib.racm")
        );
    }

    #[test]
    fn test_module_name_of() {
        assert_eq!(module_name_of(Path::new("src/geo.rac")), "geo");
        assert_eq!(module_name_of(Path::new("app.rac")), "app");
    }

    #[test]
    fn test_needs_recompilation() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("m.rac");
        let object = dir.path().join("m.o");
        fs::write(&source, "fun main(): i32 { return 0; }").unwrap();

        // No object yet.
        assert!(needs_recompilation(&source, &object, false));

        // Fresh object.
        fs::write(&object, b"obj").unwrap();
        let now = SystemTime::now();
        File::options()
            .write(true)
            .open(&object)
            .unwrap()
            .set_modified(now + Duration::from_secs(10))
            .unwrap();
        assert!(!needs_recompilation(&source, &object, false));

        // Force always recompiles.
        assert!(needs_recompilation(&source, &object, true));

        // Source newer than object.
        File::options()
            .write(true)
            .open(&source)
            .unwrap()
            .set_modified(now + Duration::from_secs(20))
            .unwrap();
        assert!(needs_recompilation(&source, &object, false));
    }

    #[test]
    fn test_two_module_build_writes_metadata_and_objects() {
        let dir = tempfile::tempdir().unwrap();
        let lib = dir.path().join("lib.rac");
        let app = dir.path().join("app.rac");
        fs::write(
            &lib,
            "export fun add(a: i32, b: i32): i32 { return a + b; }",
        )
        .unwrap();
        fs::write(
            &app,
            "import \"lib\";\nfun main(): i32 { return lib.add(2, 3); }",
        )
        .unwrap();

        let options = BuildOptions {
            no_link: true,
            quiet: true,
            ..BuildOptions::default()
        };
        let mut driver = Driver::new(options);
        driver.build(&[app.clone()]).unwrap();

        // The dependency was auto-compiled and its surface recorded.
        assert!(dir.path().join("lib.o").exists());
        assert!(dir.path().join("app.o").exists());

        let metadata = fs::read_to_string(dir.path().join("lib.racm")).unwrap();
        assert!(metadata.contains("MODULE lib"));
        assert!(metadata.contains("FUNCTION add i32 2"));
        assert_eq!(metadata.matches("PARAM").count(), 2);
    }

    #[test]
    fn test_up_to_date_build_skips_object_emission() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("m.rac");
        fs::write(&source, "fun main(): i32 { return 0; }").unwrap();

        let options = BuildOptions {
            no_link: true,
            quiet: true,
            ..BuildOptions::default()
        };
        Driver::new(options.clone()).build(&[source.clone()]).unwrap();

        let object = dir.path().join("m.o");
        assert!(object.exists());

        // Push the object's timestamp ahead so the second build must skip.
        File::options()
            .write(true)
            .open(&object)
            .unwrap()
            .set_modified(SystemTime::now() + Duration::from_secs(30))
            .unwrap();
        let stamped = fs::metadata(&object).unwrap().modified().unwrap();

        Driver::new(options).build(&[source]).unwrap();
        assert_eq!(fs::metadata(&object).unwrap().modified().unwrap(), stamped);
    }

    #[test]
    fn test_missing_import_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let app = dir.path().join("app.rac");
        fs::write(&app, "import \"ghost\";\nfun main(): i32 { return 0; }").unwrap();

        let options = BuildOptions {
            no_link: true,
            quiet: true,
            ..BuildOptions::default()
        };
        let err = Driver::new(options).build(&[app]).unwrap_err();
        assert!(matches!(err, BuildError::MissingModule { module, .. } if module == "ghost"));
    }

    #[test]
    fn test_import_cycle_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.rac"), "import \"b\";\nfun fa() { }").unwrap();
        fs::write(dir.path().join("b.rac"), "import \"a\";\nfun fb() { }").unwrap();

        let options = BuildOptions {
            no_link: true,
            quiet: true,
            ..BuildOptions::default()
        };
        let err = Driver::new(options)
            .build(&[dir.path().join("a.rac")])
            .unwrap_err();
        assert!(matches!(err, BuildError::ImportCycle(chain) if chain.contains("a -> b -> a")));
    }

    #[test]
    fn test_parse_errors_abort_the_unit() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("bad.rac");
        fs::write(&source, "fun main(): i32 { let = 1; }").unwrap();

        let options = BuildOptions {
            no_link: true,
            quiet: true,
            ..BuildOptions::default()
        };
        let err = Driver::new(options).build(&[source]).unwrap_err();
        assert!(matches!(err, BuildError::Parse { count, .. } if count > 0));
    }

    #[test]
    fn test_emit_llvm_rejects_multiple_inputs() {
        let options = BuildOptions {
            emit_llvm: true,
            quiet: true,
            ..BuildOptions::default()
        };
        let err = Driver::new(options)
            .build(&[PathBuf::from("a.rac"), PathBuf::from("b.rac")])
            .unwrap_err();
        assert!(matches!(err, BuildError::EmitLlvmMultipleInputs));
    }

    #[test]
    fn test_emit_llvm_writes_textual_ir() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("m.rac");
        let output = dir.path().join("m.ll");
        fs::write(&source, "fun main(): i32 { return 2 + 3; }").unwrap();

        let options = BuildOptions {
            emit_llvm: true,
            quiet: true,
            output: output.clone(),
            ..BuildOptions::default()
        };
        Driver::new(options).build(&[source]).unwrap();

        let ir = fs::read_to_string(&output).unwrap();
        assert!(ir.contains("define i32 @main"));
    }
}
