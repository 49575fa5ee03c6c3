//! rac compiler CLI
//!
//! The `racc` command compiles one or more `.rac` sources, auto-compiles
//! their imports, and links the result into an executable.

use clap::Parser;
use rac::driver::{BuildOptions, Driver};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "racc")]
#[command(version = rac::VERSION)]
#[command(about = "Ahead-of-time compiler for the rac language", long_about = None)]
struct Cli {
    /// Source files to compile
    #[arg(value_name = "FILE", required = true)]
    sources: Vec<PathBuf>,

    /// Output filename
    #[arg(short, long, value_name = "FILE", default_value = "a.out")]
    output: PathBuf,

    /// Emit textual LLVM IR only (single input)
    #[arg(long)]
    emit_llvm: bool,

    /// Emit object files and skip the link step
    #[arg(long, visible_alias = "no-link")]
    emit_object: bool,

    /// Optimization level
    #[arg(
        short = 'O',
        value_name = "LEVEL",
        default_value_t = 0,
        value_parser = clap::value_parser!(u8).range(0..=3)
    )]
    opt_level: u8,

    /// Generate debug information (not implemented)
    #[arg(short = 'g')]
    debug_info: bool,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Suppress non-error output
    #[arg(short, long)]
    quiet: bool,

    /// Force recompilation of all files
    #[arg(short, long)]
    force: bool,

    /// Override the default host target triple; x86_64-bios selects
    /// bare-metal mode (static relocation, no link step)
    #[arg(long, value_name = "TRIPLE")]
    target: Option<String>,
}

fn main() -> miette::Result<()> {
    let cli = Cli::parse();

    let bare_metal = cli.target.as_deref() == Some("x86_64-bios");
    let options = BuildOptions {
        output: cli.output,
        target_triple: cli.target,
        bare_metal,
        emit_llvm: cli.emit_llvm,
        no_link: cli.emit_object || bare_metal,
        opt_level: cli.opt_level,
        debug_info: cli.debug_info,
        verbose: cli.verbose,
        quiet: cli.quiet,
        force: cli.force,
    };

    if bare_metal && !options.quiet {
        println!("[INFO] BIOS target detected; skipping host linker.");
        println!("       Link manually, e.g. ld -T linker.ld -nostdlib -o kernel.elf ...");
    }

    let mut driver = Driver::new(options);
    driver
        .build(&cli.sources)
        .map_err(|e| miette::miette!("{}", e))?;

    Ok(())
}
