//! rac compiler
//!
//! An ahead-of-time compiler for the rac language: a small, statically
//! typed, C-family language with structs, pointers, and cross-module
//! imports through textual metadata sidecars.
//!
//! # Architecture
//!
//! ```text
//! Source Code (.rac)
//!       │
//!       ▼
//! ┌─────────────┐
//! │    Lexer    │  → Tokens
//! └─────────────┘
//!       │
//!       ▼
//! ┌─────────────┐
//! │   Parser    │  → AST
//! └─────────────┘
//!       │
//!       ▼
//! ┌─────────────┐     ┌──────────────────┐
//! │   Codegen   │ ←── │ Import metadata  │ (.racm)
//! └─────────────┘     └──────────────────┘
//!       │
//!       ▼
//! ┌─────────────┐
//! │   Driver    │  → Object files → Linker → Executable
//! └─────────────┘
//! ```
//!
//! The driver walks the import graph depth-first, reusing object files
//! whose timestamps are current, and mangles exported functions as
//! `<module>_<name>` so sibling modules link against them.

pub mod ast;
pub mod codegen;
pub mod driver;
pub mod lexer;
pub mod metadata;
pub mod parser;
pub mod span;
pub mod token;

// Re-exports for convenience
pub use lexer::Lexer;
pub use span::Span;
pub use token::{Token, TokenKind};

/// Compiler version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// File extension for rac source files
pub const FILE_EXTENSION: &str = "rac";

/// File extension for module metadata sidecars
pub const METADATA_EXTENSION: &str = "racm";
