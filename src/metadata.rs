//! Module metadata (`.racm` sidecar files)
//!
//! Each compiled module with exports writes a sidecar next to its source
//! describing the exported surface, so sibling modules can resolve
//! qualified calls and imported struct layouts without reparsing sources.
//!
//! The format is strictly line-oriented, whitespace-separated ASCII:
//!
//! ```text
//! MODULE <name>
//! FUNCTION <name> <returnType> <paramCount>
//!   PARAM <name> <type>
//! STRUCT <name> <fieldCount>
//!   FIELD <name> <type>
//! ```
//!
//! Readers skip unknown leading keywords so the format can grow.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use thiserror::Error;

/// Errors reading or writing a metadata file
#[derive(Error, Debug)]
pub enum MetadataError {
    #[error("cannot access metadata file {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("malformed {keyword} line in metadata: {line:?}")]
    MalformedLine { keyword: &'static str, line: String },

    #[error("metadata ends in the middle of a {keyword} body")]
    Truncated { keyword: &'static str },
}

/// An exported function signature
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportedFunction {
    pub name: String,
    /// Parameters as (name, type spelling) pairs, in order
    pub params: Vec<(String, String)>,
    pub return_type: String,
}

/// An exported struct layout
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportedStruct {
    pub name: String,
    /// Fields as (name, type spelling) pairs, in declaration order
    pub fields: Vec<(String, String)>,
}

/// The exported surface of one module
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModuleMetadata {
    pub module_name: String,
    pub functions: Vec<ExportedFunction>,
    pub structs: Vec<ExportedStruct>,
}

impl ModuleMetadata {
    pub fn new(module_name: impl Into<String>) -> Self {
        Self {
            module_name: module_name.into(),
            functions: Vec::new(),
            structs: Vec::new(),
        }
    }

    /// True if the module exports nothing
    pub fn is_empty(&self) -> bool {
        self.functions.is_empty() && self.structs.is_empty()
    }

    pub fn find_function(&self, name: &str) -> Option<&ExportedFunction> {
        self.functions.iter().find(|f| f.name == name)
    }

    pub fn find_struct(&self, name: &str) -> Option<&ExportedStruct> {
        self.structs.iter().find(|s| s.name == name)
    }

    /// Load a metadata file
    pub fn load(path: &Path) -> Result<Self, MetadataError> {
        let text = fs::read_to_string(path).map_err(|source| MetadataError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        text.parse()
    }

    /// Write a metadata file, atomically replacing any previous contents
    pub fn save(&self, path: &Path) -> Result<(), MetadataError> {
        let io_err = |source| MetadataError::Io {
            path: path.to_path_buf(),
            source,
        };

        // Write a sibling first so readers never observe a torn file.
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        fs::write(&tmp, self.to_string()).map_err(io_err)?;
        fs::rename(&tmp, path).map_err(io_err)
    }
}

impl fmt::Display for ModuleMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "MODULE {}", self.module_name)?;

        for func in &self.functions {
            writeln!(
                f,
                "FUNCTION {} {} {}",
                func.name,
                func.return_type,
                func.params.len()
            )?;
            for (name, ty) in &func.params {
                writeln!(f, "  PARAM {} {}", name, ty)?;
            }
        }

        for st in &self.structs {
            writeln!(f, "STRUCT {} {}", st.name, st.fields.len())?;
            for (name, ty) in &st.fields {
                writeln!(f, "  FIELD {} {}", name, ty)?;
            }
        }

        Ok(())
    }
}

impl FromStr for ModuleMetadata {
    type Err = MetadataError;

    fn from_str(text: &str) -> Result<Self, MetadataError> {
        let mut metadata = ModuleMetadata::default();
        let mut lines = text.lines();

        while let Some(line) = lines.next() {
            let mut words = line.split_whitespace();
            let Some(keyword) = words.next() else {
                continue;
            };

            match keyword {
                "MODULE" => {
                    metadata.module_name = words.next().unwrap_or_default().to_string();
                }
                "FUNCTION" => {
                    let (name, return_type, count) = parse_header("FUNCTION", line, words)?;
                    let params = parse_body("FUNCTION", "PARAM", count, &mut lines)?;
                    metadata.functions.push(ExportedFunction {
                        name,
                        params,
                        return_type,
                    });
                }
                "STRUCT" => {
                    let name = words
                        .next()
                        .ok_or_else(|| malformed("STRUCT", line))?
                        .to_string();
                    let count = words
                        .next()
                        .and_then(|w| w.parse::<usize>().ok())
                        .ok_or_else(|| malformed("STRUCT", line))?;
                    let fields = parse_body("STRUCT", "FIELD", count, &mut lines)?;
                    metadata.structs.push(ExportedStruct { name, fields });
                }
                // Unknown keywords are ignored for forward compatibility.
                _ => continue,
            }
        }

        Ok(metadata)
    }
}

fn malformed(keyword: &'static str, line: &str) -> MetadataError {
    MetadataError::MalformedLine {
        keyword,
        line: line.to_string(),
    }
}

fn parse_header<'a>(
    keyword: &'static str,
    line: &str,
    mut words: impl Iterator<Item = &'a str>,
) -> Result<(String, String, usize), MetadataError> {
    let name = words.next().ok_or_else(|| malformed(keyword, line))?;
    let return_type = words.next().ok_or_else(|| malformed(keyword, line))?;
    let count = words
        .next()
        .and_then(|w| w.parse::<usize>().ok())
        .ok_or_else(|| malformed(keyword, line))?;
    Ok((name.to_string(), return_type.to_string(), count))
}

/// Consume `count` indented body lines; entries whose keyword does not
/// match are consumed but skipped.
fn parse_body<'a>(
    header: &'static str,
    keyword: &str,
    count: usize,
    lines: &mut impl Iterator<Item = &'a str>,
) -> Result<Vec<(String, String)>, MetadataError> {
    let mut entries = Vec::with_capacity(count);
    for _ in 0..count {
        let line = lines
            .next()
            .ok_or(MetadataError::Truncated { keyword: header })?;
        let mut words = line.split_whitespace();
        if words.next() != Some(keyword) {
            continue;
        }
        let (Some(name), Some(ty)) = (words.next(), words.next()) else {
            return Err(malformed(header, line));
        };
        entries.push((name.to_string(), ty.to_string()));
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ModuleMetadata {
        ModuleMetadata {
            module_name: "lib".to_string(),
            functions: vec![ExportedFunction {
                name: "add".to_string(),
                params: vec![
                    ("a".to_string(), "i32".to_string()),
                    ("b".to_string(), "i32".to_string()),
                ],
                return_type: "i32".to_string(),
            }],
            structs: vec![ExportedStruct {
                name: "Point".to_string(),
                fields: vec![
                    ("x".to_string(), "i32".to_string()),
                    ("y".to_string(), "i32".to_string()),
                ],
            }],
        }
    }

    #[test]
    fn test_exact_line_layout() {
        let text = sample().to_string();
        assert_eq!(
            text,
            "MODULE lib\n\
             FUNCTION add i32 2\n\
             \x20 PARAM a i32\n\
             \x20 PARAM b i32\n\
             STRUCT Point 2\n\
             \x20 FIELD x i32\n\
             \x20 FIELD y i32\n"
        );
    }

    #[test]
    fn test_round_trip() {
        let metadata = sample();
        let parsed: ModuleMetadata = metadata.to_string().parse().unwrap();
        assert_eq!(parsed, metadata);
    }

    #[test]
    fn test_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lib.racm");

        let metadata = sample();
        metadata.save(&path).unwrap();
        let loaded = ModuleMetadata::load(&path).unwrap();
        assert_eq!(loaded, metadata);

        // A second save replaces the first.
        let mut updated = metadata.clone();
        updated.functions.clear();
        updated.save(&path).unwrap();
        assert_eq!(ModuleMetadata::load(&path).unwrap(), updated);
    }

    #[test]
    fn test_unknown_keywords_are_ignored() {
        let text = "MODULE lib\nVERSION 2\nFUNCTION id i32 1\n  PARAM x i32\nNOTE whatever\n";
        let metadata: ModuleMetadata = text.parse().unwrap();
        assert_eq!(metadata.module_name, "lib");
        assert_eq!(metadata.functions.len(), 1);
        assert_eq!(metadata.functions[0].params.len(), 1);
    }

    #[test]
    fn test_find_helpers() {
        let metadata = sample();
        assert!(metadata.find_function("add").is_some());
        assert!(metadata.find_function("sub").is_none());
        assert!(metadata.find_struct("Point").is_some());
        assert!(metadata.find_struct("Rect").is_none());
    }

    #[test]
    fn test_truncated_body_is_an_error() {
        let text = "MODULE lib\nFUNCTION add i32 2\n  PARAM a i32\n";
        assert!(text.parse::<ModuleMetadata>().is_err());
    }

    #[test]
    fn test_malformed_count_is_an_error() {
        let text = "MODULE lib\nFUNCTION add i32 many\n";
        assert!(text.parse::<ModuleMetadata>().is_err());
    }

    #[test]
    fn test_pointer_types_survive() {
        let mut metadata = ModuleMetadata::new("mem");
        metadata.functions.push(ExportedFunction {
            name: "alloc_pair".to_string(),
            params: vec![("count".to_string(), "u64".to_string())],
            return_type: "Pair*".to_string(),
        });
        let parsed: ModuleMetadata = metadata.to_string().parse().unwrap();
        assert_eq!(parsed.functions[0].return_type, "Pair*");
    }
}
