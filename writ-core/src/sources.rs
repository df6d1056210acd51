use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// A chunk of policy text handed to `load`, with the file it came from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Source {
    pub filename: Option<String>,
    pub src: String,
}

impl Source {
    pub fn new<T: AsRef<str>>(src: T) -> Self {
        Self {
            filename: None,
            src: src.as_ref().to_owned(),
        }
    }

    pub fn new_with_name<T: AsRef<str>, U: AsRef<str>>(filename: T, src: U) -> Self {
        Self {
            filename: Some(filename.as_ref().to_owned()),
            src: src.as_ref().to_owned(),
        }
    }

    /// Zero-based (row, column) of a byte offset.
    pub fn position(&self, offset: usize) -> (usize, usize) {
        loc_to_pos(&self.src, offset)
    }
}

/// Where a term came from.
#[derive(Debug, Clone)]
pub enum SourceInfo {
    /// Parsed from policy text; `left..right` is the byte span of the term.
    Parser {
        source: Arc<Source>,
        left: usize,
        right: usize,
    },

    /// Introduced by a rewrite or by the VM.
    TemporaryVariable,

    /// Handed in by the host.
    Ffi,

    Test,
}

impl SourceInfo {
    pub fn ffi() -> Self {
        Self::Ffi
    }

    pub fn parser(source: Arc<Source>, left: usize, right: usize) -> Self {
        Self::Parser {
            source,
            left,
            right,
        }
    }

    /// The source text and offset of a parsed term, if any.
    pub fn span(&self) -> Option<(&Source, usize, usize)> {
        match self {
            Self::Parser {
                source,
                left,
                right,
            } => Some((source, *left, *right)),
            _ => None,
        }
    }
}

/// Convert a byte offset into a zero-based (row, column) pair.
pub fn loc_to_pos(src: &str, loc: usize) -> (usize, usize) {
    let mut row = 0;
    let mut column = 0;
    for (index, c) in src.char_indices() {
        if index >= loc {
            break;
        }
        if c == '\n' {
            row += 1;
            column = 0;
        } else {
            column += 1;
        }
    }
    (row, column)
}
