//! HTML tokenization.

pub mod lexer;

pub use lexer::{Attribute, Lexer, Tag, Token};
