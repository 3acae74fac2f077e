// Parser module for conductor plays

pub mod ast;
pub mod expressions;
pub mod yaml;

pub use ast::*;
pub use expressions::parse_expression;
pub use yaml::parse_play;
