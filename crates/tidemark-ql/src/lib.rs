#![warn(missing_docs)]

//! Tidemark query language subsystem: statement AST, privilege requirements and canonical rendering

pub mod ast;
pub mod privilege;

pub use ast::{
    quote_ident, ContinuousQueryStatement, Field, Measurement, Query, SelectStatement, Statement,
    Target,
};
pub use privilege::{ExecutionPrivilege, Privilege};
