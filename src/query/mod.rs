//! The query language: expression trees, operator pipelines, captured parameters and the client
//! evaluator used for parts of a query that run after materialization.

pub mod eval;
pub mod expr;
pub mod operators;
pub mod parameters;

pub use eval::{compare, ClientFunction, ClientFunctions, Evaluator};
pub use expr::{
    lambda, new_object, param, static_call, static_member, var, BinaryOp, DeclaringType, Expr, Lambda, MethodRef,
    UnaryOp,
};
pub use operators::{Query, QueryOperator, QuerySource, Terminal};
pub use parameters::QueryParameters;
