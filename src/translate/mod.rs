//! Query translation: operator pipelines to SQL trees and shape templates, through the translating
//! visitor, the projection binder and the pluggable method/member translators.

pub mod compiler;
pub mod functions;
mod navigation;
mod projection;
pub mod registry;
pub mod shape;
mod visitor;

pub use compiler::{Cardinality, CompiledQuery, QueryCompiler};
pub use functions::{DbFunction, FunctionTranslation};
pub use registry::{MemberTranslator, MethodCallTranslator, TranslatorRegistry};
pub use shape::{PendingCollection, ShapeExpr};

#[cfg(test)]
pub(crate) use visitor::tests::BLOGGING;
