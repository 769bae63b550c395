//! Architect ORM: query compilation, SQL generation and result shaping for a relational
//! object mapper.

pub mod cache;
pub mod case;
pub mod concurrency;
pub mod context;
pub mod error;
pub mod model;
pub mod options;
pub mod query;
pub mod service;
pub mod shaper;
pub mod sql;
pub mod storage;
pub mod translate;
pub mod value;

pub use cache::{CacheStats, PlanCache};
pub use concurrency::{ConcurrencyDetector, CriticalSection};
pub use context::QueryContext;
pub use error::{ModelError, QueryError, Result};
pub use model::{from_json, resolve, Model, ModelBuilder};
pub use options::{Dialect, QueryOptions, TrackingBehavior};
pub use query::{ClientFunctions, Expr, Lambda, Query, QueryParameters, Terminal};
pub use service::{CommandExecutor, InMemoryExecutor, PgCommandExecutor, RelationalCommand};
pub use shaper::{EntityInstance, ShapedValue};
pub use translate::{CompiledQuery, QueryCompiler, TranslatorRegistry};
pub use value::{ClrType, Value};
