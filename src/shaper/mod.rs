//! Materialization: turns result rows into shaped values, resolving identity through a scope.

pub mod cursor;
pub mod instance;
pub mod query;
#[allow(clippy::module_inception)]
pub mod shaper;
pub mod tracking;

pub use cursor::{AsyncRowCursor, BufferedRows, RowCursor, ValueBuffer};
pub use instance::{EntityInstance, ShapedValue};
pub use query::{shape, shape_async, ShapedQuery};
pub use shaper::{CollectionShaper, EntityShaper, IncludeShaper, IncludeTarget, PropertySlot, ScalarSlot, Shaper};
pub use tracking::{EntityEntry, EntityKey, IdentityScope, SharedStateManager, StateManager};
