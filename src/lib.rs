pub mod cli;
pub mod collection;
pub mod error;
pub mod eval;
pub mod expr;
pub mod index;
pub mod matcher;
pub mod path;
pub mod pipeline;
pub mod projection;
pub mod update;
pub mod value;

pub use collection::{Collection, Cursor, Database, UpdateResult};
pub use error::{Error, Result};
pub use eval::{EvalCtx, Scope, eval};
pub use expr::{Expr, compile as compile_expr};
pub use matcher::{Predicate, compile as compile_filter, matches};
pub use pipeline::{SortSpec, Stage};
pub use value::{Document, Value, from_json, to_json};
