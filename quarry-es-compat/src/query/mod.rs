//! Elasticsearch query handling: DSL types, DSL to SQL predicates, date math
//! and the SQL builder

pub mod date_math;
pub mod sql;
pub mod translator;
pub mod types;

pub use date_math::{DateMathExpression, DateUnit, Interval};
pub use translator::{LuceneParser, WhereTranslator};
pub use types::*;
