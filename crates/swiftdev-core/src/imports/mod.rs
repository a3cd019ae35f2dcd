//! Import discovery for JavaScript/TypeScript files.

mod scan;

pub use scan::{scan_import_clauses, ImportClause, ImportKind};
