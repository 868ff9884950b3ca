//! Compile-time declaration of watched tables via `#[derive(WatchedTable)]`
//! (in the optional `harmonylite-derive` crate). Each derive submits one
//! [`WatchedTableDecl`] to a global [`inventory`] collection at link time;
//! [`declared_in`] lets a CLI binary discover its own crate's declarations
//! by module-path prefix instead of hand-maintaining a table name list in
//! its config.
//!
//! This is purely a convenience layer on top of [`schema::WatchedTable`] —
//! the engine still introspects the live database via `PRAGMA table_info`
//! for the authoritative column descriptors; this registry only supplies
//! table *names* to watch.

/// Metadata submitted by `#[derive(WatchedTable)]` at link time.
pub struct WatchedTableDecl {
    /// The `module_path!()` of the annotated struct, used for prefix matching.
    pub module_path: &'static str,
    /// The SQL table name this struct corresponds to.
    pub table_name: &'static str,
}

inventory::collect!(WatchedTableDecl);

/// Table names declared by structs whose module path starts with `prefix`,
/// in declaration order. Pass your crate name (or
/// `module_path!().split("::").next().unwrap()`) to discover only your own
/// declarations.
pub fn declared_in(prefix: &str) -> Vec<&'static str> {
    inventory::iter::<WatchedTableDecl>()
        .filter(|d| d.module_path.starts_with(prefix))
        .map(|d| d.table_name)
        .collect()
}
