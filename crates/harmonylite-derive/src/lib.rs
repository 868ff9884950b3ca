use proc_macro::TokenStream;
use syn::{parse_macro_input, DeriveInput, LitStr};

/// Derive macro that declares a struct's table for CDC discovery.
///
/// ```ignore
/// #[derive(WatchedTable)]
/// #[harmonylite(table = "books")]
/// pub struct Book {
///     pub id: i64,
///     pub title: String,
/// }
/// ```
///
/// At link time, the table name is submitted to an `inventory` collection
/// keyed by the struct's `module_path!()`. A CLI binary calls
/// `harmonylite_core::watched_table_registry::declared_in("my_crate")` to
/// discover every table declared in its own crate without hand-maintaining
/// a table name list in its config file.
///
/// The struct's fields are not inspected — column descriptors are always
/// read from the live database via `PRAGMA table_info`, since the struct is
/// a documentation aid, not the source of truth for column types.
#[proc_macro_derive(WatchedTable, attributes(harmonylite))]
pub fn derive_watched_table(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    let table_name = match table_name_from_attrs(&input) {
        Ok(name) => name,
        Err(err) => return err.to_compile_error().into(),
    };

    quote::quote! {
        harmonylite_core::inventory::submit! {
            harmonylite_core::WatchedTableDecl {
                module_path: module_path!(),
                table_name: #table_name,
            }
        }
    }
    .into()
}

fn table_name_from_attrs(input: &DeriveInput) -> syn::Result<String> {
    for attr in &input.attrs {
        if !attr.path().is_ident("harmonylite") {
            continue;
        }
        let mut found = None;
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("table") {
                let value = meta.value()?;
                let lit: LitStr = value.parse()?;
                found = Some(lit.value());
                Ok(())
            } else {
                Err(meta.error("unsupported harmonylite attribute, expected `table = \"...\"`"))
            }
        })?;
        if let Some(name) = found {
            return Ok(name);
        }
    }
    Err(syn::Error::new_spanned(
        &input.ident,
        "#[derive(WatchedTable)] requires #[harmonylite(table = \"...\")]",
    ))
}
