//! Centralized identifier quoting and literal escaping.
//!
//! SQL identifiers (schema, table and column names) cannot be bound as
//! parameters, so every statement that names one goes through this module.
//! Values are bound as parameters wherever the protocol allows; data rule
//! values, which are inlined into the COPY select list, use [`quote_literal`].

use crate::core::schema::Table;

/// Quote a PostgreSQL identifier.
///
/// Escapes double quotes by doubling them and wraps in double quotes.
///
/// ```
/// use pgsync::core::identifier::quote_ident;
/// assert_eq!(quote_ident("users"), "\"users\"");
/// assert_eq!(quote_ident("table\"name"), "\"table\"\"name\"");
/// ```
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quote a schema-qualified table: `"schema"."name"`.
pub fn quote_table(table: &Table) -> String {
    format!("{}.{}", quote_ident(table.schema()), quote_ident(table.name()))
}

/// Quote a string literal by doubling single quotes. Backslashes are
/// literal under `standard_conforming_strings`, the server default.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Quote a column qualified by its table: `"schema"."table"."column"`.
pub fn quote_column(table: &Table, column: &str) -> String {
    format!("{}.{}", quote_table(table), quote_ident(column))
}

/// Quote and join a column list: `"a", "b", "c"`.
pub fn quote_list<S: AsRef<str>>(columns: &[S]) -> String {
    columns
        .iter()
        .map(|c| quote_ident(c.as_ref()))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_ident_escapes_quotes() {
        assert_eq!(quote_ident("Users"), "\"Users\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn test_quote_literal() {
        assert_eq!(quote_literal("hi"), "'hi'");
        assert_eq!(quote_literal("it's"), "'it''s'");
        assert_eq!(quote_literal("a\\b"), "'a\\b'");
        assert_eq!(quote_literal("C:\\temp\\it's"), "'C:\\temp\\it''s'");
    }

    #[test]
    fn test_quote_table_and_column() {
        let table = Table::new("public", "Users");
        assert_eq!(quote_table(&table), "\"public\".\"Users\"");
        assert_eq!(quote_column(&table, "Id"), "\"public\".\"Users\".\"Id\"");
        assert_eq!(quote_list(&["id", "title"]), "\"id\", \"title\"");
    }
}
