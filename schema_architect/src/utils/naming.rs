//! Naming utilities for schema_architect
//!
//! Identifier qualification, collision suffixes and keyword escaping.

use std::collections::HashSet;

/// Join optional catalog and schema names with a table name using dots
pub fn to_qualified_name(catalog: Option<&str>, schema: Option<&str>, name: &str) -> String {
    let mut parts: Vec<&str> = Vec::with_capacity(3);
    if let Some(catalog) = catalog.filter(|c| !c.is_empty()) {
        parts.push(catalog);
    }
    if let Some(schema) = schema.filter(|s| !s.is_empty()) {
        parts.push(schema);
    }
    parts.push(name);
    parts.join(".")
}

/// Generate a unique name with a `_n` suffix if `name` is already taken.
///
/// Comparison ignores case, matching how most databases resolve unquoted
/// identifiers.
pub fn generate_unique_name(name: &str, existing_names: &HashSet<String>) -> String {
    if !existing_names.contains(&name.to_lowercase()) {
        return name.to_string();
    }

    let mut counter = 1;
    loop {
        let new_name = format!("{}_{}", name, counter);
        if !existing_names.contains(&new_name.to_lowercase()) {
            return new_name;
        }
        counter += 1;
    }
}

/// Format SQL identifier according to database style (quoted, backticks, etc.)
pub fn format_sql_identifier(name: &str, db_type: &str) -> String {
    match db_type.to_lowercase().as_str() {
        "postgres" | "postgresql" => format!("\"{}\"", name.replace('"', "\"\"")),
        "mysql" => format!("`{}`", name.replace('`', "``")),
        "sqlserver" | "mssql" => format!("[{}]", name.replace(']', "]]")),
        _ => name.to_string(),
    }
}

/// Check if a name is a reserved SQL keyword
pub fn is_sql_keyword(name: &str) -> bool {
    // Common SQL keywords across databases
    const SQL_KEYWORDS: &[&str] = &[
        "add", "all", "alter", "and", "any", "as", "asc", "backup", "begin", "between",
        "by", "case", "check", "column", "constraint", "create", "database", "default",
        "delete", "desc", "distinct", "drop", "else", "end", "except", "exec", "exists",
        "foreign", "from", "full", "group", "having", "in", "index", "inner", "insert",
        "intersect", "into", "is", "join", "key", "left", "like", "limit", "not",
        "null", "on", "or", "order", "outer", "primary", "procedure", "references", "right",
        "rownum", "select", "set", "table", "top", "truncate", "union", "unique",
        "update", "user", "values", "view", "where", "with",
    ];

    SQL_KEYWORDS.contains(&name.to_lowercase().as_str())
}

/// Escape a SQL keyword if needed
pub fn escape_sql_keyword(name: &str, db_type: &str) -> String {
    if is_sql_keyword(name) {
        format_sql_identifier(name, db_type)
    } else {
        name.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_qualified_name() {
        assert_eq!(to_qualified_name(Some("erp"), Some("sales"), "orders"), "erp.sales.orders");
        assert_eq!(to_qualified_name(None, Some("public"), "orders"), "public.orders");
        assert_eq!(to_qualified_name(Some(""), None, "orders"), "orders");
    }

    #[test]
    fn test_generate_unique_name() {
        let existing: HashSet<String> = ["user", "user_1", "customer"]
            .iter()
            .map(|s| s.to_string())
            .collect();

        assert_eq!(generate_unique_name("profile", &existing), "profile");
        assert_eq!(generate_unique_name("user", &existing), "user_2");
        assert_eq!(generate_unique_name("CUSTOMER", &existing), "CUSTOMER_1");
    }

    #[test]
    fn test_is_sql_keyword() {
        assert!(is_sql_keyword("SELECT"));
        assert!(is_sql_keyword("from"));
        assert!(is_sql_keyword("JOIN"));
        assert!(!is_sql_keyword("username"));
    }

    #[test]
    fn test_escape_sql_keyword() {
        assert_eq!(escape_sql_keyword("select", "postgres"), "\"select\"");
        assert_eq!(escape_sql_keyword("from", "mysql"), "`from`");
        assert_eq!(escape_sql_keyword("order", "sqlserver"), "[order]");
        assert_eq!(escape_sql_keyword("username", "postgres"), "username");
    }
}
