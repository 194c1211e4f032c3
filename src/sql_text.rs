/// Tidies SQL text returned by a language model: one line, no trailing
/// block comment, and a leading `SELECT` when the model dropped it.
pub fn normalize_generated_sql(raw: &str) -> String {
    let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    let without_comment = match collapsed.find("/*") {
        Some(idx) => &collapsed[..idx],
        None => collapsed.as_str(),
    };
    let sql = without_comment.trim();
    if sql.is_empty() {
        return String::new();
    }
    let upper = sql.to_ascii_uppercase();
    if upper.starts_with("SELECT") || upper.starts_with("WITH") {
        sql.to_string()
    } else {
        format!("SELECT {}", sql)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collapses_whitespace() {
        assert_eq!(
            normalize_generated_sql("SELECT a,\n   b\tFROM t\n"),
            "SELECT a, b FROM t"
        );
    }

    #[test]
    fn drops_trailing_block_comment() {
        assert_eq!(
            normalize_generated_sql("SELECT 1 /* explanation */"),
            "SELECT 1"
        );
    }

    #[test]
    fn restores_missing_select() {
        assert_eq!(
            normalize_generated_sql(" name FROM singer"),
            "SELECT name FROM singer"
        );
        assert_eq!(normalize_generated_sql("select 1"), "select 1");
        assert_eq!(
            normalize_generated_sql("WITH x AS (SELECT 1) SELECT * FROM x"),
            "WITH x AS (SELECT 1) SELECT * FROM x"
        );
    }

    #[test]
    fn empty_stays_empty() {
        assert_eq!(normalize_generated_sql("  \n "), "");
        assert_eq!(normalize_generated_sql("/* nothing */"), "");
    }
}
