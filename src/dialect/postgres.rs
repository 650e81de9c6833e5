use super::Dialect;

/// PostgreSQL dialect: `"..."` identifiers, `$n` positional parameters, `LIMIT ... OFFSET`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresDialect;

impl Dialect for PostgresDialect {
    fn name(&self) -> &'static str {
        "postgres"
    }

    fn quote_ident(&self, ident: &str) -> String {
        format!("\"{}\"", ident.replace('"', "\"\""))
    }

    fn param_placeholder(&self, index: usize) -> String {
        format!("${}", index + 1)
    }

    fn like_operator(&self, negated: bool) -> &'static str {
        if negated { "NOT ILIKE" } else { "ILIKE" }
    }

    fn limit_offset_clause(&self, limit: Option<i64>, offset: i64) -> String {
        match limit {
            Some(limit) => format!("LIMIT {limit} OFFSET {offset}"),
            None => format!("OFFSET {offset}"),
        }
    }

    fn deterministic_order_by(&self) -> &'static str {
        // PostgreSQL rejects `SELECT NULL` in an ORDER BY subquery position.
        "(SELECT 1)"
    }

    fn last_identity_expr(&self) -> &'static str {
        "SELECT lastval()"
    }

    fn is_identity_column(&self, column_default: Option<&str>, _extra: Option<&str>) -> bool {
        column_default
            .map(|d| d.contains("nextval("))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paging_without_limit() {
        let d = PostgresDialect;
        assert_eq!(d.limit_offset_clause(None, 5), "OFFSET 5");
    }

    #[test]
    fn identity_detection_uses_nextval() {
        let d = PostgresDialect;
        assert!(d.is_identity_column(Some("nextval('users_id_seq'::regclass)"), None));
        assert!(!d.is_identity_column(Some("'pending'::text"), None));
    }
}
