use super::Dialect;

/// SQL Server dialect: `[..]` identifiers, `@pN` parameters, `OFFSET ... FETCH NEXT`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqlServerDialect;

impl Dialect for SqlServerDialect {
    fn name(&self) -> &'static str {
        "mssql"
    }

    fn quote_ident(&self, ident: &str) -> String {
        format!("[{}]", ident.replace(']', "]]"))
    }

    fn param_placeholder(&self, index: usize) -> String {
        format!("@p{index}")
    }

    fn like_operator(&self, negated: bool) -> &'static str {
        if negated { "NOT LIKE" } else { "LIKE" }
    }

    fn limit_offset_clause(&self, limit: Option<i64>, offset: i64) -> String {
        match limit {
            Some(limit) => format!("OFFSET {offset} ROWS FETCH NEXT {limit} ROWS ONLY"),
            None => format!("OFFSET {offset} ROWS"),
        }
    }

    fn deterministic_order_by(&self) -> &'static str {
        "(SELECT NULL)"
    }

    fn last_identity_expr(&self) -> &'static str {
        "SELECT SCOPE_IDENTITY()"
    }

    fn is_identity_column(&self, _column_default: Option<&str>, extra: Option<&str>) -> bool {
        // Populated from `COLUMNPROPERTY(object_id(...), column, 'IsIdentity')` by the Schema
        // Reader, which passes the 0/1 result through as `extra` ("1" means identity).
        extra == Some("1")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paging_with_limit() {
        let d = SqlServerDialect;
        assert_eq!(
            d.limit_offset_clause(Some(2), 0),
            "OFFSET 0 ROWS FETCH NEXT 2 ROWS ONLY"
        );
    }

    #[test]
    fn bracket_escaping() {
        let d = SqlServerDialect;
        assert_eq!(d.quote_ident("Weird]Name"), "[Weird]]Name]");
    }
}
