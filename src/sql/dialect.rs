use std::fmt;

/// Dialect family of the connected database. Drives the schema-qualification
/// convention and the row-limiting syntax injected into prompts and repairs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlDialect {
    SqlServer,
    Postgres,
    Mysql,
    Oracle,
}

impl SqlDialect {
    /// Maps free-form databaseType strings ("postgres", "PostgreSQL", "mssql",
    /// "mariadb", ...) onto a dialect family. Unknown values fall back to the
    /// SQL Server family.
    pub fn from_database_type(database_type: &str) -> Self {
        let normalized = database_type.trim().to_ascii_lowercase();
        match normalized.as_str() {
            s if s.contains("postgres") || s.contains("redshift") || s == "pg" => {
                SqlDialect::Postgres
            }
            s if s.contains("mysql") || s.contains("maria") => SqlDialect::Mysql,
            s if s.contains("oracle") => SqlDialect::Oracle,
            s if s.contains("sqlserver") || s.contains("mssql") || s.contains("azure") => {
                SqlDialect::SqlServer
            }
            _ => SqlDialect::SqlServer,
        }
    }

    /// The schema name assumed when the model omits qualification. MySQL has
    /// no separate schema layer, so the database name itself is used.
    pub fn default_schema(&self, database_name: &str) -> String {
        match self {
            SqlDialect::SqlServer => "dbo".to_string(),
            SqlDialect::Postgres => "public".to_string(),
            SqlDialect::Mysql => database_name.to_string(),
            SqlDialect::Oracle => database_name.to_uppercase(),
        }
    }

    /// Human-readable row-limiting instruction for the system prompt.
    pub fn row_limit_hint(&self, limit: usize) -> String {
        match self {
            SqlDialect::SqlServer => format!("SELECT TOP {} ... (TOP clause)", limit),
            SqlDialect::Postgres | SqlDialect::Mysql => format!("... LIMIT {}", limit),
            SqlDialect::Oracle => format!("... FETCH FIRST {} ROWS ONLY", limit),
        }
    }
}

impl fmt::Display for SqlDialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SqlDialect::SqlServer => "sqlserver",
            SqlDialect::Postgres => "postgres",
            SqlDialect::Mysql => "mysql",
            SqlDialect::Oracle => "oracle",
        };
        write!(f, "{}", name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_database_type_families() {
        assert_eq!(SqlDialect::from_database_type("PostgreSQL"), SqlDialect::Postgres);
        assert_eq!(SqlDialect::from_database_type("mysql"), SqlDialect::Mysql);
        assert_eq!(SqlDialect::from_database_type("mariadb"), SqlDialect::Mysql);
        assert_eq!(SqlDialect::from_database_type("mssql"), SqlDialect::SqlServer);
        assert_eq!(SqlDialect::from_database_type("oracle"), SqlDialect::Oracle);
    }

    #[test]
    fn unknown_dialect_falls_back_to_sqlserver() {
        assert_eq!(SqlDialect::from_database_type("db2"), SqlDialect::SqlServer);
        assert_eq!(SqlDialect::from_database_type(""), SqlDialect::SqlServer);
    }

    #[test]
    fn default_schema_per_family() {
        assert_eq!(SqlDialect::SqlServer.default_schema("sales"), "dbo");
        assert_eq!(SqlDialect::Postgres.default_schema("sales"), "public");
        assert_eq!(SqlDialect::Mysql.default_schema("sales"), "sales");
    }
}
