//! SQL dialect capabilities used when rendering write statements.

/// SQL dialect for generating dialect-specific SQL.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Dialect {
    /// PostgreSQL dialect (uses $1, $2 placeholders)
    #[default]
    Postgres,
    /// SQLite dialect (uses ?1, ?2 placeholders)
    Sqlite,
    /// MySQL dialect (uses ? placeholders)
    Mysql,
}

impl Dialect {
    /// Generate a placeholder for the given parameter index (1-based).
    pub fn placeholder(self, index: usize) -> String {
        match self {
            Dialect::Postgres => format!("${index}"),
            Dialect::Sqlite => format!("?{index}"),
            Dialect::Mysql => "?".to_string(),
        }
    }

    /// Quote an identifier for this dialect.
    ///
    /// Embedded quote characters are doubled.
    pub fn quote_identifier(self, name: &str) -> String {
        match self {
            Dialect::Postgres | Dialect::Sqlite => {
                let escaped = name.replace('"', "\"\"");
                format!("\"{}\"", escaped)
            }
            Dialect::Mysql => {
                let escaped = name.replace('`', "``");
                format!("`{}`", escaped)
            }
        }
    }

    /// Whether `INSERT ... VALUES (..), (..)` is accepted.
    pub const fn supports_multiple_insert(self) -> bool {
        match self {
            Dialect::Postgres | Dialect::Sqlite | Dialect::Mysql => true,
        }
    }

    /// Whether `INSERT ... RETURNING` reports generated columns.
    pub const fn supports_returning(self) -> bool {
        matches!(self, Dialect::Postgres | Dialect::Sqlite)
    }

    /// Whether the database can produce random UUIDs itself.
    pub const fn supports_uuid_generation(self) -> bool {
        matches!(self, Dialect::Postgres)
    }

    /// Server-side UUID expression, when supported.
    pub const fn uuid_function(self) -> Option<&'static str> {
        match self {
            Dialect::Postgres => Some("gen_random_uuid()"),
            Dialect::Sqlite | Dialect::Mysql => None,
        }
    }

    /// Expression producing the next value of a sequence, when sequences exist.
    pub fn sequence_next_value(self, sequence: &str) -> Option<String> {
        match self {
            Dialect::Postgres => {
                let escaped = sequence.replace('\'', "''");
                Some(format!("nextval('{}')", escaped))
            }
            Dialect::Sqlite | Dialect::Mysql => None,
        }
    }
}
