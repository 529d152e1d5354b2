//! SQL rendering per dialect.
//!
//! Statements applied by importers are rendered with inline literals, the
//! way every statement in a batch can be sent in one transaction without
//! per-type bind plumbing.

use crate::config::Dialect;
use crate::record::{Row, Value};

use super::TableMetadata;

/// Renders identifiers, literals and statements for one dialect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SqlBuilder {
    dialect: Dialect,
}

impl SqlBuilder {
    pub fn new(dialect: Dialect) -> Self {
        Self { dialect }
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// Quote a possibly schema-qualified name
    pub fn quote_table(&self, table: &str) -> String {
        table
            .split('.')
            .map(|part| self.quote_ident(part))
            .collect::<Vec<_>>()
            .join(".")
    }

    pub fn quote_ident(&self, name: &str) -> String {
        match self.dialect {
            Dialect::MySql => format!("`{}`", name.replace('`', "``")),
            Dialect::PostgreSql => format!("\"{}\"", name.replace('"', "\"\"")),
        }
    }

    fn quote_str(&self, s: &str) -> String {
        match self.dialect {
            Dialect::MySql => format!("'{}'", s.replace('\\', "\\\\").replace('\'', "''")),
            Dialect::PostgreSql => format!("'{}'", s.replace('\'', "''")),
        }
    }

    /// Convert to SQL literal
    pub fn literal(&self, value: &Value) -> String {
        match value {
            Value::Null => "NULL".to_string(),
            Value::Bool(b) => match self.dialect {
                Dialect::MySql => if *b { "1" } else { "0" }.to_string(),
                Dialect::PostgreSql => if *b { "TRUE" } else { "FALSE" }.to_string(),
            },
            Value::Int(i) => i.to_string(),
            Value::UInt(u) => u.to_string(),
            Value::Float(f) if f.is_finite() => {
                let s = f.to_string();
                if s.contains(['.', 'e', 'E']) {
                    s
                } else {
                    format!("{}.0", s)
                }
            }
            Value::Float(f) => self.quote_str(&f.to_string()),
            Value::Decimal(d) if is_numeric(d) => d.clone(),
            Value::Decimal(d) => self.quote_str(d),
            Value::String(s) => self.quote_str(s),
            Value::Bytes(b) => match self.dialect {
                Dialect::MySql => format!("X'{}'", hex::encode(b)),
                Dialect::PostgreSql => format!("'\\x{}'::bytea", hex::encode(b)),
            },
            Value::Uuid(u) => self.quote_str(&u.to_string()),
            Value::Date(d) => self.quote_str(&d.format("%Y-%m-%d").to_string()),
            Value::Time(t) => self.quote_str(t),
            Value::DateTime(t) => self.quote_str(&t.format("%Y-%m-%d %H:%M:%S%.6f").to_string()),
            Value::Timestamp(t) => match self.dialect {
                // sqlx opens every MySQL session with time_zone '+00:00'
                Dialect::MySql => {
                    self.quote_str(&t.naive_utc().format("%Y-%m-%d %H:%M:%S%.6f").to_string())
                }
                Dialect::PostgreSql => {
                    self.quote_str(&t.format("%Y-%m-%d %H:%M:%S%.6f+00").to_string())
                }
            },
            Value::Json(j) => self.quote_str(&j.to_string()),
        }
    }

    /// `INSERT` that overwrites an existing row with the same key
    pub fn upsert(&self, table: &str, row: &Row, keys: &[String]) -> String {
        let columns: Vec<String> = row.columns.iter().map(|c| self.quote_ident(&c.name)).collect();
        let values: Vec<String> = row.columns.iter().map(|c| self.literal(&c.value)).collect();
        let non_keys: Vec<&str> = row
            .columns
            .iter()
            .filter(|c| !keys.iter().any(|k| k.eq_ignore_ascii_case(&c.name)))
            .map(|c| c.name.as_str())
            .collect();

        let insert = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            self.quote_table(table),
            columns.join(", "),
            values.join(", ")
        );

        match self.dialect {
            Dialect::MySql => {
                let updates: Vec<String> = if non_keys.is_empty() {
                    row.columns
                        .iter()
                        .take(1)
                        .map(|c| {
                            let col = self.quote_ident(&c.name);
                            format!("{} = {}", col, col)
                        })
                        .collect()
                } else {
                    non_keys
                        .iter()
                        .map(|c| {
                            let col = self.quote_ident(c);
                            format!("{} = VALUES({})", col, col)
                        })
                        .collect()
                };
                format!("{} ON DUPLICATE KEY UPDATE {}", insert, updates.join(", "))
            }
            Dialect::PostgreSql => {
                let conflict: Vec<String> = keys.iter().map(|k| self.quote_ident(k)).collect();
                if non_keys.is_empty() {
                    format!("{} ON CONFLICT ({}) DO NOTHING", insert, conflict.join(", "))
                } else {
                    let updates: Vec<String> = non_keys
                        .iter()
                        .map(|c| {
                            let col = self.quote_ident(c);
                            format!("{} = EXCLUDED.{}", col, col)
                        })
                        .collect();
                    format!(
                        "{} ON CONFLICT ({}) DO UPDATE SET {}",
                        insert,
                        conflict.join(", "),
                        updates.join(", ")
                    )
                }
            }
        }
    }

    /// `DELETE` matching the key columns of `row`; a no-op when absent
    pub fn delete(&self, table: &str, row: &Row, keys: &[String]) -> String {
        format!(
            "DELETE FROM {} WHERE {}",
            self.quote_table(table),
            self.key_predicate(row, keys)
        )
    }

    fn key_predicate(&self, row: &Row, keys: &[String]) -> String {
        let clauses: Vec<String> = keys
            .iter()
            .map(|key| {
                let col = self.quote_ident(key);
                match row.get(key) {
                    Some(Value::Null) | None => format!("{} IS NULL", col),
                    Some(value) => format!("{} = {}", col, self.literal(value)),
                }
            })
            .collect();
        clauses.join(" AND ")
    }

    /// Column list for reads; PostgreSQL types without a native decoding
    /// are read as text
    pub fn select_list(&self, metadata: &TableMetadata) -> String {
        metadata
            .columns
            .iter()
            .map(|c| {
                let col = self.quote_ident(&c.name);
                if self.dialect == Dialect::PostgreSql && !super::row::pg_native(&c.data_type) {
                    format!("{}::text AS {}", col, col)
                } else {
                    col
                }
            })
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Keyset page: rows after `after` (exclusive) ordered by primary key
    pub fn select_page(
        &self,
        metadata: &TableMetadata,
        condition: Option<&str>,
        after: Option<&[Value]>,
        limit: usize,
    ) -> String {
        let keys: Vec<String> = metadata
            .primary_keys
            .iter()
            .map(|k| self.quote_ident(k))
            .collect();

        let mut predicates = Vec::new();
        if let Some(condition) = condition {
            predicates.push(format!("({})", condition));
        }
        if let Some(after) = after {
            let values: Vec<String> = after.iter().map(|v| self.literal(v)).collect();
            if keys.len() == 1 {
                predicates.push(format!("{} > {}", keys[0], values[0]));
            } else {
                predicates.push(format!("({}) > ({})", keys.join(", "), values.join(", ")));
            }
        }

        let mut sql = format!(
            "SELECT {} FROM {}",
            self.select_list(metadata),
            self.quote_table(&metadata.name)
        );
        if !predicates.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&predicates.join(" AND "));
        }
        sql.push_str(&format!(" ORDER BY {} LIMIT {}", keys.join(", "), limit));
        sql
    }

    pub fn count(&self, table: &str, condition: Option<&str>) -> String {
        match condition {
            Some(condition) => format!(
                "SELECT COUNT(*) FROM {} WHERE {}",
                self.quote_table(table),
                condition
            ),
            None => format!("SELECT COUNT(*) FROM {}", self.quote_table(table)),
        }
    }

    /// Bounds of an integer key, cast so both dialects return BIGINT
    pub fn key_range(&self, table: &str, key: &str, condition: Option<&str>) -> String {
        let col = self.quote_ident(key);
        let (min, max) = match self.dialect {
            Dialect::MySql => (
                format!("CAST(MIN({}) AS SIGNED)", col),
                format!("CAST(MAX({}) AS SIGNED)", col),
            ),
            Dialect::PostgreSql => (format!("MIN({})::int8", col), format!("MAX({})::int8", col)),
        };
        let mut sql = format!("SELECT {}, {} FROM {}", min, max, self.quote_table(table));
        if let Some(condition) = condition {
            sql.push_str(" WHERE ");
            sql.push_str(condition);
        }
        sql
    }

    /// Filter selecting one integer key range
    pub fn range_condition(&self, key: &str, begin: i64, end: i64) -> String {
        let col = self.quote_ident(key);
        format!("{} >= {} AND {} <= {}", col, begin, col, end)
    }
}

fn is_numeric(s: &str) -> bool {
    !s.is_empty()
        && s.chars().any(|c| c.is_ascii_digit())
        && s
            .chars()
            .all(|c| c.is_ascii_digit() || matches!(c, '.' | '-' | '+' | 'e' | 'E'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datasource::ColumnMetadata;
    use crate::record::Column;

    fn order_row() -> Row {
        Row::new(vec![
            Column::new("order_id", Value::Int(1), true),
            Column::new("user_id", Value::Int(10), false),
            Column::new("note", Value::String("it's \\ fine".into()), false),
        ])
    }

    fn keys() -> Vec<String> {
        vec!["order_id".to_string()]
    }

    #[test]
    fn test_mysql_upsert() {
        let sql = SqlBuilder::new(Dialect::MySql).upsert("t_order", &order_row(), &keys());
        assert_eq!(
            sql,
            "INSERT INTO `t_order` (`order_id`, `user_id`, `note`) VALUES (1, 10, 'it''s \\\\ fine') \
             ON DUPLICATE KEY UPDATE `user_id` = VALUES(`user_id`), `note` = VALUES(`note`)"
        );
    }

    #[test]
    fn test_postgres_upsert() {
        let sql = SqlBuilder::new(Dialect::PostgreSql).upsert("public.t_order", &order_row(), &keys());
        assert_eq!(
            sql,
            "INSERT INTO \"public\".\"t_order\" (\"order_id\", \"user_id\", \"note\") \
             VALUES (1, 10, 'it''s \\ fine') ON CONFLICT (\"order_id\") DO UPDATE SET \
             \"user_id\" = EXCLUDED.\"user_id\", \"note\" = EXCLUDED.\"note\""
        );
    }

    #[test]
    fn test_key_only_upsert() {
        let row = Row::new(vec![Column::new("id", Value::Int(7), true)]);
        let keys = vec!["id".to_string()];
        assert!(SqlBuilder::new(Dialect::PostgreSql)
            .upsert("t", &row, &keys)
            .ends_with("ON CONFLICT (\"id\") DO NOTHING"));
        assert!(SqlBuilder::new(Dialect::MySql)
            .upsert("t", &row, &keys)
            .ends_with("ON DUPLICATE KEY UPDATE `id` = `id`"));
    }

    #[test]
    fn test_delete_uses_keys_only() {
        let sql = SqlBuilder::new(Dialect::MySql).delete("t_order", &order_row(), &keys());
        assert_eq!(sql, "DELETE FROM `t_order` WHERE `order_id` = 1");
    }

    #[test]
    fn test_literals() {
        let pg = SqlBuilder::new(Dialect::PostgreSql);
        let my = SqlBuilder::new(Dialect::MySql);
        assert_eq!(pg.literal(&Value::Bytes(vec![0x01, 0xff])), "'\\x01ff'::bytea");
        assert_eq!(my.literal(&Value::Bytes(vec![0x01, 0xff])), "X'01ff'");
        assert_eq!(pg.literal(&Value::Bool(true)), "TRUE");
        assert_eq!(my.literal(&Value::Bool(true)), "1");
        assert_eq!(my.literal(&Value::Float(2.0)), "2.0");
        assert_eq!(my.literal(&Value::Decimal("12.50".into())), "12.50");
        assert_eq!(my.literal(&Value::Decimal("1); DROP".into())), "'1); DROP'");
        assert_eq!(pg.quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn test_select_page() {
        let metadata = TableMetadata {
            name: "t_order".into(),
            columns: vec![
                ColumnMetadata::new("order_id", "integer"),
                ColumnMetadata::new("amount", "numeric"),
            ],
            primary_keys: vec!["order_id".into()],
        };
        let pg = SqlBuilder::new(Dialect::PostgreSql);
        assert_eq!(
            pg.select_page(&metadata, Some("\"order_id\" >= 1"), Some(&[Value::Int(5)]), 100),
            "SELECT \"order_id\", \"amount\"::text AS \"amount\" FROM \"t_order\" \
             WHERE (\"order_id\" >= 1) AND \"order_id\" > 5 ORDER BY \"order_id\" LIMIT 100"
        );

        let my = SqlBuilder::new(Dialect::MySql);
        assert_eq!(
            my.select_page(&metadata, None, None, 10),
            "SELECT `order_id`, `amount` FROM `t_order` ORDER BY `order_id` LIMIT 10"
        );
    }
}
