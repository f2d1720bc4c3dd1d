use sqlx::mysql::{MySqlConnectOptions, MySqlConnection, MySqlPool, MySqlPoolOptions, MySqlRow};
use sqlx::{Column, Connection, Executor, Row as _, TypeInfo, ValueRef};

use crate::config::MySqlConfig;
use crate::rows::{Number, Row, RowSet, Scalar};

use super::{Rollback, SandboxBackend, SandboxConnection, refuse_statements};

/// Switching schemas would take the session out of its sandbox
const FORBIDDEN_STATEMENTS: &[&str] = &["use"];

/// Sandboxes backed by throwaway schemas on a MySQL server
///
/// Every sandbox gets its own connection, opened outside the admin pool so
/// that `USE` never leaks into a pooled connection. The admin pool only runs
/// `DROP SCHEMA`, `KILL QUERY` and the sweep listing.
#[derive(Debug, Clone)]
pub struct MySqlBackend {
    admin: MySqlPool,
    options: MySqlConnectOptions,
}

impl MySqlBackend {
    pub async fn connect(config: &MySqlConfig) -> sqlx::Result<Self> {
        let options = MySqlConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .username(&config.user)
            .password(&config.password);

        let admin = MySqlPoolOptions::new()
            .max_connections(config.admin_connections.max(1))
            .min_connections(0)
            .connect_with(options.clone())
            .await?;

        log::info!(
            "Connected to MySQL at {}:{} for sandboxes",
            config.host,
            config.port
        );
        Ok(Self { admin, options })
    }
}

pub struct MySqlSandboxConnection {
    conn: MySqlConnection,
    /// Server-side id, target of `KILL QUERY`
    connection_id: u64,
    schema: String,
    options: MySqlConnectOptions,
}

impl SandboxConnection for MySqlSandboxConnection {
    async fn execute(&mut self, sql: &str) -> sqlx::Result<()> {
        refuse_statements(sql, FORBIDDEN_STATEMENTS)?;
        // A bare &str goes over the text protocol, which accepts statements
        // the prepared-statement protocol refuses
        Executor::execute(&mut self.conn, sql).await?;
        Ok(())
    }

    async fn fetch(&mut self, sql: &str) -> sqlx::Result<RowSet> {
        refuse_statements(sql, FORBIDDEN_STATEMENTS)?;
        let rows = Executor::fetch_all(&mut self.conn, sql).await?;
        rows.iter().map(row_from_mysql).collect()
    }

    /// DDL commits implicitly, so there is nothing to mark
    async fn checkpoint(&mut self) -> sqlx::Result<()> {
        Ok(())
    }

    /// Recreates the schema empty and moves to a new session, which drops
    /// the temporary tables and variables of the old one
    async fn rollback_to_checkpoint(&mut self) -> sqlx::Result<Rollback> {
        let drop_schema = drop_statement(&self.schema);
        Executor::execute(&mut self.conn, drop_schema.as_str()).await?;
        let create = create_statement(&self.schema);
        Executor::execute(&mut self.conn, create.as_str()).await?;

        let mut fresh = MySqlConnection::connect_with(&self.options).await?;
        let connection_id = switch_into(&mut fresh, &self.schema).await?;
        let stale = std::mem::replace(&mut self.conn, fresh);
        self.connection_id = connection_id;

        if let Err(e) = stale.close().await {
            log::warn!("Failed to close replaced session of sandbox {}: {e}", self.schema);
        }
        Ok(Rollback::Emptied)
    }
}

impl SandboxBackend for MySqlBackend {
    type Connection = MySqlSandboxConnection;

    fn forbidden_statements(&self) -> &'static [&'static str] {
        FORBIDDEN_STATEMENTS
    }

    async fn create(&self, schema: &str) -> sqlx::Result<Self::Connection> {
        let mut conn = MySqlConnection::connect_with(&self.options).await?;
        let create = create_statement(schema);
        conn.execute(create.as_str()).await?;

        match switch_into(&mut conn, schema).await {
            Ok(connection_id) => Ok(MySqlSandboxConnection {
                conn,
                connection_id,
                schema: schema.to_string(),
                options: self.options.clone(),
            }),
            Err(e) => {
                if let Err(drop_err) = self.drop_namespace(schema).await {
                    log::error!("Failed to drop half-created sandbox {schema}: {drop_err}");
                }
                Err(e)
            }
        }
    }

    async fn interrupt(&self, conn: &Self::Connection) -> sqlx::Result<()> {
        let kill = format!("KILL QUERY {}", conn.connection_id);
        Executor::execute(&self.admin, kill.as_str()).await?;
        Ok(())
    }

    async fn destroy(&self, conn: Self::Connection, schema: &str) -> sqlx::Result<()> {
        let MySqlSandboxConnection { mut conn, .. } = conn;
        let drop_schema = drop_statement(schema);
        let dropped = conn.execute(drop_schema.as_str()).await;

        if let Err(e) = conn.close().await {
            log::warn!("Failed to close connection of sandbox {schema}: {e}");
        }

        match dropped {
            Ok(_) => Ok(()),
            Err(e) => {
                log::warn!("Dropping sandbox {schema} on its own connection failed ({e}), retrying");
                self.drop_namespace(schema).await
            }
        }
    }

    async fn drop_namespace(&self, schema: &str) -> sqlx::Result<()> {
        let drop_schema = drop_statement(schema);
        Executor::execute(&self.admin, drop_schema.as_str()).await?;
        Ok(())
    }

    async fn list_namespaces(&self, prefix: &str) -> sqlx::Result<Vec<String>> {
        let names: Vec<String> =
            sqlx::query_scalar("SELECT CAST(SCHEMA_NAME AS CHAR) FROM information_schema.SCHEMATA")
                .fetch_all(&self.admin)
                .await?;
        let mut names: Vec<String> = names
            .into_iter()
            .filter(|name| name.starts_with(prefix))
            .collect();
        names.sort();
        Ok(names)
    }
}

fn quote_identifier(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

/// Makes `schema` the session default and returns the session id
async fn switch_into(conn: &mut MySqlConnection, schema: &str) -> sqlx::Result<u64> {
    let use_schema = format!("USE {}", quote_identifier(schema));
    Executor::execute(&mut *conn, use_schema.as_str()).await?;
    sqlx::query_scalar::<_, u64>("SELECT CONNECTION_ID()")
        .fetch_one(&mut *conn)
        .await
}

fn create_statement(schema: &str) -> String {
    format!("CREATE SCHEMA {}", quote_identifier(schema))
}

fn drop_statement(schema: &str) -> String {
    format!("DROP SCHEMA IF EXISTS {}", quote_identifier(schema))
}

fn row_from_mysql(row: &MySqlRow) -> sqlx::Result<Row> {
    let mut out = Row::new();
    for column in row.columns() {
        let idx = column.ordinal();
        let raw = row.try_get_raw(idx)?;
        let value = if raw.is_null() {
            Scalar::Null
        } else {
            let type_name = raw.type_info().name().to_string();
            // Text protocol: every value arrives as its textual representation
            let bytes = row.try_get_unchecked::<Vec<u8>, _>(idx)?;
            classify(&type_name, &String::from_utf8_lossy(&bytes))
        };
        out.push(column.name(), value);
    }
    Ok(out)
}

/// Turns the textual form of a MySQL value into a scalar based on its type name
fn classify(type_name: &str, text: &str) -> Scalar {
    let base = type_name
        .trim_end_matches(" UNSIGNED")
        .to_ascii_uppercase();

    match base.as_str() {
        "BOOLEAN" => Scalar::Bool(text == "1" || text.eq_ignore_ascii_case("true")),
        "TINYINT" | "SMALLINT" | "MEDIUMINT" | "INT" | "BIGINT" | "YEAR" => {
            match text.parse::<i64>() {
                Ok(i) => Scalar::Number(Number::Int(i)),
                // BIGINT UNSIGNED beyond i64
                Err(_) => text
                    .parse::<f64>()
                    .map_or_else(|_| Scalar::Text(text.to_string()), |f| {
                        Scalar::Number(Number::Float(f))
                    }),
            }
        }
        "DECIMAL" | "DOUBLE" | "FLOAT" => text
            .parse::<f64>()
            .map_or_else(|_| Scalar::Text(text.to_string()), |f| {
                Scalar::Number(Number::Float(f))
            }),
        _ => Scalar::Text(text.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_numbers() {
        assert_eq!(classify("BIGINT", "42"), Scalar::from(42i64));
        assert_eq!(classify("INT UNSIGNED", "7"), Scalar::from(7i64));
        assert_eq!(
            classify("BIGINT UNSIGNED", "18446744073709551615"),
            Scalar::from(18446744073709551615.0)
        );
        assert_eq!(classify("DECIMAL", "50000.50"), Scalar::from(50000.5));
        assert_eq!(classify("DOUBLE", "1e3"), Scalar::from(1000i64));
    }

    #[test]
    fn test_classify_other_types() {
        assert_eq!(classify("BOOLEAN", "1"), Scalar::from(true));
        assert_eq!(classify("BOOLEAN", "0"), Scalar::from(false));
        assert_eq!(classify("VARCHAR", "Alice"), Scalar::from("Alice"));
        assert_eq!(classify("DATE", "2024-01-31"), Scalar::from("2024-01-31"));
        assert_eq!(classify("POINT", "POINT(1 2)"), Scalar::from("POINT(1 2)"));
    }

    #[test]
    fn test_identifier_quoting() {
        assert_eq!(quote_identifier("sandbox_ab12"), "`sandbox_ab12`");
        assert_eq!(quote_identifier("we`ird"), "`we``ird`");
        assert_eq!(
            drop_statement("sandbox_ab12"),
            "DROP SCHEMA IF EXISTS `sandbox_ab12`"
        );
        assert_eq!(create_statement("sandbox_ab12"), "CREATE SCHEMA `sandbox_ab12`");
    }

    #[test]
    fn test_schema_switch_is_refused() {
        let err = refuse_statements("SELECT 1; use mysql", FORBIDDEN_STATEMENTS).unwrap_err();
        assert!(err.to_string().contains("USE is not allowed"), "{err}");
        assert!(refuse_statements("SELECT used FROM t", FORBIDDEN_STATEMENTS).is_ok());
    }
}
