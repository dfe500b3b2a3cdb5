//! Topology schema DDL
//!
//! The schema belongs to the surrounding system; the quickstart only makes sure
//! it exists before writing cluster and server rows. Engines differ in how they
//! spell auto-increment keys, binary columns and quoted identifiers, nothing
//! else.

use crate::config::OdbKind;

/// Tables in creation order, parents before children
pub const TABLES: [&str; 8] = [
    "install_state",
    "cluster",
    "server",
    "channel_url_def",
    "wss_def",
    "wss_def_passwd",
    "sql_pool",
    "sql_pool_passwd",
];

struct Dialect(OdbKind);

impl Dialect {
    fn id(&self) -> &'static str {
        match self.0 {
            OdbKind::Postgresql => "id BIGSERIAL PRIMARY KEY",
            OdbKind::Mysql => "id BIGINT NOT NULL AUTO_INCREMENT PRIMARY KEY",
            OdbKind::Sqlite => "id INTEGER PRIMARY KEY AUTOINCREMENT",
        }
    }

    fn blob(&self) -> &'static str {
        match self.0 {
            OdbKind::Postgresql => "BYTEA",
            OdbKind::Mysql => "LONGBLOB",
            OdbKind::Sqlite => "BLOB",
        }
    }

    fn timestamp(&self) -> &'static str {
        match self.0 {
            OdbKind::Mysql => "DATETIME",
            OdbKind::Postgresql | OdbKind::Sqlite => "TIMESTAMP",
        }
    }

    fn quote(&self, ident: &str) -> String {
        match self.0 {
            OdbKind::Mysql => format!("`{}`", ident),
            OdbKind::Postgresql | OdbKind::Sqlite => format!("\"{}\"", ident),
        }
    }

    fn table(&self, name: &str, body: &[String]) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {} (\n    {}\n)",
            name,
            body.join(",\n    ")
        )
    }
}

/// `CREATE TABLE IF NOT EXISTS` statements for every topology table
///
/// Returned one statement per entry since not every engine accepts several
/// statements in one round trip.
pub fn create_statements(kind: OdbKind) -> Vec<String> {
    let d = Dialect(kind);
    let user = d.quote("user");

    let lines = |items: &[&str]| -> Vec<String> {
        std::iter::once(d.id().to_string())
            .chain(items.iter().map(|s| s.to_string()))
            .collect()
    };

    vec![
        d.table(
            "install_state",
            &lines(&[
                "version VARCHAR(200) NOT NULL UNIQUE",
                &format!("install_time {} NOT NULL", d.timestamp()),
                "source_host VARCHAR(200) NOT NULL",
                "source_user VARCHAR(200) NOT NULL",
            ]),
        ),
        d.table(
            "cluster",
            &lines(&[
                "name VARCHAR(200) NOT NULL UNIQUE",
                "description VARCHAR(1000)",
                "odb_type VARCHAR(30) NOT NULL",
                "odb_host VARCHAR(200) NOT NULL",
                "odb_port INTEGER NOT NULL",
                "odb_user VARCHAR(200) NOT NULL",
                "odb_db_name VARCHAR(200) NOT NULL",
                "odb_schema VARCHAR(200)",
                "amqp_host VARCHAR(200) NOT NULL",
                "amqp_port INTEGER NOT NULL",
                "amqp_user VARCHAR(200) NOT NULL",
                "lb_host VARCHAR(200) NOT NULL",
                "lb_agent_port INTEGER NOT NULL",
                "sec_server_host VARCHAR(200) NOT NULL",
                "sec_server_port INTEGER NOT NULL",
            ]),
        ),
        d.table(
            "server",
            &lines(&[
                "name VARCHAR(200) NOT NULL UNIQUE",
                "cluster_id BIGINT",
                "FOREIGN KEY (cluster_id) REFERENCES cluster (id)",
            ]),
        ),
        d.table(
            "channel_url_def",
            &lines(&[
                "url_pattern VARCHAR(400) NOT NULL",
                "channel_type VARCHAR(20) NOT NULL",
                "cluster_id BIGINT",
                "UNIQUE (cluster_id, url_pattern)",
                "FOREIGN KEY (cluster_id) REFERENCES cluster (id)",
            ]),
        ),
        d.table(
            "wss_def",
            &lines(&[
                "name VARCHAR(200) NOT NULL",
                "username VARCHAR(200) NOT NULL",
                "reject_empty_nonce_ts BOOLEAN NOT NULL",
                "reject_stale_username BOOLEAN NOT NULL",
                "expiry_limit INTEGER NOT NULL",
                "nonce_freshness INTEGER NOT NULL",
                "cluster_id BIGINT NOT NULL",
                "UNIQUE (cluster_id, name)",
                "FOREIGN KEY (cluster_id) REFERENCES cluster (id)",
            ]),
        ),
        d.table(
            "wss_def_passwd",
            &lines(&[
                &format!("password {} NOT NULL", d.blob()),
                &format!("server_key_hash {} NOT NULL", d.blob()),
                "server_id BIGINT NOT NULL",
                "wss_def_id BIGINT NOT NULL",
                "FOREIGN KEY (server_id) REFERENCES server (id)",
                "FOREIGN KEY (wss_def_id) REFERENCES wss_def (id)",
            ]),
        ),
        d.table(
            "sql_pool",
            &lines(&[
                "name VARCHAR(200) NOT NULL",
                &format!("{} VARCHAR(200) NOT NULL", user),
                "db_name VARCHAR(200) NOT NULL",
                "engine VARCHAR(200) NOT NULL",
                &format!("extra {}", d.blob()),
                "host VARCHAR(200) NOT NULL",
                "port INTEGER NOT NULL",
                "pool_size INTEGER NOT NULL",
                "cluster_id BIGINT NOT NULL",
                "UNIQUE (cluster_id, name)",
                "FOREIGN KEY (cluster_id) REFERENCES cluster (id)",
            ]),
        ),
        d.table(
            "sql_pool_passwd",
            &lines(&[
                &format!("password {} NOT NULL", d.blob()),
                &format!("server_key_hash {} NOT NULL", d.blob()),
                "server_id BIGINT NOT NULL",
                "sql_pool_id BIGINT NOT NULL",
                "FOREIGN KEY (server_id) REFERENCES server (id)",
                "FOREIGN KEY (sql_pool_id) REFERENCES sql_pool (id)",
            ]),
        ),
    ]
}

/// Positional parameter markers for `count` values
pub fn placeholders(kind: OdbKind, count: usize) -> String {
    (1..=count)
        .map(|i| match kind {
            OdbKind::Postgresql => format!("${}", i),
            OdbKind::Mysql | OdbKind::Sqlite => "?".to_string(),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::postgres(OdbKind::Postgresql)]
    #[case::mysql(OdbKind::Mysql)]
    #[case::sqlite(OdbKind::Sqlite)]
    fn one_statement_per_table(#[case] kind: OdbKind) {
        let statements = create_statements(kind);
        assert_eq!(statements.len(), TABLES.len());

        for (statement, table) in statements.iter().zip(TABLES) {
            assert!(
                statement.starts_with(&format!("CREATE TABLE IF NOT EXISTS {} (", table)),
                "unexpected statement for {}: {}",
                table,
                statement
            );
        }
    }

    #[test]
    fn auto_increment_key_follows_engine() {
        assert!(create_statements(OdbKind::Postgresql)[1].contains("BIGSERIAL"));
        assert!(create_statements(OdbKind::Mysql)[1].contains("AUTO_INCREMENT"));
        assert!(create_statements(OdbKind::Sqlite)[1].contains("AUTOINCREMENT"));
    }

    #[test]
    fn reserved_user_column_is_quoted() {
        let pg = create_statements(OdbKind::Postgresql);
        assert!(pg[6].contains("\"user\" VARCHAR(200)"));

        let mysql = create_statements(OdbKind::Mysql);
        assert!(mysql[6].contains("`user` VARCHAR(200)"));
    }

    #[test]
    fn names_are_unique_where_the_model_requires() {
        let statements = create_statements(OdbKind::Sqlite);
        assert!(statements[1].contains("name VARCHAR(200) NOT NULL UNIQUE"));
        assert!(statements[2].contains("name VARCHAR(200) NOT NULL UNIQUE"));
        assert!(statements[3].contains("UNIQUE (cluster_id, url_pattern)"));
        assert!(statements[4].contains("UNIQUE (cluster_id, name)"));
        assert!(statements[6].contains("UNIQUE (cluster_id, name)"));
    }

    #[test]
    fn placeholders_per_engine() {
        assert_eq!(placeholders(OdbKind::Postgresql, 3), "$1, $2, $3");
        assert_eq!(placeholders(OdbKind::Mysql, 2), "?, ?");
        assert_eq!(placeholders(OdbKind::Sqlite, 1), "?");
    }
}
