// Extract DB type and name from a PDO data source name (DSN)
//
//   mysql:host=localhost;dbname=shop   -> ("mysql", "shop")
//   sqlsrv:Server=db;Database=shop     -> ("mssql", "shop")
//   odbc:warehouse                     -> ("odbc", "DSN=warehouse")
//   sqlite::memory:                    -> ("sqlite", "memory")

pub const SQLITE_TEMP_DB: &str = "temp_db";
pub const SQLITE_MEMORY_DB: &str = "memory";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DbConnectionInfo {
    /// Span subtype for the DB (`mysql`, `postgresql`, ...)
    pub db_type: Option<String>,
    pub db_name: Option<String>,
}

/// Parse `dsn`; unknown prefixes yield neither type nor name
pub fn parse_db_connection_string(dsn: &str) -> DbConnectionInfo {
    let Some((prefix, rest)) = dsn.split_once(':') else {
        tracing::debug!("DB connection string has no DB type prefix");
        return DbConnectionInfo::default();
    };

    let mut db_name_key = "dbname";
    let mut dsn_key = None;
    let db_type = match prefix {
        "cubrid" => "cubrid",
        "dblib" | "mssql" => "mssql",
        "firebird" => "firebird",
        "ibm" => {
            db_name_key = "database";
            dsn_key = Some("DSN");
            "db2"
        }
        "informix" => {
            db_name_key = "database";
            dsn_key = Some("DSN");
            "informix"
        }
        "mysql" => "mysql",
        "oci" => "oracle",
        "odbc" => {
            return DbConnectionInfo {
                db_type: Some("odbc".to_string()),
                db_name: Some(format!("DSN={}", rest)),
            };
        }
        "pgsql" => "postgresql",
        "sqlite" => {
            let db_name = if rest.is_empty() {
                SQLITE_TEMP_DB
            } else if dsn == "sqlite::memory:" {
                SQLITE_MEMORY_DB
            } else {
                rest
            };
            return DbConnectionInfo {
                db_type: Some("sqlite".to_string()),
                db_name: Some(db_name.to_string()),
            };
        }
        "sqlsrv" => {
            db_name_key = "database";
            "mssql"
        }
        _ => {
            tracing::debug!(prefix, "Unknown DB type in connection string prefix");
            return DbConnectionInfo::default();
        }
    };

    let db_name = extract_db_name(rest, db_name_key, dsn_key);
    if db_name.is_none() {
        tracing::debug!(db_type, db_name_key, "Key-value pair with DB name key not found");
    }
    DbConnectionInfo {
        db_type: Some(db_type.to_string()),
        db_name,
    }
}

/// First `key=value` entry (`;`-separated) whose key matches `db_name_key`
/// or `dsn_key`, compared case-insensitively
fn extract_db_name(entries: &str, db_name_key: &str, dsn_key: Option<&str>) -> Option<String> {
    entries
        .split(';')
        .filter_map(|entry| entry.split_once('='))
        .map(|(key, value)| (key.trim(), value.trim()))
        .find_map(|(key, value)| {
            if key.eq_ignore_ascii_case(db_name_key) {
                Some(value.to_string())
            } else {
                dsn_key
                    .filter(|dsn_key| key.eq_ignore_ascii_case(dsn_key))
                    .map(|dsn_key| format!("{}={}", dsn_key, value))
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parsed(dsn: &str) -> (Option<String>, Option<String>) {
        let info = parse_db_connection_string(dsn);
        (info.db_type, info.db_name)
    }

    fn some(value: &str) -> Option<String> {
        Some(value.to_string())
    }

    #[test]
    fn test_supported_prefixes() {
        let cases: &[(&str, &str, Option<&str>)] = &[
            ("cubrid:host=localhost;port=33000;dbname=demodb", "cubrid", Some("demodb")),
            ("dblib:host=localhost:10060;dbname=testdb", "mssql", Some("testdb")),
            ("mssql:host=localhost;dbname=testdb", "mssql", Some("testdb")),
            (
                "firebird:dbname=localhost:/var/lib/firebird/employee.fdb",
                "firebird",
                Some("localhost:/var/lib/firebird/employee.fdb"),
            ),
            ("ibm:DRIVER={IBM DB2 ODBC DRIVER};DATABASE=testdb;HOSTNAME=h", "db2", Some("testdb")),
            ("ibm:DSN=DB2_9", "db2", Some("DSN=DB2_9")),
            (
                "informix:host=h; service=9800; database=common_db; server=ids",
                "informix",
                Some("common_db"),
            ),
            ("informix:DSN=Infdrv33", "informix", Some("DSN=Infdrv33")),
            ("mysql:host=localhost;port=3307;dbname=testdb", "mysql", Some("testdb")),
            ("oci:dbname=//localhost:1521/mydb", "oracle", Some("//localhost:1521/mydb")),
            ("odbc:testdb", "odbc", Some("DSN=testdb")),
            (
                "pgsql:host=localhost;port=5432;dbname=testdb;user=bruce",
                "postgresql",
                Some("testdb"),
            ),
            ("sqlite:/opt/databases/mydb.sq3", "sqlite", Some("/opt/databases/mydb.sq3")),
            ("sqlite::memory:", "sqlite", Some("memory")),
            ("sqlite:", "sqlite", Some("temp_db")),
            ("sqlsrv:Server=localhost,1521;Database=testdb", "mssql", Some("testdb")),
        ];
        for (dsn, db_type, db_name) in cases {
            let info = parse_db_connection_string(dsn);
            assert_eq!(info.db_type.as_deref(), Some(*db_type), "{}", dsn);
            assert_eq!(info.db_name.as_deref(), *db_name, "{}", dsn);
        }
    }

    #[test]
    fn test_missing_db_name_keeps_type() {
        assert_eq!(parsed("mysql:host=localhost"), (some("mysql"), None));
    }

    #[test]
    fn test_key_match_is_case_insensitive_and_trimmed() {
        assert_eq!(
            parsed("pgsql: host = h ; DBNAME = orders ;"),
            (some("postgresql"), some("orders"))
        );
    }

    #[test]
    fn test_sqlsrv_ignores_dbname_key() {
        assert_eq!(parsed("sqlsrv:dbname=x"), (some("mssql"), None));
    }

    #[test]
    fn test_unknown_or_missing_prefix() {
        assert_eq!(parse_db_connection_string("mongodb:host=h"), DbConnectionInfo::default());
        assert_eq!(parse_db_connection_string("no prefix here"), DbConnectionInfo::default());
        assert_eq!(parse_db_connection_string(""), DbConnectionInfo::default());
    }
}
