// Built-in instrumentations of host libraries
//
// - pdo: database spans for PDO / PDOStatement, classified by the DSN
// - mysqli: database spans for mysqli links and statements, method and
//   procedural style
// - curl: external HTTP spans for curl handles
//
// Each keeps per-object state (attached DB properties, curl handle options)
// keyed by the host's object/resource id in a bounded HandleMap.

mod curl;
mod db_connection_string;
mod handle_map;
mod mysqli;
mod pdo;

pub use curl::{
    CurlFunction, CurlHandleState, CurlHook, CurlInstrumentation, CURLOPT_CUSTOMREQUEST,
    CURLOPT_HTTPGET, CURLOPT_NOBODY, CURLOPT_POST, CURLOPT_POSTFIELDS, CURLOPT_PUT, CURLOPT_URL,
};
pub use db_connection_string::{parse_db_connection_string, DbConnectionInfo};
pub use handle_map::HandleMap;
pub use mysqli::{
    MysqliAttached, MysqliCallStyle, MysqliHook, MysqliInstrumentation, MysqliTarget,
    SPAN_SUBTYPE_MYSQL,
};
pub use pdo::{AttachedDbProperties, PdoHook, PdoInstrumentation, PdoTarget};

use crate::events::{DbContext, DestinationContext, DestinationService};
use crate::intercepted::RawText;
use crate::interception::RegistrationContext;
use crate::tracer::{Span, Tracer};

pub const SPAN_TYPE_DB: &str = "db";
pub const SPAN_TYPE_EXTERNAL: &str = "external";
pub const SPAN_SUBTYPE_HTTP: &str = "http";
pub const SPAN_SUBTYPE_UNKNOWN: &str = "unknown";
pub const SPAN_ACTION_QUERY: &str = "query";

/// Register every built-in instrumentation
pub fn register_builtin_instrumentations(ctx: &mut RegistrationContext) {
    PdoInstrumentation::new().register(ctx);
    MysqliInstrumentation::new().register(ctx);
    CurlInstrumentation::new().register(ctx);
}

/// Open a `db` query span with subtype `db_type`
///
/// The destination resource is `<db_type>` or `<db_type>/<db_name>`.
pub(crate) fn begin_db_span(
    tracer: &mut Tracer,
    name: &str,
    db_type: &str,
    statement: Option<RawText>,
    db_name: Option<&str>,
) -> Option<Span> {
    let mut span =
        tracer.begin_current_span(name, SPAN_TYPE_DB, Some(db_type), Some(SPAN_ACTION_QUERY))?;

    let mut resource = db_type.to_string();
    if let Some(db_name) = db_name.filter(|name| !name.is_empty()) {
        resource.push('/');
        resource.push_str(db_name);
    }
    let context = span.context_mut();
    context.db = Some(DbContext {
        statement,
        db_type: Some("sql".to_string()),
        instance: db_name.map(str::to_string),
    });
    context.destination = Some(DestinationContext {
        service: DestinationService {
            name: resource.clone(),
            resource,
            service_type: db_type.to_string(),
        },
    });
    Some(span)
}
