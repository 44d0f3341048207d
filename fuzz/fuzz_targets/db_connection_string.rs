#![no_main]

use calltrack::instrumentation::parse_db_connection_string;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // DSNs come from host strings, which are not guaranteed to be UTF-8
    let dsn = String::from_utf8_lossy(data);
    let info = parse_db_connection_string(&dsn);

    // A DB name is only ever reported together with a DB type
    assert!(info.db_name.is_none() || info.db_type.is_some());
});
