//! Metadata describing the reporting service and process
//!
//! Sent as the first line of every intake payload.

use crate::config::AgentConfig;
use serde::Serialize;

pub const AGENT_NAME: &str = "calltrack";
pub const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentData {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceData {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
    pub agent: AgentData,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessData {
    pub pid: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Metadata {
    pub service: ServiceData,
    pub process: ProcessData,
}

impl Metadata {
    /// Metadata of the current process
    pub fn discover(config: &AgentConfig) -> Self {
        Self::with_pid(config, std::process::id())
    }

    pub fn with_pid(config: &AgentConfig, pid: u32) -> Self {
        Self {
            service: ServiceData {
                name: crate::events::limit_keyword_string(&config.service_name),
                version: crate::events::limit_nullable_keyword_string(
                    config.service_version.as_deref(),
                ),
                environment: crate::events::limit_nullable_keyword_string(
                    config.environment.as_deref(),
                ),
                agent: AgentData {
                    name: AGENT_NAME.to_string(),
                    version: AGENT_VERSION.to_string(),
                },
            },
            process: ProcessData { pid },
        }
    }

    /// `User-Agent` value for intake requests
    ///
    /// `calltrack/<version> (<service name>[ <service version>])`, with
    /// characters not allowed in the header replaced by `_` in the version.
    pub fn user_agent_http_header(&self) -> String {
        let mut suffix = self.service.name.clone();
        if let Some(version) = &self.service.version {
            suffix.push(' ');
            suffix.extend(version.chars().map(|c| {
                if is_user_agent_char(c) {
                    c
                } else {
                    '_'
                }
            }));
        }
        format!("{}/{} ({})", AGENT_NAME, AGENT_VERSION, suffix)
    }
}

fn is_user_agent_char(c: char) -> bool {
    matches!(c, '\t' | ' '..='\'' | '*'..='[' | ']'..='~') || (c as u32) >= 0x80
}
