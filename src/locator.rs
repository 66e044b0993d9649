//! Instance locator: turns an instance id into a reachable SSH endpoint.
//!
//! The provisioning API has returned instance listings in several shapes over
//! time, and a single record may carry its address in any of a half-dozen
//! fields. Resolution is therefore split in two ordered probes:
//!
//! 1. [`RECORD_LISTS`] finds the list of instance records in the document.
//! 2. [`HOST_EXTRACTORS`] finds the host and port within the matching record.
//!
//! Both are plain slices of functions over [`serde_json::Value`] so each probe
//! can be tested on its own.
//!
//! # Host priority
//!
//! ```text
//! sshCommand ──match──> done
//!     │ no match
//!     v
//! ip | ipAddress | ssh{host,port} | network.ip | status.ip | instance{..}
//! └──────────── first present field decides, no fall-through ───────────┘
//! ```

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use crate::Result;
use crate::config::DEFAULT_SSH_PORT;
use crate::remote::{StatusPayload, StatusSource};

static SSH_HOST_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"@([^:\s]+)").expect("valid host regex"));
static SSH_PORT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"-p\s+(\d+)").expect("valid port regex"));

/// Resolved network address of an instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Outcome of one extractor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Probe {
    /// This level resolved the endpoint.
    Found(Endpoint),
    /// This level's field is present but yields no host; stop searching.
    Unusable,
    /// This level's field is absent; try the next one.
    Absent,
}

pub type RecordListProbe = fn(&Value) -> Option<&Vec<Value>>;
pub type HostExtractor = fn(&Value) -> Probe;

/// Known locations of the instance list, in priority order.
pub const RECORD_LISTS: &[(&str, RecordListProbe)] = &[
    ("instances", top_level_instances),
    ("data", top_level_data),
    ("data.instances", nested_data_instances),
    ("<root>", bare_array),
];

/// Host/port extractors, in priority order.
pub const HOST_EXTRACTORS: &[(&str, HostExtractor)] = &[
    ("sshCommand", from_ssh_command_field),
    ("ip", from_ip),
    ("ipAddress", from_ip_address),
    ("ssh", from_ssh_object),
    ("network.ip", from_network_ip),
    ("status.ip", from_status_ip),
    ("instance", from_nested_instance),
];

fn top_level_instances(doc: &Value) -> Option<&Vec<Value>> {
    doc.get("instances")?.as_array()
}

fn top_level_data(doc: &Value) -> Option<&Vec<Value>> {
    doc.get("data")?.as_array()
}

fn nested_data_instances(doc: &Value) -> Option<&Vec<Value>> {
    doc.get("data")?.get("instances")?.as_array()
}

fn bare_array(doc: &Value) -> Option<&Vec<Value>> {
    doc.as_array()
}

/// Resolves instance ids against a [`StatusSource`].
pub struct InstanceLocator {
    source: Box<dyn StatusSource>,
}

impl InstanceLocator {
    pub fn new(source: Box<dyn StatusSource>) -> Self {
        Self { source }
    }

    /// Look up `instance_id`.
    ///
    /// Returns `Ok(None)` when the document is malformed, the instance is not
    /// listed, or no address field is usable. Only a failing status source is
    /// an error.
    pub fn resolve(&self, instance_id: &str) -> Result<Option<Endpoint>> {
        let payload = self.source.fetch_status()?;
        Ok(resolve_in_payload(&payload, instance_id))
    }
}

/// Resolve `instance_id` within an already fetched payload.
pub fn resolve_in_payload(payload: &StatusPayload, instance_id: &str) -> Option<Endpoint> {
    let parsed;
    let doc = match payload {
        StatusPayload::Json(value) => value,
        StatusPayload::Text(text) => match serde_json::from_str::<Value>(text) {
            Ok(value) => {
                parsed = value;
                &parsed
            }
            Err(e) => {
                tracing::warn!(error = %e, "instance status is not valid JSON");
                return None;
            }
        },
    };
    resolve_in_document(doc, instance_id)
}

/// Resolve `instance_id` within a parsed status document.
pub fn resolve_in_document(doc: &Value, instance_id: &str) -> Option<Endpoint> {
    let Some(record) = find_record(doc, instance_id) else {
        tracing::warn!(instance_id, "instance not found in status data");
        return None;
    };
    let endpoint = endpoint_from_record(record);
    if endpoint.is_none() {
        tracing::warn!(instance_id, "no usable address in instance record");
    }
    endpoint
}

/// Find the record whose `id` equals `instance_id`.
pub fn find_record<'a>(doc: &'a Value, instance_id: &str) -> Option<&'a Value> {
    let (shape, records) = RECORD_LISTS
        .iter()
        .find_map(|(shape, probe)| probe(doc).map(|records| (*shape, records)))?;
    tracing::debug!(shape, count = records.len(), "located instance list");
    records.iter().find(|r| id_matches(r, instance_id))
}

fn id_matches(record: &Value, instance_id: &str) -> bool {
    match record.get("id") {
        Some(Value::String(id)) => id == instance_id,
        Some(Value::Number(id)) => id.to_string() == instance_id,
        _ => false,
    }
}

/// Run [`HOST_EXTRACTORS`] over a single instance record.
pub fn endpoint_from_record(record: &Value) -> Option<Endpoint> {
    for (field, extract) in HOST_EXTRACTORS {
        match extract(record) {
            Probe::Found(endpoint) => {
                tracing::debug!(field, endpoint = %endpoint, "resolved instance endpoint");
                return Some(endpoint);
            }
            Probe::Unusable => {
                tracing::debug!(field, "address field present but unusable");
                return None;
            }
            Probe::Absent => {}
        }
    }
    None
}

/// Parse `user@host [-p port]` out of an SSH command line.
///
/// Returns `None` when no `@host` fragment is present. A port fragment that
/// is missing, non-numeric, or out of range leaves the default port.
pub fn parse_ssh_command(command: &str) -> Option<Endpoint> {
    let host = SSH_HOST_RE.captures(command)?.get(1)?.as_str();
    let port = match SSH_PORT_RE.captures(command).and_then(|c| c.get(1)) {
        Some(raw) => parse_port(raw.as_str()).unwrap_or_else(|| {
            tracing::warn!(port = raw.as_str(), "invalid port in ssh command, using 22");
            DEFAULT_SSH_PORT
        }),
        None => DEFAULT_SSH_PORT,
    };
    Some(Endpoint::new(host, port))
}

/// Parse a positive TCP port.
pub fn parse_port(raw: &str) -> Option<u16> {
    raw.trim().parse::<u16>().ok().filter(|p| *p > 0)
}

fn port_from_value(value: &Value) -> Option<u16> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .and_then(|p| u16::try_from(p).ok())
            .filter(|p| *p > 0),
        Value::String(s) => parse_port(s),
        _ => None,
    }
}

/// JSON truthiness: null, false, zero and empty containers are all "unset".
fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn truthy_field<'a>(record: &'a Value, field: &str) -> Option<&'a Value> {
    record.get(field).filter(|v| is_truthy(v))
}

fn host_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.trim().to_string()).filter(|s| !s.is_empty()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn ssh_command_probe(record: &Value) -> Option<Endpoint> {
    let command = truthy_field(record, "sshCommand")?.as_str()?;
    tracing::debug!(ssh_command = command, "found sshCommand");
    parse_ssh_command(command)
}

fn from_ssh_command_field(record: &Value) -> Probe {
    // An unparseable command falls through to the address fields.
    ssh_command_probe(record).map_or(Probe::Absent, Probe::Found)
}

fn from_flat_field(record: &Value, field: &str) -> Probe {
    match truthy_field(record, field) {
        Some(value) => host_string(value)
            .map(|host| Probe::Found(Endpoint::new(host, DEFAULT_SSH_PORT)))
            .unwrap_or(Probe::Unusable),
        None => Probe::Absent,
    }
}

fn from_ssh_object(record: &Value) -> Probe {
    let Some(ssh) = record.get("ssh").filter(|v| v.is_object()) else {
        return Probe::Absent;
    };
    let port = match truthy_field(ssh, "port") {
        Some(raw) => port_from_value(raw).unwrap_or_else(|| {
            tracing::warn!(port = %raw, "invalid port in ssh.port, using 22");
            DEFAULT_SSH_PORT
        }),
        None => DEFAULT_SSH_PORT,
    };
    truthy_field(ssh, "host")
        .and_then(host_string)
        .map(|host| Probe::Found(Endpoint::new(host, port)))
        .unwrap_or(Probe::Unusable)
}

fn from_ip(record: &Value) -> Probe {
    from_flat_field(record, "ip")
}

fn from_ip_address(record: &Value) -> Probe {
    from_flat_field(record, "ipAddress")
}

fn from_network_ip(record: &Value) -> Probe {
    from_nested_ip(record, "network")
}

fn from_status_ip(record: &Value) -> Probe {
    from_nested_ip(record, "status")
}

fn from_nested_ip(record: &Value, object: &str) -> Probe {
    let Some(nested) = record.get(object).filter(|v| v.is_object()) else {
        return Probe::Absent;
    };
    truthy_field(nested, "ip")
        .and_then(host_string)
        .map(|host| Probe::Found(Endpoint::new(host, DEFAULT_SSH_PORT)))
        .unwrap_or(Probe::Unusable)
}

fn from_nested_instance(record: &Value) -> Probe {
    let Some(nested) = record.get("instance").filter(|v| v.is_object()) else {
        return Probe::Absent;
    };
    if let Some(endpoint) = ssh_command_probe(nested) {
        return Probe::Found(endpoint);
    }
    ["ip", "ipAddress", "hostname", "address"]
        .iter()
        .find_map(|field| truthy_field(nested, field).and_then(host_string))
        .map(|host| Probe::Found(Endpoint::new(host, DEFAULT_SSH_PORT)))
        .unwrap_or(Probe::Unusable)
}
