use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventType {
    Added,
    Modified,
    Deleted,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventType::Added => f.write_str("added"),
            EventType::Modified => f.write_str("modified"),
            EventType::Deleted => f.write_str("deleted"),
        }
    }
}

/// Registry record for one node's subnet lease, keyed by node name. The
/// `node` field is the node's IP, which remote agents point their VXLAN
/// tunnels at.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Subnet {
    #[serde(rename = "node")]
    pub node_ip: String,
    pub sub: String,
}

/// A tenant namespace as stored in the registry. VNID state lives in the
/// annotations, owned by the master controller.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Namespace {
    pub name: String,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

impl Namespace {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            annotations: BTreeMap::new(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ServiceProtocol {
    #[default]
    #[serde(rename = "TCP")]
    Tcp,
    #[serde(rename = "UDP")]
    Udp,
}

impl fmt::Display for ServiceProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceProtocol::Tcp => f.write_str("tcp"),
            ServiceProtocol::Udp => f.write_str("udp"),
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ServicePort {
    pub protocol: ServiceProtocol,
    pub port: u16,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Service {
    pub uid: String,
    pub namespace: String,
    pub name: String,
    /// Empty for headless services, which get no dispatch flows.
    #[serde(default)]
    pub cluster_ip: Option<String>,
    #[serde(default)]
    pub ports: Vec<ServicePort>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Pod {
    pub uid: String,
    pub namespace: String,
    pub name: String,
    pub node: String,
    #[serde(default)]
    pub container_id: String,
    #[serde(default)]
    pub ip: Option<String>,
}

/// Persisted allocator snapshot: the range tag plus the allocation bitmap.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RangeAllocation {
    pub range: String,
    /// base64-encoded bitmap, one bit per offset.
    #[serde(default)]
    pub data: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeEvent {
    pub event_type: EventType,
    pub node: String,
    /// Node IP; taken from the previous value on delete.
    pub ip: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubnetEvent {
    pub event_type: EventType,
    /// Node name, parsed from the key.
    pub node: String,
    pub subnet: Subnet,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NamespaceEvent {
    pub event_type: EventType,
    pub namespace: Namespace,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceEvent {
    pub event_type: EventType,
    pub service: Service,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PodEvent {
    pub event_type: EventType,
    pub pod: Pod,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_subnet_record_json() {
        let sub = Subnet {
            node_ip: "10.20.0.2".into(),
            sub: "10.1.3.0/24".into(),
        };
        let encoded = serde_json::to_string(&sub).unwrap();
        assert_eq!(encoded, r#"{"node":"10.20.0.2","sub":"10.1.3.0/24"}"#);
        assert_eq!(serde_json::from_str::<Subnet>(&encoded).unwrap(), sub);
    }

    #[test]
    fn test_service_protocol_forms() {
        let port: ServicePort = serde_json::from_str(r#"{"protocol":"UDP","port":53}"#).unwrap();
        assert_eq!(port.protocol, ServiceProtocol::Udp);
        assert_eq!(port.protocol.to_string(), "udp");
        assert_eq!(ServiceProtocol::Tcp.to_string(), "tcp");
    }

    #[test]
    fn test_namespace_defaults() {
        let ns: Namespace = serde_json::from_str(r#"{"name":"web"}"#).unwrap();
        assert_eq!(ns.name, "web");
        assert!(ns.annotations.is_empty());
    }
}
