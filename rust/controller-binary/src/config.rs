//! This file contains the declarative virtual-server definition carried by
//! ConfigMaps, and the parser that turns a ConfigMap into a
//! [`VirtualServerConfig`].
//!
//! The same types describe both directions: they deserialize the JSON blob
//! under the ConfigMap's `data` key and serialize the document handed to the
//! load-balancer agent. Runtime bookkeeping ([`MetaData`]) never crosses the
//! wire in either direction.

use k8s_openapi::api::core::v1::ConfigMap;
use serde::{Deserialize, Serialize};
use snafu::{OptionExt, ResultExt, Snafu};

pub const APP_NAME: &str = "bigip-lb-controller";

/// Label selector that marks a ConfigMap as a virtual-server definition.
pub const DEFAULT_CONFIGMAP_SELECTOR: &str = "f5type in (virtual-server)";

/// Annotation reporting the bind address back onto the ConfigMap.
pub const VS_STATUS_BINDADDR_ANNOTATION: &str = "status.virtual-server.f5.com/ip";

/// ConfigMap data key holding the JSON definition.
const CONFIGMAP_DATA_KEY: &str = "data";

/// Identity of a virtual-server entry. The derived `Ord` (namespace, then
/// service, then port) is the emission order.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ServiceKey {
    pub namespace: String,
    pub service_name: String,
    pub service_port: i32,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualServerConfig {
    pub virtual_server: VirtualServer,
    /// Runtime state owned by the store; not part of the wire format.
    #[serde(skip)]
    pub meta_data: MetaData,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualServer {
    pub backend: Backend,
    #[serde(default)]
    pub frontend: Frontend,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Backend {
    pub service_name: String,
    pub service_port: i32,
    #[serde(default)]
    pub pool_member_addrs: Vec<String>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Frontend {
    #[serde(default)]
    pub virtual_server_name: String,
    #[serde(default, rename = "iAppTemplate", skip_serializing_if = "Option::is_none")]
    pub iapp_template: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub virtual_address: Option<VirtualAddress>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualAddress {
    pub bind_addr: String,
    #[serde(default)]
    pub port: i32,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct MetaData {
    pub active: bool,
    pub node_port: i32,
}

#[derive(Debug, Snafu)]
pub enum ParseError {
    #[snafu(display("ConfigMap {name} carries no \"{CONFIGMAP_DATA_KEY}\" key"))]
    MissingDataKey { name: String },
    #[snafu(display("ConfigMap {name} carries malformed JSON"))]
    Decode {
        source: serde_json::Error,
        name: String,
    },
    #[snafu(display("virtual server in ConfigMap {name} names no backend service"))]
    EmptyServiceName {
        name: String,
        partial: Box<VirtualServerConfig>,
    },
    #[snafu(display("virtual server in ConfigMap {name} has out-of-range service port {port}"))]
    ServicePortOutOfRange {
        name: String,
        port: i32,
        partial: Box<VirtualServerConfig>,
    },
    #[snafu(display("virtual server in ConfigMap {name} has out-of-range bind port {port}"))]
    BindPortOutOfRange {
        name: String,
        port: i32,
        partial: Box<VirtualServerConfig>,
    },
}

impl ParseError {
    /// The partially-decoded definition, when the blob decoded as JSON but
    /// failed validation. Lets callers locate store entries that a previously
    /// valid version of the same ConfigMap produced.
    pub fn partial(&self) -> Option<&VirtualServerConfig> {
        match self {
            ParseError::MissingDataKey { .. } | ParseError::Decode { .. } => None,
            ParseError::EmptyServiceName { partial, .. }
            | ParseError::ServicePortOutOfRange { partial, .. }
            | ParseError::BindPortOutOfRange { partial, .. } => Some(partial),
        }
    }
}

/// Stable virtual-server name for a ConfigMap: `{namespace}_{name}`.
pub fn virtual_server_name(cm: &ConfigMap) -> String {
    format!(
        "{}_{}",
        cm.metadata.namespace.as_deref().unwrap_or_default(),
        cm.metadata.name.as_deref().unwrap_or_default()
    )
}

/// Parses and validates the virtual-server definition in `cm`.
pub fn parse_virtual_server_config(cm: &ConfigMap) -> Result<VirtualServerConfig, ParseError> {
    let name = cm.metadata.name.clone().unwrap_or_default();
    let blob = cm
        .data
        .as_ref()
        .and_then(|data| data.get(CONFIGMAP_DATA_KEY))
        .context(MissingDataKeySnafu { name: name.clone() })?;
    let cfg: VirtualServerConfig =
        serde_json::from_str(blob).context(DecodeSnafu { name: name.clone() })?;

    if cfg.virtual_server.backend.service_name.is_empty() {
        return EmptyServiceNameSnafu {
            name,
            partial: Box::new(cfg),
        }
        .fail();
    }
    let port = cfg.virtual_server.backend.service_port;
    if !(1..=65535).contains(&port) {
        return ServicePortOutOfRangeSnafu {
            name,
            port,
            partial: Box::new(cfg),
        }
        .fail();
    }
    if let Some(virtual_address) = &cfg.virtual_server.frontend.virtual_address {
        let port = virtual_address.port;
        if !(0..=65535).contains(&port) {
            return BindPortOutOfRangeSnafu {
                name,
                port,
                partial: Box::new(cfg),
            }
            .fail();
        }
    }
    Ok(cfg)
}
