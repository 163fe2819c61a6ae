//! Cached node addresses for NodePort pool derivation.

use k8s_openapi::api::core::v1::Node;
use parking_lot::Mutex;
use tracing::{debug, warn};

const INTERNAL_IP: &str = "InternalIP";
const EXTERNAL_IP: &str = "ExternalIP";

/// Snapshot of the cluster's usable node addresses. The cached list is
/// strictly sorted and free of duplicates; it is replaced wholesale by the
/// node update path and read by NodePort pool derivation.
#[derive(Debug, Default)]
pub struct NodeCache {
    addrs: Mutex<Vec<String>>,
}

impl NodeCache {
    pub fn snapshot(&self) -> Vec<String> {
        self.addrs.lock().clone()
    }

    /// Replaces the cached list with `new_sorted` (which must be sorted and
    /// deduplicated). Returns whether the list differed.
    pub fn update(&self, new_sorted: Vec<String>) -> bool {
        let mut addrs = self.addrs.lock();
        if *addrs == new_sorted {
            return false;
        }
        *addrs = new_sorted;
        true
    }
}

/// Collects the usable address of every schedulable node, sorted and
/// deduplicated. `use_internal` selects the InternalIP address type,
/// otherwise the ExternalIP is used; a node without an address of the wanted
/// type is logged and skipped.
pub fn node_addresses(nodes: &[Node], use_internal: bool) -> Vec<String> {
    let wanted = if use_internal { INTERNAL_IP } else { EXTERNAL_IP };
    let mut addrs = Vec::new();
    for node in nodes {
        let name = node.metadata.name.as_deref().unwrap_or_default();
        let unschedulable = node
            .spec
            .as_ref()
            .and_then(|spec| spec.unschedulable)
            .unwrap_or(false);
        if unschedulable {
            debug!(node = name, "skipping unschedulable node");
            continue;
        }
        let addr = node
            .status
            .as_ref()
            .and_then(|status| status.addresses.as_ref())
            .and_then(|addresses| addresses.iter().find(|addr| addr.type_ == wanted));
        match addr {
            Some(addr) => addrs.push(addr.address.clone()),
            None => warn!(
                node = name,
                address_type = wanted,
                "node has no usable address, skipping"
            ),
        }
    }
    addrs.sort();
    addrs.dedup();
    addrs
}
