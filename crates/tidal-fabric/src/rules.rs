//! Flow-rule construction and installation.
//!
//! An inter-leaf flow needs six rules: forward matches on the source
//! leaf (to the spine uplink), the spine (to the destination-leaf
//! downlink), and the destination leaf (to the host port), plus the
//! three mirror-image reverse rules pinned to the same spine. A
//! same-leaf flow needs a single rule to the destination host port.
//!
//! Rules are pushed to the SDN controller's flow-entry REST endpoint.

use async_trait::async_trait;
use serde_json::{json, Value};

use tidal_common::topology::Topology;

use crate::flow::{FiveTuple, PROTO_ICMP, PROTO_TCP, PROTO_UDP};

pub const DEFAULT_PRIORITY: u32 = 10;

/// One OpenFlow rule to install on one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowRule {
    pub dpid: u64,
    /// Device name, for logs and tests.
    pub device: String,
    pub tuple: FiveTuple,
    pub out_port: u32,
    pub idle_timeout: u32,
    pub priority: u32,
}

impl FlowRule {
    /// Body for the controller's `flowentry/add` endpoint.
    pub fn to_request(&self) -> Value {
        let mut match_fields = json!({
            "eth_type": 2048,
            "ipv4_src": self.tuple.src_ip.to_string(),
            "ipv4_dst": self.tuple.dst_ip.to_string(),
            "ip_proto": self.tuple.proto,
        });
        let m = match_fields.as_object_mut().unwrap();
        match self.tuple.proto {
            PROTO_TCP => {
                m.insert("tcp_src".into(), json!(self.tuple.src_key));
                m.insert("tcp_dst".into(), json!(self.tuple.dst_key));
            }
            PROTO_UDP => {
                m.insert("udp_src".into(), json!(self.tuple.src_key));
                m.insert("udp_dst".into(), json!(self.tuple.dst_key));
            }
            PROTO_ICMP => {
                m.insert("icmpv4_type".into(), json!(self.tuple.src_key));
                m.insert("icmpv4_code".into(), json!(self.tuple.dst_key));
            }
            _ => {}
        }
        json!({
            "dpid": self.dpid,
            "idle_timeout": self.idle_timeout,
            "priority": self.priority,
            "match": match_fields,
            "actions": [{"type": "OUTPUT", "port": self.out_port}],
        })
    }
}

fn rule(dpid: u64, device: &str, tuple: FiveTuple, out_port: u32, idle_timeout: u32) -> FlowRule {
    FlowRule {
        dpid,
        device: device.to_string(),
        tuple,
        out_port,
        idle_timeout,
        priority: DEFAULT_PRIORITY,
    }
}

/// Rules for a flow whose endpoints share a leaf: one forward rule to
/// the destination host port.
pub fn same_leaf_rules(
    topo: &Topology,
    tuple: &FiveTuple,
    idle_timeout: u32,
) -> anyhow::Result<Vec<FlowRule>> {
    let (leaf, host_port) = topo
        .host_location(&tuple.dst_ip.to_string())
        .ok_or_else(|| anyhow::anyhow!("unknown destination host {}", tuple.dst_ip))?;
    Ok(vec![rule(leaf.dpid, &leaf.name, *tuple, host_port, idle_timeout)])
}

/// Symmetric rules for an inter-leaf flow crossing `spine`: three
/// forward, three reverse.
pub fn inter_leaf_rules(
    topo: &Topology,
    tuple: &FiveTuple,
    spine_name: &str,
    idle_timeout: u32,
) -> anyhow::Result<Vec<FlowRule>> {
    let (src_leaf, src_host_port) = topo
        .host_location(&tuple.src_ip.to_string())
        .ok_or_else(|| anyhow::anyhow!("unknown source host {}", tuple.src_ip))?;
    let (dst_leaf, dst_host_port) = topo
        .host_location(&tuple.dst_ip.to_string())
        .ok_or_else(|| anyhow::anyhow!("unknown destination host {}", tuple.dst_ip))?;
    let spine = topo
        .spine(spine_name)
        .ok_or_else(|| anyhow::anyhow!("unknown spine {spine_name}"))?;

    let src_uplink = *src_leaf
        .uplinks
        .get(spine_name)
        .ok_or_else(|| anyhow::anyhow!("{} has no uplink to {spine_name}", src_leaf.name))?;
    let dst_uplink = *dst_leaf
        .uplinks
        .get(spine_name)
        .ok_or_else(|| anyhow::anyhow!("{} has no uplink to {spine_name}", dst_leaf.name))?;
    let down_to_dst = *spine
        .downlinks
        .get(&dst_leaf.name)
        .ok_or_else(|| anyhow::anyhow!("{spine_name} has no downlink to {}", dst_leaf.name))?;
    let down_to_src = *spine
        .downlinks
        .get(&src_leaf.name)
        .ok_or_else(|| anyhow::anyhow!("{spine_name} has no downlink to {}", src_leaf.name))?;

    let rev = tuple.reversed();
    Ok(vec![
        // forward: src leaf → spine → dst leaf → host
        rule(src_leaf.dpid, &src_leaf.name, *tuple, src_uplink, idle_timeout),
        rule(spine.dpid, &spine.name, *tuple, down_to_dst, idle_timeout),
        rule(dst_leaf.dpid, &dst_leaf.name, *tuple, dst_host_port, idle_timeout),
        // reverse: dst leaf → same spine → src leaf → host
        rule(dst_leaf.dpid, &dst_leaf.name, rev, dst_uplink, idle_timeout),
        rule(spine.dpid, &spine.name, rev, down_to_src, idle_timeout),
        rule(src_leaf.dpid, &src_leaf.name, rev, src_host_port, idle_timeout),
    ])
}

/// Pushes rules into the dataplane.
#[async_trait]
pub trait RuleInstaller: Send + Sync {
    async fn install(&self, rule: &FlowRule) -> anyhow::Result<()>;
}

/// REST installer against the SDN controller's flow-entry API.
pub struct RestRuleInstaller {
    http: reqwest::Client,
    base_url: String,
}

impl RestRuleInstaller {
    pub fn new(base_url: &str, timeout: std::time::Duration) -> anyhow::Result<Self> {
        Ok(Self {
            http: reqwest::Client::builder().timeout(timeout).build()?,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl RuleInstaller for RestRuleInstaller {
    async fn install(&self, rule: &FlowRule) -> anyhow::Result<()> {
        let url = format!("{}/stats/flowentry/add", self.base_url);
        self.http
            .post(&url)
            .json(&rule.to_request())
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}
