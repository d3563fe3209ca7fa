//! Declarative dataplane resources
//!
//! `RouteConfiguration` describes policy routing tables, `FirewallConfiguration`
//! nftables filter chains. Both are applied by the reconcilers of this crate
//! and carry the status reported back by the driver.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Desired content of a RouteConfiguration
#[derive(CustomResource, Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "networking.gateway.dev",
    version = "v1beta1",
    kind = "RouteConfiguration",
    namespaced,
    status = "ConfigurationStatus",
    shortname = "rtcfg"
)]
#[serde(rename_all = "camelCase")]
pub struct RouteConfigurationSpec {
    pub table: Table,
}

/// Desired content of a FirewallConfiguration
#[derive(CustomResource, Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "networking.gateway.dev",
    version = "v1beta1",
    kind = "FirewallConfiguration",
    namespaced,
    status = "ConfigurationStatus",
    shortname = "fwcfg"
)]
#[serde(rename_all = "camelCase")]
pub struct FirewallConfigurationSpec {
    pub table: FirewallTable,
}

/// A named policy routing table and the rules that select it
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Table {
    pub name: String,
    #[serde(default)]
    pub rules: Vec<Rule>,
}

/// A routing policy rule pointing at its table.
///
/// Unset fields do not constrain the match against existing kernel rules.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dst: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iif: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oif: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fwmark: Option<u32>,
    #[serde(default)]
    pub routes: Vec<Route>,
    /// Object this rule was generated for, informational only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_ref: Option<TargetRef>,
}

/// A route of the table. Unset fields act as wildcards when matching.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Route {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dst: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gw: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dev: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub onlink: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<Scope>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_ref: Option<TargetRef>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Universe,
    Site,
    Link,
    Host,
    Nowhere,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Universe => "global",
            Scope::Site => "site",
            Scope::Link => "link",
            Scope::Host => "host",
            Scope::Nowhere => "nowhere",
        }
    }

    /// Parse the scope names printed by iproute2
    pub fn from_iproute2(name: &str) -> Option<Self> {
        match name {
            "global" | "universe" => Some(Scope::Universe),
            "site" => Some(Scope::Site),
            "link" => Some(Scope::Link),
            "host" => Some(Scope::Host),
            "nowhere" => Some(Scope::Nowhere),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TargetRef {
    pub kind: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// An nftables table with its chains
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FirewallTable {
    pub name: String,
    #[serde(default)]
    pub family: TableFamily,
    #[serde(default)]
    pub chains: Vec<Chain>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum TableFamily {
    #[default]
    Inet,
    Ip,
    Ip6,
}

impl TableFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            TableFamily::Inet => "inet",
            TableFamily::Ip => "ip",
            TableFamily::Ip6 => "ip6",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Chain {
    pub name: String,
    pub hook: ChainHook,
    #[serde(default)]
    pub chain_type: ChainType,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub policy: ChainPolicy,
    /// Rules keyed by name; content changes under an existing name are
    /// not re-applied.
    #[serde(default)]
    pub rules: Vec<FilterRule>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ChainHook {
    Prerouting,
    Input,
    Forward,
    Output,
    Postrouting,
}

impl ChainHook {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChainHook::Prerouting => "prerouting",
            ChainHook::Input => "input",
            ChainHook::Forward => "forward",
            ChainHook::Output => "output",
            ChainHook::Postrouting => "postrouting",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "prerouting" => Some(ChainHook::Prerouting),
            "input" => Some(ChainHook::Input),
            "forward" => Some(ChainHook::Forward),
            "output" => Some(ChainHook::Output),
            "postrouting" => Some(ChainHook::Postrouting),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ChainType {
    #[default]
    Filter,
    Nat,
    Route,
}

impl ChainType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChainType::Filter => "filter",
            ChainType::Nat => "nat",
            ChainType::Route => "route",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "filter" => Some(ChainType::Filter),
            "nat" => Some(ChainType::Nat),
            "route" => Some(ChainType::Route),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ChainPolicy {
    #[default]
    Accept,
    Drop,
}

impl ChainPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChainPolicy::Accept => "accept",
            ChainPolicy::Drop => "drop",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "accept" => Some(ChainPolicy::Accept),
            "drop" => Some(ChainPolicy::Drop),
            _ => None,
        }
    }
}

/// A filter rule, identified by its name
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FilterRule {
    pub name: String,
    #[serde(default)]
    pub matches: Vec<Match>,
    pub action: FilterAction,
    /// Action argument, e.g. the mark for `ctmark`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

impl FilterRule {
    /// The conntrack mark set by a `ctmark` rule
    pub fn ct_mark(&self) -> Option<u32> {
        match self.action {
            FilterAction::CtMark => self.value.as_deref().and_then(parse_mark),
            _ => None,
        }
    }
}

/// Parse a mark written in decimal or `0x` hexadecimal
pub fn parse_mark(value: &str) -> Option<u32> {
    let value = value.trim();
    match value.strip_prefix("0x") {
        Some(hex) => u32::from_str_radix(hex, 16).ok(),
        None => value.parse().ok(),
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum FilterAction {
    /// Set the conntrack mark to `value`
    CtMark,
    /// Copy the conntrack mark into the packet mark
    MetaMarkFromCtMark,
    Accept,
    Drop,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Match {
    #[serde(default)]
    pub op: MatchOperation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<MatchIp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dev: Option<MatchDev>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum MatchOperation {
    #[default]
    Eq,
    Neq,
}

impl MatchOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchOperation::Eq => "==",
            MatchOperation::Neq => "!=",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MatchIp {
    /// Address or prefix
    pub value: String,
    pub position: IpPosition,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum IpPosition {
    Src,
    Dst,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MatchDev {
    pub value: String,
    pub position: DevPosition,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum DevPosition {
    In,
    Out,
}

/// Status written back by the driver after a reconciliation pass
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConfigurationStatus {
    #[serde(default)]
    pub conditions: Vec<ConfigurationCondition>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConfigurationCondition {
    /// Node that applied the configuration
    pub host: String,
    #[serde(rename = "type")]
    pub type_: ConditionType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub last_transition_time: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum ConditionType {
    Applied,
    Error,
}

impl ConfigurationStatus {
    /// Record the outcome of applying the configuration on `host`,
    /// replacing any previous condition of that host.
    pub fn record<T>(&mut self, host: &str, outcome: &crate::Result<T>) {
        let (type_, message) = match outcome {
            Ok(_) => (ConditionType::Applied, None),
            Err(e) => (ConditionType::Error, Some(e.to_string())),
        };

        if let Some(existing) = self.conditions.iter().find(|c| c.host == host) {
            if existing.type_ == type_ && existing.message == message {
                return;
            }
        }
        self.conditions.retain(|c| c.host != host);
        self.conditions.push(ConfigurationCondition {
            host: host.to_string(),
            type_,
            message,
            last_transition_time: chrono::Utc::now().to_rfc3339(),
        });
    }
}
