//! `nft` backend speaking the libnftables JSON format

use super::{ChainState, NftHandle, RuleState};
use crate::crd::{
    Chain, ChainHook, ChainPolicy, ChainType, DevPosition, FilterAction, FilterRule, IpPosition,
    Match, TableFamily,
};
use crate::netlink::parse_net;
use crate::{Error, Result};
use async_trait::async_trait;
use ipnet::IpNet;
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, instrument};

/// [`NftHandle`] driving the `nft` binary. Requires CAP_NET_ADMIN.
#[derive(Debug, Clone)]
pub struct NftCommand {
    binary: PathBuf,
}

impl Default for NftCommand {
    fn default() -> Self {
        Self::new("nft")
    }
}

#[derive(Debug, Deserialize)]
struct Ruleset {
    nftables: Vec<serde_json::Map<String, Value>>,
}

#[derive(Debug, Deserialize)]
struct NftChainJson {
    name: String,
    #[serde(rename = "type")]
    chain_type: Option<String>,
    hook: Option<String>,
    prio: Option<i32>,
    policy: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NftRuleJson {
    chain: String,
    handle: u64,
    comment: Option<String>,
}

impl NftCommand {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn failure(&self, args: &[&str], stderr: &[u8]) -> Error {
        Error::Command {
            command: format!("{} {}", self.binary.display(), args.join(" ")),
            stderr: String::from_utf8_lossy(stderr).trim().to_string(),
        }
    }

    async fn run(&self, args: &[&str]) -> Result<Vec<u8>> {
        debug!("Running {} {}", self.binary.display(), args.join(" "));
        let output = Command::new(&self.binary).args(args).output().await?;
        if !output.status.success() {
            return Err(self.failure(args, &output.stderr));
        }
        Ok(output.stdout)
    }

    /// Apply a batch of commands atomically
    async fn apply(&self, commands: Vec<Value>) -> Result<()> {
        let document = serde_json::to_vec(&json!({ "nftables": commands }))?;
        let args = ["-j", "-f", "-"];
        debug!(batch = %String::from_utf8_lossy(&document), "Applying nft batch");

        let mut child = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&document).await?;
        }
        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(self.failure(&args, &output.stderr));
        }
        Ok(())
    }
}

fn table_ref(family: TableFamily, table: &str) -> Value {
    json!({ "family": family.as_str(), "name": table })
}

fn chain_ref(family: TableFamily, table: &str, chain: &str) -> Value {
    json!({ "family": family.as_str(), "table": table, "name": chain })
}

fn chain_object(family: TableFamily, table: &str, chain: &Chain) -> Value {
    json!({
        "family": family.as_str(),
        "table": table,
        "name": chain.name,
        "type": chain.chain_type.as_str(),
        "hook": chain.hook.as_str(),
        "prio": chain.priority,
        "policy": chain.policy.as_str(),
    })
}

fn ip_right(net: IpNet) -> Value {
    if net.prefix_len() == net.max_prefix_len() {
        json!(net.addr().to_string())
    } else {
        json!({ "prefix": { "addr": net.network().to_string(), "len": net.prefix_len() } })
    }
}

fn match_expr(m: &Match) -> Result<Vec<Value>> {
    let mut exprs = Vec::new();
    if let Some(ip) = &m.ip {
        let net = parse_net(&ip.value)?;
        let protocol = match net {
            IpNet::V4(_) => "ip",
            IpNet::V6(_) => "ip6",
        };
        let field = match ip.position {
            IpPosition::Src => "saddr",
            IpPosition::Dst => "daddr",
        };
        exprs.push(json!({ "match": {
            "op": m.op.as_str(),
            "left": { "payload": { "protocol": protocol, "field": field } },
            "right": ip_right(net),
        }}));
    }
    if let Some(dev) = &m.dev {
        let key = match dev.position {
            DevPosition::In => "iifname",
            DevPosition::Out => "oifname",
        };
        exprs.push(json!({ "match": {
            "op": m.op.as_str(),
            "left": { "meta": { "key": key } },
            "right": dev.value,
        }}));
    }
    Ok(exprs)
}

fn action_expr(rule: &FilterRule) -> Result<Value> {
    Ok(match rule.action {
        FilterAction::CtMark => {
            let mark = rule.ct_mark().ok_or_else(|| {
                Error::InvalidSpec(format!("rule {} sets ctmark without a valid mark", rule.name))
            })?;
            json!({ "mangle": { "key": { "ct": { "key": "mark" } }, "value": mark } })
        }
        FilterAction::MetaMarkFromCtMark => json!({ "mangle": {
            "key": { "meta": { "key": "mark" } },
            "value": { "ct": { "key": "mark" } },
        }}),
        FilterAction::Accept => json!({ "accept": null }),
        FilterAction::Drop => json!({ "drop": null }),
    })
}

fn rule_object(family: TableFamily, table: &str, chain: &str, rule: &FilterRule) -> Result<Value> {
    let mut expr = Vec::new();
    for m in &rule.matches {
        expr.extend(match_expr(m)?);
    }
    expr.push(action_expr(rule)?);
    Ok(json!({
        "family": family.as_str(),
        "table": table,
        "chain": chain,
        "comment": rule.name,
        "expr": expr,
    }))
}

fn parse_ruleset(raw: &[u8]) -> Result<Vec<ChainState>> {
    let ruleset: Ruleset = serde_json::from_slice(raw)?;
    let mut chains: Vec<ChainState> = Vec::new();
    for object in ruleset.nftables {
        if let Some(chain) = object.get("chain") {
            let chain: NftChainJson = serde_json::from_value(chain.clone())?;
            chains.push(ChainState {
                name: chain.name,
                hook: chain.hook.as_deref().and_then(ChainHook::parse),
                chain_type: chain.chain_type.as_deref().and_then(ChainType::parse),
                priority: chain.prio,
                policy: chain.policy.as_deref().and_then(ChainPolicy::parse),
                rules: Vec::new(),
            });
        } else if let Some(rule) = object.get("rule") {
            let rule: NftRuleJson = serde_json::from_value(rule.clone())?;
            // nft lists a chain before its rules
            if let Some(chain) = chains.iter_mut().find(|c| c.name == rule.chain) {
                chain.rules.push(RuleState {
                    handle: rule.handle,
                    name: rule.comment,
                });
            }
        }
    }
    Ok(chains)
}

#[async_trait]
impl NftHandle for NftCommand {
    async fn ensure_table(&self, family: TableFamily, table: &str) -> Result<()> {
        // `add table` is a no-op on an existing table
        self.apply(vec![json!({ "add": { "table": table_ref(family, table) } })])
            .await
    }

    async fn delete_table(&self, family: TableFamily, table: &str) -> Result<()> {
        match self
            .apply(vec![json!({ "delete": { "table": table_ref(family, table) } })])
            .await
        {
            Err(Error::Command { stderr, .. }) if stderr.contains("No such file or directory") => {
                debug!(table, "Firewall table already absent");
                Ok(())
            }
            other => other,
        }
    }

    #[instrument(skip(self))]
    async fn list_chains(&self, family: TableFamily, table: &str) -> Result<Vec<ChainState>> {
        let raw = self
            .run(&["-j", "-a", "list", "table", family.as_str(), table])
            .await?;
        parse_ruleset(&raw)
    }

    async fn add_chain(&self, family: TableFamily, table: &str, chain: &Chain) -> Result<()> {
        self.apply(vec![
            json!({ "add": { "chain": chain_object(family, table, chain) } }),
        ])
        .await
    }

    async fn delete_chain(&self, family: TableFamily, table: &str, chain: &str) -> Result<()> {
        let chain = chain_ref(family, table, chain);
        self.apply(vec![
            json!({ "flush": { "chain": chain.clone() } }),
            json!({ "delete": { "chain": chain } }),
        ])
        .await
    }

    async fn add_rule(
        &self,
        family: TableFamily,
        table: &str,
        chain: &str,
        rule: &FilterRule,
    ) -> Result<()> {
        let rule = rule_object(family, table, chain, rule)?;
        self.apply(vec![json!({ "add": { "rule": rule } })]).await
    }

    async fn delete_rule(
        &self,
        family: TableFamily,
        table: &str,
        chain: &str,
        handle: u64,
    ) -> Result<()> {
        self.apply(vec![json!({ "delete": { "rule": {
            "family": family.as_str(),
            "table": table,
            "chain": chain,
            "handle": handle,
        }}})])
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{MatchDev, MatchIp, MatchOperation};

    #[test]
    fn test_parse_ruleset() {
        let raw = br#"{"nftables":[
            {"metainfo":{"version":"1.0.9","json_schema_version":1}},
            {"table":{"family":"inet","name":"nodeport","handle":3}},
            {"chain":{"family":"inet","table":"nodeport","name":"mark-to-conntrack","handle":1,
                      "type":"filter","hook":"forward","prio":-150,"policy":"accept"}},
            {"chain":{"family":"inet","table":"nodeport","name":"helper","handle":2}},
            {"rule":{"family":"inet","table":"nodeport","chain":"mark-to-conntrack","handle":4,
                     "comment":"node-a","expr":[]}},
            {"rule":{"family":"inet","table":"nodeport","chain":"mark-to-conntrack","handle":5,
                     "expr":[]}}
        ]}"#;
        let chains = parse_ruleset(raw).unwrap();

        assert_eq!(chains.len(), 2);
        assert_eq!(chains[0].hook, Some(ChainHook::Forward));
        assert_eq!(chains[0].priority, Some(-150));
        assert_eq!(chains[0].policy, Some(ChainPolicy::Accept));
        assert_eq!(
            chains[0].rules,
            vec![
                RuleState { handle: 4, name: Some("node-a".to_string()) },
                RuleState { handle: 5, name: None },
            ]
        );
        assert_eq!(chains[1].hook, None);
    }

    #[test]
    fn test_ctmark_rule_object() {
        let rule = FilterRule {
            name: "node-a".to_string(),
            matches: vec![Match {
                op: MatchOperation::Eq,
                ip: None,
                dev: Some(MatchDev {
                    value: "tun-a".to_string(),
                    position: DevPosition::In,
                }),
            }],
            action: FilterAction::CtMark,
            value: Some("0x3".to_string()),
        };
        let object = rule_object(TableFamily::Inet, "nodeport", "mark-to-conntrack", &rule).unwrap();

        assert_eq!(object["comment"], "node-a");
        assert_eq!(
            object["expr"][0],
            json!({ "match": {
                "op": "==",
                "left": { "meta": { "key": "iifname" } },
                "right": "tun-a",
            }})
        );
        assert_eq!(object["expr"][1]["mangle"]["value"], 3);
    }

    #[test]
    fn test_ip_match_prefix_and_host() {
        let m = Match {
            op: MatchOperation::Neq,
            ip: Some(MatchIp {
                value: "10.1.0.0/16".to_string(),
                position: IpPosition::Dst,
            }),
            dev: None,
        };
        let expr = match_expr(&m).unwrap();
        assert_eq!(expr[0]["match"]["op"], "!=");
        assert_eq!(expr[0]["match"]["left"]["payload"]["field"], "daddr");
        assert_eq!(expr[0]["match"]["right"]["prefix"]["len"], 16);

        let host = Match {
            ip: Some(MatchIp {
                value: "fd00::1".to_string(),
                position: IpPosition::Src,
            }),
            ..m
        };
        let expr = match_expr(&host).unwrap();
        assert_eq!(expr[0]["match"]["left"]["payload"]["protocol"], "ip6");
        assert_eq!(expr[0]["match"]["right"], "fd00::1");
    }

    #[test]
    fn test_restore_mark_action() {
        let rule = FilterRule {
            name: "restore".to_string(),
            matches: vec![],
            action: FilterAction::MetaMarkFromCtMark,
            value: None,
        };
        let expr = action_expr(&rule).unwrap();
        assert_eq!(expr["mangle"]["key"]["meta"]["key"], "mark");
        assert_eq!(expr["mangle"]["value"]["ct"]["key"], "mark");
    }
}
