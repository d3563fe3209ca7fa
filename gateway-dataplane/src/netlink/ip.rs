//! iproute2 backend
//!
//! Lists rules and routes with `ip -j` and parses the JSON output; mutations
//! go through plain `ip rule` / `ip route` invocations. Requires
//! CAP_NET_ADMIN.

use super::{parse_addr, parse_net, RouteHandle, RouteSpec, RuleSpec};
use crate::crd::{parse_mark, Scope};
use crate::{Error, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::path::PathBuf;
use tokio::process::Command;
use tracing::{debug, instrument};

/// [`RouteHandle`] driving the `ip` binary
#[derive(Debug, Clone)]
pub struct IpCommand {
    binary: PathBuf,
}

impl Default for IpCommand {
    fn default() -> Self {
        Self::new("ip")
    }
}

#[derive(Debug, Deserialize)]
struct IpRuleJson {
    priority: Option<u32>,
    src: Option<String>,
    srclen: Option<u8>,
    dst: Option<String>,
    dstlen: Option<u8>,
    iif: Option<String>,
    oif: Option<String>,
    fwmark: Option<String>,
}

#[derive(Debug, Deserialize)]
struct IpRouteJson {
    dst: String,
    gateway: Option<String>,
    dev: Option<String>,
    prefsrc: Option<String>,
    scope: Option<String>,
    #[serde(default)]
    flags: Vec<String>,
}

impl IpCommand {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn run(&self, args: &[String]) -> Result<Vec<u8>> {
        debug!("Running {} {}", self.binary.display(), args.join(" "));
        let output = Command::new(&self.binary).args(args).output().await?;
        if !output.status.success() {
            return Err(Error::Command {
                command: format!("{} {}", self.binary.display(), args.join(" ")),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output.stdout)
    }

    async fn list_json<T: for<'de> Deserialize<'de>>(&self, args: Vec<String>) -> Result<Vec<T>> {
        let stdout = self.run(&args).await?;
        if stdout.iter().all(u8::is_ascii_whitespace) {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_slice(&stdout)?)
    }
}

fn family(ipv6: bool) -> String {
    let flag = if ipv6 { "-6" } else { "-4" };
    flag.to_string()
}

fn rule_args(verb: &str, rule: &RuleSpec) -> Vec<String> {
    let mut args = vec![family(rule.is_ipv6()), "rule".to_string(), verb.to_string()];
    if let Some(priority) = rule.priority {
        args.extend(["priority".to_string(), priority.to_string()]);
    }
    if let Some(src) = &rule.src {
        args.extend(["from".to_string(), src.to_string()]);
    }
    if let Some(dst) = &rule.dst {
        args.extend(["to".to_string(), dst.to_string()]);
    }
    if let Some(iif) = &rule.iif {
        args.extend(["iif".to_string(), iif.clone()]);
    }
    if let Some(oif) = &rule.oif {
        args.extend(["oif".to_string(), oif.clone()]);
    }
    if let Some(mark) = rule.fwmark {
        args.extend(["fwmark".to_string(), format!("{:#x}", mark)]);
    }
    args.extend(["table".to_string(), rule.table.to_string()]);
    args
}

fn route_args(verb: &str, route: &RouteSpec) -> Vec<String> {
    let mut args = vec![
        family(route.is_ipv6()),
        "route".to_string(),
        verb.to_string(),
        route.destination().to_string(),
    ];
    if let Some(gw) = &route.gw {
        args.extend(["via".to_string(), gw.to_string()]);
    }
    if let Some(dev) = &route.dev {
        args.extend(["dev".to_string(), dev.clone()]);
    }
    if let Some(src) = &route.src {
        args.extend(["src".to_string(), src.to_string()]);
    }
    if let Some(scope) = &route.scope {
        args.extend(["scope".to_string(), scope.as_str().to_string()]);
    }
    if route.onlink == Some(true) {
        args.push("onlink".to_string());
    }
    args.extend(["table".to_string(), route.table.to_string()]);
    args
}

fn selector(addr: Option<String>, len: Option<u8>) -> Result<Option<ipnet::IpNet>> {
    match addr.as_deref() {
        None | Some("all") => Ok(None),
        Some(addr) => {
            let net = match len {
                Some(len) => parse_net(&format!("{}/{}", addr, len))?,
                None => parse_net(addr)?,
            };
            Ok(Some(net))
        }
    }
}

impl IpRuleJson {
    fn into_spec(self, table: u32) -> Result<RuleSpec> {
        Ok(RuleSpec {
            table,
            priority: self.priority,
            src: selector(self.src, self.srclen)?,
            dst: selector(self.dst, self.dstlen)?,
            iif: self.iif,
            oif: self.oif,
            fwmark: self.fwmark.as_deref().and_then(parse_mark),
        })
    }
}

impl IpRouteJson {
    fn into_spec(self, table: u32, ipv6: bool) -> Result<RouteSpec> {
        let dst = match self.dst.as_str() {
            "default" => Some(parse_net(if ipv6 { "::/0" } else { "0.0.0.0/0" })?),
            dst => Some(parse_net(dst)?),
        };
        Ok(RouteSpec {
            table,
            dst,
            src: self.prefsrc.as_deref().map(parse_addr).transpose()?,
            gw: self.gateway.as_deref().map(parse_addr).transpose()?,
            dev: self.dev,
            onlink: Some(self.flags.iter().any(|f| f == "onlink")),
            // iproute2 omits the scope of universe routes
            scope: Some(
                self.scope
                    .as_deref()
                    .and_then(Scope::from_iproute2)
                    .unwrap_or(Scope::Universe),
            ),
        })
    }
}

#[async_trait]
impl RouteHandle for IpCommand {
    #[instrument(skip(self))]
    async fn list_rules(&self, table: u32) -> Result<Vec<RuleSpec>> {
        let mut rules = Vec::new();
        for ipv6 in [false, true] {
            let args = vec![
                "-j".to_string(),
                family(ipv6),
                "rule".to_string(),
                "show".to_string(),
                "table".to_string(),
                table.to_string(),
            ];
            for rule in self.list_json::<IpRuleJson>(args).await? {
                rules.push(rule.into_spec(table)?);
            }
        }
        Ok(rules)
    }

    async fn add_rule(&self, rule: &RuleSpec) -> Result<()> {
        self.run(&rule_args("add", rule)).await.map(|_| ())
    }

    async fn del_rule(&self, rule: &RuleSpec) -> Result<()> {
        self.run(&rule_args("del", rule)).await.map(|_| ())
    }

    #[instrument(skip(self))]
    async fn list_routes(&self, table: u32) -> Result<Vec<RouteSpec>> {
        let mut routes = Vec::new();
        for ipv6 in [false, true] {
            let args = vec![
                "-j".to_string(),
                family(ipv6),
                "route".to_string(),
                "show".to_string(),
                "table".to_string(),
                table.to_string(),
            ];
            for route in self.list_json::<IpRouteJson>(args).await? {
                routes.push(route.into_spec(table, ipv6)?);
            }
        }
        Ok(routes)
    }

    async fn add_route(&self, route: &RouteSpec) -> Result<()> {
        self.run(&route_args("add", route)).await.map(|_| ())
    }

    async fn replace_route(&self, route: &RouteSpec) -> Result<()> {
        self.run(&route_args("replace", route)).await.map(|_| ())
    }

    async fn del_route(&self, route: &RouteSpec) -> Result<()> {
        self.run(&route_args("del", route)).await.map(|_| ())
    }
}
