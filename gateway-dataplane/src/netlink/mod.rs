//! Kernel routing policy access
//!
//! [`RouteHandle`] is the seam between the reconciler and the kernel. The
//! [`IpCommand`] backend drives iproute2, [`MemoryRouteHandle`] keeps the
//! state in memory for tests and dry runs.
//!
//! Matching is asymmetric on purpose: a field left unset in the desired
//! object matches anything, a field set in the desired object must be
//! present and equal in the kernel object.

mod ip;
mod memory;

pub use ip::IpCommand;
pub use memory::MemoryRouteHandle;

use crate::crd::{self, Scope};
use crate::{Error, Result};
use async_trait::async_trait;
use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use std::fmt;
use std::net::IpAddr;

/// A routing policy rule as seen by the kernel
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleSpec {
    pub table: u32,
    /// Only set on rules listed from the kernel; ignored when matching
    pub priority: Option<u32>,
    pub src: Option<IpNet>,
    pub dst: Option<IpNet>,
    pub iif: Option<String>,
    pub oif: Option<String>,
    pub fwmark: Option<u32>,
}

/// A route as seen by the kernel
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteSpec {
    pub table: u32,
    pub dst: Option<IpNet>,
    pub src: Option<IpAddr>,
    pub gw: Option<IpAddr>,
    pub dev: Option<String>,
    pub onlink: Option<bool>,
    pub scope: Option<Scope>,
}

fn field_matches<T: PartialEq>(desired: &Option<T>, existing: &Option<T>) -> bool {
    match desired {
        None => true,
        Some(_) => desired == existing,
    }
}

impl RuleSpec {
    /// Build the kernel rule for a desired rule of table `table`
    pub fn from_desired(rule: &crd::Rule, table: u32) -> Result<Self> {
        Ok(Self {
            table,
            priority: None,
            src: rule.src.as_deref().map(parse_net).transpose()?,
            dst: rule.dst.as_deref().map(parse_net).transpose()?,
            iif: rule.iif.clone(),
            oif: rule.oif.clone(),
            fwmark: rule.fwmark,
        })
    }

    /// Whether `existing` satisfies this desired rule
    pub fn matches(&self, existing: &RuleSpec) -> bool {
        self.table == existing.table
            && field_matches(&self.src, &existing.src)
            && field_matches(&self.dst, &existing.dst)
            && field_matches(&self.iif, &existing.iif)
            && field_matches(&self.oif, &existing.oif)
            && field_matches(&self.fwmark, &existing.fwmark)
    }

    pub fn is_ipv6(&self) -> bool {
        matches!(self.src.or(self.dst), Some(IpNet::V6(_)))
    }
}

impl RouteSpec {
    /// Build the kernel route for a desired route of table `table`
    pub fn from_desired(route: &crd::Route, table: u32) -> Result<Self> {
        Ok(Self {
            table,
            dst: route.dst.as_deref().map(parse_net).transpose()?,
            src: route.src.as_deref().map(parse_addr).transpose()?,
            gw: route.gw.as_deref().map(parse_addr).transpose()?,
            dev: route.dev.clone(),
            onlink: route.onlink,
            scope: route.scope,
        })
    }

    /// Whether `existing` satisfies this desired route. The destination is
    /// never a wildcard: a route without one is the default route.
    pub fn matches(&self, existing: &RouteSpec) -> bool {
        self.same_destination(existing)
            && field_matches(&self.src, &existing.src)
            && field_matches(&self.gw, &existing.gw)
            && field_matches(&self.dev, &existing.dev)
            && field_matches(&self.onlink, &existing.onlink)
            && field_matches(&self.scope, &existing.scope)
    }

    /// Destination, with the default route made explicit
    pub fn destination(&self) -> IpNet {
        self.dst.unwrap_or_else(|| default_net(self.is_ipv6()))
    }

    /// Same table and destination, whatever the next hop
    pub fn same_destination(&self, existing: &RouteSpec) -> bool {
        self.table == existing.table && self.destination() == existing.destination()
    }

    pub fn is_ipv6(&self) -> bool {
        match (self.dst, self.gw, self.src) {
            (Some(net), _, _) => matches!(net, IpNet::V6(_)),
            (None, Some(gw), _) => gw.is_ipv6(),
            (None, None, Some(src)) => src.is_ipv6(),
            _ => false,
        }
    }
}

impl fmt::Display for RuleSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "table {}", self.table)?;
        if let Some(src) = &self.src {
            write!(f, " from {}", src)?;
        }
        if let Some(dst) = &self.dst {
            write!(f, " to {}", dst)?;
        }
        if let Some(iif) = &self.iif {
            write!(f, " iif {}", iif)?;
        }
        if let Some(oif) = &self.oif {
            write!(f, " oif {}", oif)?;
        }
        if let Some(mark) = self.fwmark {
            write!(f, " fwmark {:#x}", mark)?;
        }
        Ok(())
    }
}

impl fmt::Display for RouteSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} table {}", self.destination(), self.table)?;
        if let Some(gw) = &self.gw {
            write!(f, " via {}", gw)?;
        }
        if let Some(dev) = &self.dev {
            write!(f, " dev {}", dev)?;
        }
        if let Some(src) = &self.src {
            write!(f, " src {}", src)?;
        }
        if let Some(scope) = &self.scope {
            write!(f, " scope {}", scope.as_str())?;
        }
        if self.onlink == Some(true) {
            write!(f, " onlink")?;
        }
        Ok(())
    }
}

/// Parse an address or prefix. Bare addresses become host prefixes and
/// host bits are cleared.
pub fn parse_net(value: &str) -> Result<IpNet> {
    let value = value.trim();
    if value.contains('/') {
        let net: IpNet = value
            .parse()
            .map_err(|e| Error::InvalidSpec(format!("invalid prefix {:?}: {}", value, e)))?;
        return Ok(net.trunc());
    }
    let addr = parse_addr(value)?;
    let prefix = if addr.is_ipv4() { 32 } else { 128 };
    IpNet::new(addr, prefix).map_err(|e| Error::InvalidSpec(format!("invalid prefix: {}", e)))
}

pub fn parse_addr(value: &str) -> Result<IpAddr> {
    value
        .trim()
        .parse()
        .map_err(|e| Error::InvalidSpec(format!("invalid address {:?}: {}", value, e)))
}

fn default_net(ipv6: bool) -> IpNet {
    if ipv6 {
        IpNet::V6(Ipv6Net::default())
    } else {
        IpNet::V4(Ipv4Net::default())
    }
}

/// Access to the kernel rules and routes of one table at a time
#[async_trait]
pub trait RouteHandle: Send + Sync {
    async fn list_rules(&self, table: u32) -> Result<Vec<RuleSpec>>;

    async fn add_rule(&self, rule: &RuleSpec) -> Result<()>;

    async fn del_rule(&self, rule: &RuleSpec) -> Result<()>;

    async fn list_routes(&self, table: u32) -> Result<Vec<RouteSpec>>;

    async fn add_route(&self, route: &RouteSpec) -> Result<()>;

    /// Add or overwrite the route with the same destination
    async fn replace_route(&self, route: &RouteSpec) -> Result<()>;

    async fn del_route(&self, route: &RouteSpec) -> Result<()>;
}
