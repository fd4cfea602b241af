//! # Topology Model
//!
//! The declared graph of nodes and links, kept entirely in memory. Nothing in this module talks
//! to the host: the [`runtime`](crate::runtime) and [`fabric`](crate::fabric) modules realize a
//! [`Topology`] afterwards.
//!
//! ```text
//!   h1 ──┐
//!   h2 ──┼── s1 ─────── s2 ── h4
//!   h3 ──┘     s1-eth4  s2-eth2
//! ```
//!
//! Every link creates exactly one [`Interface`] on each endpoint. Interfaces are named either
//! explicitly through [`LinkConfig`] or as `<node>-eth<port>`, where hosts and routers number
//! their ports from 0 and switches from 1.

use std::{fmt, net::Ipv4Addr};

use rustc_hash::FxHashMap;

use crate::{error::ValidationError, ip::InterfaceAddress, netem::LinkShaping};

/// Maximum length of a Linux interface name (`IFNAMSIZ - 1`).
pub const MAX_INTERFACE_NAME_LEN: usize = 15;

/// Index of a node inside its [`Topology`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeRef(pub(crate) usize);

impl fmt::Display for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node#{}", self.0)
    }
}

/// Index of a link inside its [`Topology`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkRef(pub(crate) usize);

impl LinkRef {
    pub const fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for LinkRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link#{}", self.0)
    }
}

/// A specific interface: the `index`-th interface of `node`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InterfaceRef {
    pub node: NodeRef,
    pub index: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Host,
    Switch,
    Router,
}

impl NodeKind {
    /// The first port number used when naming interfaces of this kind.
    pub const fn first_port(&self) -> u32 {
        match self {
            Self::Switch => 1,
            Self::Host | Self::Router => 0,
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Host => "host",
            Self::Switch => "switch",
            Self::Router => "router",
        };
        f.write_str(s)
    }
}

/// Configuration of an end host.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HostConfig {
    /// Address of the host's first interface, unless the link sets one explicitly.
    pub ip: Option<InterfaceAddress>,
    /// Gateway of the default route, installed once the host is wired.
    pub default_route: Option<Ipv4Addr>,
}

/// Configuration of a learning switch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SwitchConfig {
    /// Enable the spanning tree protocol on the switch bridge.
    pub stp: bool,
}

/// Configuration of a router.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RouterConfig {
    /// Address of the router's first interface, unless the link sets one explicitly.
    pub ip: Option<InterfaceAddress>,
}

/// Per-kind node configuration.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeSpec {
    Host(HostConfig),
    Switch(SwitchConfig),
    Router(RouterConfig),
}

impl NodeSpec {
    pub const fn kind(&self) -> NodeKind {
        match self {
            Self::Host(_) => NodeKind::Host,
            Self::Switch(_) => NodeKind::Switch,
            Self::Router(_) => NodeKind::Router,
        }
    }

    /// The node-level address, assigned to the first interface.
    fn ip(&self) -> Option<InterfaceAddress> {
        match self {
            Self::Host(config) => config.ip,
            Self::Router(config) => config.ip,
            Self::Switch(_) => None,
        }
    }
}

/// A network interface owned by a [`Node`]. Each interface belongs to exactly one link.
#[derive(Debug, Clone, PartialEq)]
pub struct Interface {
    pub name: String,
    pub address: Option<InterfaceAddress>,
    pub shaping: LinkShaping,
    pub link: LinkRef,
}

#[derive(Debug, Clone)]
pub struct Node {
    id: String,
    spec: NodeSpec,
    interfaces: Vec<Interface>,
    next_port: u32,
}

impl Node {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub const fn kind(&self) -> NodeKind {
        self.spec.kind()
    }

    pub const fn spec(&self) -> &NodeSpec {
        &self.spec
    }

    pub fn interfaces(&self) -> &[Interface] {
        &self.interfaces
    }

    pub fn interface_named(&self, name: &str) -> Option<&Interface> {
        self.interfaces.iter().find(|i| i.name == name)
    }

    /// Addresses of every addressed interface of the node.
    pub fn addresses(&self) -> impl Iterator<Item = InterfaceAddress> + '_ {
        self.interfaces.iter().filter_map(|i| i.address)
    }

    /// The gateway of the host's default route, if any.
    pub fn default_route(&self) -> Option<Ipv4Addr> {
        match &self.spec {
            NodeSpec::Host(config) => config.default_route,
            _ => None,
        }
    }
}

/// One end of a link, as declared.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Endpoint {
    /// Explicit interface name. When `None`, the name is `<node>-eth<port>`.
    pub name: Option<String>,
    /// Explicit address. When `None`, the node-level address is used for its first interface.
    pub address: Option<InterfaceAddress>,
}

/// Parameters of a link between two nodes.
///
/// # Example
///
/// ```
/// use topolab_sim::topology::LinkConfig;
///
/// let config = LinkConfig::default()
///     .b_name("ra-eth4")
///     .b_address("192.168.4.1/24".parse().unwrap());
/// assert_eq!(config.b.name.as_deref(), Some("ra-eth4"));
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LinkConfig {
    pub a: Endpoint,
    pub b: Endpoint,
    /// Shaping applied to both interfaces when the link is wired.
    pub shaping: LinkShaping,
}

impl LinkConfig {
    pub fn a_name(mut self, name: impl Into<String>) -> Self {
        self.a.name = Some(name.into());
        self
    }

    pub fn b_name(mut self, name: impl Into<String>) -> Self {
        self.b.name = Some(name.into());
        self
    }

    pub fn a_address(mut self, address: InterfaceAddress) -> Self {
        self.a.address = Some(address);
        self
    }

    pub fn b_address(mut self, address: InterfaceAddress) -> Self {
        self.b.address = Some(address);
        self
    }

    pub fn shaping(mut self, shaping: LinkShaping) -> Self {
        self.shaping = shaping;
        self
    }
}

/// An unordered pair of interfaces on two distinct nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Link {
    pub a: InterfaceRef,
    pub b: InterfaceRef,
}

impl Link {
    /// Returns the endpoint opposite to `node`.
    pub fn peer_of(&self, node: NodeRef) -> Option<InterfaceRef> {
        if self.a.node == node {
            Some(self.b)
        } else if self.b.node == node {
            Some(self.a)
        } else {
            None
        }
    }
}

/// A declared virtual network.
#[derive(Debug, Clone, Default)]
pub struct Topology {
    nodes: Vec<Node>,
    links: Vec<Link>,
    index: FxHashMap<String, NodeRef>,
}

impl Topology {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a node. Ids must be unique and made of ASCII alphanumerics, `-` or `_`.
    pub fn add_node(
        &mut self,
        id: impl Into<String>,
        spec: NodeSpec,
    ) -> Result<NodeRef, ValidationError> {
        let id = id.into();

        let valid = !id.is_empty() &&
            id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(ValidationError::InvalidNodeId(id));
        }

        if self.index.contains_key(&id) {
            return Err(ValidationError::DuplicateNodeId(id));
        }

        let node_ref = NodeRef(self.nodes.len());
        let next_port = spec.kind().first_port();
        self.index.insert(id.clone(), node_ref);
        self.nodes.push(Node { id, spec, interfaces: Vec::new(), next_port });

        Ok(node_ref)
    }

    pub fn add_host(
        &mut self,
        id: impl Into<String>,
        config: HostConfig,
    ) -> Result<NodeRef, ValidationError> {
        self.add_node(id, NodeSpec::Host(config))
    }

    pub fn add_switch(&mut self, id: impl Into<String>) -> Result<NodeRef, ValidationError> {
        self.add_node(id, NodeSpec::Switch(SwitchConfig::default()))
    }

    pub fn add_router(
        &mut self,
        id: impl Into<String>,
        config: RouterConfig,
    ) -> Result<NodeRef, ValidationError> {
        self.add_node(id, NodeSpec::Router(config))
    }

    /// Connects two nodes, creating one interface on each.
    ///
    /// Nothing is modified when an error is returned.
    pub fn add_link(
        &mut self,
        a: &str,
        b: &str,
        config: LinkConfig,
    ) -> Result<LinkRef, ValidationError> {
        let a_ref = self.require(a)?;
        let b_ref = self.require(b)?;

        if a_ref == b_ref {
            return Err(ValidationError::SelfLoop(a.to_string()));
        }

        config.shaping.validate()?;

        let a_intf = self.plan_interface(a_ref, &config.a)?;
        let b_intf = self.plan_interface(b_ref, &config.b)?;

        let link = LinkRef(self.links.len());
        let a_end = self.attach(a_ref, a_intf, config.shaping, link);
        let b_end = self.attach(b_ref, b_intf, config.shaping, link);
        self.links.push(Link { a: a_end, b: b_end });

        Ok(link)
    }

    /// Computes the name and address of the next interface of `node` without attaching it.
    fn plan_interface(
        &self,
        node: NodeRef,
        endpoint: &Endpoint,
    ) -> Result<(String, Option<InterfaceAddress>), ValidationError> {
        let node = &self.nodes[node.0];

        let name = match &endpoint.name {
            Some(name) => name.clone(),
            None => format!("{}-eth{}", node.id, node.next_port),
        };

        if name.is_empty() || name.len() > MAX_INTERFACE_NAME_LEN {
            return Err(ValidationError::InterfaceNameTooLong(name));
        }

        if node.interface_named(&name).is_some() {
            return Err(ValidationError::InterfaceNameConflict { node: node.id.clone(), name });
        }

        let address = endpoint
            .address
            .or_else(|| if node.interfaces.is_empty() { node.spec.ip() } else { None });

        Ok((name, address))
    }

    fn attach(
        &mut self,
        node: NodeRef,
        (name, address): (String, Option<InterfaceAddress>),
        shaping: LinkShaping,
        link: LinkRef,
    ) -> InterfaceRef {
        let node_data = &mut self.nodes[node.0];
        let index = node_data.interfaces.len();

        node_data.next_port += 1;
        node_data.interfaces.push(Interface { name, address, shaping, link });

        InterfaceRef { node, index }
    }

    fn require(&self, id: &str) -> Result<NodeRef, ValidationError> {
        self.node_ref(id).ok_or_else(|| ValidationError::UnknownNode(id.to_string()))
    }

    pub fn node_ref(&self, id: &str) -> Option<NodeRef> {
        self.index.get(id).copied()
    }

    pub fn node(&self, node: NodeRef) -> &Node {
        &self.nodes[node.0]
    }

    /// Looks up a node by id, failing with [`ValidationError::UnknownNode`].
    pub fn node_by_id(&self, id: &str) -> Result<(NodeRef, &Node), ValidationError> {
        let node_ref = self.require(id)?;
        Ok((node_ref, self.node(node_ref)))
    }

    /// Iterates over all nodes in insertion order.
    pub fn nodes(&self) -> impl Iterator<Item = (NodeRef, &Node)> + '_ {
        self.nodes.iter().enumerate().map(|(i, n)| (NodeRef(i), n))
    }

    /// Iterates over all links in insertion order.
    pub fn links(&self) -> impl Iterator<Item = (LinkRef, &Link)> + '_ {
        self.links.iter().enumerate().map(|(i, l)| (LinkRef(i), l))
    }

    pub fn link(&self, link: LinkRef) -> Option<&Link> {
        self.links.get(link.0)
    }

    /// Returns the first link between the two nodes, in either direction.
    pub fn link_between(&self, a: &str, b: &str) -> Result<LinkRef, ValidationError> {
        let a_ref = self.require(a)?;
        let b_ref = self.require(b)?;

        self.links()
            .find(|(_, l)| {
                (l.a.node == a_ref && l.b.node == b_ref) || (l.a.node == b_ref && l.b.node == a_ref)
            })
            .map(|(r, _)| r)
            .ok_or_else(|| ValidationError::NoLink(a.to_string(), b.to_string()))
    }

    pub fn interface(&self, interface: InterfaceRef) -> Option<&Interface> {
        self.nodes.get(interface.node.0)?.interfaces.get(interface.index)
    }

    pub(crate) fn interface_mut(&mut self, interface: InterfaceRef) -> Option<&mut Interface> {
        self.nodes.get_mut(interface.node.0)?.interfaces.get_mut(interface.index)
    }

    /// Iterates over the interfaces of `node` together with their references.
    pub fn interfaces_of(
        &self,
        node: NodeRef,
    ) -> impl Iterator<Item = (InterfaceRef, &Interface)> + '_ {
        self.nodes[node.0]
            .interfaces
            .iter()
            .enumerate()
            .map(move |(index, i)| (InterfaceRef { node, index }, i))
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn link_count(&self) -> usize {
        self.links.len()
    }
}
