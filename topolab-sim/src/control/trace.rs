//! Model-level hop-by-hop forwarding.
//!
//! A trace never touches the host. It replays what the kernel would do with the routes the
//! emulation installed: every layer 3 node forwards either to a directly connected subnet, to
//! its default gateway (hosts) or to the next hop of its longest matching static route
//! (routers). Switches are transparent; their ports form a single layer 2 segment.

use std::{collections::BTreeMap, net::Ipv4Addr};

use rustc_hash::{FxHashMap, FxHashSet};

use crate::{
    error::ValidationError,
    ip::Subnet,
    topology::{InterfaceRef, NodeKind, NodeRef, Topology},
};

/// Maximum number of forwarding hops before a trace is declared a loop.
pub const MAX_HOPS: usize = 64;

/// Static routes of one router, keyed by destination.
pub type RouteTable = BTreeMap<Subnet, Ipv4Addr>;

/// Layer 2 segments of a topology: interfaces joined by links or by a switch bridge.
#[derive(Debug)]
struct Segments {
    slots: FxHashMap<InterfaceRef, usize>,
    parent: Vec<usize>,
}

impl Segments {
    fn build(topology: &Topology) -> Self {
        let mut segments = Self { slots: FxHashMap::default(), parent: Vec::new() };

        for (node_ref, node) in topology.nodes() {
            let mut first = None;
            for (intf_ref, _) in topology.interfaces_of(node_ref) {
                let slot = segments.slot(intf_ref);
                if node.kind() == NodeKind::Switch {
                    match first {
                        Some(first) => segments.union(first, slot),
                        None => first = Some(slot),
                    }
                }
            }
        }

        for (_, link) in topology.links() {
            let a = segments.slot(link.a);
            let b = segments.slot(link.b);
            segments.union(a, b);
        }

        segments
    }

    fn slot(&mut self, interface: InterfaceRef) -> usize {
        let next = self.parent.len();
        let slot = *self.slots.entry(interface).or_insert(next);
        if slot == next {
            self.parent.push(next);
        }
        slot
    }

    fn find(&self, mut slot: usize) -> usize {
        while self.parent[slot] != slot {
            slot = self.parent[slot];
        }
        slot
    }

    fn union(&mut self, a: usize, b: usize) {
        let (a, b) = (self.find(a), self.find(b));
        if a != b {
            self.parent[b] = a;
        }
    }

    fn same(&self, a: InterfaceRef, b: InterfaceRef) -> bool {
        match (self.slots.get(&a), self.slots.get(&b)) {
            (Some(&a), Some(&b)) => self.find(a) == self.find(b),
            _ => false,
        }
    }
}

/// Looks up the longest prefix route matching `dst`.
pub fn longest_match(table: &RouteTable, dst: Ipv4Addr) -> Option<(Subnet, Ipv4Addr)> {
    table
        .iter()
        .filter(|(subnet, _)| subnet.contains(dst))
        .max_by_key(|(subnet, _)| subnet.netmask())
        .map(|(subnet, next_hop)| (*subnet, *next_hop))
}

/// Returns the addressed interface of `node` whose subnet contains `addr`.
fn connected_interface(topology: &Topology, node: NodeRef, addr: Ipv4Addr) -> Option<InterfaceRef> {
    topology
        .interfaces_of(node)
        .find(|(_, i)| i.address.is_some_and(|a| a.subnet().contains(addr)))
        .map(|(r, _)| r)
}

/// Traces the forwarding path from `src` to `dst`.
///
/// Returns the layer 3 nodes visited, `src` first and the owner of `dst` last. `forwarding`
/// tells whether a router relays packets.
pub fn trace(
    topology: &Topology,
    routes: &FxHashMap<NodeRef, RouteTable>,
    forwarding: impl Fn(NodeRef) -> bool,
    src: NodeRef,
    dst: Ipv4Addr,
) -> Result<Vec<NodeRef>, ValidationError> {
    let src_id = topology.node(src).id().to_string();
    let unreachable = || ValidationError::Unreachable { from: src_id.clone(), to: dst };

    let segments = Segments::build(topology);
    let owners: FxHashMap<Ipv4Addr, InterfaceRef> = topology
        .nodes()
        .flat_map(|(node_ref, _)| topology.interfaces_of(node_ref))
        .filter_map(|(r, i)| i.address.map(|a| (a.address(), r)))
        .collect();

    let mut path = vec![src];
    let mut visited = FxHashSet::from_iter([src]);
    let mut current = src;

    for _ in 0..MAX_HOPS {
        let node = topology.node(current);

        if node.addresses().any(|a| a.address() == dst) {
            return Ok(path);
        }

        if current != src {
            let relays = node.kind() == NodeKind::Router && forwarding(current);
            if !relays {
                return Err(unreachable());
            }
        }

        let gateway = if connected_interface(topology, current, dst).is_some() {
            Some(dst)
        } else {
            match node.kind() {
                NodeKind::Host => node.default_route(),
                NodeKind::Router => {
                    routes.get(&current).and_then(|t| longest_match(t, dst)).map(|(_, nh)| nh)
                }
                NodeKind::Switch => None,
            }
        };
        let gateway = gateway.ok_or_else(unreachable)?;

        let egress = connected_interface(topology, current, gateway).ok_or_else(unreachable)?;
        let next = owners
            .get(&gateway)
            .filter(|owner| segments.same(egress, **owner))
            .map(|owner| owner.node)
            .ok_or_else(unreachable)?;

        if !visited.insert(next) {
            return Err(ValidationError::RoutingLoop { from: src_id, to: dst });
        }

        tracing::trace!(from = topology.node(current).id(), to = topology.node(next).id(), %gateway, "hop");
        path.push(next);
        current = next;
    }

    Err(ValidationError::RoutingLoop { from: src_id, to: dst })
}
