//! # Control-Plane Configurator
//!
//! Everything that happens to a wired topology before and during the interactive session:
//! forwarding toggles, static routes, link shaping, terminals and routing table dumps.
//!
//! The configurator never computes paths. It validates and installs the
//! `(destination, next hop)` pairs it is given, and keeps a copy of every installed route so
//! that [`trace`] can replay forwarding decisions without asking the host.

pub mod trace;

use std::net::Ipv4Addr;

use rustc_hash::FxHashMap;
use tracing::Instrument as _;

use crate::{
    command::{self, Backend, Cmd},
    error::{Error, ValidationError},
    fabric::{Fabric, InterfaceHandle},
    ip::Subnet,
    netem::{LinkShaping, Netem},
    runtime::{NodeRuntime, RuntimeHandle, Runtimes},
    topology::{LinkRef, NodeKind, NodeRef, Topology},
};

pub use trace::RouteTable;

/// A terminal spawned inside a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalHandle {
    pub node: String,
    /// Process id of the terminal, when the backend knows it.
    pub pid: Option<u32>,
}

/// Installs `shaping` on one interface, or removes its qdisc when the shaping is unimpaired.
async fn shape_interface<B: Backend>(
    backend: &B,
    end: &InterfaceHandle,
    shaping: &LinkShaping,
) -> Result<(), command::Error> {
    if shaping.is_unimpaired() {
        let cmd = Netem::clear(&end.name).in_namespace(end.namespace.clone());
        let output = backend.output(&cmd).await?;
        if !output.success() {
            tracing::debug!(stderr = output.stderr.trim(), "no qdisc to remove");
        }
    } else {
        let cmd = Netem::from_shaping(end.name.clone(), shaping).build().in_namespace(end.namespace.clone());
        backend.run(&cmd).await?;
    }

    Ok(())
}

fn handle<'a>(
    topology: &Topology,
    runtimes: &'a Runtimes,
    node: NodeRef,
) -> Result<&'a RuntimeHandle, ValidationError> {
    runtimes
        .get(node)
        .ok_or_else(|| ValidationError::NotInstantiated(topology.node(node).id().to_string()))
}

#[derive(Debug, Default)]
pub struct Configurator {
    routes: FxHashMap<NodeRef, RouteTable>,
}

impl Configurator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enables or disables IPv4 forwarding on a router.
    pub async fn set_forwarding<B: Backend>(
        &self,
        runtime: &NodeRuntime<B>,
        topology: &Topology,
        runtimes: &mut Runtimes,
        node: NodeRef,
        enabled: bool,
    ) -> Result<(), Error> {
        if topology.node(node).kind() != NodeKind::Router {
            return Err(ValidationError::NotARouter(topology.node(node).id().to_string()).into());
        }

        let id = topology.node(node).id().to_string();
        let handle = runtimes.get_mut(node).ok_or(ValidationError::NotInstantiated(id))?;
        runtime.set_forwarding(handle, enabled).await
    }

    /// Installs a static route on a router.
    ///
    /// Returns `false` if the identical route was already installed, in which case no command
    /// is issued.
    pub async fn add_route<B: Backend>(
        &mut self,
        backend: &B,
        topology: &Topology,
        runtimes: &Runtimes,
        node: NodeRef,
        destination: Subnet,
        next_hop: Ipv4Addr,
    ) -> Result<bool, Error> {
        let data = topology.node(node);
        let id = data.id().to_string();

        if data.kind() != NodeKind::Router {
            return Err(ValidationError::NotARouter(id).into());
        }

        match self.routes.get(&node).and_then(|t| t.get(&destination)) {
            Some(existing) if *existing == next_hop => {
                tracing::debug!(node = %id, %destination, %next_hop, "route already installed");
                return Ok(false);
            }
            Some(existing) => {
                return Err(ValidationError::ConflictingRoute {
                    node: id,
                    destination,
                    existing: *existing,
                    requested: next_hop,
                }
                .into());
            }
            None => {}
        }

        let on_link = data.addresses().any(|a| a.subnet().contains(next_hop));
        let own = data.addresses().any(|a| a.address() == next_hop);
        if !on_link || own {
            return Err(ValidationError::InvalidNextHop { node: id, next_hop }.into());
        }

        let runtime = handle(topology, runtimes, node)?;
        if runtime.forwarding != Some(true) {
            return Err(ValidationError::ForwardingDisabled(id).into());
        }

        let cmd = Cmd::new([
            "ip".to_string(),
            "route".to_string(),
            "add".to_string(),
            destination.to_string(),
            "via".to_string(),
            next_hop.to_string(),
        ]);
        backend.run(&runtime.scope(cmd)).await?;

        tracing::info!(node = %id, %destination, %next_hop, "route installed");
        self.routes.entry(node).or_default().insert(destination, next_hop);

        Ok(true)
    }

    /// Applies `shaping` to both interfaces of a wired link and records it in the model.
    ///
    /// Unimpaired shaping removes the qdisc instead. If the second interface fails, the first
    /// one is put back to the shaping it had before, so the link never ends up asymmetric.
    pub async fn apply_link_shaping<B: Backend>(
        &self,
        backend: &B,
        topology: &mut Topology,
        fabric: &Fabric,
        link: LinkRef,
        shaping: LinkShaping,
    ) -> Result<(), Error> {
        shaping.validate()?;

        let (a, b) = fabric.handles(link).ok_or(ValidationError::NotWired(link))?;
        let previous = topology.interface(a.interface).map(|i| i.shaping).unwrap_or_default();
        let span = tracing::debug_span!("apply_link_shaping", %link, ?shaping);

        async {
            shape_interface(backend, a, &shaping).await?;

            if let Err(e) = shape_interface(backend, b, &shaping).await {
                if let Err(restore) = shape_interface(backend, a, &previous).await {
                    tracing::warn!(?restore, interface = %a.name, "failed to restore previous shaping");
                }
                return Err(e);
            }

            Ok::<_, command::Error>(())
        }
        .instrument(span)
        .await?;

        for end in [a.interface, b.interface] {
            if let Some(interface) = topology.interface_mut(end) {
                interface.shaping = shaping;
            }
        }

        tracing::info!(%link, loss = shaping.loss, "link shaping applied");

        Ok(())
    }

    /// Spawns `terminal` inside the namespace of `node`.
    pub fn launch_interactive<B: Backend>(
        &self,
        backend: &B,
        topology: &Topology,
        runtimes: &Runtimes,
        node: NodeRef,
        terminal: &[String],
    ) -> Result<TerminalHandle, Error> {
        let runtime = handle(topology, runtimes, node)?;

        let cmd = runtime.scope(Cmd::new(terminal.iter().cloned()));
        let pid = backend.spawn(&cmd)?;

        tracing::info!(node = %runtime.id, ?pid, "terminal launched");
        Ok(TerminalHandle { node: runtime.id.clone(), pid })
    }

    /// Returns the kernel routing table of `node`, as printed by `ip route show`.
    pub async fn routing_table<B: Backend>(
        &self,
        backend: &B,
        topology: &Topology,
        runtimes: &Runtimes,
        node: NodeRef,
    ) -> Result<String, Error> {
        let runtime = handle(topology, runtimes, node)?;
        let output = backend.run(&runtime.scope(Cmd::by_str("ip route show"))).await?;
        Ok(output.stdout)
    }

    /// The static routes installed on `node`.
    pub fn routes(&self, node: NodeRef) -> Option<&RouteTable> {
        self.routes.get(&node)
    }

    /// Traces the forwarding path from `src` to `dst` through the installed routes.
    pub fn trace(
        &self,
        topology: &Topology,
        runtimes: &Runtimes,
        src: NodeRef,
        dst: Ipv4Addr,
    ) -> Result<Vec<NodeRef>, ValidationError> {
        let forwarding = |node: NodeRef| runtimes.get(node).map_or(true, |h| h.forwarding != Some(false));
        trace::trace(topology, &self.routes, forwarding, src, dst)
    }

    /// Forgets installed routes. They disappear with the namespaces.
    pub fn clear(&mut self) {
        self.routes.clear();
    }
}
