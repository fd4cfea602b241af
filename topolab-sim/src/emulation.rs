//! The emulation: one scenario realized on the host, from namespaces to interactive session.
//!
//! [`Emulation`] owns the topology model together with the state of every layer built on top
//! of it (node runtimes, wired links, installed routes) and drives the run through its
//! [`Phase`]s. Whatever happens, [`Emulation::teardown`] releases everything that was created,
//! and does so only once.

use std::{net::Ipv4Addr, sync::Arc};

use futures::future::join_all;

use crate::{
    command::{Backend, Output},
    control::{Configurator, TerminalHandle},
    error::{Error, ValidationError},
    fabric::Fabric,
    ip::Subnet,
    netem::LinkShaping,
    runtime::{NodeRuntime, RuntimeHandle, Runtimes},
    scenario::{Action, Phase, Scenario},
    shutdown::Shutdown,
    topology::{LinkRef, NodeRef, Topology},
};

/// Process level configuration of an emulation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmulationConfig {
    /// Identifier embedded in namespace and device names so that concurrent runs don't collide.
    pub sim_id: u16,
    /// Terminal program and arguments spawned by terminal actions.
    pub terminal: Vec<String>,
    /// Whether terminal actions spawn anything.
    pub launch_terminals: bool,
    /// Prefix host commands with `sudo`.
    pub sudo: bool,
}

impl Default for EmulationConfig {
    fn default() -> Self {
        Self {
            // Truncation is fine, the id only has to differ between concurrent runs.
            sim_id: std::process::id() as u16,
            terminal: vec!["xterm".to_string()],
            launch_terminals: true,
            sudo: false,
        }
    }
}

#[derive(Debug)]
pub struct Emulation<B: Backend> {
    config: EmulationConfig,
    backend: Arc<B>,
    runtime: NodeRuntime<B>,
    scenario: String,
    topology: Topology,
    actions: Vec<Action>,
    runtimes: Runtimes,
    fabric: Fabric,
    control: Configurator,
    terminals: Vec<TerminalHandle>,
    phase: Phase,
}

impl<B: Backend> Emulation<B> {
    pub fn new(backend: Arc<B>, config: EmulationConfig) -> Self {
        Self {
            runtime: NodeRuntime::new(Arc::clone(&backend), config.sim_id),
            fabric: Fabric::new(config.sim_id),
            config,
            backend,
            scenario: String::new(),
            topology: Topology::new(),
            actions: Vec::new(),
            runtimes: Runtimes::default(),
            control: Configurator::new(),
            terminals: Vec::new(),
            phase: Phase::Unselected,
        }
    }

    /// Loads the selected scenario. Nothing is created on the host yet.
    pub fn load(&mut self, scenario: Scenario) -> Result<(), Error> {
        self.advance(Phase::TopologyBuilt)?;

        self.scenario = scenario.name;
        self.topology = scenario.topology;
        self.actions = scenario.actions;

        Ok(())
    }

    /// Wires and configures the loaded scenario. On failure, everything already created is
    /// torn down before the error is returned.
    pub async fn start(&mut self) -> Result<(), Error> {
        self.start_until(&Shutdown::new()).await.map(|_| ())
    }

    /// Like [`start`](Self::start), but stops between steps once `shutdown` is triggered.
    ///
    /// Wiring always runs to completion so that every namespace it creates is registered for
    /// teardown. Returns `false` if the start was interrupted; tearing down what was built is
    /// then up to the caller.
    pub async fn start_until(&mut self, shutdown: &Shutdown) -> Result<bool, Error> {
        let result = async {
            self.wire().await?;
            if shutdown.is_triggered() {
                return Ok(false);
            }
            self.configure_until(shutdown).await
        }
        .await;

        match &result {
            Err(e) => {
                tracing::error!(%e, "failed to start emulation, tearing down");
                self.teardown().await;
            }
            Ok(false) => tracing::warn!(phase = %self.phase, "start interrupted"),
            Ok(true) => {}
        }

        result
    }

    /// Instantiates every node, then wires every link, both concurrently.
    pub async fn wire(&mut self) -> Result<(), Error> {
        self.phase.transition(Phase::Wired)?;

        let instantiated = {
            let runtime = &self.runtime;
            join_all(self.topology.nodes().map(|(node_ref, node)| runtime.instantiate(node_ref, node)))
                .await
        };

        let mut first_error = None;
        for result in instantiated {
            match result {
                Ok(handle) => self.runtimes.insert(handle),
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        let links: Vec<LinkRef> = self.topology.links().map(|(r, _)| r).collect();
        let mut plans = Vec::with_capacity(links.len());
        for link in links {
            plans.push(self.fabric.reserve(&self.topology, &self.runtimes, link)?);
        }

        let executed = {
            let backend = self.backend.as_ref();
            join_all(plans.iter().map(|plan| Fabric::execute(backend, plan))).await
        };

        let mut first_error = None;
        for (plan, result) in plans.into_iter().zip(executed) {
            match result {
                Ok(()) => {
                    self.fabric.commit(plan);
                }
                Err(e) => {
                    self.fabric.release(plan);
                    first_error.get_or_insert(e);
                }
            }
        }
        if let Some(e) = first_error {
            return Err(e.into());
        }

        let shaped: Vec<(LinkRef, LinkShaping)> = self
            .topology
            .links()
            .filter_map(|(r, l)| self.topology.interface(l.a).map(|i| (r, i.shaping)))
            .filter(|(_, s)| !s.is_unimpaired())
            .collect();
        for (link, shaping) in shaped {
            self.control
                .apply_link_shaping(self.backend.as_ref(), &mut self.topology, &self.fabric, link, shaping)
                .await?;
        }

        for handle in self.runtimes.iter() {
            self.runtime.configure(handle, self.topology.node(handle.node)).await?;
        }

        self.advance(Phase::Wired)?;
        tracing::info!(
            nodes = self.runtimes.len(),
            links = self.fabric.wired_count(),
            "topology wired"
        );

        Ok(())
    }

    /// Runs the scenario actions in declaration order.
    pub async fn configure(&mut self) -> Result<(), Error> {
        self.configure_until(&Shutdown::new()).await.map(|_| ())
    }

    async fn configure_until(&mut self, shutdown: &Shutdown) -> Result<bool, Error> {
        self.phase.transition(Phase::Configured)?;

        let actions = self.actions.clone();
        for action in &actions {
            if shutdown.is_triggered() {
                return Ok(false);
            }
            tracing::debug!(%action, "applying action");
            self.apply(action).await?;
        }

        self.advance(Phase::Configured)?;
        Ok(true)
    }

    /// Applies a single control-plane action.
    pub async fn apply(&mut self, action: &Action) -> Result<(), Error> {
        match action {
            Action::SetForwarding { node, enabled } => self.set_forwarding(node, *enabled).await,
            Action::AddRoute { node, destination, next_hop } => {
                self.add_route(node, *destination, *next_hop).await.map(|_| ())
            }
            Action::ShapeLink { a, b, shaping } => self.shape_link(a, b, *shaping).await,
            Action::LaunchTerminal { node } => {
                if self.config.launch_terminals {
                    self.launch_terminal(node).map(|_| ())
                } else {
                    tracing::debug!(%node, "terminals disabled, skipping");
                    Ok(())
                }
            }
            Action::ShowRoutes { node } => {
                let table = self.routing_table(node).await?;
                tracing::info!("routing table of {node}:\n{}", table.trim_end());
                Ok(())
            }
        }
    }

    /// Hands the emulation over to the operator.
    pub fn enter_interactive(&mut self) -> Result<(), Error> {
        self.advance(Phase::Interactive)
    }

    /// Tears down every instantiated node in reverse creation order.
    ///
    /// Only the first call does anything; it returns `true` when it ran.
    pub async fn teardown(&mut self) -> bool {
        if self.phase == Phase::TornDown {
            return false;
        }

        let handles = self.runtimes.drain_reverse();
        let count = handles.len();
        let mut failures = 0;

        for handle in handles {
            let node = self.topology.node(handle.node);
            if !self.runtime.teardown(handle, node).await {
                failures += 1;
            }
        }

        self.fabric.clear();
        self.control.clear();
        self.phase = Phase::TornDown;

        if failures == 0 {
            tracing::info!(nodes = count, "emulation torn down");
        } else {
            tracing::warn!(nodes = count, failures, "emulation torn down with failures");
        }

        true
    }

    fn advance(&mut self, to: Phase) -> Result<(), Error> {
        let from = self.phase;
        self.phase = from.transition(to)?;
        tracing::info!(scenario = %self.scenario, %from, %to, "phase transition");
        Ok(())
    }

    fn node_ref(&self, id: &str) -> Result<NodeRef, ValidationError> {
        self.topology.node_ref(id).ok_or_else(|| ValidationError::UnknownNode(id.to_string()))
    }

    fn runtime_of(&self, id: &str) -> Result<&RuntimeHandle, ValidationError> {
        let node = self.node_ref(id)?;
        self.runtimes.get(node).ok_or_else(|| ValidationError::NotInstantiated(id.to_string()))
    }

    pub async fn set_forwarding(&mut self, node: &str, enabled: bool) -> Result<(), Error> {
        let node = self.node_ref(node)?;
        self.control
            .set_forwarding(&self.runtime, &self.topology, &mut self.runtimes, node, enabled)
            .await
    }

    /// Installs a static route. Returns `false` if it was already installed.
    pub async fn add_route(
        &mut self,
        node: &str,
        destination: Subnet,
        next_hop: Ipv4Addr,
    ) -> Result<bool, Error> {
        let node = self.node_ref(node)?;
        self.control
            .add_route(self.backend.as_ref(), &self.topology, &self.runtimes, node, destination, next_hop)
            .await
    }

    /// Shapes the link between nodes `a` and `b`.
    pub async fn shape_link(&mut self, a: &str, b: &str, shaping: LinkShaping) -> Result<(), Error> {
        let link = self.topology.link_between(a, b)?;
        self.control
            .apply_link_shaping(self.backend.as_ref(), &mut self.topology, &self.fabric, link, shaping)
            .await
    }

    pub fn launch_terminal(&mut self, node: &str) -> Result<TerminalHandle, Error> {
        let node = self.node_ref(node)?;
        let terminal = self.control.launch_interactive(
            self.backend.as_ref(),
            &self.topology,
            &self.runtimes,
            node,
            &self.config.terminal,
        )?;

        self.terminals.push(terminal.clone());
        Ok(terminal)
    }

    pub async fn routing_table(&self, node: &str) -> Result<String, Error> {
        let node = self.node_ref(node)?;
        self.control.routing_table(self.backend.as_ref(), &self.topology, &self.runtimes, node).await
    }

    /// Runs `argv` inside `node`.
    pub async fn execute(&self, node: &str, argv: &[String]) -> Result<Output, Error> {
        let handle = self.runtime_of(node)?;
        self.runtime.execute(handle, argv).await
    }

    /// Traces the path from `node` to `dst`, returning the ids of the nodes traversed.
    pub fn trace(&self, node: &str, dst: Ipv4Addr) -> Result<Vec<String>, Error> {
        let src = self.node_ref(node)?;
        let path = self.control.trace(&self.topology, &self.runtimes, src, dst)?;
        Ok(path.into_iter().map(|n| self.topology.node(n).id().to_string()).collect())
    }

    pub const fn phase(&self) -> Phase {
        self.phase
    }

    pub fn scenario(&self) -> &str {
        &self.scenario
    }

    pub const fn topology(&self) -> &Topology {
        &self.topology
    }

    pub const fn runtimes(&self) -> &Runtimes {
        &self.runtimes
    }

    pub const fn fabric(&self) -> &Fabric {
        &self.fabric
    }

    pub fn terminals(&self) -> &[TerminalHandle] {
        &self.terminals
    }
}

impl<B: Backend> Drop for Emulation<B> {
    fn drop(&mut self) {
        if !self.runtimes.is_empty() {
            tracing::warn!(
                nodes = self.runtimes.len(),
                "emulation dropped without teardown, namespaces are left behind"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        command::RecordingBackend,
        scenario::{Params, ScenarioRegistry},
    };

    fn config() -> EmulationConfig {
        EmulationConfig { sim_id: 1, ..Default::default() }
    }

    async fn started(
        name: &str,
        params: Params,
    ) -> (Arc<RecordingBackend>, Emulation<RecordingBackend>) {
        let backend = Arc::new(RecordingBackend::new());
        let mut emulation = Emulation::new(Arc::clone(&backend), config());
        let scenario = ScenarioRegistry::builtin().select(name, &params).unwrap();
        emulation.load(scenario).unwrap();
        emulation.start().await.unwrap();
        (backend, emulation)
    }

    fn namespaces_added(backend: &RecordingBackend) -> Vec<String> {
        backend
            .rendered()
            .into_iter()
            .filter_map(|c| c.strip_prefix("ip netns add ").map(str::to_string))
            .collect()
    }

    fn namespaces_deleted(backend: &RecordingBackend) -> Vec<String> {
        backend
            .rendered()
            .into_iter()
            .filter_map(|c| c.strip_prefix("ip netns del ").map(str::to_string))
            .collect()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn every_link_is_wired_once() {
        let _ = tracing_subscriber::fmt::try_init();

        for name in ["b", "routers"] {
            let (_, mut emulation) = started(name, Params::default()).await;
            let topology = emulation.topology();

            assert_eq!(emulation.fabric().wired_count(), topology.link_count());
            for (node_ref, _) in topology.nodes() {
                for (intf_ref, intf) in topology.interfaces_of(node_ref) {
                    assert_eq!(emulation.fabric().link_of(intf_ref), Some(intf.link));
                }
            }

            assert_eq!(emulation.phase(), Phase::Configured);
            emulation.teardown().await;
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn loss_only_on_backbone() {
        let _ = tracing_subscriber::fmt::try_init();

        let (backend, mut emulation) = started("d", Params { loss: Some(37.5) }).await;
        let topology = emulation.topology();

        let mut lossy = Vec::new();
        for (node_ref, node) in topology.nodes() {
            for (_, intf) in topology.interfaces_of(node_ref) {
                if intf.shaping.loss != 0.0 {
                    assert_eq!(intf.shaping.loss, 37.5);
                    lossy.push(format!("{}:{}", node.id(), intf.name));
                }
            }
        }
        assert_eq!(lossy, ["s1:s1-eth4", "s2:s2-eth2"]);

        let tc: Vec<_> = backend.rendered().into_iter().filter(|c| c.contains("netem")).collect();
        assert_eq!(
            tc,
            [
                "ip netns exec tl-0001-s1 tc qdisc replace dev s1-eth4 root netem loss 37.5%",
                "ip netns exec tl-0001-s2 tc qdisc replace dev s2-eth2 root netem loss 37.5%",
            ]
        );

        let spawned: Vec<_> = backend.spawned().iter().map(ToString::to_string).collect();
        assert_eq!(spawned, ["ip netns exec tl-0001-h1 xterm", "ip netns exec tl-0001-h4 xterm"]);

        emulation.teardown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn teardown_runs_once_in_reverse_order() {
        let (backend, mut emulation) = started("b", Params::default()).await;
        emulation.enter_interactive().unwrap();

        let added = namespaces_added(&backend);
        backend.clear();

        assert!(emulation.teardown().await);
        assert!(!emulation.teardown().await);
        assert_eq!(emulation.phase(), Phase::TornDown);

        let mut deleted = namespaces_deleted(&backend);
        deleted.reverse();
        assert_eq!(deleted, added);
        assert_eq!(backend.commands().len(), added.len());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failed_action_still_releases_every_namespace() {
        let _ = tracing_subscriber::fmt::try_init();

        let backend = Arc::new(RecordingBackend::new());
        backend.fail_on("ip route add 192.168.3.0/24 via 192.168.5.2");

        let mut emulation = Emulation::new(Arc::clone(&backend), config());
        emulation.load(ScenarioRegistry::builtin().select("routers", &Params::default()).unwrap()).unwrap();

        let err = emulation.start().await.unwrap_err();
        assert_eq!(err.exit_code(), 2);
        assert_eq!(emulation.phase(), Phase::TornDown);

        let mut added = namespaces_added(&backend);
        let mut deleted = namespaces_deleted(&backend);
        added.sort();
        deleted.sort();
        assert_eq!(added.len(), 15);
        assert_eq!(deleted, added);

        // Routers give forwarding back before their namespace goes away.
        let rendered = backend.rendered();
        let release = rendered.iter().position(|c| c == "ip netns exec tl-0001-ra sysctl -w net.ipv4.ip_forward=0");
        let delete = rendered.iter().position(|c| c == "ip netns del tl-0001-ra");
        assert!(release.unwrap() < delete.unwrap());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn shutdown_during_start_skips_actions_and_still_tears_down() {
        let _ = tracing_subscriber::fmt::try_init();

        let backend = Arc::new(RecordingBackend::new());
        let mut emulation = Emulation::new(Arc::clone(&backend), config());
        emulation.load(ScenarioRegistry::builtin().select("routers", &Params::default()).unwrap()).unwrap();

        let shutdown = Shutdown::new();
        shutdown.trigger();
        assert!(!emulation.start_until(&shutdown).await.unwrap());
        assert_eq!(emulation.phase(), Phase::Wired);

        // Host default routes belong to wiring, static routes are actions.
        let rendered = backend.rendered();
        assert!(rendered.iter().any(|c| c.ends_with("ip route add default via 192.168.1.1")));
        assert!(!rendered.iter().any(|c| c.contains("ip route add 192.168.")));

        assert!(emulation.teardown().await);
        let mut added = namespaces_added(&backend);
        let mut deleted = namespaces_deleted(&backend);
        added.sort();
        deleted.sort();
        assert_eq!(added.len(), 15);
        assert_eq!(deleted, added);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failed_namespace_creation_cleans_up_others() {
        let backend = Arc::new(RecordingBackend::new());
        backend.fail_on("ip netns add tl-0001-h3");

        let mut emulation = Emulation::new(Arc::clone(&backend), config());
        emulation.load(ScenarioRegistry::builtin().select("b", &Params::default()).unwrap()).unwrap();

        assert!(emulation.start().await.is_err());
        assert_eq!(namespaces_deleted(&backend).len(), 5);
        assert!(!namespaces_deleted(&backend).contains(&"tl-0001-h3".to_string()));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn triangle_host_pairs_trace_through_routers() {
        let (_, mut emulation) = started("routers", Params::default()).await;

        let hosts: Vec<(String, Ipv4Addr)> = emulation
            .topology()
            .nodes()
            .filter_map(|(_, n)| n.default_route().and(n.addresses().next()).map(|a| (n.id().to_string(), a.address())))
            .collect();
        assert_eq!(hosts.len(), 6);

        let mut pairs = 0;
        for (src, _) in &hosts {
            let (_, src_node) = emulation.topology().node_by_id(src).unwrap();
            let src_gateway = src_node.default_route().unwrap();

            for (dst, dst_addr) in &hosts {
                let (_, dst_node) = emulation.topology().node_by_id(dst).unwrap();
                if dst_node.default_route().unwrap() == src_gateway {
                    continue;
                }

                let path = emulation.trace(src, *dst_addr).unwrap();
                assert_eq!(path.first(), Some(src));
                assert_eq!(path.last(), Some(dst));
                assert_eq!(path.len(), 4, "{src} -> {dst}: {path:?}");
                assert!(path[1..3].iter().all(|n| n.starts_with('r')));
                pairs += 1;
            }
        }
        assert_eq!(pairs, 24);

        emulation.teardown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn phases_are_enforced() {
        let backend = Arc::new(RecordingBackend::new());
        let mut emulation = Emulation::new(Arc::clone(&backend), config());

        let err = emulation.wire().await.unwrap_err();
        assert!(matches!(err, Error::Validation(ValidationError::InvalidTransition { .. })));
        assert!(backend.commands().is_empty());

        emulation.load(ScenarioRegistry::builtin().select("c", &Params::default()).unwrap()).unwrap();
        assert!(emulation.configure().await.is_err());
        assert!(emulation.enter_interactive().is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn terminals_can_be_disabled() {
        let backend = Arc::new(RecordingBackend::new());
        let config = EmulationConfig { launch_terminals: false, ..config() };
        let mut emulation = Emulation::new(Arc::clone(&backend), config);
        emulation.load(ScenarioRegistry::builtin().select("c", &Params::default()).unwrap()).unwrap();
        emulation.start().await.unwrap();

        assert!(backend.spawned().is_empty());
        assert!(emulation.terminals().is_empty());
        emulation.teardown().await;
    }
}
