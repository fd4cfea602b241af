//! # Link Fabric
//!
//! Turns declared links into veth pairs between node namespaces.
//!
//! ```text
//!        host namespace                     tl-{id}-h1          tl-{id}-s1
//!  ┌──────────────────────────┐         ┌──────────────┐   ┌─────────────────┐
//!  │ tv{id}x0 ══ veth ══ tv{id}x1 ───▶  │ h1-eth0      │   │ s1-eth1 ─▶ br0  │
//!  └──────────────────────────┘         └──────────────┘   └─────────────────┘
//! ```
//!
//! Both ends are created in the host namespace under temporary names handed out by the
//! [`NameAllocator`], moved into their endpoint namespaces and only then renamed to their model
//! names. Model names can repeat across nodes, temporary names never do.

use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::Instrument as _;

use crate::{
    command::{self, Backend, Cmd},
    error::{Error, ValidationError},
    ip::InterfaceAddress,
    runtime::{Runtimes, BRIDGE_NAME},
    topology::{InterfaceRef, LinkRef, NodeKind, NodeRef, Topology},
};

/// Prefix of the temporary veth names.
pub const TEMP_PREFIX: &str = "tv";

/// The single authority for temporary interface names.
///
/// Format: `tv{sim_id:04x}x{n:x}`, at most 15 characters.
#[derive(Debug)]
pub struct NameAllocator {
    sim_id: u16,
    next: Mutex<u32>,
}

impl NameAllocator {
    pub const fn new(sim_id: u16) -> Self {
        Self { sim_id, next: Mutex::new(0) }
    }

    pub fn allocate(&self) -> String {
        let mut next = self.next.lock();
        let n = *next;
        *next = next.wrapping_add(1);
        format!("{TEMP_PREFIX}{:04x}x{n:x}", self.sim_id)
    }
}

/// A wired interface inside its namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceHandle {
    pub interface: InterfaceRef,
    pub namespace: String,
    pub name: String,
}

/// One end of a link about to be wired.
#[derive(Debug, Clone)]
struct EndPlan {
    handle: InterfaceHandle,
    temp: String,
    address: Option<InterfaceAddress>,
    enslave: bool,
}

/// Everything needed to wire a link, resolved before any command runs.
#[derive(Debug, Clone)]
pub struct WirePlan {
    link: LinkRef,
    ends: [EndPlan; 2],
}

impl WirePlan {
    pub const fn link(&self) -> LinkRef {
        self.link
    }
}

#[derive(Debug)]
pub struct Fabric {
    allocator: NameAllocator,
    wired: FxHashMap<LinkRef, (InterfaceHandle, InterfaceHandle)>,
    by_interface: FxHashMap<InterfaceRef, LinkRef>,
    attached: FxHashMap<NodeRef, FxHashSet<String>>,
    pending: FxHashSet<LinkRef>,
}

impl Fabric {
    pub fn new(sim_id: u16) -> Self {
        Self {
            allocator: NameAllocator::new(sim_id),
            wired: FxHashMap::default(),
            by_interface: FxHashMap::default(),
            attached: FxHashMap::default(),
            pending: FxHashSet::default(),
        }
    }

    /// Validates that `link` can be wired and reserves its interface names.
    ///
    /// Fails with [`ValidationError::AlreadyWired`] for a link that is wired or being wired, and
    /// with [`ValidationError::InterfaceNameConflict`] if a name is already attached on its node.
    pub fn reserve(
        &mut self,
        topology: &Topology,
        runtimes: &Runtimes,
        link: LinkRef,
    ) -> Result<WirePlan, ValidationError> {
        if self.wired.contains_key(&link) || self.pending.contains(&link) {
            return Err(ValidationError::AlreadyWired(link));
        }

        let declared = topology.link(link).ok_or(ValidationError::UnknownLink(link))?;

        let mut ends = Vec::with_capacity(2);
        for end in [declared.a, declared.b] {
            let node = topology.node(end.node);
            let interface = topology.interface(end).ok_or(ValidationError::UnknownLink(link))?;
            let runtime = runtimes
                .get(end.node)
                .ok_or_else(|| ValidationError::NotInstantiated(node.id().to_string()))?;

            let taken = self.attached.get(&end.node).is_some_and(|s| s.contains(&interface.name));
            if taken {
                return Err(ValidationError::InterfaceNameConflict {
                    node: node.id().to_string(),
                    name: interface.name.clone(),
                });
            }

            ends.push((end, runtime.namespace.clone(), interface.name.clone(), interface.address, node.kind()));
        }

        let ends = ends.into_iter().map(|(interface, namespace, name, address, kind)| {
            self.attached.entry(interface.node).or_default().insert(name.clone());
            EndPlan {
                handle: InterfaceHandle { interface, namespace, name },
                temp: self.allocator.allocate(),
                address,
                enslave: kind == NodeKind::Switch,
            }
        });
        let [a, b]: [EndPlan; 2] = ends
            .collect::<Vec<_>>()
            .try_into()
            .map_err(|_| ValidationError::UnknownLink(link))?;

        self.pending.insert(link);
        Ok(WirePlan { link, ends: [a, b] })
    }

    /// Runs the commands of a reserved plan.
    ///
    /// On failure the veth pair is deleted again, best effort. Deleting either end removes its
    /// peer, so cleanup stops at the first deletion that succeeds.
    pub async fn execute<B: Backend>(backend: &B, plan: &WirePlan) -> command::Result<()> {
        let [a, b] = &plan.ends;
        let span = tracing::debug_span!(
            "wire",
            link = %plan.link,
            a = %a.handle.name,
            b = %b.handle.name,
        );

        async move {
            let create = Cmd::new([
                "ip", "link", "add", &a.temp, "type", "veth", "peer", "name", &b.temp,
            ]);
            backend.run(&create).await?;

            let result = async {
                for end in [a, b] {
                    for cmd in Self::end_commands(end) {
                        backend.run(&cmd).await?;
                    }
                }
                Ok::<_, command::Error>(())
            }
            .await;

            if let Err(e) = result {
                tracing::debug!(?e, "failed to wire link, deleting veth pair");

                let deletions = [a, b].into_iter().flat_map(|end| {
                    [
                        Cmd::new(["ip", "link", "del", &end.temp]),
                        Cmd::new(["ip", "link", "del", &end.handle.name])
                            .in_namespace(end.handle.namespace.clone()),
                    ]
                });

                let mut deleted = false;
                for del in deletions {
                    match backend.output(&del).await {
                        Ok(output) if output.success() => {
                            deleted = true;
                            break;
                        }
                        Ok(output) => tracing::debug!(%del, stderr = output.stderr.trim(), "veth end not found"),
                        Err(cleanup) => tracing::warn!(?cleanup, %del, "failed to run veth cleanup"),
                    }
                }

                if !deleted {
                    tracing::warn!("could not delete the veth pair, it stays until its namespaces are removed");
                }
                return Err(e);
            }

            Ok(())
        }
        .instrument(span)
        .await
    }

    fn end_commands(end: &EndPlan) -> Vec<Cmd> {
        let ns = end.handle.namespace.as_str();
        let name = end.handle.name.as_str();

        let mut cmds = vec![
            Cmd::new(["ip", "link", "set", &end.temp, "netns", ns]),
            Cmd::new(["ip", "link", "set", &end.temp, "name", name]).in_namespace(ns),
        ];

        if let Some(address) = end.address {
            cmds.push(Cmd::new(["ip", "addr", "add", &address.to_string(), "dev", name]).in_namespace(ns));
        }

        if end.enslave {
            cmds.push(Cmd::new(["ip", "link", "set", name, "master", BRIDGE_NAME]).in_namespace(ns));
        }

        cmds.push(Cmd::new(["ip", "link", "set", name, "up"]).in_namespace(ns));
        cmds
    }

    /// Marks a successfully executed plan as wired.
    pub fn commit(&mut self, plan: WirePlan) -> (InterfaceHandle, InterfaceHandle) {
        let [a, b] = plan.ends;
        self.pending.remove(&plan.link);
        self.by_interface.insert(a.handle.interface, plan.link);
        self.by_interface.insert(b.handle.interface, plan.link);

        let handles = (a.handle, b.handle);
        self.wired.insert(plan.link, handles.clone());
        handles
    }

    /// Drops the reservation of a plan that failed to execute.
    pub fn release(&mut self, plan: WirePlan) {
        self.pending.remove(&plan.link);
        for end in plan.ends {
            if let Some(names) = self.attached.get_mut(&end.handle.interface.node) {
                names.remove(&end.handle.name);
            }
        }
    }

    /// Wires a single link.
    pub async fn wire<B: Backend>(
        &mut self,
        backend: &Arc<B>,
        topology: &Topology,
        runtimes: &Runtimes,
        link: LinkRef,
    ) -> Result<(InterfaceHandle, InterfaceHandle), Error> {
        let plan = self.reserve(topology, runtimes, link)?;

        match Self::execute(backend.as_ref(), &plan).await {
            Ok(()) => Ok(self.commit(plan)),
            Err(e) => {
                self.release(plan);
                Err(e.into())
            }
        }
    }

    pub fn wired_count(&self) -> usize {
        self.wired.len()
    }

    pub fn is_wired(&self, link: LinkRef) -> bool {
        self.wired.contains_key(&link)
    }

    /// The wired link an interface belongs to.
    pub fn link_of(&self, interface: InterfaceRef) -> Option<LinkRef> {
        self.by_interface.get(&interface).copied()
    }

    pub fn handles(&self, link: LinkRef) -> Option<&(InterfaceHandle, InterfaceHandle)> {
        self.wired.get(&link)
    }

    /// Forgets every wired link. Their devices disappear with the namespaces.
    pub fn clear(&mut self) {
        self.wired.clear();
        self.by_interface.clear();
        self.attached.clear();
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        command::RecordingBackend,
        runtime::NodeRuntime,
        topology::{HostConfig, LinkConfig},
    };

    async fn setup(backend: &Arc<RecordingBackend>) -> (Topology, Runtimes) {
        let mut topo = Topology::new();
        topo.add_host("h1", HostConfig { ip: Some("10.0.0.1/8".parse().unwrap()), ..Default::default() })
            .unwrap();
        topo.add_switch("s1").unwrap();
        topo.add_link("h1", "s1", LinkConfig::default()).unwrap();

        let runtime = NodeRuntime::new(Arc::clone(backend), 1);
        let mut runtimes = Runtimes::default();
        for (node_ref, node) in topo.nodes() {
            runtimes.insert(runtime.instantiate(node_ref, node).await.unwrap());
        }
        backend.clear();

        (topo, runtimes)
    }

    #[test]
    fn allocator_names_fit_ifnamsiz() {
        let allocator = NameAllocator::new(0xffff);
        assert_eq!(allocator.allocate(), "tvffffx0");
        assert_eq!(allocator.allocate(), "tvffffx1");

        *allocator.next.lock() = u32::MAX;
        let name = allocator.allocate();
        assert_eq!(name, "tvffffxffffffff");
        assert!(name.len() <= 15);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn wire_creates_moves_and_renames() {
        let _ = tracing_subscriber::fmt::try_init();

        let backend = Arc::new(RecordingBackend::new());
        let (topo, runtimes) = setup(&backend).await;
        let mut fabric = Fabric::new(1);

        let link = topo.link_between("h1", "s1").unwrap();
        let (a, b) = fabric.wire(&backend, &topo, &runtimes, link).await.unwrap();
        assert_eq!(a.name, "h1-eth0");
        assert_eq!(b.name, "s1-eth1");

        assert_eq!(
            backend.rendered(),
            [
                "ip link add tv0001x0 type veth peer name tv0001x1",
                "ip link set tv0001x0 netns tl-0001-h1",
                "ip netns exec tl-0001-h1 ip link set tv0001x0 name h1-eth0",
                "ip netns exec tl-0001-h1 ip addr add 10.0.0.1/8 dev h1-eth0",
                "ip netns exec tl-0001-h1 ip link set h1-eth0 up",
                "ip link set tv0001x1 netns tl-0001-s1",
                "ip netns exec tl-0001-s1 ip link set tv0001x1 name s1-eth1",
                "ip netns exec tl-0001-s1 ip link set s1-eth1 master br0",
                "ip netns exec tl-0001-s1 ip link set s1-eth1 up",
            ]
        );

        assert_eq!(fabric.wired_count(), 1);
        assert!(fabric.is_wired(link));
        assert_eq!(fabric.link_of(a.interface), Some(link));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn second_wire_is_rejected_before_any_command() {
        let backend = Arc::new(RecordingBackend::new());
        let (topo, runtimes) = setup(&backend).await;
        let mut fabric = Fabric::new(1);

        let link = topo.link_between("h1", "s1").unwrap();
        fabric.wire(&backend, &topo, &runtimes, link).await.unwrap();
        backend.clear();

        let err = fabric.wire(&backend, &topo, &runtimes, link).await.unwrap_err();
        assert!(matches!(err, Error::Validation(ValidationError::AlreadyWired(l)) if l == link));
        assert!(backend.commands().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failed_wire_releases_reservation() {
        let backend = Arc::new(RecordingBackend::new());
        let (topo, runtimes) = setup(&backend).await;
        let mut fabric = Fabric::new(1);
        backend.fail_on("master br0");

        let link = topo.link_between("h1", "s1").unwrap();
        assert!(matches!(
            fabric.wire(&backend, &topo, &runtimes, link).await,
            Err(Error::Resource(_))
        ));
        assert!(!fabric.is_wired(link));
        assert!(backend.rendered().iter().any(|c| c == "ip link del tv0001x0"));

        // The link can be retried with fresh temporary names.
        let backend_ok = Arc::new(RecordingBackend::new());
        let (a, _) = fabric.wire(&backend_ok, &topo, &runtimes, link).await.unwrap();
        assert_eq!(a.name, "h1-eth0");
        assert_eq!(backend_ok.rendered()[0], "ip link add tv0001x2 type veth peer name tv0001x3");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cleanup_failure_keeps_the_wiring_error() {
        let _ = tracing_subscriber::fmt::try_init();

        let backend = Arc::new(RecordingBackend::new());
        let (topo, runtimes) = setup(&backend).await;
        let mut fabric = Fabric::new(1);
        backend.fail_on("master br0");
        backend.fail_on("link del");

        let link = topo.link_between("h1", "s1").unwrap();
        let err = fabric.wire(&backend, &topo, &runtimes, link).await.unwrap_err();
        assert!(err.to_string().contains("master br0"), "{err}");

        let deletions: Vec<_> = backend.rendered().into_iter().filter(|c| c.contains("link del")).collect();
        assert_eq!(
            deletions,
            [
                "ip link del tv0001x0",
                "ip netns exec tl-0001-h1 ip link del h1-eth0",
                "ip link del tv0001x1",
                "ip netns exec tl-0001-s1 ip link del s1-eth1",
            ]
        );
        assert!(!fabric.is_wired(link));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn attached_interface_name_is_rejected() {
        let backend = Arc::new(RecordingBackend::new());
        let (topo, runtimes) = setup(&backend).await;
        let mut fabric = Fabric::new(1);

        let link = topo.link_between("h1", "s1").unwrap();
        let h1 = topo.node_ref("h1").unwrap();
        fabric.attached.entry(h1).or_default().insert("h1-eth0".to_string());

        let err = fabric.reserve(&topo, &runtimes, link).unwrap_err();
        assert!(matches!(
            err,
            ValidationError::InterfaceNameConflict { ref node, ref name } if node == "h1" && name == "h1-eth0"
        ));
        assert!(!fabric.pending.contains(&link));
        assert!(backend.commands().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn link_of_another_topology_is_unknown() {
        let backend = Arc::new(RecordingBackend::new());
        let (topo, runtimes) = setup(&backend).await;
        let mut fabric = Fabric::new(1);

        let mut bigger = Topology::new();
        bigger.add_host("h1", HostConfig::default()).unwrap();
        bigger.add_host("h2", HostConfig::default()).unwrap();
        bigger.add_switch("s1").unwrap();
        bigger.add_link("h1", "s1", LinkConfig::default()).unwrap();
        let foreign = bigger.add_link("h2", "s1", LinkConfig::default()).unwrap();

        let err = fabric.reserve(&topo, &runtimes, foreign).unwrap_err();
        assert!(matches!(err, ValidationError::UnknownLink(l) if l == foreign));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unknown_runtime_is_rejected() {
        let backend = Arc::new(RecordingBackend::new());
        let (topo, _) = setup(&backend).await;
        let mut fabric = Fabric::new(1);

        let link = topo.link_between("h1", "s1").unwrap();
        let err = fabric.reserve(&topo, &Runtimes::default(), link).unwrap_err();
        assert!(matches!(err, ValidationError::NotInstantiated(id) if id == "h1"));
    }
}
