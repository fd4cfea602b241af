//! # Node Runtime
//!
//! Realizes each [`Node`] as its own Linux network namespace, named
//! `tl-{sim_id:04x}-{node}`. What happens inside the namespace depends on the node kind:
//!
//! - switches get a `br0` bridge every attached interface is enslaved to;
//! - routers acquire IPv4 forwarding when created and release it when torn down;
//! - hosts install their default route once their interfaces exist.

use std::sync::Arc;

use rustc_hash::FxHashMap;
use tracing::Instrument as _;

use crate::{
    command::{self, Backend, Cmd, Output},
    error::{Error, ResourceError, ValidationError},
    sysctl::{self, Ip, Protocol},
    topology::{HostConfig, Node, NodeKind, NodeRef, NodeSpec, RouterConfig, SwitchConfig},
};

/// Prefix for all network namespace names created by this crate.
pub const NAMESPACE_PREFIX: &str = "tl";

/// Name of the bridge device inside every switch namespace.
pub const BRIDGE_NAME: &str = "br0";

/// Returns the namespace name of node `id` in simulation `sim_id`.
///
/// Format: `tl-{sim_id:04x}-{id}` (e.g. `tl-a3f1-h1`).
pub fn namespace_name(sim_id: u16, id: &str) -> String {
    format!("{NAMESPACE_PREFIX}-{sim_id:04x}-{id}")
}

/// Kind-specific behavior of a node over its lifecycle.
///
/// Every method returns the commands to run inside the node's namespace.
pub trait NodeRole {
    /// Right after the namespace is created and its loopback is up.
    fn setup(&self) -> Vec<Cmd> {
        Vec::new()
    }

    /// Once every link of the topology is wired.
    fn configure(&self) -> Vec<Cmd> {
        Vec::new()
    }

    /// Before the namespace is deleted.
    fn release(&self) -> Vec<Cmd> {
        Vec::new()
    }
}

impl NodeRole for HostConfig {
    fn configure(&self) -> Vec<Cmd> {
        self.default_route
            .map(|gateway| {
                Cmd::new(["ip", "route", "add", "default", "via", &gateway.to_string()])
            })
            .into_iter()
            .collect()
    }
}

impl NodeRole for SwitchConfig {
    fn setup(&self) -> Vec<Cmd> {
        let mut cmds = vec![Cmd::new(["ip", "link", "add", BRIDGE_NAME, "type", "bridge"])];
        if self.stp {
            cmds.push(Cmd::new(["ip", "link", "set", BRIDGE_NAME, "type", "bridge", "stp_state", "1"]));
        }
        cmds.push(Cmd::new(["ip", "link", "set", BRIDGE_NAME, "up"]));
        cmds
    }
}

impl NodeRole for RouterConfig {
    fn setup(&self) -> Vec<Cmd> {
        vec![sysctl::write_command(Ip::Forwarding, Protocol::V4, "1")]
    }

    fn release(&self) -> Vec<Cmd> {
        vec![sysctl::write_command(Ip::Forwarding, Protocol::V4, "0")]
    }
}

impl NodeRole for NodeSpec {
    fn setup(&self) -> Vec<Cmd> {
        match self {
            Self::Host(c) => c.setup(),
            Self::Switch(c) => c.setup(),
            Self::Router(c) => c.setup(),
        }
    }

    fn configure(&self) -> Vec<Cmd> {
        match self {
            Self::Host(c) => c.configure(),
            Self::Switch(c) => c.configure(),
            Self::Router(c) => c.configure(),
        }
    }

    fn release(&self) -> Vec<Cmd> {
        match self {
            Self::Host(c) => c.release(),
            Self::Switch(c) => c.release(),
            Self::Router(c) => c.release(),
        }
    }
}

/// A live node: its namespace and runtime state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeHandle {
    pub node: NodeRef,
    pub id: String,
    pub namespace: String,
    pub kind: NodeKind,
    /// Whether IPv4 forwarding is enabled. `None` for nodes that are not routers.
    pub forwarding: Option<bool>,
}

impl RuntimeHandle {
    /// Scopes `cmd` to this node's namespace.
    pub fn scope(&self, cmd: Cmd) -> Cmd {
        cmd.in_namespace(self.namespace.clone())
    }
}

/// Creates, configures and deletes node namespaces through a [`Backend`].
#[derive(Debug)]
pub struct NodeRuntime<B> {
    backend: Arc<B>,
    sim_id: u16,
}

impl<B> Clone for NodeRuntime<B> {
    fn clone(&self) -> Self {
        Self { backend: Arc::clone(&self.backend), sim_id: self.sim_id }
    }
}

impl<B: Backend> NodeRuntime<B> {
    pub const fn new(backend: Arc<B>, sim_id: u16) -> Self {
        Self { backend, sim_id }
    }

    /// Creates the namespace of `node`, brings its loopback up and runs the role setup.
    ///
    /// If anything after the namespace creation fails, the namespace is deleted again before
    /// the error is returned.
    pub async fn instantiate(&self, node_ref: NodeRef, node: &Node) -> Result<RuntimeHandle, Error> {
        let namespace = namespace_name(self.sim_id, node.id());
        let span = tracing::debug_span!("instantiate", node = node.id(), %namespace);

        async move {
            let add = Cmd::new(["ip", "netns", "add", namespace.as_str()]);
            self.backend.run(&add).await.map_err(|source| ResourceError::NamespaceCreation {
                namespace: namespace.clone(),
                source,
            })?;

            let handle = RuntimeHandle {
                node: node_ref,
                id: node.id().to_string(),
                namespace,
                kind: node.kind(),
                forwarding: matches!(node.kind(), NodeKind::Router).then_some(true),
            };

            let mut setup = vec![Cmd::new(["ip", "link", "set", "lo", "up"])];
            setup.extend(node.spec().setup());

            if let Err(e) = self.run_all(&handle, setup).await {
                tracing::debug!(?e, "node setup failed, deleting namespace");
                self.delete_namespace(&handle.namespace).await;
                return Err(e.into());
            }

            tracing::debug!("node instantiated");
            Ok(handle)
        }
        .instrument(span)
        .await
    }

    /// Runs the role configuration of `node`, e.g. the default route of a host.
    pub async fn configure(&self, handle: &RuntimeHandle, node: &Node) -> Result<(), Error> {
        self.run_all(handle, node.spec().configure()).await?;
        Ok(())
    }

    /// Enables or disables IPv4 forwarding on a router.
    pub async fn set_forwarding(
        &self,
        handle: &mut RuntimeHandle,
        enabled: bool,
    ) -> Result<(), Error> {
        if handle.forwarding.is_none() {
            return Err(ValidationError::NotARouter(handle.id.clone()).into());
        }

        let value = if enabled { "1" } else { "0" };
        let cmd = handle.scope(sysctl::write_command(Ip::Forwarding, Protocol::V4, value));
        self.backend.run(&cmd).await?;

        handle.forwarding = Some(enabled);
        tracing::debug!(node = %handle.id, enabled, "forwarding updated");

        Ok(())
    }

    /// Runs `argv` inside the node and returns its output, whatever the exit status.
    pub async fn execute(&self, handle: &RuntimeHandle, argv: &[String]) -> Result<Output, Error> {
        let cmd = handle.scope(Cmd::new(argv.iter().cloned()));
        Ok(self.backend.output(&cmd).await?)
    }

    /// Releases the node resources: role release first (forwarding on routers), then the
    /// namespace itself. Best effort: failures are logged and the namespace is always deleted.
    ///
    /// Returns `true` if every step succeeded.
    pub async fn teardown(&self, handle: RuntimeHandle, node: &Node) -> bool {
        let span = tracing::debug_span!("teardown", node = %handle.id, namespace = %handle.namespace);

        async move {
            let mut clean = true;

            for cmd in node.spec().release() {
                if let Err(e) = self.backend.run(&handle.scope(cmd)).await {
                    tracing::warn!(?e, "failed to release node resource");
                    clean = false;
                }
            }

            clean &= self.delete_namespace(&handle.namespace).await;
            clean
        }
        .instrument(span)
        .await
    }

    async fn run_all(&self, handle: &RuntimeHandle, cmds: Vec<Cmd>) -> command::Result<()> {
        for cmd in cmds {
            self.backend.run(&handle.scope(cmd)).await?;
        }
        Ok(())
    }

    async fn delete_namespace(&self, namespace: &str) -> bool {
        let cmd = Cmd::new(["ip", "netns", "del", namespace]);
        tracing::debug!(?cmd, "deleting namespace");

        match self.backend.run(&cmd).await {
            Ok(_) => true,
            Err(e) => {
                tracing::error!(?e, namespace, "failed to delete network namespace");
                false
            }
        }
    }
}

/// The runtime handles of a run, in creation order.
#[derive(Debug, Default)]
pub struct Runtimes {
    handles: Vec<RuntimeHandle>,
    index: FxHashMap<NodeRef, usize>,
}

impl Runtimes {
    pub fn insert(&mut self, handle: RuntimeHandle) {
        self.index.insert(handle.node, self.handles.len());
        self.handles.push(handle);
    }

    pub fn get(&self, node: NodeRef) -> Option<&RuntimeHandle> {
        self.index.get(&node).map(|&i| &self.handles[i])
    }

    pub fn get_mut(&mut self, node: NodeRef) -> Option<&mut RuntimeHandle> {
        self.index.get(&node).map(|&i| &mut self.handles[i])
    }

    pub fn iter(&self) -> impl Iterator<Item = &RuntimeHandle> {
        self.handles.iter()
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Removes every handle, returning them in reverse creation order.
    pub fn drain_reverse(&mut self) -> Vec<RuntimeHandle> {
        self.index.clear();
        let mut handles = std::mem::take(&mut self.handles);
        handles.reverse();
        handles
    }
}
