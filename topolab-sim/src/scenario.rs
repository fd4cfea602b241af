//! # Scenario Selector
//!
//! A [`Scenario`] is a named topology plus the ordered control-plane [`Action`]s to run once it
//! is wired. Scenarios are looked up by name in a [`ScenarioRegistry`]; parameters are checked
//! at selection time, before anything is built.
//!
//! The run itself moves through the [`Phase`]s in order:
//!
//! ```text
//! Unselected ─▶ TopologyBuilt ─▶ Wired ─▶ Configured ─▶ Interactive
//!      └──────────────┴─────────────┴──────────┴─────────────┴──▶ TornDown
//! ```

use std::{fmt, net::Ipv4Addr};

use crate::{
    error::{ConfigurationError, Error, ValidationError},
    ip::{InterfaceAddress, Subnet},
    netem::LinkShaping,
    topology::{HostConfig, LinkConfig, RouterConfig, Topology},
};

/// Names of the scenarios registered by [`ScenarioRegistry::builtin`].
pub const BUILTIN_SCENARIOS: [&str; 4] = ["b", "c", "d", "routers"];

/// Lifecycle phase of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Phase {
    #[default]
    Unselected,
    TopologyBuilt,
    Wired,
    Configured,
    Interactive,
    TornDown,
}

impl Phase {
    const fn rank(self) -> u8 {
        match self {
            Self::Unselected => 0,
            Self::TopologyBuilt => 1,
            Self::Wired => 2,
            Self::Configured => 3,
            Self::Interactive => 4,
            Self::TornDown => 5,
        }
    }

    /// Checks that `self -> to` is a legal transition.
    ///
    /// Phases advance one step at a time, except [`Phase::TornDown`] which is reachable from
    /// anywhere.
    pub fn transition(self, to: Self) -> Result<Self, ValidationError> {
        let legal = to == Self::TornDown || (self != Self::TornDown && to.rank() == self.rank() + 1);

        if legal {
            Ok(to)
        } else {
            Err(ValidationError::InvalidTransition { from: self, to })
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unselected => "unselected",
            Self::TopologyBuilt => "topology-built",
            Self::Wired => "wired",
            Self::Configured => "configured",
            Self::Interactive => "interactive",
            Self::TornDown => "torn-down",
        };
        f.write_str(s)
    }
}

/// A control-plane step, run in declaration order once the topology is wired.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    SetForwarding { node: String, enabled: bool },
    AddRoute { node: String, destination: Subnet, next_hop: Ipv4Addr },
    ShapeLink { a: String, b: String, shaping: LinkShaping },
    LaunchTerminal { node: String },
    ShowRoutes { node: String },
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SetForwarding { node, enabled } => write!(f, "set forwarding on {node} to {enabled}"),
            Self::AddRoute { node, destination, next_hop } => {
                write!(f, "route {destination} via {next_hop} on {node}")
            }
            Self::ShapeLink { a, b, shaping } => write!(f, "shape {a}-{b} with {shaping:?}"),
            Self::LaunchTerminal { node } => write!(f, "launch terminal on {node}"),
            Self::ShowRoutes { node } => write!(f, "show routes of {node}"),
        }
    }
}

/// A selected scenario, ready to be loaded into an [`Emulation`](crate::Emulation).
#[derive(Debug, Clone)]
pub struct Scenario {
    pub name: String,
    pub topology: Topology,
    pub actions: Vec<Action>,
}

/// Operator supplied scenario parameters.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Params {
    /// Link loss percentage.
    pub loss: Option<f64>,
}

/// A parameter a scenario can require.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Param {
    Loss,
}

impl Param {
    pub const fn description(&self) -> &'static str {
        match self {
            Self::Loss => "link loss percentage",
        }
    }

    /// The command line flag carrying the parameter, without dashes.
    pub const fn flag(&self) -> &'static str {
        match self {
            Self::Loss => "loss",
        }
    }

    fn is_set(&self, params: &Params) -> bool {
        match self {
            Self::Loss => params.loss.is_some(),
        }
    }
}

/// Builds a scenario from validated parameters.
pub type BuildFn = fn(&Params) -> Result<Scenario, ValidationError>;

/// A registered scenario.
#[derive(Debug, Clone)]
pub struct ScenarioDefinition {
    pub name: &'static str,
    pub summary: &'static str,
    pub required: &'static [Param],
    pub build: BuildFn,
}

/// Scenarios selectable by name.
#[derive(Debug, Clone, Default)]
pub struct ScenarioRegistry {
    definitions: Vec<ScenarioDefinition>,
}

impl ScenarioRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// The registry holding the built-in scenarios.
    pub fn builtin() -> Self {
        let mut registry = Self::new();

        registry.register(ScenarioDefinition {
            name: "b",
            summary: "two switches, terminals on h1 and h4",
            required: &[],
            build: |_| {
                Ok(Scenario {
                    name: "b".to_string(),
                    topology: two_switch_topology()?,
                    actions: terminals(&["h1", "h4"]),
                })
            },
        });

        // Repeated terminals on a host collapse into one.
        registry.register(ScenarioDefinition {
            name: "c",
            summary: "two switches, terminals on h1, h2, h3 and h4",
            required: &[],
            build: |_| {
                Ok(Scenario {
                    name: "c".to_string(),
                    topology: two_switch_topology()?,
                    actions: terminals(&["h1", "h2", "h3", "h4", "h4", "h4"]),
                })
            },
        });

        registry.register(ScenarioDefinition {
            name: "d",
            summary: "two switches, lossy s1-s2 backbone, terminals on h1 and h4",
            required: &[Param::Loss],
            build: |params| {
                let loss = params.loss.ok_or(ValidationError::InvalidParameter {
                    name: "loss",
                    reason: "missing".to_string(),
                })?;

                let mut actions = vec![Action::ShapeLink {
                    a: "s1".to_string(),
                    b: "s2".to_string(),
                    shaping: LinkShaping::with_loss(loss),
                }];
                actions.extend(terminals(&["h1", "h4"]));

                Ok(Scenario { name: "d".to_string(), topology: two_switch_topology()?, actions })
            },
        });

        registry.register(ScenarioDefinition {
            name: "routers",
            summary: "three routers in a triangle with static routes",
            required: &[],
            build: |_| {
                Ok(Scenario {
                    name: "routers".to_string(),
                    topology: router_triangle_topology()?,
                    actions: router_triangle_actions()?,
                })
            },
        });

        registry
    }

    /// Registers a scenario, replacing any scenario with the same name.
    pub fn register(&mut self, definition: ScenarioDefinition) {
        match self.definitions.iter_mut().find(|d| d.name == definition.name) {
            Some(existing) => *existing = definition,
            None => self.definitions.push(definition),
        }
    }

    pub fn get(&self, name: &str) -> Option<&ScenarioDefinition> {
        self.definitions.iter().find(|d| d.name == name)
    }

    /// Registered names, in registration order.
    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.definitions.iter().map(|d| d.name)
    }

    /// Selects a scenario by name, validating `params` before anything is built.
    pub fn select(&self, name: &str, params: &Params) -> Result<Scenario, Error> {
        let definition =
            self.get(name).ok_or_else(|| ConfigurationError::UnknownScenario(name.to_string()))?;

        if let Some(missing) = definition.required.iter().find(|p| !p.is_set(params)) {
            return Err(ConfigurationError::MissingParameter {
                scenario: name.to_string(),
                description: missing.description(),
                flag: missing.flag(),
            }
            .into());
        }

        // Parameters a scenario does not take are ignored, whatever their value.
        if let Some(loss) = params.loss.filter(|_| definition.required.contains(&Param::Loss)) {
            LinkShaping::with_loss(loss).validate()?;
        }

        let scenario = (definition.build)(params)?;
        tracing::info!(
            scenario = name,
            nodes = scenario.topology.node_count(),
            links = scenario.topology.link_count(),
            actions = scenario.actions.len(),
            "scenario selected"
        );

        Ok(scenario)
    }
}

/// One terminal action per distinct node, in first-seen order.
fn terminals(nodes: &[&str]) -> Vec<Action> {
    let mut seen = Vec::new();
    for node in nodes {
        if !seen.contains(node) {
            seen.push(*node);
        }
    }
    seen.into_iter().map(|node| Action::LaunchTerminal { node: node.to_string() }).collect()
}

fn addr(s: &str) -> Result<InterfaceAddress, ValidationError> {
    s.parse()
}

/// Hosts `h1..h3` on `s1`, `h4` on `s2`, and the `s1`-`s2` backbone.
///
/// Hosts are addressed `10.0.0.N/8`.
pub fn two_switch_topology() -> Result<Topology, ValidationError> {
    let mut topo = Topology::new();

    topo.add_switch("s1")?;
    topo.add_switch("s2")?;

    for n in 1..=4 {
        let ip = addr(&format!("10.0.0.{n}/8"))?;
        topo.add_host(format!("h{n}"), HostConfig { ip: Some(ip), default_route: None })?;
    }

    topo.add_link("h1", "s1", LinkConfig::default())?;
    topo.add_link("h2", "s1", LinkConfig::default())?;
    topo.add_link("h3", "s1", LinkConfig::default())?;
    topo.add_link("h4", "s2", LinkConfig::default())?;
    topo.add_link("s1", "s2", LinkConfig::default())?;

    Ok(topo)
}

/// Routers `ra`, `rb`, `rc` serving `192.168.{1,2,3}.0/24`, meshed through the backbone
/// switches `s4` (ra-rb), `s5` (rb-rc) and `s6` (ra-rc). Two hosts sit on each subnet.
pub fn router_triangle_topology() -> Result<Topology, ValidationError> {
    let mut topo = Topology::new();

    topo.add_router("ra", RouterConfig { ip: Some(addr("192.168.1.1/24")?) })?;
    topo.add_router("rb", RouterConfig { ip: Some(addr("192.168.2.1/24")?) })?;
    topo.add_router("rc", RouterConfig { ip: Some(addr("192.168.3.1/24")?) })?;

    for s in ["s1", "s2", "s3", "s4", "s5", "s6"] {
        topo.add_switch(s)?;
    }

    let router_port = |name: &str, ip: &str| -> Result<LinkConfig, ValidationError> {
        Ok(LinkConfig::default().b_name(name).b_address(addr(ip)?))
    };

    topo.add_link("s1", "ra", router_port("ra-eth1", "192.168.1.1/24")?)?;
    topo.add_link("s2", "rb", router_port("rb-eth2", "192.168.2.1/24")?)?;
    topo.add_link("s3", "rc", router_port("rc-eth3", "192.168.3.1/24")?)?;

    let hosts = [
        ("h1", "192.168.1.2/24", "192.168.1.1", "s1"),
        ("h2", "192.168.1.3/24", "192.168.1.1", "s1"),
        ("h3", "192.168.2.2/24", "192.168.2.1", "s2"),
        ("h4", "192.168.2.3/24", "192.168.2.1", "s2"),
        ("h5", "192.168.3.2/24", "192.168.3.1", "s3"),
        ("h6", "192.168.3.3/24", "192.168.3.1", "s3"),
    ];
    for (id, ip, gateway, switch) in hosts {
        let gateway = gateway
            .parse()
            .map_err(|_| ValidationError::InvalidAddress(gateway.to_string()))?;
        topo.add_host(id, HostConfig { ip: Some(addr(ip)?), default_route: Some(gateway) })?;
        topo.add_link(id, switch, LinkConfig::default())?;
    }

    topo.add_link("s4", "ra", router_port("ra-eth4", "192.168.4.1/24")?)?;
    topo.add_link("s4", "rb", router_port("rb-eth4", "192.168.4.2/24")?)?;
    topo.add_link("s5", "rb", router_port("rb-eth5", "192.168.5.1/24")?)?;
    topo.add_link("s5", "rc", router_port("rc-eth5", "192.168.5.2/24")?)?;
    topo.add_link("s6", "ra", router_port("ra-eth6", "192.168.6.1/24")?)?;
    topo.add_link("s6", "rc", router_port("rc-eth6", "192.168.6.2/24")?)?;

    Ok(topo)
}

/// Static routes between the three router subnets, then a routing table dump per router.
fn router_triangle_actions() -> Result<Vec<Action>, ValidationError> {
    let routes = [
        ("ra", "192.168.2.0/24", "192.168.4.2"),
        ("ra", "192.168.3.0/24", "192.168.6.2"),
        ("rb", "192.168.1.0/24", "192.168.4.1"),
        ("rb", "192.168.3.0/24", "192.168.5.2"),
        ("rc", "192.168.1.0/24", "192.168.6.1"),
        ("rc", "192.168.2.0/24", "192.168.5.1"),
    ];

    let mut actions = Vec::with_capacity(routes.len() + 3);
    for (node, destination, next_hop) in routes {
        actions.push(Action::AddRoute {
            node: node.to_string(),
            destination: destination.parse()?,
            next_hop: next_hop
                .parse()
                .map_err(|_| ValidationError::InvalidAddress(next_hop.to_string()))?,
        });
    }

    actions.extend(["ra", "rb", "rc"].map(|node| Action::ShowRoutes { node: node.to_string() }));
    Ok(actions)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phases_advance_in_order() {
        let mut phase = Phase::default();
        for next in
            [Phase::TopologyBuilt, Phase::Wired, Phase::Configured, Phase::Interactive, Phase::TornDown]
        {
            phase = phase.transition(next).unwrap();
        }
        assert_eq!(phase, Phase::TornDown);

        assert!(Phase::Unselected.transition(Phase::Wired).is_err());
        assert!(Phase::Configured.transition(Phase::Wired).is_err());
        assert!(Phase::TornDown.transition(Phase::Interactive).is_err());
        assert_eq!(Phase::Wired.transition(Phase::TornDown).unwrap(), Phase::TornDown);
    }

    #[test]
    fn missing_loss_is_reported_before_building() {
        let registry = ScenarioRegistry::builtin();

        let err = registry.select("d", &Params::default()).unwrap_err();
        assert!(matches!(err, Error::Configuration(ConfigurationError::MissingParameter { .. })));
        assert_eq!(
            err.to_string(),
            "You must specify the link loss percentage using the --loss argument for configuration 'd'"
        );
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn selection_errors() {
        let registry = ScenarioRegistry::builtin();

        assert!(matches!(
            registry.select("z", &Params::default()),
            Err(Error::Configuration(ConfigurationError::UnknownScenario(_)))
        ));
        assert!(matches!(
            registry.select("d", &Params { loss: Some(150.0) }),
            Err(Error::Validation(ValidationError::InvalidParameter { name: "loss", .. }))
        ));
    }

    #[test]
    fn unused_loss_is_not_validated() {
        let registry = ScenarioRegistry::builtin();

        for name in ["b", "c", "routers"] {
            let scenario = registry.select(name, &Params { loss: Some(150.0) }).unwrap();
            assert!(!scenario.actions.iter().any(|a| matches!(a, Action::ShapeLink { .. })), "{name}");
        }
    }

    #[test]
    fn builtin_scenarios() {
        let registry = ScenarioRegistry::builtin();
        assert_eq!(registry.names().collect::<Vec<_>>(), BUILTIN_SCENARIOS);

        let b = registry.select("b", &Params::default()).unwrap();
        assert_eq!(b.topology.node_count(), 6);
        assert_eq!(b.topology.link_count(), 5);
        assert_eq!(b.actions, terminals(&["h1", "h4"]));

        let c = registry.select("c", &Params::default()).unwrap();
        assert_eq!(c.actions.len(), 4);

        let d = registry.select("d", &Params { loss: Some(37.5) }).unwrap();
        assert_eq!(
            d.actions[0],
            Action::ShapeLink {
                a: "s1".to_string(),
                b: "s2".to_string(),
                shaping: LinkShaping::with_loss(37.5)
            }
        );
        assert_eq!(d.actions.len(), 3);

        let routers = registry.select("routers", &Params::default()).unwrap();
        assert_eq!(routers.topology.node_count(), 15);
        assert_eq!(routers.topology.link_count(), 15);
        assert_eq!(routers.actions.iter().filter(|a| matches!(a, Action::AddRoute { .. })).count(), 6);
    }

    #[test]
    fn triangle_router_interfaces() {
        let topo = router_triangle_topology().unwrap();
        let (_, rb) = topo.node_by_id("rb").unwrap();

        let names: Vec<_> = rb.interfaces().iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, ["rb-eth2", "rb-eth4", "rb-eth5"]);
        let addresses: Vec<_> = rb.addresses().map(|a| a.to_string()).collect();
        assert_eq!(addresses, ["192.168.2.1/24", "192.168.4.2/24", "192.168.5.1/24"]);
    }

    #[test]
    fn registry_replaces_by_name() {
        let mut registry = ScenarioRegistry::builtin();
        registry.register(ScenarioDefinition {
            name: "b",
            summary: "empty",
            required: &[],
            build: |_| Ok(Scenario { name: "b".into(), topology: Topology::new(), actions: vec![] }),
        });

        assert_eq!(registry.names().count(), 4);
        assert_eq!(registry.get("b").unwrap().summary, "empty");
    }
}
