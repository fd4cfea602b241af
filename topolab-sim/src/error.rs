//! Error taxonomy shared by every layer of the emulation.
//!
//! Errors fall in three categories:
//!
//! - [`ConfigurationError`]: bad or missing operator input. Raised before anything is built.
//! - [`ValidationError`]: a request the model rejects (duplicate ids, unknown nodes, out of range
//!   shaping parameters...). Raised before the corresponding command is issued.
//! - [`ResourceError`]: the host failed to provide a namespace, a device or a process. Fatal for
//!   the run; the caller is expected to tear down whatever was already built.

use std::{io, net::Ipv4Addr};

use crate::{command, ip::Subnet, scenario::Phase, topology::LinkRef};

/// Bad or missing operator input.
#[derive(Debug, thiserror::Error)]
pub enum ConfigurationError {
    #[error("You must specify the {description} using the --{flag} argument for configuration '{scenario}'")]
    MissingParameter { scenario: String, description: &'static str, flag: &'static str },

    #[error("unknown scenario '{0}'")]
    UnknownScenario(String),
}

/// A request rejected by the model.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("node id '{0}' is already in use")]
    DuplicateNodeId(String),

    #[error("invalid node id '{0}'")]
    InvalidNodeId(String),

    #[error("unknown node '{0}'")]
    UnknownNode(String),

    #[error("node '{0}' cannot be linked to itself")]
    SelfLoop(String),

    #[error("no link between '{0}' and '{1}'")]
    NoLink(String, String),

    #[error("interface name '{0}' exceeds 15 bytes")]
    InterfaceNameTooLong(String),

    #[error("interface '{name}' is already attached to node '{node}'")]
    InterfaceNameConflict { node: String, name: String },

    #[error("link {0} is already wired")]
    AlreadyWired(LinkRef),

    #[error("link {0} is not wired")]
    NotWired(LinkRef),

    #[error("unknown link {0}")]
    UnknownLink(LinkRef),

    #[error("node '{0}' has no runtime")]
    NotInstantiated(String),

    #[error("invalid parameter `{name}`: {reason}")]
    InvalidParameter { name: &'static str, reason: String },

    #[error("invalid address '{0}'")]
    InvalidAddress(String),

    #[error("node '{0}' is not a router")]
    NotARouter(String),

    #[error("next hop {next_hop} is not a neighbor on any interface of '{node}'")]
    InvalidNextHop { node: String, next_hop: Ipv4Addr },

    #[error("'{node}' already routes {destination} via {existing}, refusing {requested}")]
    ConflictingRoute { node: String, destination: Subnet, existing: Ipv4Addr, requested: Ipv4Addr },

    #[error("forwarding is disabled on '{0}'")]
    ForwardingDisabled(String),

    #[error("cannot move from {from} to {to}")]
    InvalidTransition { from: Phase, to: Phase },

    #[error("{to} is unreachable from '{from}'")]
    Unreachable { from: String, to: Ipv4Addr },

    #[error("routing loop while forwarding from '{from}' to {to}")]
    RoutingLoop { from: String, to: Ipv4Addr },
}

/// The host could not provide a resource the emulation needs.
#[derive(Debug, thiserror::Error)]
pub enum ResourceError {
    #[error("failed to create namespace '{namespace}': {source}")]
    NamespaceCreation {
        namespace: String,
        #[source]
        source: command::Error,
    },

    #[error("command error: {0}")]
    Command(#[from] command::Error),

    #[error("console io error: {0}")]
    Console(#[from] io::Error),
}

/// Any error raised by the emulation.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Resource(#[from] ResourceError),
}

impl From<command::Error> for Error {
    fn from(value: command::Error) -> Self {
        Self::Resource(ResourceError::Command(value))
    }
}

impl Error {
    /// The process exit code to report for this error.
    pub const fn exit_code(&self) -> u8 {
        match self {
            Self::Configuration(_) | Self::Validation(_) => 1,
            Self::Resource(_) => 2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_loss_message_matches_cli_contract() {
        let err = ConfigurationError::MissingParameter {
            scenario: "d".to_string(),
            description: "link loss percentage",
            flag: "loss",
        };

        assert_eq!(
            err.to_string(),
            "You must specify the link loss percentage using the --loss argument for configuration 'd'"
        );
    }

    #[test]
    fn exit_codes_follow_category() {
        let config: Error = ConfigurationError::UnknownScenario("x".into()).into();
        let validation: Error = ValidationError::UnknownNode("h9".into()).into();
        let resource: Error = command::Error::Empty.into();

        assert_eq!(config.exit_code(), 1);
        assert_eq!(validation.exit_code(), 1);
        assert_eq!(resource.exit_code(), 2);
    }
}
