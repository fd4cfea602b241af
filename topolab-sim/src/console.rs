//! Line oriented operator console over a running emulation.
//!
//! The console reads one command per line until `exit`, end of input, or a shutdown request
//! from elsewhere (e.g. a signal). Command failures are printed and the session goes on; only
//! I/O errors on the console streams end it early.

use std::{fmt::Write as _, net::Ipv4Addr};

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::{
    command::Backend,
    emulation::Emulation,
    error::{Error, ResourceError},
    netem::LinkShaping,
    shutdown::Shutdown,
    topology::{InterfaceRef, Topology},
};

pub const PROMPT: &str = "topolab> ";

const HELP: &str = "\
commands:
  nodes                  list nodes and their namespaces
  links                  list links and their shaping
  net                    list every node with its peers
  routes <node>          show the routing table of a node
  trace <node> <addr>    trace the forwarding path from a node
  xterm <node>...        open a terminal in each node
  <node> <cmd>...        run a command inside a node
  help                   show this message
  exit | quit            tear down and leave
";

/// A parsed console line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Empty,
    Help,
    Exit,
    Nodes,
    Links,
    Net,
    Routes(String),
    Trace(String, Ipv4Addr),
    Xterm(Vec<String>),
    Exec { node: String, argv: Vec<String> },
}

impl ConsoleCommand {
    /// Parses a console line. Errors are usage messages for the operator.
    pub fn parse(line: &str) -> Result<Self, String> {
        let mut words = line.split_whitespace();
        let Some(first) = words.next() else {
            return Ok(Self::Empty);
        };
        let rest: Vec<String> = words.map(str::to_string).collect();

        match (first, rest.as_slice()) {
            ("help" | "?", _) => Ok(Self::Help),
            ("exit" | "quit", _) => Ok(Self::Exit),
            ("nodes", _) => Ok(Self::Nodes),
            ("links", _) => Ok(Self::Links),
            ("net", _) => Ok(Self::Net),
            ("routes", [node]) => Ok(Self::Routes(node.clone())),
            ("routes", _) => Err("usage: routes <node>".to_string()),
            ("trace", [node, addr]) => addr
                .parse()
                .map(|addr| Self::Trace(node.clone(), addr))
                .map_err(|_| format!("invalid address '{addr}'")),
            ("trace", _) => Err("usage: trace <node> <addr>".to_string()),
            ("xterm", []) => Err("usage: xterm <node>...".to_string()),
            ("xterm", nodes) => Ok(Self::Xterm(nodes.to_vec())),
            (node, []) => Err(format!("no command given for '{node}'")),
            (node, argv) => Ok(Self::Exec { node: node.to_string(), argv: argv.to_vec() }),
        }
    }
}

fn console_io(e: std::io::Error) -> Error {
    ResourceError::Console(e).into()
}

fn endpoint(topology: &Topology, interface: InterfaceRef) -> String {
    let node = topology.node(interface.node).id();
    match topology.interface(interface) {
        Some(intf) => format!("{node}:{}", intf.name),
        None => node.to_string(),
    }
}

fn describe_shaping(shaping: &LinkShaping) -> String {
    let mut out = String::new();
    if shaping.loss != 0.0 {
        let _ = write!(out, " loss {}%", shaping.loss);
    }
    if let Some(delay) = shaping.delay.filter(|d| !d.is_zero()) {
        let _ = write!(out, " delay {delay:?}");
    }
    if let Some(rate) = shaping.bandwidth_mbit_s {
        let _ = write!(out, " rate {rate}Mbit/s");
    }
    out
}

fn list_nodes<B: Backend>(emulation: &Emulation<B>) -> String {
    let mut out = String::new();
    for (node_ref, node) in emulation.topology().nodes() {
        let namespace = emulation.runtimes().get(node_ref).map_or("-", |h| h.namespace.as_str());
        let _ = writeln!(out, "{:<6} {:<6} {namespace}", node.id(), node.kind().to_string());
    }
    out
}

fn list_links<B: Backend>(emulation: &Emulation<B>) -> String {
    let topology = emulation.topology();
    let mut out = String::new();
    for (link_ref, link) in topology.links() {
        let shaping = topology.interface(link.a).map(|i| describe_shaping(&i.shaping)).unwrap_or_default();
        let state = if emulation.fabric().is_wired(link_ref) { "" } else { " (not wired)" };
        let _ = writeln!(
            out,
            "{} <-> {}{shaping}{state}",
            endpoint(topology, link.a),
            endpoint(topology, link.b)
        );
    }
    out
}

fn list_net<B: Backend>(emulation: &Emulation<B>) -> String {
    let topology = emulation.topology();
    let mut out = String::new();
    for (node_ref, node) in topology.nodes() {
        out.push_str(node.id());
        for (_, intf) in topology.interfaces_of(node_ref) {
            let peer = topology
                .link(intf.link)
                .and_then(|l| l.peer_of(node_ref))
                .and_then(|p| topology.interface(p))
                .map_or("?", |p| p.name.as_str());
            let _ = write!(out, " {}:{peer}", intf.name);
        }
        out.push('\n');
    }
    out
}

async fn dispatch<B: Backend>(
    emulation: &mut Emulation<B>,
    command: ConsoleCommand,
) -> Result<String, Error> {
    let out = match command {
        ConsoleCommand::Empty | ConsoleCommand::Exit => String::new(),
        ConsoleCommand::Help => HELP.to_string(),
        ConsoleCommand::Nodes => list_nodes(emulation),
        ConsoleCommand::Links => list_links(emulation),
        ConsoleCommand::Net => list_net(emulation),
        ConsoleCommand::Routes(node) => emulation.routing_table(&node).await?,
        ConsoleCommand::Trace(node, addr) => {
            let path = emulation.trace(&node, addr)?;
            format!("{}\n", path.join(" -> "))
        }
        ConsoleCommand::Xterm(nodes) => {
            for node in &nodes {
                emulation.launch_terminal(node)?;
            }
            String::new()
        }
        ConsoleCommand::Exec { node, argv } => {
            let output = emulation.execute(&node, &argv).await?;
            let succeeded = output.success();
            let mut out = output.stdout;
            out.push_str(&output.stderr);
            if !succeeded {
                if !out.is_empty() && !out.ends_with('\n') {
                    out.push('\n');
                }
                match output.code {
                    Some(code) => {
                        let _ = writeln!(out, "exit status {code}");
                    }
                    None => out.push_str("terminated by signal\n"),
                }
            }
            out
        }
    };

    Ok(out)
}

/// Runs the console until `exit`, end of input or `shutdown`. Always leaves `shutdown`
/// triggered so that the caller tears the emulation down exactly once.
pub async fn run<B, R, W>(
    emulation: &mut Emulation<B>,
    input: R,
    mut output: W,
    shutdown: &Shutdown,
) -> Result<(), Error>
where
    B: Backend,
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = input.lines();

    let result = async {
        loop {
            output.write_all(PROMPT.as_bytes()).await.map_err(console_io)?;
            output.flush().await.map_err(console_io)?;

            let line = tokio::select! {
                line = lines.next_line() => line.map_err(console_io)?,
                _ = shutdown.wait() => break,
            };

            let Some(line) = line else {
                tracing::debug!("console input closed");
                output.write_all(b"\n").await.map_err(console_io)?;
                break;
            };

            let reply = match ConsoleCommand::parse(&line) {
                Ok(ConsoleCommand::Exit) => break,
                Ok(command) => match dispatch(emulation, command).await {
                    Ok(out) => out,
                    Err(e) => format!("Error: {e}\n"),
                },
                Err(usage) => format!("{usage}\n"),
            };

            output.write_all(reply.as_bytes()).await.map_err(console_io)?;
        }

        output.flush().await.map_err(console_io)
    }
    .await;

    shutdown.trigger();
    result
}
