/*
 * raftling is a single Raft consensus node. It takes configuration via a
 * configuration file, command-line parameters, and environment variables,
 * then starts the node and logs its role changes. Commands read from stdin
 * are appended to the replicated log, one line each.
 *
 * The stock build ships the in-process channel transport and the in-memory
 * storage engine, so a standalone node is mostly useful to poke at the role
 * machine and log; real deployments plug in their own transport.
 */

#![warn(clippy::all)]

use raftling::error::Result;
use raftling::raft::{
    ChannelMesh, Endpoint, EngineNodeStore, Entry, Index, Log, Mode, NodeId, Options, Server,
    State,
};
use raftling::storage::Memory;
use raftling::{errinput, Error};

use serde::Deserialize;
use std::collections::HashMap;
use std::io::BufRead as _;

fn main() -> Result<()> {
    let args = clap::command!()
        .about("Starts a raftling consensus node.")
        .arg(
            clap::Arg::new("config")
                .short('c')
                .long("config")
                .help("Configuration file path")
                .default_value("config/raftling.yaml"),
        )
        .get_matches();
    let cfg = Config::new(args.get_one::<String>("config").unwrap().as_ref())?;

    let loglevel = cfg.log_level.parse::<simplelog::LevelFilter>()?;
    let mut logconfig = simplelog::ConfigBuilder::new();
    if loglevel != simplelog::LevelFilter::Debug {
        logconfig.add_filter_allow_str("raftling");
    }
    simplelog::SimpleLogger::init(loglevel, logconfig.build())?;

    let mode = match cfg.mode.as_str() {
        "active" | "" => Mode::Active,
        "standby" => Mode::Standby,
        mode => return errinput!("invalid node mode {mode}"),
    };
    let log = match cfg.storage.as_str() {
        "memory" | "" => Log::new(Box::new(Memory::new()))?,
        name => return errinput!("invalid storage engine {name}"),
    };
    let store = EngineNodeStore::new(Box::new(Memory::new()))?;

    let mesh = ChannelMesh::new();
    let transport = mesh.connect(cfg.id);
    let mut members = vec![Endpoint::new(cfg.id, cfg.listen.clone())];
    for (id, address) in &cfg.peers {
        members.push(Endpoint::new(*id, address.clone()));
    }

    let opts = Options { mode, ..Options::default() };
    let mut server =
        Server::new(cfg.id, members, log, Box::new(store), Box::new(transport), opts);
    server.register_state_machine(Box::new(EchoState::default()))?;
    server.add_role_listener(Box::new(|state| {
        log::info!("role changed to {:?}", state);
    }))?;
    server.start()?;

    for line in std::io::stdin().lock().lines() {
        let line = line?;
        if line.is_empty() {
            continue;
        }
        match server.append(line.into_bytes()) {
            Ok(()) => {}
            Err(Error::NotLeader { role, leader }) => {
                log::warn!("not leader (currently {role}, leader {leader:?}), dropping command")
            }
            Err(err) => return Err(err),
        }
    }
    server.stop()
}

#[derive(Debug, Deserialize)]
struct Config {
    id: NodeId,
    listen: String,
    peers: HashMap<NodeId, String>,
    log_level: String,
    storage: String,
    mode: String,
}

impl Config {
    fn new(file: &str) -> Result<Self> {
        Ok(config::Config::builder()
            .set_default("id", 1)?
            .set_default("listen", "local")?
            .set_default("peers", HashMap::<String, String>::new())?
            .set_default("log_level", "info")?
            .set_default("storage", "memory")?
            .set_default("mode", "active")?
            .add_source(config::File::with_name(file).required(false))
            .add_source(config::Environment::with_prefix("RAFTLING"))
            .build()?
            .try_deserialize()?)
    }
}

/// A state machine that logs applied commands.
#[derive(Default)]
struct EchoState {
    applied_index: Index,
}

impl State for EchoState {
    fn applied_index(&self) -> Index {
        self.applied_index
    }

    fn apply(&mut self, entry: &Entry) -> Result<()> {
        if let raftling::raft::Command::Write(command) = &entry.command {
            log::info!("applied {}@{}: {}", entry.index, entry.term, String::from_utf8_lossy(command));
        }
        self.applied_index = entry.index;
        Ok(())
    }

    fn snapshot(&self) -> Result<Vec<u8>> {
        Ok(Vec::new())
    }

    fn restore(&mut self, applied_index: Index, _data: &[u8]) -> Result<()> {
        self.applied_index = applied_index;
        Ok(())
    }
}
