#[macro_use]
extern crate log;

use std::error::Error;
use std::io::{self, BufRead, Write};
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::sync::Arc;

use clap::Parser;
use simplelog::{ColorChoice, CombinedLogger, LevelFilter, TermLogger, TerminalMode};

use kademlia_quorum::storage::ArcStorage;
use kademlia_quorum::transport::UdpTransport;
use kademlia_quorum::{Config, Node};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Port to listen on, 0 for any free port
    #[arg(long, default_value_t = 8468)]
    port: u16,

    /// Interface to listen on
    #[arg(long, default_value = "0.0.0.0")]
    interface: IpAddr,

    /// Comma separated host:port pairs of nodes to join through
    #[arg(long, value_delimiter = ',')]
    bootstrap: Vec<String>,

    /// Bucket capacity and replication factor
    #[arg(long, default_value_t = 20)]
    ksize: usize,

    /// Parallel probes per lookup round
    #[arg(long, default_value_t = 3)]
    alpha: usize,

    /// Keep at most this many values in an adaptive replacement cache instead of expiring them
    #[arg(long)]
    arc_capacity: Option<usize>,

    #[arg(long, default_value = "info")]
    log_level: LevelFilter,
}

fn resolve(seeds: &[String]) -> Vec<SocketAddr> {
    let mut addrs = Vec::new();
    for seed in seeds {
        match seed.to_socket_addrs() {
            Ok(resolved) => addrs.extend(resolved.filter(SocketAddr::is_ipv4)),
            Err(err) => warn!("Could not resolve {}: {}", seed, err),
        }
    }
    addrs
}

fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    CombinedLogger::init(vec![TermLogger::new(
        cli.log_level,
        simplelog::Config::default(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )])?;

    let config = Config {
        interface: cli.interface,
        port: cli.port,
        ksize: cli.ksize,
        alpha: cli.alpha,
        ..Config::default()
    };
    let node = match cli.arc_capacity {
        Some(capacity) => {
            let transport = UdpTransport::bind((config.interface, config.port))?;
            Node::with_transport(config, Arc::new(transport), Arc::new(ArcStorage::new(capacity)))
        },
        None => Node::new(config)?,
    };
    println!("Listening as {:?}", node.node_data());

    if !cli.bootstrap.is_empty() {
        let found = node.bootstrap(&resolve(&cli.bootstrap));
        println!("Bootstrapped with {} nodes", found.len());
    }

    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();
    loop {
        print!("> ");
        io::stdout().flush()?;
        let line = match lines.next() {
            Some(line) => line?,
            None => break,
        };
        let line = line.trim();
        let (command, argument) = match line.split_once(' ') {
            Some((command, argument)) => (command, argument.trim()),
            None => (line, ""),
        };
        match command {
            "get" if !argument.is_empty() => match node.get(argument) {
                Some(value) => println!("{}", String::from_utf8_lossy(&value)),
                None => println!("(not found)"),
            },
            "set" => match argument.split_once('=') {
                Some((key, value)) if !key.is_empty() => {
                    println!("{}", if node.set(key, value.as_bytes()) { "ok" } else { "failed" })
                },
                _ => println!("usage: set <key>=<value>"),
            },
            "delete" if !argument.is_empty() => {
                println!("{}", if node.delete(argument) { "ok" } else { "failed" })
            },
            "quit" | "exit" => break,
            "" => {},
            _ => println!("commands: get <key>, set <key>=<value>, delete <key>, quit"),
        }
    }

    node.kill();
    Ok(())
}
