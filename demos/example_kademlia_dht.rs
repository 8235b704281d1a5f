use std::net::{IpAddr, Ipv4Addr};

use kademlia_quorum::{Config, Node};

fn config() -> Config {
    Config {
        interface: IpAddr::V4(Ipv4Addr::LOCALHOST),
        port: 0,
        ..Config::default()
    }
}

fn main() -> kademlia_quorum::Result<()> {
    let first = Node::new(config())?;
    let second = Node::new(config())?;

    let seed = first.node_data().addr.into_iter().collect::<Vec<_>>();
    second.bootstrap(&seed);

    assert!(first.set("Hello", b"World"));
    assert_eq!(second.get("Hello").as_deref(), Some(&b"World"[..]));

    first.kill();
    second.kill();
    Ok(())
}
