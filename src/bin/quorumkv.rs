/*
 * quorumkv is a replicated in-memory key/value store. It takes the shared
 * transport port, this replica's id, and the peer replica ids on the command
 * line, then serves client GET/PUT requests over UDP datagrams, replicating
 * writes across the cluster with Raft consensus.
 */

#![warn(clippy::all)]

use quorumkv::error::Result;
use quorumkv::{KvStore, Server};

use std::collections::HashSet;

fn main() -> Result<()> {
    let args = clap::command!()
        .about("A replicated in-memory key/value store")
        .arg(
            clap::Arg::new("port")
                .required(true)
                .value_parser(clap::value_parser!(u16))
                .help("Shared UDP transport port on localhost"),
        )
        .arg(clap::Arg::new("id").required(true).help("This replica's id"))
        .arg(clap::Arg::new("peers").required(true).num_args(1..).help("Peer replica ids"))
        .arg(
            clap::Arg::new("log_level")
                .short('l')
                .long("log-level")
                .default_value("info")
                .help("Log level"),
        )
        .get_matches();

    let loglevel = args.get_one::<String>("log_level").unwrap().parse::<simplelog::LevelFilter>()?;
    let mut logconfig = simplelog::ConfigBuilder::new();
    if loglevel != simplelog::LevelFilter::Debug {
        logconfig.add_filter_allow_str("quorumkv");
    }
    simplelog::SimpleLogger::init(loglevel, logconfig.build())?;

    let port = *args.get_one::<u16>("port").unwrap();
    let id = args.get_one::<String>("id").unwrap().clone();
    let peers: HashSet<String> = args.get_many::<String>("peers").unwrap().cloned().collect();

    Server::new(id, peers, port, Box::new(KvStore::new()))?.serve()
}
