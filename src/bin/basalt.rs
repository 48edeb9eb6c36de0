/*
 * basalt is the basalt cluster server. It takes configuration via a
 * configuration file, command-line parameters, and environment variables,
 * then joins the configured cluster and replicates its database.
 */

#![warn(clippy::all)]

use basalt::cluster::{Options, PeerConfig};
use basalt::db::Memory;
use basalt::error::Result;
use basalt::Server;

use serde_derive::Deserialize;

fn main() -> Result<()> {
    let args = clap::command!()
        .arg(
            clap::Arg::new("config")
                .short('c')
                .long("config")
                .help("Configuration file path")
                .default_value("config/basalt.yaml"),
        )
        .get_matches();
    let cfg = Config::new(args.get_one::<String>("config").unwrap().as_ref())?;

    let loglevel = cfg.log_level.parse::<simplelog::LevelFilter>()?;
    let mut logconfig = simplelog::ConfigBuilder::new();
    if loglevel != simplelog::LevelFilter::Debug {
        logconfig.add_filter_allow_str("basalt");
    }
    simplelog::SimpleLogger::init(loglevel, logconfig.build())?;

    let peers = cfg
        .peers
        .iter()
        .map(|entry| PeerConfig::parse(entry))
        .collect::<Result<Vec<PeerConfig>>>()?;

    let server = Server::new(
        cfg.name,
        env!("CARGO_PKG_VERSION"),
        cfg.priority,
        peers,
        Box::new(Memory::new()),
        Options::default(),
    );
    server.serve(&cfg.listen)
}

#[derive(Debug, Deserialize)]
struct Config {
    name: String,
    listen: String,
    priority: i64,
    peers: Vec<String>,
    log_level: String,
}

impl Config {
    fn new(file: &str) -> Result<Self> {
        Ok(config::Config::builder()
            .set_default("listen", "0.0.0.0:9500")?
            .set_default("priority", 1)?
            .set_default("peers", Vec::<String>::new())?
            .set_default("log_level", "info")?
            .add_source(config::File::with_name(file))
            .add_source(config::Environment::with_prefix("BASALT"))
            .build()?
            .try_deserialize()?)
    }
}
