//! A small SOCKS5 client for poking at proxies.
//!
//! `socks-dial` dials a SOCKS5 server, negotiates authentication, asks
//! the server to connect to a target, and then relays stdin to the
//! target and the target's answer to stdout.

#![warn(missing_docs)]

mod relay;

use socks_negotiate::msg::{Request, SocksAddr, SocksCmd, SocksHostname};
use socks_negotiate::{ClientConfig, SocksConn};

use anyhow::{Context, Result};
use argh::FromArgs;
use async_std::net::TcpStream;
use futures::io::AsyncWriteExt;
use serde::Deserialize;
use std::convert::TryInto;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, Level};

#[derive(FromArgs, Debug, Clone)]
/// Connect to a target through a SOCKS5 proxy, and relay stdin/stdout
/// to it.
///
/// This is a diagnostic tool; you get no stability guarantee.
struct Args {
    /// override the default location(s) for the configuration file
    #[argh(option, short = 'f')]
    rc: Vec<String>,
    /// override a configuration option (uses toml syntax)
    #[argh(option, short = 'c')]
    cfg: Vec<String>,
}

/// Default options to use for our configuration.
const DIAL_DEFAULTS: &str = include_str!("./dial_defaults.toml");

/// Structure to hold our configuration options, whether from a
/// configuration file or the command line.
#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct DialConfig {
    /// Address of the SOCKS5 server.
    proxy: String,
    /// Hostname or IP address to ask the proxy to connect to.
    target_host: String,
    /// Port to ask the proxy to connect to.
    target_port: u16,
    /// Whether to log at trace level.
    trace: bool,
    /// How to negotiate with the proxy.
    #[serde(default)]
    client: ClientConfig,
}

impl DialConfig {
    /// Return the target address in the form SOCKS wants it.
    fn target_addr(&self) -> Result<SocksAddr> {
        if let Ok(ip) = self.target_host.parse::<IpAddr>() {
            return Ok(SocksAddr::Ip(ip));
        }
        let host: SocksHostname = self
            .target_host
            .clone()
            .try_into()
            .context("target_host is too long")?;
        Ok(SocksAddr::Hostname(host))
    }
}

/// Load our configuration from the built-in defaults, the files in
/// `files`, and the toml lines in `opts`, in that order.
fn load_config(files: &[String], opts: &[String]) -> Result<DialConfig> {
    let mut cfg = config::Config::new();
    cfg.merge(config::File::from_str(
        DIAL_DEFAULTS,
        config::FileFormat::Toml,
    ))?;
    for f in files {
        let f: config::File<_> = Path::new(f).into();
        cfg.merge(f.format(config::FileFormat::Toml))?;
    }
    for opt in opts {
        cfg.merge(config::File::from_str(opt, config::FileFormat::Toml))
            .with_context(|| format!("bad option {:?}", opt))?;
    }
    Ok(cfg.try_into()?)
}

fn main() -> Result<()> {
    let args: Args = argh::from_env();
    let config = load_config(&args.rc, &args.cfg)?;

    let level = if config.trace {
        Level::TRACE
    } else {
        Level::DEBUG
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();

    async_std::task::block_on(run(config))
}

/// Dial the proxy, negotiate, ask for the target, and relay.
async fn run(config: DialConfig) -> Result<()> {
    let tcp = TcpStream::connect(config.proxy.as_str())
        .await
        .with_context(|| format!("connecting to SOCKS server at {}", config.proxy))?;
    let selector = config.client.build_selector();
    let mut conn = SocksConn::client(Box::new(tcp), Some(Arc::new(selector)));

    let request = Request::new(SocksCmd::CONNECT, config.target_addr()?, config.target_port);
    conn.write_all(&request.encode())
        .await
        .context("sending SOCKS request")?;
    conn.expect_reply();
    conn.handshake(true)
        .await
        .with_context(|| format!("SOCKS negotiation with {} failed", config.proxy))?;
    info!(
        "Connected to {}:{} via {} (method {:?})",
        config.target_host,
        config.target_port,
        config.proxy,
        conn.method()
    );

    relay::splice(conn).await
}
