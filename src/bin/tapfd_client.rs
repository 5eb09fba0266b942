//! Command-line client for a running tapfd-server
//!
//! Usage:
//!   tapfd-client add <key> <json>
//!   tapfd-client get <key>
//!   tapfd-client release <key>
//!   tapfd-client recover <key> <json>
//!
//! e.g. `tapfd-client add vm-1 '{"interface": "tap%d", "vnet_hdr": true}'`
//!
//! The socket comes from `TAPFD_SOCKET` (default `/run/tapfd/tapfd.sock`).
//! Received descriptors are only reported, then closed on exit.

use std::env;
use std::os::fd::{AsRawFd, OwnedFd};
use std::process;

use tapfd::config::{DEFAULT_SOCKET_PATH, ENV_SOCKET};
use tapfd::FdClient;

const USAGE: &str = "usage: tapfd-client <add|get|release|recover> <key> [json]";

fn json_arg(args: &[String]) -> Result<serde_json::Value, String> {
    let raw = args.get(2).ok_or_else(|| format!("missing json payload\n{}", USAGE))?;
    serde_json::from_str(raw).map_err(|e| format!("bad json payload: {}", e))
}

fn report(fds: &[OwnedFd], payload: &[u8]) {
    let raw: Vec<_> = fds.iter().map(|fd| fd.as_raw_fd()).collect();
    println!("fds: {:?}", raw);
    println!("{}", String::from_utf8_lossy(payload));
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let args: Vec<String> = env::args().skip(1).collect();
    if args.len() < 2 {
        eprintln!("{}", USAGE);
        process::exit(2);
    }
    let (command, key) = (args[0].as_str(), args[1].as_str());

    let socket = env::var(ENV_SOCKET).unwrap_or_else(|_| DEFAULT_SOCKET_PATH.to_string());
    let client = FdClient::new(socket);

    match command {
        "add" => {
            let data = json_arg(&args)?;
            let (fds, payload) = client.add_fds(key, &data).await?;
            report(&fds, &payload);
        }
        "get" => {
            let (fds, payload) = client.get_fds(key).await?;
            report(&fds, &payload);
        }
        "release" => {
            client.release_fds(key).await?;
            println!("released {}", key);
        }
        "recover" => {
            let data = json_arg(&args)?;
            client.recover(key, &data).await?;
            println!("recovered {}", key);
        }
        other => {
            eprintln!("unknown command {:?}\n{}", other, USAGE);
            process::exit(2);
        }
    }
    Ok(())
}
