//! # Summary
//!
//! The optional control-plane master channel (`6`): a single TCP
//! controller connects to `127.0.0.1:<master>` and issues newline-framed
//! `get`/`alive`/`broadcast <text>`/`crash` commands. Grounded in the
//! original `server/server.go`'s `handleMasterMsg`/`doAlive`/`doGet`/
//! `doBroadcast`, ported onto this crate's `LinkManager::connect_master`
//! accept loop instead of a raw `net.Conn`.

use std::net::SocketAddr;
use std::sync::Arc;

use paxos::NodeContext;

/// Accepts one controller connection on `master_addr` and services
/// commands until it disconnects or the process exits. Never returns
/// unless the listener itself fails, matching the original's one-shot
/// `connectAndHandleMaster`.
pub async fn run(ctx: Arc<NodeContext>, master_addr: SocketAddr) {
    loop {
        let (mut inbound, outbound) = match ctx.link_manager.clone().connect_master(master_addr).await {
            Ok(channels) => channels,
            Err(err) => {
                log::error!("master control listener on {} failed: {}", master_addr, err);
                return;
            }
        };

        log::info!("accepted master control connection on {}", master_addr);

        while let Some(line) = inbound.recv().await {
            handle(&ctx, &line, &outbound);
        }

        log::info!("master control connection closed; awaiting a new one");
    }
}

fn handle(ctx: &Arc<NodeContext>, line: &str, outbound: &paxos::Tx<String>) {
    let mut fields = line.trim().splitn(2, ' ');
    match fields.next() {
        Some("get") => {
            let messages = ctx.chat_messages().join(",");
            outbound.try_send(format!("messages {}", messages));
        }
        Some("alive") => {
            let alive: Vec<String> = ctx.link_manager.alive_set().iter().map(|box_id| box_id.to_string()).collect();
            outbound.try_send(format!("alive {}", alive.join(",")));
        }
        Some("broadcast") => {
            let text = fields.next().unwrap_or_default();
            ctx.link_manager.broadcast_chat(text);
        }
        Some("crash") => {
            log::warn!("master requested crash; exiting");
            std::process::exit(0);
        }
        _ => log::debug!("dropping unrecognized master command: {:?}", line),
    }
}
