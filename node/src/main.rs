use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use structopt::StructOpt;

mod master;

/// One hosted box's runtime: Paxos replica agents, the Link Manager's
/// inter-box transport, and an optional master control channel (`6`).
#[derive(StructOpt)]
#[structopt(name = "paxos-node")]
struct Opt {
    /// Path to the cluster configuration file
    config: PathBuf,

    /// This node's box address (host:port), as named in the config
    box_id: paxos::BoxID,

    /// Control-plane master listener port on 127.0.0.1; 0 disables it
    #[structopt(long = "master", default_value = "0")]
    master: u16,

    /// Verbose trace output
    #[structopt(long = "debug")]
    debug: bool,

    /// Per-message loss fraction applied by the router, 0..1
    #[structopt(long = "loss", default_value = "0")]
    loss: f64,

    /// Append-only trace log path; stdout only if omitted
    #[structopt(long = "log")]
    log: Option<PathBuf>,

    /// Path `dump` writes the applied log to, for locally-hosted replicas
    #[structopt(long = "output")]
    output: Option<PathBuf>,
}

fn init_logging(opt: &Opt) {
    let level = if opt.debug { log::LevelFilter::Debug } else { log::LevelFilter::Info };
    let my_box = opt.box_id.to_string();

    let mut dispatch = fern::Dispatch::new()
        .format(move |out, message, record| {
            out.finish(format_args!(
                "[{}][{}][{}][{}]: {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                my_box,
                record.level(),
                record.target(),
                message
            ))
        })
        .level_for("paxos", level)
        .level_for("mio", log::LevelFilter::Off)
        .level_for("tokio", log::LevelFilter::Off)
        .chain(std::io::stdout());

    if let Some(path) = &opt.log {
        match fern::log_file(path) {
            Ok(file) => dispatch = dispatch.chain(file),
            Err(err) => eprintln!("warning: could not open log file {}: {}", path.display(), err),
        }
    }

    dispatch.apply().expect("logging can only be initialized once");
}

#[tokio::main]
async fn main() {
    let opt = Opt::from_args();
    init_logging(&opt);

    let config = match paxos::Config::load(&opt.config) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("fatal: {}", err);
            std::process::exit(1);
        }
    };

    let my_box = opt.box_id.clone();
    let local_agents = match config.local_agents(&my_box) {
        Ok(local) => local,
        Err(err) => {
            eprintln!("fatal: {}", err);
            std::process::exit(1);
        }
    };

    if local_agents.is_empty() {
        log::warn!("no agents configured for box {}; node will idle", my_box);
    }

    let failure_detector = Arc::new(paxos::FailureDetector::new());
    let leader_flag = Arc::new(AtomicBool::new(false));

    let peer_boxes: Vec<paxos::BoxID> = config.agents.values().map(|descriptor| descriptor.box_id.clone()).collect();
    let (link_manager, inbound, chat_inbound) =
        paxos::LinkManager::new(my_box.clone(), peer_boxes, leader_flag.clone(), failure_detector.clone());

    let ctx =
        paxos::NodeContext::new(my_box.clone(), config.clone(), link_manager.clone(), failure_detector, leader_flag, opt.loss);

    tokio::spawn(link_manager.clone().dial_loop());
    tokio::spawn(async move {
        if let Err(err) = link_manager.listen_loop().await {
            log::error!("peer listener on {} failed: {}", my_box, err);
            std::process::exit(1);
        }
    });
    tokio::spawn(ctx.clone().pump_transport(inbound));
    tokio::spawn(ctx.clone().pump_chat(chat_inbound));

    let output_path = opt.output.as_ref().map(|path| path.to_string_lossy().into_owned());

    let hosts: Vec<paxos::AgentHost> = local_agents
        .into_iter()
        .map(|(id, descriptor)| paxos::AgentHost::spawn(id, descriptor, ctx.clone(), output_path.clone()))
        .collect();

    if opt.master != 0 {
        let master_addr: SocketAddr = format!("127.0.0.1:{}", opt.master).parse().expect("master port always forms a valid loopback address");
        let master_ctx = ctx.clone();
        tokio::spawn(async move { master::run(master_ctx, master_addr).await });
    }

    tokio::signal::ctrl_c().await.expect("failed to listen for ctrl-c");
    log::info!("shutting down");
    for host in &hosts {
        host.halt();
    }
}
