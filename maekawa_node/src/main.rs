//! Maekawa mutual exclusion node executable.

use std::collections::{HashMap, HashSet};
use std::net::{Ipv4Addr, SocketAddr};
use std::process::ExitCode;

use clap::Parser;
use log::{self, LevelFilter};
use maekawa::{
    logger_init, pf_error, pf_info, pf_warn, run_workload, MaekawaError,
    MaekawaReplica, NodeId,
};
use tokio::runtime::Builder;
use tokio::sync::watch;

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// My node ID, an index into the peers list.
    #[arg(short, long)]
    id: NodeId,

    /// Peer-facing address of every node in ID order, myself included
    /// (e.g., '-p host0:port -p host1:port'). The population is the length
    /// of this list.
    #[arg(short, long)]
    peers: Vec<SocketAddr>,

    /// Local IP to use for binding the listening socket; the port is taken
    /// from my own entry in the peers list.
    #[arg(short, long, default_value_t = Ipv4Addr::UNSPECIFIED)]
    bind_ip: Ipv4Addr,

    /// Protocol configuration TOML string.
    /// Every '+' is treated as newline.
    #[arg(long, default_value_t = String::from(""))]
    config: String,

    /// Number of tokio worker threads.
    #[arg(long, default_value_t = 4)]
    threads: usize,
}

impl CliArgs {
    /// Sanitize command line arguments, return `Ok(peer_addrs)` on success
    /// or `Err(MaekawaError)` on any error.
    fn sanitize(&self) -> Result<HashMap<NodeId, SocketAddr>, MaekawaError> {
        if self.peers.is_empty() || self.peers.len() > NodeId::MAX as usize {
            Err(MaekawaError::config(format!(
                "invalid number of peers {}",
                self.peers.len()
            )))
        } else if self.id as usize >= self.peers.len() {
            Err(MaekawaError::config(format!(
                "node ID {} out of {} peers",
                self.id,
                self.peers.len()
            )))
        } else if self.peers.iter().collect::<HashSet<_>>().len()
            != self.peers.len()
        {
            Err(MaekawaError::config(format!(
                "duplicate addresses in peers {:?}",
                self.peers
            )))
        } else if self.threads < 2 {
            Err(MaekawaError::config(format!(
                "invalid number of threads {}",
                self.threads
            )))
        } else {
            Ok(self
                .peers
                .iter()
                .enumerate()
                .map(|(id, &addr)| (id as NodeId, addr))
                .collect())
        }
    }
}

/// Actual main function of Maekawa node executable.
fn node_main() -> Result<(), MaekawaError> {
    // read in and parse command line arguments
    let mut args = CliArgs::parse();
    let peer_addrs = args.sanitize()?;
    let id = args.id;
    let p2p_addr = SocketAddr::new(args.bind_ip.into(), peer_addrs[&id].port());

    // parse optional config string if given
    let config_str = if args.config.is_empty() {
        None
    } else {
        args.config = args.config.replace('+', "\n");
        Some(args.config.clone())
    };

    // set up termination signals handler
    let (tx_term, rx_term) = watch::channel(false);
    ctrlc::set_handler(move || {
        if let Err(e) = tx_term.send(true) {
            pf_error!(id; "error sending to term channel: {}", e);
        }
    })?;

    let log_level = log::max_level();
    {
        // create tokio multi-threaded runtime
        let runtime = Builder::new_multi_thread()
            .enable_all()
            .worker_threads(args.threads)
            .thread_name("tokio-worker-node")
            .build()?;

        // enter tokio runtime, connect to the group, and run the replica
        // event loop alongside the workload driver
        runtime.block_on(async move {
            let (mut replica, handle) = MaekawaReplica::new_and_setup(
                id,
                p2p_addr,
                peer_addrs,
                config_str.as_deref(),
            )
            .await?;

            let workload =
                tokio::spawn(run_workload(handle, id, replica.config().clone()));
            let summary = replica.run(rx_term).await?;

            if summary.all_done {
                match workload.await {
                    Ok(res) => {
                        res?;
                    }
                    Err(e) => return Err(MaekawaError::msg(e)),
                }
                pf_info!(id; "{}", summary);
            } else {
                workload.abort();
                pf_warn!(id; "{}", summary);
            }

            // suppress logging before dropping the runtime to avoid spurious
            // error messages
            log::set_max_level(LevelFilter::Off);

            Ok::<(), MaekawaError>(()) // give type hint for this async closure
        })?;
    } // drop the runtime here

    log::set_max_level(log_level);
    Ok(())
}

/// Main function of Maekawa node executable.
fn main() -> ExitCode {
    logger_init();

    if let Err(ref e) = node_main() {
        pf_error!("node"; "node_main exited: {}", e);
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
