//! Maekawa mutual exclusion cluster launcher: runs a whole population of
//! nodes on localhost inside one process.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::process::ExitCode;

use clap::Parser;
use log::{self, LevelFilter};
use maekawa::{
    logger_init, pf_error, pf_info, pf_warn, run_workload, MaekawaError,
    MaekawaReplica, NodeId, ReplicaConfigMaekawa, RunSummary,
};
use tokio::runtime::Builder;
use tokio::sync::watch;

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Total number of nodes in cluster.
    #[arg(short = 'n', long, default_value_t = 4)]
    population: u8,

    /// Peer-facing port of node 0; node i listens on `base_port + i`.
    /// Ports [base_port, base_port + population) must be available.
    #[arg(short, long, default_value_t = 52700)]
    base_port: u16,

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
        if self.population == 0 {
            Err(MaekawaError::config(format!(
                "invalid population {}",
                self.population
            )))
        } else if self.base_port <= 1024
            || self.base_port as u32 + self.population as u32 > u16::MAX as u32 + 1
        {
            Err(MaekawaError::config(format!(
                "invalid base_port {} for population {}",
                self.base_port, self.population
            )))
        } else if self.threads < 2 {
            Err(MaekawaError::config(format!(
                "invalid number of threads {}",
                self.threads
            )))
        } else {
            Ok((0..self.population)
                .map(|id| {
                    let port = self.base_port + id as u16;
                    (id, SocketAddr::from((Ipv4Addr::LOCALHOST, port)))
                })
                .collect())
        }
    }
}

/// Sets up one node, runs its workload to completion (or interruption), and
/// returns its summary.
async fn run_node(
    id: NodeId,
    peer_addrs: HashMap<NodeId, SocketAddr>,
    config_str: Option<String>,
    rx_term: watch::Receiver<bool>,
) -> Result<RunSummary, MaekawaError> {
    let p2p_addr = peer_addrs[&id];
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
        workload.await.map_err(MaekawaError::msg)??;
    } else {
        workload.abort();
    }
    Ok(summary)
}

/// Actual main function of Maekawa cluster launcher.
fn cluster_main() -> Result<(), MaekawaError> {
    // read in and parse command line arguments
    let mut args = CliArgs::parse();
    let peer_addrs = args.sanitize()?;

    // parse optional config string if given; validate it once up front
    let config_str = if args.config.is_empty() {
        None
    } else {
        args.config = args.config.replace('+', "\n");
        Some(args.config.clone())
    };
    let config = ReplicaConfigMaekawa::parse(config_str.as_deref())?;
    config.quorum_table(args.population)?;
    pf_info!("cluster"; "launching {} nodes, {} cycles each",
                        args.population, config.quota);

    // set up termination signals handler
    let (tx_term, rx_term) = watch::channel(false);
    ctrlc::set_handler(move || {
        if let Err(e) = tx_term.send(true) {
            pf_error!("cluster"; "error sending to term channel: {}", e);
        }
    })?;

    let log_level = log::max_level();
    {
        // create tokio multi-threaded runtime
        let runtime = Builder::new_multi_thread()
            .enable_all()
            .worker_threads(args.threads)
            .thread_name("tokio-worker-cluster")
            .build()?;

        runtime.block_on(async move {
            let mut nodes = vec![];
            for id in 0..args.population {
                nodes.push(tokio::spawn(run_node(
                    id,
                    peer_addrs.clone(),
                    config_str.clone(),
                    rx_term.clone(),
                )));
            }

            let mut summaries = vec![];
            for node in nodes {
                summaries.push(node.await.map_err(MaekawaError::msg)??);
            }

            let entries: u32 = summaries.iter().map(|s| s.completed).sum();
            let expected = args.population as u32 * config.quota;
            for summary in &summaries {
                pf_info!("cluster"; "{}", summary);
            }
            if summaries.iter().all(|s| s.all_done) {
                if entries != expected {
                    return Err(MaekawaError::msg(format!(
                        "{} CS entries completed, expected {}",
                        entries, expected
                    )));
                }
                pf_info!("cluster"; "all nodes done, {} CS entries", entries);
            } else {
                pf_warn!("cluster"; "interrupted after {} CS entries", entries);
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

/// Main function of Maekawa cluster launcher.
fn main() -> ExitCode {
    logger_init();

    if let Err(ref e) = cluster_main() {
        pf_error!("cluster"; "cluster_main exited: {}", e);
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
