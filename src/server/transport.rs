//! Node-to-node TCP transport module implementation.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::net::SocketAddr;

use crate::protocol::NodeId;
use crate::utils::{
    safe_tcp_read, tcp_bind_with_retry, tcp_connect_with_retry, tcp_write_obj,
    Bitmap, MaekawaError,
};

use bytes::BytesMut;

use serde::{de::DeserializeOwned, Serialize};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Event surfaced from a peer messenger task.
#[derive(Debug)]
pub(crate) enum PeerEvent<Msg> {
    /// A message received from the peer, in link order.
    Recv(Msg),

    /// The link to the peer broke (I/O error, EOF, or bad frame); no more
    /// events will follow from this peer.
    Broken(MaekawaError),
}

/// Node-to-node TCP transport module. One messenger task per peer owns the
/// single stream to that peer, so delivery on each link is FIFO.
pub(crate) struct TransportHub<Msg> {
    /// My node ID.
    me: NodeId,

    /// Total number of nodes.
    population: u8,

    /// Capacity of a per-peer send channel.
    chan_send_cap: usize,

    /// Map from peer ID -> sender side of its send channel.
    tx_sends: HashMap<NodeId, mpsc::Sender<Msg>>,

    /// Sender side of the recv channel, cloned into each messenger task.
    tx_recv: mpsc::Sender<(NodeId, PeerEvent<Msg>)>,

    /// Receiver side of the recv channel.
    rx_recv: mpsc::Receiver<(NodeId, PeerEvent<Msg>)>,

    /// TCP listener for peer connections.
    peer_listener: TcpListener,

    /// Map from peer ID -> peer messenger task join handles.
    peer_messenger_handles: HashMap<NodeId, JoinHandle<()>>,
}

// TransportHub public API implementation
impl<Msg> TransportHub<Msg>
where
    Msg: fmt::Debug + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Creates a new transport hub and binds the listener for peer
    /// connections.
    pub(crate) async fn new_and_setup(
        me: NodeId,
        population: u8,
        p2p_addr: SocketAddr,
        chan_send_cap: usize,
        chan_recv_cap: usize,
    ) -> Result<Self, MaekawaError> {
        if me >= population {
            return logged_err!(me; "invalid node ID {} / {}", me, population);
        }
        if chan_send_cap == 0 {
            return logged_err!(me; "invalid chan_send_cap {}", chan_send_cap);
        }
        if chan_recv_cap == 0 {
            return logged_err!(me; "invalid chan_recv_cap {}", chan_recv_cap);
        }

        let (tx_recv, rx_recv) = mpsc::channel(chan_recv_cap);
        let peer_listener = tcp_bind_with_retry(p2p_addr, 10).await?;

        Ok(TransportHub {
            me,
            population,
            chan_send_cap,
            tx_sends: HashMap::new(),
            tx_recv,
            rx_recv,
            peer_listener,
            peer_messenger_handles: HashMap::new(),
        })
    }

    /// Connects to a peer actively, retrying for a while if it is not
    /// listening yet.
    pub(crate) async fn connect_peer(
        &mut self,
        id: NodeId,
        addr: SocketAddr,
    ) -> Result<(), MaekawaError> {
        if id == self.me || id >= self.population {
            return logged_err!(self.me; "invalid peer ID {} to connect", id);
        }
        if self.peer_messenger_handles.contains_key(&id) {
            return logged_err!(self.me; "peer ID {} already connected", id);
        }

        let mut stream = tcp_connect_with_retry(addr, 100).await?;
        stream.write_u8(self.me).await?; // send my ID

        self.spawn_messenger(id, addr, stream);
        pf_debug!(self.me; "connected to peer {}", id);
        Ok(())
    }

    /// Waits for a connection attempt from some peer and spawns its messenger
    /// task. Returns the connecting peer's ID.
    pub(crate) async fn wait_on_peer(&mut self) -> Result<NodeId, MaekawaError> {
        let (mut stream, addr) = self.peer_listener.accept().await?;
        let id = stream.read_u8().await?; // receive connecting peer's ID

        if id == self.me || id >= self.population {
            return logged_err!(self.me; "invalid peer ID {} waited on", id);
        }
        if self.peer_messenger_handles.contains_key(&id) {
            return logged_err!(self.me; "peer ID {} already connected", id);
        }

        self.spawn_messenger(id, addr, stream);
        pf_debug!(self.me; "waited on peer {}", id);
        Ok(id)
    }

    /// Deadlock-free strategy for a group of nodes to connect with each
    /// other: connect actively to every peer with a smaller ID, then wait on
    /// every peer with a larger ID. Entries for myself are ignored. Returns
    /// the set of peer IDs connected.
    pub(crate) async fn group_connect(
        &mut self,
        peer_addrs: &HashMap<NodeId, SocketAddr>,
    ) -> Result<HashSet<NodeId>, MaekawaError> {
        let mut peer_ids: Vec<NodeId> = peer_addrs
            .keys()
            .filter(|&&id| id != self.me)
            .cloned()
            .collect();
        peer_ids.sort();
        if peer_ids.len() + 1 != self.population as usize
            || peer_ids.iter().any(|&id| id >= self.population)
        {
            return logged_err!(
                self.me;
                "invalid peer_addrs keys {:?} for population {}",
                peer_ids, self.population
            );
        }

        let mid_idx = peer_ids.partition_point(|&id| id < self.me);
        let mut connected: HashSet<NodeId> = HashSet::new();

        // for peers with ID smaller than me, connect to them actively
        for &id in &peer_ids[..mid_idx] {
            self.connect_peer(id, peer_addrs[&id]).await?;
            connected.insert(id);
        }

        // for peers with ID larger than me, wait on their connection
        for _ in &peer_ids[mid_idx..] {
            let id = self.wait_on_peer().await?;
            if id <= self.me {
                return logged_err!(self.me; "unexpected peer ID {} waited on", id);
            }
            if !connected.insert(id) {
                return logged_err!(self.me; "duplicate peer ID {} waited on", id);
            }
        }

        pf_info!(self.me; "group connected peers {:?}", peer_ids);
        Ok(connected)
    }

    /// Sends a message to a peer by pushing into its send channel.
    pub(crate) async fn send_msg(
        &mut self,
        msg: Msg,
        peer: NodeId,
    ) -> Result<(), MaekawaError> {
        match self.tx_sends.get(&peer) {
            Some(tx_send) => {
                tx_send.send(msg).await?;
                Ok(())
            }
            None => Err(MaekawaError::transport(format!(
                "peer ID {} not among connected ones",
                peer
            ))),
        }
    }

    /// Sends a message to every peer in `targets`; my own bit is skipped.
    pub(crate) async fn bcast_msg(
        &mut self,
        msg: Msg,
        targets: &Bitmap,
    ) -> Result<(), MaekawaError> {
        for peer in targets.ones() {
            if peer == self.me {
                continue;
            }
            self.send_msg(msg.clone(), peer).await?;
        }
        Ok(())
    }

    /// Receives the next event from some peer. Returns `(peer_id, event)`.
    pub(crate) async fn recv_msg(
        &mut self,
    ) -> Result<(NodeId, PeerEvent<Msg>), MaekawaError> {
        match self.rx_recv.recv().await {
            Some((id, event)) => Ok((id, event)),
            None => logged_err!(self.me; "recv channel has been closed"),
        }
    }

    /// Number of peers currently connected.
    #[inline]
    pub(crate) fn num_connected(&self) -> usize {
        self.peer_messenger_handles.len()
    }

    /// Closes every send channel and waits for all messenger tasks to exit.
    /// Each messenger writes out whatever is still queued for its peer
    /// before closing the stream, so on return every message sent through
    /// this hub has reached the socket. Inbound messages arriving meanwhile
    /// are discarded.
    pub(crate) async fn shutdown(&mut self) {
        self.tx_sends.clear();
        self.rx_recv.close();
        for (id, handle) in self.peer_messenger_handles.drain() {
            if let Err(e) = handle.await {
                pf_warn!(self.me; "peer_messenger task for {} join error: {}", id, e);
            }
        }
        pf_debug!(self.me; "transport hub shut down");
    }
}

// TransportHub peer_messenger task implementation
impl<Msg> TransportHub<Msg>
where
    Msg: fmt::Debug + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Creates the send channel to a newly connected peer and spawns its
    /// messenger task.
    fn spawn_messenger(&mut self, id: NodeId, addr: SocketAddr, stream: TcpStream) {
        let (tx_send, rx_send) = mpsc::channel(self.chan_send_cap);
        self.tx_sends.insert(id, tx_send);

        let peer_messenger_handle = tokio::spawn(Self::peer_messenger_task(
            self.me,
            id,
            addr,
            stream,
            rx_send,
            self.tx_recv.clone(),
        ));
        self.peer_messenger_handles.insert(id, peer_messenger_handle);
    }

    /// Peer messenger task function.
    async fn peer_messenger_task(
        me: NodeId,
        id: NodeId,       // corresponding peer's ID
        addr: SocketAddr, // corresponding peer's address
        mut conn: TcpStream,
        mut rx_send: mpsc::Receiver<Msg>,
        tx_recv: mpsc::Sender<(NodeId, PeerEvent<Msg>)>,
    ) {
        pf_debug!(me; "peer_messenger task for {} ({}) spawned", id, addr);

        let (mut conn_read, mut conn_write) = conn.split();
        let mut read_buf = BytesMut::with_capacity(8 + 1024);

        loop {
            tokio::select! {
                // gets a message to send out
                msg = rx_send.recv() => {
                    match msg {
                        Some(msg) => {
                            if let Err(e) = tcp_write_obj(&msg, &mut conn_write).await {
                                pf_error!(me; "error sending to {}: {}", id, e);
                                let _ = tx_recv.send((id, PeerEvent::Broken(e))).await;
                                break;
                            }
                            pf_trace!(me; "sent to {} msg {:?}", id, msg);
                        },
                        None => break, // hub dropped and no messages remain
                    }
                },

                // receives new message from peer
                msg = safe_tcp_read(&mut read_buf, &mut conn_read) => {
                    match msg {
                        Ok(msg) => {
                            pf_trace!(me; "recv from {} msg {:?}", id, msg);
                            if tx_recv.send((id, PeerEvent::Recv(msg))).await.is_err() {
                                // hub shutting down; keep flushing sends
                                pf_debug!(me; "recv from {} discarded", id);
                            }
                        },
                        Err(e) => {
                            pf_debug!(me; "link from {} broken: {}", id, e);
                            let _ = tx_recv.send((id, PeerEvent::Broken(e))).await;
                            break;
                        }
                    }
                },
            }
        }

        let _ = conn_write.shutdown().await;
        pf_debug!(me; "peer_messenger task for {} ({}) exited", id, addr);
    }
}

#[cfg(test)]
mod transport_tests {
    use super::*;
    use serde::Deserialize;
    use std::sync::Arc;
    use tokio::sync::Barrier;

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    struct TestMsg(String);

    fn addrs(base: u16, population: u8) -> HashMap<NodeId, SocketAddr> {
        (0..population)
            .map(|id| {
                (id, SocketAddr::from(([127, 0, 0, 1], base + id as u16)))
            })
            .collect()
    }

    async fn connected_hub(
        me: NodeId,
        base: u16,
        population: u8,
    ) -> Result<TransportHub<TestMsg>, MaekawaError> {
        let peers = addrs(base, population);
        let mut hub =
            TransportHub::new_and_setup(me, population, peers[&me], 10, 10)
                .await?;
        hub.group_connect(&peers).await?;
        Ok(hub)
    }

    /// Receives the next message from node 0, skipping link teardown of
    /// other peers that finished earlier.
    async fn recv_from_zero(
        hub: &mut TransportHub<TestMsg>,
    ) -> Result<TestMsg, MaekawaError> {
        loop {
            match hub.recv_msg().await? {
                (0, PeerEvent::Recv(msg)) => return Ok(msg),
                (0, PeerEvent::Broken(e)) => return Err(e),
                _ => continue,
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn hub_setup_rejects_zero_caps() -> Result<(), MaekawaError> {
        let addr = "127.0.0.1:54790".parse()?;
        assert!(TransportHub::<TestMsg>::new_and_setup(0, 3, addr, 0, 1)
            .await
            .is_err());
        assert!(TransportHub::<TestMsg>::new_and_setup(3, 3, addr, 1, 1)
            .await
            .is_err());
        let hub = TransportHub::<TestMsg>::new_and_setup(0, 3, addr, 1, 1).await?;
        assert_eq!(hub.num_connected(), 0);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn group_connect_three() -> Result<(), MaekawaError> {
        let barrier = Arc::new(Barrier::new(3));
        let mut tasks = vec![];
        for me in 1..3 {
            let barrier = barrier.clone();
            tasks.push(tokio::spawn(async move {
                let hub = connected_hub(me, 54800, 3).await?;
                assert_eq!(hub.num_connected(), 2);
                barrier.wait().await;
                Ok::<(), MaekawaError>(())
            }));
        }
        let hub = connected_hub(0, 54800, 3).await?;
        assert_eq!(hub.num_connected(), 2);
        barrier.wait().await;
        for task in tasks {
            task.await.map_err(MaekawaError::msg)??;
        }
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn send_recv_fifo() -> Result<(), MaekawaError> {
        let peer = tokio::spawn(async move {
            let mut hub = connected_hub(1, 54810, 3).await?;
            // echo back everything node 0 sends, in order
            for _ in 0..5 {
                let msg = recv_from_zero(&mut hub).await?;
                hub.send_msg(msg, 0).await?;
            }
            assert_eq!(recv_from_zero(&mut hub).await?, TestMsg("bye".into()));
            Ok::<(), MaekawaError>(())
        });
        let other = tokio::spawn(async move {
            let mut hub = connected_hub(2, 54810, 3).await?;
            assert_eq!(recv_from_zero(&mut hub).await?, TestMsg("bye".into()));
            Ok::<(), MaekawaError>(())
        });

        let mut hub = connected_hub(0, 54810, 3).await?;
        for i in 0..5 {
            hub.send_msg(TestMsg(format!("m{}", i)), 1).await?;
        }
        for i in 0..5 {
            match hub.recv_msg().await? {
                (1, PeerEvent::Recv(msg)) => {
                    assert_eq!(msg, TestMsg(format!("m{}", i)))
                }
                (id, event) => panic!("unexpected {:?} from {}", event, id),
            }
        }
        assert!(hub.send_msg(TestMsg("self".into()), 0).await.is_err());
        hub.bcast_msg(TestMsg("bye".into()), &Bitmap::new(3, true))
            .await?;
        peer.await.map_err(MaekawaError::msg)??;
        other.await.map_err(MaekawaError::msg)??;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn dropped_peer_breaks_link() -> Result<(), MaekawaError> {
        let peer = tokio::spawn(async move {
            let mut hub = connected_hub(1, 54820, 2).await?;
            hub.send_msg(TestMsg("last words".into()), 0).await?;
            // give the messenger a moment to flush before dropping the hub
            tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
            Ok::<(), MaekawaError>(())
        });

        let mut hub = connected_hub(0, 54820, 2).await?;
        let (id, event) = hub.recv_msg().await?;
        assert_eq!(id, 1);
        assert!(matches!(event, PeerEvent::Recv(_)));
        peer.await.map_err(MaekawaError::msg)??;
        let (id, event) = hub.recv_msg().await?;
        assert_eq!(id, 1);
        assert!(matches!(event, PeerEvent::Broken(MaekawaError::Transport(_))));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn shutdown_flushes_queued_sends() -> Result<(), MaekawaError> {
        let peer = tokio::spawn(async move {
            let mut hub = connected_hub(1, 54830, 2).await?;
            for i in 0..200 {
                hub.send_msg(TestMsg(format!("m{}", i)), 0).await?;
            }
            hub.shutdown().await;
            assert_eq!(hub.num_connected(), 0);
            assert!(hub.send_msg(TestMsg("late".into()), 0).await.is_err());
            Ok::<(), MaekawaError>(())
        });

        let mut hub = connected_hub(0, 54830, 2).await?;
        peer.await.map_err(MaekawaError::msg)??;
        for i in 0..200 {
            match hub.recv_msg().await? {
                (1, PeerEvent::Recv(msg)) => {
                    assert_eq!(msg, TestMsg(format!("m{}", i)))
                }
                (id, event) => panic!("unexpected {:?} from {}", event, id),
            }
        }
        let (id, event) = hub.recv_msg().await?;
        assert_eq!(id, 1);
        assert!(matches!(event, PeerEvent::Broken(MaekawaError::Transport(_))));
        Ok(())
    }
}
