use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::bail;
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use rustc_hash::FxHashMap;
use tokio::net::UdpSocket;
use tokio::select;
use tokio::sync::Mutex;
use tokio::time::interval;
use tracing::{debug, error, info, span, trace, warn, Instrument, Level};
use uuid::Uuid;

use crate::ack::Statistics;
use crate::buffers::pool::BufferPool;
use crate::config::ReliableConfig;
use crate::errors::PipelineError;
use crate::packet_header::PacketHeader;
use crate::pipeline::ReliableStage;

/// This is an abstraction for sending a datagram on a UDP socket, introduced to
///  facilitate mocking the I/O part away for testing
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DatagramSink: Send + Sync + 'static {
    async fn send_datagram(&self, to: SocketAddr, datagram: &[u8]);

    fn local_addr(&self) -> SocketAddr;
}

#[async_trait]
impl DatagramSink for Arc<UdpSocket> {
    async fn send_datagram(&self, to: SocketAddr, datagram: &[u8]) {
        trace!("UDP socket: sending datagram to {:?}", to);

        if let Err(e) = self.send_to(datagram, to).await {
            error!("error sending UDP datagram to {:?}: {}", to, e);
        }
    }

    fn local_addr(&self) -> SocketAddr {
        self.as_ref().local_addr()
            .expect("UdpSocket should have an initialized local addr")
    }
}

/// callback for application payloads coming out of the reliable-sequenced stage, in
///  order and exactly once per peer
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MessageDispatcher: Send + Sync + 'static {
    async fn on_message(&self, sender_addr: SocketAddr, msg_buf: &[u8]);
}

/// EndPoint is the place where the parts come together: it listens on a UdpSocket,
///  feeds inbound datagrams into the per-peer stage, drives the update tick that
///  triggers resends and standalone acks, and has an API for application code to send
///  messages.
///
/// Each peer's stage sits behind its own lock and is only ever driven by one call at a
///  time - sends, receives and ticks for a connection never overlap, while different
///  connections proceed independently.
pub struct EndPoint {
    receive_socket: Arc<UdpSocket>,
    send_socket: Arc<dyn DatagramSink>,
    message_dispatcher: Arc<dyn MessageDispatcher>,
    config: Arc<ReliableConfig>,
    buffer_pool: Arc<BufferPool>,
    connections: Mutex<FxHashMap<SocketAddr, Arc<Mutex<ReliableStage>>>>,
    start: Instant,
}

impl EndPoint {
    pub async fn bind(
        addr: SocketAddr,
        message_dispatcher: Arc<dyn MessageDispatcher>,
        config: Arc<ReliableConfig>,
    ) -> anyhow::Result<EndPoint> {
        config.validate()?;

        let socket = Arc::new(UdpSocket::bind(addr).await?);
        info!("bound receive socket to {:?}", UdpSocket::local_addr(&socket)?);

        Ok(Self::new(socket.clone(), Arc::new(socket), message_dispatcher, config))
    }

    fn new(
        receive_socket: Arc<UdpSocket>,
        send_socket: Arc<dyn DatagramSink>,
        message_dispatcher: Arc<dyn MessageDispatcher>,
        config: Arc<ReliableConfig>,
    ) -> EndPoint {
        let buffer_pool = Arc::new(BufferPool::new(
            PacketHeader::CAPACITY + config.max_payload_len,
            config.buffer_pool_size,
        ));

        EndPoint {
            receive_socket,
            send_socket,
            message_dispatcher,
            config,
            buffer_pool,
            connections: Mutex::new(FxHashMap::default()),
            start: Instant::now(),
        }
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(UdpSocket::local_addr(&self.receive_socket)?)
    }

    /// the monotonic millisecond tick every stage call is stamped with
    fn now_ms(&self) -> i64 {
        self.start.elapsed().as_millis() as i64
    }

    async fn connection(&self, peer_addr: SocketAddr) -> anyhow::Result<Arc<Mutex<ReliableStage>>> {
        let mut connections = self.connections.lock().await;
        if let Some(connection) = connections.get(&peer_addr) {
            return Ok(connection.clone());
        }

        debug!("initializing connection state for {:?}", peer_addr);
        let stage = ReliableStage::new(&self.config)?;
        let connection = Arc::new(Mutex::new(stage));
        connections.insert(peer_addr, connection.clone());
        Ok(connection)
    }

    /// Hand a message to the reliable-sequenced stage for `to_addr` and put the
    ///  resulting datagram on the wire. Once this returns Ok, delivery is guaranteed for
    ///  as long as the connection stays live.
    ///
    /// Returns [`PipelineError::OutgoingQueueIsFull`] (wrapped) while the send window is
    ///  saturated - transient, retry after the next tick has collected acks.
    pub async fn send_message(&self, to_addr: SocketAddr, message: &[u8]) -> anyhow::Result<()> {
        if message.len() > self.config.max_payload_len {
            debug!("message for {:?} has a maximum length of {} to fit a single packet, was {}", to_addr, self.config.max_payload_len, message.len());
            bail!("message for {:?} has a maximum length of {} to fit a single packet, was {}", to_addr, self.config.max_payload_len, message.len());
        }

        let connection = self.connection(to_addr).await?;
        let mut stage = connection.lock().await;

        match stage.send(self.now_ms(), message) {
            Ok(effect) => {
                if let Some(datagram) = effect.outbound {
                    self.send_socket.send_datagram(to_addr, &datagram).await;
                }
                Ok(())
            }
            Err(e @ PipelineError::OutgoingQueueIsFull) => {
                debug!("send window for {:?} is full - retry after the next tick", to_addr);
                Err(e.into())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn statistics(&self, peer_addr: SocketAddr) -> Option<Statistics> {
        let connection = self.connections.lock().await.get(&peer_addr).cloned()?;
        let statistics = connection.lock().await.statistics();
        Some(statistics)
    }

    pub async fn set_minimum_resend_time(&self, peer_addr: SocketAddr, ms: i64) {
        if let Some(connection) = self.connections.lock().await.get(&peer_addr).cloned() {
            connection.lock().await.set_minimum_resend_time(ms);
        }
    }

    /// Receive loop plus update ticker - this function never returns, it runs until the
    ///  task driving it is dropped.
    pub async fn recv_loop(&self) {
        info!("starting receive loop");

        let mut update_interval = interval(self.config.update_interval);
        let mut buf = self.buffer_pool.get_from_pool();

        loop {
            buf.maximize_len();
            select! {
                result = self.receive_socket.recv_from(buf.as_mut()) => {
                    let (num_read, from) = match result {
                        Ok(x) => x,
                        Err(e) => {
                            error!("socket error: {}", e);
                            continue;
                        }
                    };
                    buf.truncate(num_read);

                    let correlation_id = Uuid::new_v4();
                    let span = span!(Level::TRACE, "datagram_received", ?correlation_id);
                    self.on_datagram(from, buf.as_ref()).instrument(span).await;
                }
                _ = update_interval.tick() => {
                    self.on_update_tick().await;
                }
            }
        }
    }

    async fn on_datagram(&self, from: SocketAddr, datagram: &[u8]) {
        trace!("received datagram from {:?}: {} bytes", from, datagram.len());

        let connection = match self.connection(from).await {
            Ok(connection) => connection,
            Err(e) => {
                warn!("cannot set up connection state for {:?}: {}", from, e);
                return;
            }
        };
        let mut stage = connection.lock().await;
        let now = self.now_ms();

        let mut effect = match stage.receive(now, datagram) {
            Ok(effect) => effect,
            Err(_) => {
                warn!("received packet with unparsable header from {:?}, dropping", from);
                return;
            }
        };

        loop {
            if let Some(delivery) = effect.delivery.take() {
                self.message_dispatcher.on_message(from, &delivery).await;
            }
            if !effect.needs_resume {
                break;
            }
            effect = stage.resume_receive(now);
        }
    }

    async fn on_update_tick(&self) {
        let connections: Vec<(SocketAddr, Arc<Mutex<ReliableStage>>)> = self.connections.lock().await
            .iter()
            .map(|(addr, connection)| (*addr, connection.clone()))
            .collect();

        for (peer_addr, connection) in connections {
            let mut stage = connection.lock().await;
            let now = self.now_ms();

            loop {
                let effect = stage.update(now);
                if let Some(datagram) = effect.outbound {
                    self.send_socket.send_datagram(peer_addr, &datagram).await;
                }
                if !effect.needs_resume {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet_header::PacketType;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn test_config() -> Arc<ReliableConfig> {
        Arc::new(ReliableConfig {
            window_size: 8,
            minimum_resend_time: 20,
            update_interval: Duration::from_millis(5),
            ..ReliableConfig::default_ipv4()
        })
    }

    struct ChannelDispatcher(mpsc::UnboundedSender<(SocketAddr, Vec<u8>)>);

    #[async_trait]
    impl MessageDispatcher for ChannelDispatcher {
        async fn on_message(&self, sender_addr: SocketAddr, msg_buf: &[u8]) {
            let _ = self.0.send((sender_addr, msg_buf.to_vec()));
        }
    }

    async fn local_socket() -> Arc<UdpSocket> {
        Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap())
    }

    #[tokio::test]
    async fn test_send_message_puts_datagram_on_the_wire() {
        let peer: SocketAddr = "127.0.0.1:9999".parse().unwrap();

        let mut sink = MockDatagramSink::new();
        sink.expect_send_datagram()
            .once()
            .withf(move |to, datagram| {
                let mut buf = &datagram[..];
                let header = PacketHeader::deser(&mut buf, 8).unwrap();
                *to == peer
                    && header.packet_type == PacketType::Payload
                    && header.sequence_id == 0
                    && buf == b"hello".as_slice()
            })
            .returning(|_, _| ());

        let end_point = EndPoint::new(
            local_socket().await,
            Arc::new(sink),
            Arc::new(MockMessageDispatcher::new()),
            test_config(),
        );

        end_point.send_message(peer, b"hello").await.unwrap();
        assert_eq!(end_point.statistics(peer).await.unwrap().packets_sent, 1);
    }

    #[tokio::test]
    async fn test_oversized_message_is_rejected() {
        let peer: SocketAddr = "127.0.0.1:9999".parse().unwrap();

        let sink = MockDatagramSink::new(); // no send expected
        let end_point = EndPoint::new(
            local_socket().await,
            Arc::new(sink),
            Arc::new(MockMessageDispatcher::new()),
            test_config(),
        );

        let oversized = vec![0u8; test_config().max_payload_len + 1];
        assert!(end_point.send_message(peer, &oversized).await.is_err());
    }

    #[tokio::test]
    async fn test_roundtrip_over_loopback() {
        let (tx_a, _rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();

        let a = Arc::new(
            EndPoint::bind("127.0.0.1:0".parse().unwrap(), Arc::new(ChannelDispatcher(tx_a)), test_config()).await.unwrap(),
        );
        let b = Arc::new(
            EndPoint::bind("127.0.0.1:0".parse().unwrap(), Arc::new(ChannelDispatcher(tx_b)), test_config()).await.unwrap(),
        );
        let b_addr = b.local_addr().unwrap();

        let run_a = tokio::spawn({ let a = a.clone(); async move { a.recv_loop().await } });
        let run_b = tokio::spawn({ let b = b.clone(); async move { b.recv_loop().await } });

        for payload in [b"one".as_slice(), b"two", b"three"] {
            a.send_message(b_addr, payload).await.unwrap();
        }

        for expected in [b"one".as_slice(), b"two", b"three"] {
            let (_, payload) = tokio::time::timeout(Duration::from_secs(5), rx_b.recv())
                .await
                .expect("delivery within the timeout")
                .expect("dispatcher channel open");
            assert_eq!(payload, expected, "deliveries come out in send order");
        }

        run_a.abort();
        run_b.abort();
    }
}
