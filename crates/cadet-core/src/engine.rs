//! Async driver
//!
//! Runs a [`Core`] on its own tokio task. Neighbor events, DHT results and
//! client calls arrive as [`EngineCommand`]s; whatever the core wants done
//! goes to a [`Transport`], channel events to an event stream. Timers are
//! served by sleeping until the next deadline of the core.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use cadet_crypto::PeerIdentity;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::channel::{ChannelEvent, ChannelNumber, ChannelOptions, Port};
use crate::core::Core;
use crate::error::{CoreError, CoreResult};
use crate::output::{Continuation, Output, SendHandle};
use crate::stats::Statistics;
use crate::tunnel::TunnelInfo;

/// Capacity of the command queue of one engine
const COMMAND_QUEUE: usize = 1024;

/// What the engine needs from the outside world
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a message to a direct neighbor
    async fn send(&self, to: PeerIdentity, message: Bytes) -> CoreResult<()>;

    /// Start a DHT lookup; results come back as [`EngineCommand::DhtResult`]
    async fn dht_search(&self, target: PeerIdentity);

    async fn dht_stop(&self, target: PeerIdentity);

    /// Try to reach `peer` at transport level
    async fn try_connect(&self, peer: PeerIdentity, hello: Bytes);
}

/// Input to the engine task
pub enum EngineCommand {
    PeerConnected(PeerIdentity),
    PeerDisconnected(PeerIdentity),
    /// Message from a direct neighbor
    Message { from: PeerIdentity, message: Bytes },
    DhtResult {
        get_path: Vec<PeerIdentity>,
        put_path: Vec<PeerIdentity>,
        hello: Option<Bytes>,
    },
    SetHello { peer: PeerIdentity, hello: Bytes },
    OpenPort {
        port: Port,
        reply: oneshot::Sender<CoreResult<()>>,
    },
    ClosePort {
        port: Port,
        reply: oneshot::Sender<CoreResult<()>>,
    },
    ChannelCreate {
        peer: PeerIdentity,
        port: Port,
        options: ChannelOptions,
        reply: oneshot::Sender<CoreResult<ChannelNumber>>,
    },
    ChannelSend {
        peer: PeerIdentity,
        chid: ChannelNumber,
        payload: Bytes,
        continuation: Option<Continuation>,
        reply: oneshot::Sender<CoreResult<SendHandle>>,
    },
    ChannelAck {
        peer: PeerIdentity,
        chid: ChannelNumber,
        reply: oneshot::Sender<CoreResult<()>>,
    },
    ChannelDestroy {
        peer: PeerIdentity,
        chid: ChannelNumber,
        reply: oneshot::Sender<CoreResult<()>>,
    },
    TunnelInfo {
        peer: PeerIdentity,
        reply: oneshot::Sender<Option<TunnelInfo>>,
    },
    Statistics { reply: oneshot::Sender<Statistics> },
    Shutdown,
}

/// Cheap handle to a running engine
#[derive(Clone)]
pub struct EngineHandle {
    local_id: PeerIdentity,
    commands: mpsc::Sender<EngineCommand>,
}

impl EngineHandle {
    pub fn local_id(&self) -> PeerIdentity {
        self.local_id
    }

    /// Queue a command for the engine task
    pub async fn command(&self, command: EngineCommand) -> CoreResult<()> {
        self.commands.send(command).await.map_err(|_| CoreError::ShutDown)
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> EngineCommand) -> CoreResult<T> {
        let (reply, response) = oneshot::channel();
        self.command(build(reply)).await?;
        response.await.map_err(|_| CoreError::ShutDown)
    }

    pub async fn peer_connected(&self, peer: PeerIdentity) -> CoreResult<()> {
        self.command(EngineCommand::PeerConnected(peer)).await
    }

    pub async fn peer_disconnected(&self, peer: PeerIdentity) -> CoreResult<()> {
        self.command(EngineCommand::PeerDisconnected(peer)).await
    }

    /// Hand a message received from neighbor `from` to the core
    pub async fn deliver(&self, from: PeerIdentity, message: Bytes) -> CoreResult<()> {
        self.command(EngineCommand::Message { from, message }).await
    }

    pub async fn open_port(&self, port: Port) -> CoreResult<()> {
        self.request(|reply| EngineCommand::OpenPort { port, reply }).await?
    }

    pub async fn close_port(&self, port: Port) -> CoreResult<()> {
        self.request(|reply| EngineCommand::ClosePort { port, reply }).await?
    }

    pub async fn channel_create(&self, peer: PeerIdentity, port: Port, options: ChannelOptions) -> CoreResult<ChannelNumber> {
        self.request(|reply| EngineCommand::ChannelCreate {
            peer,
            port,
            options,
            reply,
        })
        .await?
    }

    pub async fn channel_send(
        &self,
        peer: PeerIdentity,
        chid: ChannelNumber,
        payload: Bytes,
        continuation: Option<Continuation>,
    ) -> CoreResult<SendHandle> {
        self.request(|reply| EngineCommand::ChannelSend {
            peer,
            chid,
            payload,
            continuation,
            reply,
        })
        .await?
    }

    pub async fn channel_ack(&self, peer: PeerIdentity, chid: ChannelNumber) -> CoreResult<()> {
        self.request(|reply| EngineCommand::ChannelAck { peer, chid, reply }).await?
    }

    pub async fn channel_destroy(&self, peer: PeerIdentity, chid: ChannelNumber) -> CoreResult<()> {
        self.request(|reply| EngineCommand::ChannelDestroy { peer, chid, reply }).await?
    }

    pub async fn tunnel_info(&self, peer: PeerIdentity) -> CoreResult<Option<TunnelInfo>> {
        self.request(|reply| EngineCommand::TunnelInfo { peer, reply }).await
    }

    pub async fn statistics(&self) -> CoreResult<Statistics> {
        self.request(|reply| EngineCommand::Statistics { reply }).await
    }

    /// Ask the engine to shut the core down and stop
    pub async fn shutdown(&self) -> CoreResult<()> {
        self.command(EngineCommand::Shutdown).await
    }
}

enum Wake {
    Command(Option<EngineCommand>),
    Timer,
}

/// Owner of a core running on a tokio task
pub struct Engine {
    core: Core,
    transport: Arc<dyn Transport>,
    commands: mpsc::Receiver<EngineCommand>,
    events: mpsc::UnboundedSender<ChannelEvent>,
}

impl Engine {
    /// Start driving `core`
    ///
    /// Returns the handle for feeding the engine, the stream of channel
    /// events and the task, which ends after shutdown.
    pub fn spawn(
        core: Core,
        transport: Arc<dyn Transport>,
    ) -> (EngineHandle, mpsc::UnboundedReceiver<ChannelEvent>, JoinHandle<()>) {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let handle = EngineHandle {
            local_id: *core.local_id(),
            commands: command_tx,
        };
        let engine = Self {
            core,
            transport,
            commands: command_rx,
            events: event_tx,
        };
        let task = tokio::spawn(engine.run());
        (handle, event_rx, task)
    }

    async fn run(mut self) {
        info!("Engine for {:?} running", self.core.local_id());
        loop {
            self.flush().await;
            if self.core.is_shut_down() {
                break;
            }
            let deadline = self.core.next_deadline();
            let wake = tokio::select! {
                command = self.commands.recv() => Wake::Command(command),
                _ = sleep_until(deadline) => Wake::Timer,
            };
            match wake {
                Wake::Command(Some(command)) => self.handle_command(command),
                Wake::Command(None) => {
                    debug!("All engine handles dropped");
                    self.core.shutdown();
                }
                Wake::Timer => self.core.advance(Instant::now().into_std()),
            }
        }
        self.flush().await;
        info!("Engine for {:?} stopped", self.core.local_id());
    }

    fn handle_command(&mut self, command: EngineCommand) {
        self.core.advance(Instant::now().into_std());
        let core = &mut self.core;
        // A dropped reply receiver only means the caller lost interest
        match command {
            EngineCommand::PeerConnected(peer) => core.peer_connected(peer),
            EngineCommand::PeerDisconnected(peer) => core.peer_disconnected(peer),
            EngineCommand::Message { from, message } => core.handle_message(from, message),
            EngineCommand::DhtResult {
                get_path,
                put_path,
                hello,
            } => core.handle_dht_result(&get_path, &put_path, hello),
            EngineCommand::SetHello { peer, hello } => core.set_hello(peer, hello),
            EngineCommand::OpenPort { port, reply } => {
                let _ = reply.send(core.open_port(port));
            }
            EngineCommand::ClosePort { port, reply } => {
                let _ = reply.send(core.close_port(port));
            }
            EngineCommand::ChannelCreate {
                peer,
                port,
                options,
                reply,
            } => {
                let _ = reply.send(core.channel_create(peer, port, options));
            }
            EngineCommand::ChannelSend {
                peer,
                chid,
                payload,
                continuation,
                reply,
            } => {
                let _ = reply.send(core.channel_send(peer, chid, payload, continuation));
            }
            EngineCommand::ChannelAck { peer, chid, reply } => {
                let _ = reply.send(core.channel_ack(peer, chid));
            }
            EngineCommand::ChannelDestroy { peer, chid, reply } => {
                let _ = reply.send(core.channel_destroy(peer, chid));
            }
            EngineCommand::TunnelInfo { peer, reply } => {
                let _ = reply.send(core.tunnel_info(&peer));
            }
            EngineCommand::Statistics { reply } => {
                let _ = reply.send(core.statistics().clone());
            }
            EngineCommand::Shutdown => core.shutdown(),
        }
    }

    /// Carry out everything the core asked for
    async fn flush(&mut self) {
        while let Some(output) = self.core.poll_output() {
            match output {
                Output::Transmit { to, message } => {
                    if let Err(e) = self.transport.send(to, message).await {
                        warn!("Transmission to {:?} failed: {}", to, e);
                    }
                    self.core.transmit_done(to);
                }
                Output::DhtSearch { target } => self.transport.dht_search(target).await,
                Output::DhtStop { target } => self.transport.dht_stop(target).await,
                Output::TryConnect { peer, hello } => self.transport.try_connect(peer, hello).await,
                Output::Channel(event) => {
                    if self.events.send(event).is_err() {
                        debug!("Channel event receiver is gone");
                    }
                }
            }
        }
    }
}

async fn sleep_until(deadline: Option<std::time::Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(Instant::from_std(at)).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoreConfig;
    use crate::message::{peek_cid, peek_header, MessageType};
    use cadet_crypto::Identity;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Records what the engine asks for
    struct Recorder {
        tx: mpsc::UnboundedSender<Output>,
    }

    #[async_trait]
    impl Transport for Recorder {
        async fn send(&self, to: PeerIdentity, message: Bytes) -> CoreResult<()> {
            let _ = self.tx.send(Output::Transmit { to, message });
            Ok(())
        }

        async fn dht_search(&self, target: PeerIdentity) {
            let _ = self.tx.send(Output::DhtSearch { target });
        }

        async fn dht_stop(&self, target: PeerIdentity) {
            let _ = self.tx.send(Output::DhtStop { target });
        }

        async fn try_connect(&self, peer: PeerIdentity, hello: Bytes) {
            let _ = self.tx.send(Output::TryConnect { peer, hello });
        }
    }

    /// Delivers straight into the engine of the receiving neighbor
    struct Switch {
        me: PeerIdentity,
        engines: Arc<Mutex<HashMap<PeerIdentity, EngineHandle>>>,
    }

    #[async_trait]
    impl Transport for Switch {
        async fn send(&self, to: PeerIdentity, message: Bytes) -> CoreResult<()> {
            let handle = self.engines.lock().unwrap().get(&to).cloned();
            match handle {
                Some(handle) => handle.deliver(self.me, message).await,
                None => Err(CoreError::UnknownPeer(to)),
            }
        }

        async fn dht_search(&self, _target: PeerIdentity) {}

        async fn dht_stop(&self, _target: PeerIdentity) {}

        async fn try_connect(&self, _peer: PeerIdentity, _hello: Bytes) {}
    }

    fn core() -> Core {
        Core::new(Identity::generate(), CoreConfig::testing(), Instant::now().into_std()).unwrap()
    }

    async fn next_create(rx: &mut mpsc::UnboundedReceiver<Output>) -> (PeerIdentity, Bytes) {
        loop {
            match rx.recv().await {
                Some(Output::Transmit { to, message }) => {
                    if peek_header(&message).map(|(_, t)| t).ok() == Some(MessageType::ConnectionCreate) {
                        return (to, message);
                    }
                }
                Some(_) => {}
                None => panic!("engine stopped"),
            }
        }
    }

    #[tokio::test]
    async fn test_unreachable_peer_starts_dht_search() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (handle, _events, task) = Engine::spawn(core(), Arc::new(Recorder { tx }));
        let target = Identity::generate().peer_id();

        handle
            .channel_create(target, Port::from_name("echo"), ChannelOptions::DEFAULT)
            .await
            .unwrap();
        assert_eq!(rx.recv().await, Some(Output::DhtSearch { target }));

        handle.shutdown().await.unwrap();
        assert_eq!(rx.recv().await, Some(Output::DhtStop { target }));
        task.await.unwrap();
        assert!(matches!(handle.statistics().await, Err(CoreError::ShutDown)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_is_retried_without_ack() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (handle, _events, _task) = Engine::spawn(core(), Arc::new(Recorder { tx }));
        let neighbor = Identity::generate().peer_id();

        handle.peer_connected(neighbor).await.unwrap();
        handle
            .channel_create(neighbor, Port::from_name("echo"), ChannelOptions::DEFAULT)
            .await
            .unwrap();

        let started = Instant::now();
        let (to, first) = next_create(&mut rx).await;
        assert_eq!(to, neighbor);
        let (_, second) = next_create(&mut rx).await;
        assert!(started.elapsed() >= CoreConfig::testing().create_connection_time);
        assert_eq!(peek_cid(&first).unwrap(), peek_cid(&second).unwrap());

        let info = handle.tunnel_info(neighbor).await.unwrap().unwrap();
        assert_eq!(info.connections, 1);
        assert_eq!(info.ready_connections, 0);
    }

    #[tokio::test]
    async fn test_two_engines_exchange_data() {
        let engines = Arc::new(Mutex::new(HashMap::new()));
        let (a_core, b_core) = (core(), core());
        let (a, b) = (*a_core.local_id(), *b_core.local_id());
        let (a_handle, mut a_events, _) = Engine::spawn(
            a_core,
            Arc::new(Switch {
                me: a,
                engines: engines.clone(),
            }),
        );
        let (b_handle, mut b_events, _) = Engine::spawn(
            b_core,
            Arc::new(Switch {
                me: b,
                engines: engines.clone(),
            }),
        );
        engines.lock().unwrap().insert(a, a_handle.clone());
        engines.lock().unwrap().insert(b, b_handle.clone());

        let port = Port::from_name("echo");
        b_handle.open_port(port).await.unwrap();
        a_handle.peer_connected(b).await.unwrap();
        b_handle.peer_connected(a).await.unwrap();

        let chid = a_handle.channel_create(b, port, ChannelOptions::RELIABLE).await.unwrap();
        let opened = tokio::time::timeout(Duration::from_secs(5), a_events.recv())
            .await
            .unwrap();
        assert_eq!(opened, Some(ChannelEvent::ChannelOpened { peer: b, chid }));
        assert!(matches!(
            b_events.recv().await,
            Some(ChannelEvent::IncomingChannel { peer, .. }) if peer == a
        ));

        a_handle
            .channel_send(b, chid, Bytes::from_static(b"hello"), None)
            .await
            .unwrap();
        let data = tokio::time::timeout(Duration::from_secs(5), b_events.recv())
            .await
            .unwrap();
        assert_eq!(
            data,
            Some(ChannelEvent::Data {
                peer: a,
                chid,
                payload: Bytes::from_static(b"hello")
            })
        );

        let stats = b_handle.statistics().await.unwrap();
        assert_eq!(stats.get("# channel data received"), 1);
        assert_eq!(stats.get("# wrong HMAC"), 0);

        a_handle.shutdown().await.unwrap();
        b_handle.shutdown().await.unwrap();
    }
}
