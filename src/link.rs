//! 텔레메트리 링크
//!
//! - TCP 스트림 / UDP 데이터그램 전송
//! - 드라이버 태스크 하나가 코덱과 레지스트리를 소유함
//! - 수신 바이트, tick, 쓰기 완료, API 명령을 모두 한 채널로 직렬화

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::codec::{Codec, WireVersion};
use crate::event::EventReceiver;
use crate::fetcher::Status;
use crate::message::Message;
use crate::peer::{Peer, Telemetry};
use crate::registry::Registry;
use crate::writer::{FileWriter, WriteEvent};
use crate::{Config, Error, PeerId, Result};

/// 접속 대상
#[derive(Debug, Clone)]
pub enum Endpoint {
    Tcp(SocketAddr),
    /// remote가 없으면 처음 받은 데이터그램의 주소로 응답
    Udp {
        bind: SocketAddr,
        remote: Option<SocketAddr>,
    },
}

/// 피어 상태 스냅샷 (드라이버 밖에서 조회용)
#[derive(Debug, Clone)]
pub struct PeerSnapshot {
    pub id: PeerId,
    pub connected: bool,
    pub telemetry: Telemetry,
    pub fetch_status: Option<Status>,
    pub total_progress: Option<f64>,
    pub download_rate: Option<f64>,
}

impl PeerSnapshot {
    fn capture(peer: &Peer) -> Self {
        let fetcher = peer.log_fetcher();
        Self {
            id: peer.id(),
            connected: peer.is_connected(),
            telemetry: peer.telemetry().clone(),
            fetch_status: fetcher.map(|f| f.status()),
            total_progress: fetcher.map(|f| f.total_progress()),
            download_rate: fetcher.map(|f| f.download_rate()),
        }
    }
}

/// 내부 명령
enum LinkCmd {
    Inbound(Bytes),
    Tick,
    LivenessTick,
    StartLogFetch {
        peer: PeerId,
        log_dir: PathBuf,
        reverse: bool,
        reply: oneshot::Sender<Result<()>>,
    },
    StopLogFetch {
        peer: PeerId,
        reply: oneshot::Sender<Result<()>>,
    },
    Send(Message),
    Closed,
    Stop,
}

enum Transport {
    Tcp(OwnedWriteHalf),
    Udp {
        socket: Arc<UdpSocket>,
        remote: Arc<Mutex<Option<SocketAddr>>>,
    },
}

impl Transport {
    async fn send(&mut self, bytes: &[u8]) -> Result<()> {
        match self {
            Transport::Tcp(writer) => writer.write_all(bytes).await?,
            Transport::Udp { socket, remote } => {
                let target = *remote.lock();
                match target {
                    Some(addr) => {
                        socket.send_to(bytes, addr).await?;
                    }
                    None => debug!("원격 주소 미확인, 송신 생략"),
                }
            }
        }
        Ok(())
    }
}

/// 드라이버 내부 상태 (단일 태스크에서만 접근)
struct LinkDriver {
    registry: Registry,
    codec: Codec,
    transport: Transport,
    write_tx: mpsc::UnboundedSender<(PeerId, WriteEvent)>,
    config: Config,
    snapshots: Arc<RwLock<HashMap<PeerId, PeerSnapshot>>>,
}

impl LinkDriver {
    fn handle_inbound(&mut self, data: &[u8]) {
        let now = Instant::now();
        let frames = self.codec.decode(data);
        if frames.is_empty() {
            return;
        }

        for frame in &frames {
            self.registry.dispatch(frame, now);
        }
        self.refresh_snapshots();
    }

    async fn transmit(&mut self, message: Message) {
        let bytes = match self.codec.encode(&message) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("{} 인코딩 실패: {}", message.name(), e);
                return;
            }
        };

        if let Err(e) = self.transport.send(&bytes).await {
            warn!("{} 송신 실패: {}", message.name(), e);
        }
    }

    fn start_log_fetch(&mut self, peer: PeerId, log_dir: PathBuf, reverse: bool) -> Result<()> {
        let sink = FileWriter::spawn(peer, self.write_tx.clone(), self.config.write_high_water);
        let fetcher = self
            .registry
            .enable_log_fetch(peer, log_dir, reverse, Box::new(sink))?;
        fetcher.start(Instant::now());
        self.refresh_snapshots();
        Ok(())
    }

    fn stop_log_fetch(&mut self, peer: PeerId) -> Result<()> {
        self.registry
            .peer_mut(peer)
            .ok_or(Error::UnknownPeer(peer))?
            .log_fetcher_mut()
            .ok_or(Error::FetcherMissing(peer))?
            .stop();
        self.refresh_snapshots();
        Ok(())
    }

    fn refresh_snapshots(&mut self) {
        let universal = self.registry.peer(crate::UNIVERSAL_PEER_ID);
        let snapshots: HashMap<PeerId, PeerSnapshot> = universal
            .into_iter()
            .chain(self.registry.peers())
            .map(|peer| (peer.id(), PeerSnapshot::capture(peer)))
            .collect();
        *self.snapshots.write() = snapshots;
    }
}

/// 링크 핸들 (외부에서 제어용)
pub struct Link {
    cmd_tx: mpsc::UnboundedSender<LinkCmd>,
    running: Arc<AtomicBool>,
    snapshots: Arc<RwLock<HashMap<PeerId, PeerSnapshot>>>,
    local_addr: SocketAddr,
}

impl Link {
    /// 연결 후 드라이버 시작
    pub async fn connect(
        endpoint: Endpoint,
        config: Config,
        version: WireVersion,
    ) -> Result<(Self, EventReceiver)> {
        let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel::<LinkCmd>();
        let (outbox, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
        let (write_tx, mut write_rx) = mpsc::unbounded_channel::<(PeerId, WriteEvent)>();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let running = Arc::new(AtomicBool::new(true));

        let (transport, local_addr) = match endpoint {
            Endpoint::Tcp(addr) => {
                let stream = TcpStream::connect(addr).await?;
                stream.set_nodelay(true)?;
                let local_addr = stream.local_addr()?;
                info!("TCP 링크 연결: {} (local {})", addr, local_addr);

                let (reader, writer) = stream.into_split();
                spawn_tcp_reader(reader, cmd_tx.clone(), running.clone(), config.recv_buffer_size);
                (Transport::Tcp(writer), local_addr)
            }
            Endpoint::Udp { bind, remote } => {
                let socket = Arc::new(UdpSocket::bind(bind).await?);
                let local_addr = socket.local_addr()?;
                info!("UDP 링크 시작: {} (remote {:?})", local_addr, remote);

                let learn = remote.is_none();
                let remote = Arc::new(Mutex::new(remote));
                spawn_udp_reader(
                    socket.clone(),
                    remote.clone(),
                    learn,
                    cmd_tx.clone(),
                    running.clone(),
                    config.recv_buffer_size,
                );
                (Transport::Udp { socket, remote }, local_addr)
            }
        };

        spawn_ticker(
            cmd_tx.clone(),
            running.clone(),
            Duration::from_millis(config.tick_interval_ms),
            || LinkCmd::Tick,
        );
        spawn_ticker(
            cmd_tx.clone(),
            running.clone(),
            Duration::from_millis(config.liveness_interval_ms),
            || LinkCmd::LivenessTick,
        );

        let snapshots = Arc::new(RwLock::new(HashMap::new()));

        let mut driver = LinkDriver {
            registry: Registry::new(config.clone(), outbox, events_tx),
            codec: Codec::new(config.system_id, config.component_id, version),
            transport,
            write_tx,
            config,
            snapshots: snapshots.clone(),
        };

        // 메인 처리 태스크
        let running_main = running.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    cmd = cmd_rx.recv() => {
                        let Some(cmd) = cmd else { break };
                        match cmd {
                            LinkCmd::Inbound(data) => driver.handle_inbound(&data),
                            LinkCmd::Tick => {
                                driver.registry.tick(Instant::now());
                                driver.refresh_snapshots();
                            }
                            LinkCmd::LivenessTick => {
                                driver.registry.check_liveness(Instant::now());
                                driver.refresh_snapshots();
                            }
                            LinkCmd::StartLogFetch { peer, log_dir, reverse, reply } => {
                                let _ = reply.send(driver.start_log_fetch(peer, log_dir, reverse));
                            }
                            LinkCmd::StopLogFetch { peer, reply } => {
                                let _ = reply.send(driver.stop_log_fetch(peer));
                            }
                            LinkCmd::Send(message) => driver.transmit(message).await,
                            LinkCmd::Closed => {
                                warn!("링크 연결 종료됨");
                                break;
                            }
                            LinkCmd::Stop => break,
                        }
                    }
                    Some(message) = outbound_rx.recv() => driver.transmit(message).await,
                    Some((peer, event)) = write_rx.recv() => {
                        if let Err(e) = driver.registry.on_write_event(peer, event, Instant::now()) {
                            debug!("쓰기 이벤트 무시: {}", e);
                        }
                        driver.refresh_snapshots();
                    }
                }
            }

            running_main.store(false, Ordering::SeqCst);
            debug!("링크 드라이버 종료 (dropped frames: {})", driver.codec.dropped_frames());
        });

        let link = Self {
            cmd_tx,
            running,
            snapshots,
            local_addr,
        };

        Ok((link, events_rx))
    }

    fn command(&self, cmd: LinkCmd) -> Result<()> {
        self.cmd_tx.send(cmd).map_err(|_| Error::ConnectionClosed)
    }

    /// 피어의 로그 다운로드 시작 (0 = universal 피어)
    pub async fn start_log_fetch(
        &self,
        peer: PeerId,
        log_dir: impl Into<PathBuf>,
        reverse: bool,
    ) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.command(LinkCmd::StartLogFetch {
            peer,
            log_dir: log_dir.into(),
            reverse,
            reply,
        })?;
        rx.await.map_err(|_| Error::ChannelError)?
    }

    /// 피어의 로그 다운로드 중지
    pub async fn stop_log_fetch(&self, peer: PeerId) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.command(LinkCmd::StopLogFetch { peer, reply })?;
        rx.await.map_err(|_| Error::ChannelError)?
    }

    /// 메시지 송신
    pub fn send(&self, message: Message) -> Result<()> {
        self.command(LinkCmd::Send(message))
    }

    /// 드라이버가 마지막으로 반영한 피어 상태
    pub fn peer(&self, id: PeerId) -> Option<PeerSnapshot> {
        self.snapshots.read().get(&id).cloned()
    }

    /// 드라이버가 마지막으로 반영한 모든 피어 (ID 순)
    pub fn peers(&self) -> Vec<PeerSnapshot> {
        let mut peers: Vec<PeerSnapshot> = self.snapshots.read().values().cloned().collect();
        peers.sort_by_key(|p| p.id);
        peers
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// 정지
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let _ = self.cmd_tx.send(LinkCmd::Stop);
    }

    /// 실행 중 여부
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        // 수신/타이머 태스크도 cmd_tx를 들고 있으므로 직접 멈춰야 함
        self.stop();
    }
}

/// 수신 대기 주기 (정지 플래그 확인용)
const POLL_INTERVAL: Duration = Duration::from_millis(100);

fn spawn_tcp_reader(
    mut reader: OwnedReadHalf,
    cmd_tx: mpsc::UnboundedSender<LinkCmd>,
    running: Arc<AtomicBool>,
    buffer_size: usize,
) {
    tokio::spawn(async move {
        let mut buf = vec![0u8; buffer_size];

        while running.load(Ordering::SeqCst) {
            match tokio::time::timeout(POLL_INTERVAL, reader.read(&mut buf)).await {
                Ok(Ok(0)) => {
                    let _ = cmd_tx.send(LinkCmd::Closed);
                    break;
                }
                Ok(Ok(len)) => {
                    let data = Bytes::copy_from_slice(&buf[..len]);
                    if cmd_tx.send(LinkCmd::Inbound(data)).is_err() {
                        break;
                    }
                }
                Ok(Err(e)) => {
                    warn!("수신 에러: {}", e);
                    let _ = cmd_tx.send(LinkCmd::Closed);
                    break;
                }
                Err(_) => {
                    // 타임아웃, 계속
                }
            }
        }
    });
}

fn spawn_udp_reader(
    socket: Arc<UdpSocket>,
    remote: Arc<Mutex<Option<SocketAddr>>>,
    learn: bool,
    cmd_tx: mpsc::UnboundedSender<LinkCmd>,
    running: Arc<AtomicBool>,
    buffer_size: usize,
) {
    tokio::spawn(async move {
        let mut buf = vec![0u8; buffer_size];

        while running.load(Ordering::SeqCst) {
            match tokio::time::timeout(POLL_INTERVAL, socket.recv_from(&mut buf)).await {
                Ok(Ok((len, addr))) => {
                    if learn {
                        let mut remote = remote.lock();
                        if remote.is_none() {
                            info!("UDP 원격 주소 확인: {}", addr);
                            *remote = Some(addr);
                        }
                    }

                    let data = Bytes::copy_from_slice(&buf[..len]);
                    if cmd_tx.send(LinkCmd::Inbound(data)).is_err() {
                        break;
                    }
                }
                Ok(Err(e)) => {
                    // ICMP port unreachable 등은 계속 반복되므로 잠시 쉼
                    warn!("수신 에러: {}", e);
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
                Err(_) => {}
            }
        }
    });
}

fn spawn_ticker(
    cmd_tx: mpsc::UnboundedSender<LinkCmd>,
    running: Arc<AtomicBool>,
    period: Duration,
    make: fn() -> LinkCmd,
) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while running.load(Ordering::SeqCst) {
            interval.tick().await;
            if cmd_tx.send(make()).is_err() {
                break;
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::LinkEvent;
    use crate::fetcher::log_file_name;
    use crate::message::{Heartbeat, LogData, LogEntryMessage, VfrHud, COMP_ID_AUTOPILOT1};
    use rand::Rng;
    use tokio::net::TcpListener;

    const LOG_UTC: u32 = 1_700_000_000;

    fn heartbeat() -> Message {
        Message::Heartbeat(Heartbeat {
            custom_mode: 3 << 16,
            vehicle_type: 2,
            autopilot: 12,
            base_mode: 0,
            system_status: 3,
            protocol_version: 3,
        })
    }

    /// 로그 하나를 가진 가상 기체
    async fn run_vehicle(listener: TcpListener, log: Arc<Vec<u8>>) {
        let (stream, _) = listener.accept().await.unwrap();
        let (mut reader, mut writer) = stream.into_split();
        let mut codec = Codec::new(1, COMP_ID_AUTOPILOT1, WireVersion::V1);

        let hb = codec.encode(&heartbeat()).unwrap();
        writer.write_all(&hb).await.unwrap();

        let size = log.len() as u32;
        let mut buf = vec![0u8; 4096];

        loop {
            let len = match reader.read(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(len) => len,
            };

            let mut out = Vec::new();
            for frame in codec.decode(&buf[..len]) {
                match frame.message {
                    Message::LogRequestList(_) => {
                        let entry = Message::LogEntry(LogEntryMessage {
                            id: 0,
                            num_logs: 1,
                            last_log_num: 0,
                            time_utc: LOG_UTC,
                            size,
                        });
                        out.extend_from_slice(&codec.encode(&entry).unwrap());
                    }
                    Message::LogRequestData(req) => {
                        let end = req.ofs.saturating_add(req.count).min(size);
                        let mut ofs = req.ofs;
                        while ofs < end {
                            let count = (end - ofs).min(90);
                            let mut data = log[ofs as usize..(ofs + count) as usize].to_vec();
                            data.resize(90, 0);

                            let chunk = Message::LogData(LogData {
                                id: req.id,
                                ofs,
                                count: count as u8,
                                data,
                            });
                            out.extend_from_slice(&codec.encode(&chunk).unwrap());
                            ofs += count;
                        }
                    }
                    _ => {}
                }
            }

            if !out.is_empty() && writer.write_all(&out).await.is_err() {
                return;
            }
        }
    }

    async fn wait_for(events: &mut EventReceiver, pred: impl Fn(&LinkEvent) -> bool) -> LinkEvent {
        tokio::time::timeout(Duration::from_secs(15), async {
            loop {
                let event = events.recv().await.expect("링크 종료");
                if pred(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("이벤트 대기 타임아웃")
    }

    #[tokio::test]
    async fn test_tcp_log_download_end_to_end() {
        let mut log = vec![0u8; 100_000];
        rand::thread_rng().fill(&mut log[..]);
        let log = Arc::new(log);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(run_vehicle(listener, log.clone()));

        let (link, mut events) = Link::connect(Endpoint::Tcp(addr), Config::default(), WireVersion::V1)
            .await
            .unwrap();

        wait_for(&mut events, |e| matches!(e, LinkEvent::NewPeer { peer: 1 })).await;

        let dir = tempfile::tempdir().unwrap();
        link.start_log_fetch(1, dir.path(), false).await.unwrap();

        let done = wait_for(&mut events, |e| matches!(e, LinkEvent::Downloaded { .. })).await;
        assert!(matches!(done, LinkEvent::Downloaded { peer: 1, log_id: 0 }));

        let content = std::fs::read(dir.path().join(log_file_name(LOG_UTC))).unwrap();
        assert_eq!(content, *log);

        // 다음 tick 이후 스냅샷 확인
        tokio::time::sleep(Duration::from_millis(250)).await;
        let snapshot = link.peer(1).unwrap();
        assert!(snapshot.connected);
        assert_eq!(snapshot.telemetry.flight_mode, "Position");
        assert_eq!(snapshot.fetch_status, Some(Status::Running));
        assert_eq!(snapshot.total_progress, Some(1.0));

        link.stop_log_fetch(1).await.unwrap();
        assert!(matches!(
            link.stop_log_fetch(9).await,
            Err(Error::UnknownPeer(9))
        ));

        link.stop();
    }

    #[tokio::test]
    async fn test_snapshot_ready_when_status_changes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(run_vehicle(listener, Arc::new(vec![0u8; 10])));

        let (link, mut events) = Link::connect(Endpoint::Tcp(addr), Config::default(), WireVersion::V1)
            .await
            .unwrap();

        // 첫 heartbeat로 인한 상태 변경 직후 tick을 기다리지 않고 조회
        let event = wait_for(&mut events, |e| {
            matches!(e, LinkEvent::StatusChanged { peer: 1, .. })
        })
        .await;
        let snapshot = link.peer(1).expect("상태 변경 시점에 스냅샷 없음");
        assert!(snapshot.connected);
        assert_eq!(snapshot.telemetry.flight_mode, "Position");

        let LinkEvent::StatusChanged {
            connected,
            telemetry,
            ..
        } = event
        else {
            unreachable!()
        };
        assert!(connected);
        assert_eq!(telemetry, snapshot.telemetry);
    }

    #[tokio::test]
    async fn test_drop_closes_link() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (link, _events) = Link::connect(Endpoint::Tcp(addr), Config::default(), WireVersion::V1)
            .await
            .unwrap();
        let (mut vehicle, _) = listener.accept().await.unwrap();

        drop(link);

        // 드라이버가 끝나면서 송신 쪽이 닫힘
        let mut buf = [0u8; 64];
        let len = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match vehicle.read(&mut buf).await {
                    Ok(0) | Err(_) => return 0,
                    Ok(_) => continue,
                }
            }
        })
        .await
        .expect("링크가 닫히지 않음");
        assert_eq!(len, 0);
    }

    #[tokio::test]
    async fn test_udp_learns_remote_address() {
        let (link, mut events) = Link::connect(
            Endpoint::Udp {
                bind: "127.0.0.1:0".parse().unwrap(),
                remote: None,
            },
            Config::default(),
            WireVersion::Auto,
        )
        .await
        .unwrap();

        let vehicle = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut codec = Codec::new(1, COMP_ID_AUTOPILOT1, WireVersion::V2);
        let hb = codec.encode(&heartbeat()).unwrap();
        vehicle.send_to(&hb, link.local_addr()).await.unwrap();

        wait_for(&mut events, |e| matches!(e, LinkEvent::NewPeer { peer: 1 })).await;

        let msg = Message::VfrHud(VfrHud {
            airspeed: 1.0,
            groundspeed: 2.0,
            heading: 90,
            throttle: 10,
            alt: 5.0,
            climb: 0.0,
        });
        link.send(msg.clone()).unwrap();

        let mut buf = vec![0u8; 1024];
        let (len, _) = tokio::time::timeout(Duration::from_secs(5), vehicle.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();

        // V2 프레임을 받았으므로 응답도 V2
        assert_eq!(buf[0], crate::codec::STX_V2);
        let frames = codec.decode(&buf[..len]);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].message, msg);
        assert_eq!(frames[0].header.system_id, crate::DEFAULT_SYSTEM_ID);

        link.stop();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!link.is_running());
        assert!(link.send(msg).is_err());
    }
}
