//! skylog 로그 다운로드 도구
//!
//! 기체에 접속해서 universal 피어로 모든 로그를 받아 디렉터리에 저장함.
//! 중간에 끊겨도 다시 실행하면 이어서 받음.
//!
//! 사용법:
//!   cargo run --release --bin skylog-fetch -- <host> <port> <log_dir> [OPTIONS]
//!
//! 예시:
//!   # TCP (SITL 등)
//!   cargo run --release --bin skylog-fetch -- 127.0.0.1 5760 ./logs
//!
//!   # UDP, 최신 로그부터
//!   cargo run --release --bin skylog-fetch -- 192.168.4.1 14550 ./logs --udp --reverse

use std::net::SocketAddr;
use std::path::PathBuf;

use tokio::net::lookup_host;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use skylog::codec::WireVersion;
use skylog::link::{Endpoint, Link};
use skylog::{Config, LinkEvent, UNIVERSAL_PEER_ID};

const USAGE: &str = r#"skylog-fetch - 비행 로그 다운로드

사용법:
  skylog-fetch <host> <port> <log_dir> [OPTIONS]

옵션:
  --udp                  UDP로 접속 (기본: TCP)
  -b, --bind <ADDR>      UDP 로컬 바인드 주소 (기본: 0.0.0.0:0)
  -r, --reverse          최신 로그부터 받기
  --wire-version <V>     1, 2, auto (기본: auto)
  -h, --help             이 도움말 출력

환경 변수:
  LOG_FETCH_REQ_TIMEOUT_MILLIS   데이터 요청 타임아웃 (기본: 200)
  RUST_LOG                       로그 레벨 (기본: info)
"#;

/// 실행 인자
struct FetchArgs {
    host: String,
    port: u16,
    log_dir: PathBuf,
    udp: bool,
    bind_addr: SocketAddr,
    reverse: bool,
    version: WireVersion,
}

fn parse_version(value: &str) -> Result<WireVersion, String> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "v1" => Ok(WireVersion::V1),
        "2" | "v2" => Ok(WireVersion::V2),
        "auto" => Ok(WireVersion::Auto),
        other => Err(format!("알 수 없는 와이어 버전: {}", other)),
    }
}

fn parse_args() -> Result<FetchArgs, String> {
    let args: Vec<String> = std::env::args().collect();

    let mut positional = Vec::new();
    let mut udp = false;
    let mut bind_addr: SocketAddr = ([0, 0, 0, 0], 0).into();
    let mut reverse = false;
    let mut version = WireVersion::Auto;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--udp" => udp = true,
            "--bind" | "-b" => {
                let value = args.get(i + 1).ok_or("--bind 값 필요")?;
                bind_addr = value
                    .parse()
                    .map_err(|_| format!("유효한 주소 필요: {}", value))?;
                i += 1;
            }
            "--reverse" | "-r" => reverse = true,
            "--wire-version" => {
                let value = args.get(i + 1).ok_or("--wire-version 값 필요")?;
                version = parse_version(value)?;
                i += 1;
            }
            "--help" | "-h" => {
                println!("{}", USAGE);
                std::process::exit(0);
            }
            other => positional.push(other.to_string()),
        }
        i += 1;
    }

    let [host, port, log_dir]: [String; 3] = positional
        .try_into()
        .map_err(|_| "<host> <port> <log_dir> 필요".to_string())?;

    let port = port
        .parse()
        .map_err(|_| format!("유효한 포트 필요: {}", port))?;

    Ok(FetchArgs {
        host,
        port,
        log_dir: PathBuf::from(log_dir),
        udp,
        bind_addr,
        reverse,
        version,
    })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 로깅 설정
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let args = match parse_args() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("{}\n\n{}", e, USAGE);
            std::process::exit(2);
        }
    };

    let config = Config::from_env();

    let remote = lookup_host((args.host.as_str(), args.port))
        .await?
        .next()
        .ok_or_else(|| format!("주소 해석 실패: {}", args.host))?;

    let endpoint = if args.udp {
        Endpoint::Udp {
            bind: args.bind_addr,
            remote: Some(remote),
        }
    } else {
        Endpoint::Tcp(remote)
    };

    info!("skylog-fetch 시작: {} → {:?}", remote, args.log_dir);
    info!("요청 타임아웃: {}ms", config.request_timeout_ms);

    let (link, mut events) = Link::connect(endpoint, config, args.version).await?;
    link.start_log_fetch(UNIVERSAL_PEER_ID, &args.log_dir, args.reverse)
        .await?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("중단 요청");
                break;
            }
            event = events.recv() => {
                let Some(event) = event else {
                    warn!("링크 종료됨");
                    break;
                };

                match event {
                    LinkEvent::NewPeer { peer } => info!("새 피어: {}", peer),
                    LinkEvent::StatusChanged { peer, connected, telemetry: t } => {
                        info!(
                            "피어 {} 상태: {} | {} | {} | safety {} | connected={}",
                            peer, t.flight_mode, t.armed_state, t.landed_state,
                            t.safety_state, connected
                        );
                    }
                    LinkEvent::Downloaded { log_id, .. } => {
                        info!("로그 {} 다운로드 완료", log_id);
                    }
                    LinkEvent::Progress { progress, .. } => {
                        info!("{}", progress.summary());
                    }
                    LinkEvent::Message { .. } => {}
                }
            }
        }
    }

    if let Err(e) = link.stop_log_fetch(UNIVERSAL_PEER_ID).await {
        warn!("다운로드 중지 실패: {}", e);
    }
    link.stop();

    Ok(())
}
