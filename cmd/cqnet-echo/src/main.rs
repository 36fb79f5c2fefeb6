//! cqnet echo demo
//!
//! Usage:
//!     cargo build --release -p cqnet-echo
//!     ./target/release/cqnet-echo server [port]            # TCP echo server
//!     ./target/release/cqnet-echo udp [port]               # UDP echo node
//!     ./target/release/cqnet-echo client <ip> <port> [n]   # send n pings, print replies
//!
//! Test with:
//!     echo "hello" | nc localhost 9999
//!     echo "hello" | nc -u -q1 localhost 9999
//!
//! Backend and pool sizes come from the CQN_* environment variables
//! (CQN_BACKEND=epoll forces the epoll fallback).

use cqnet_core::kinfo;
use cqnet_engine::{
    ConnId, DatagramNode, EngineConfig, Result, StreamCallbacks, StreamClient, StreamHandle,
    StreamHandler, StreamServer,
};

use std::net::SocketAddrV4;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

const DEFAULT_PORT: u16 = 9999;

static RUNNING: AtomicBool = AtomicBool::new(true);

extern "C" fn handle_sigint(_sig: libc::c_int) {
    RUNNING.store(false, Ordering::Relaxed);
}

// ── Stats ──
#[derive(Default)]
struct Stats {
    accepts: AtomicU64,
    closes: AtomicU64,
    recvs: AtomicU64,
    bytes: AtomicU64,
    errors: AtomicU64,
}

impl Stats {
    fn print(&self, elapsed_secs: f64) {
        eprintln!(
            "[{:.1}s] accepts={} close={} recv={} bytes={} err={}",
            elapsed_secs,
            self.accepts.load(Ordering::Relaxed),
            self.closes.load(Ordering::Relaxed),
            self.recvs.load(Ordering::Relaxed),
            self.bytes.load(Ordering::Relaxed),
            self.errors.load(Ordering::Relaxed),
        );
    }
}

/// Echoes every chunk back on the connection it came from.
struct Echo {
    handle: OnceLock<StreamHandle>,
    stats: Arc<Stats>,
}

impl StreamHandler for Echo {
    fn on_connected(&self, _id: ConnId) {
        self.stats.accepts.fetch_add(1, Ordering::Relaxed);
    }

    fn on_received(&self, id: ConnId, data: &[u8]) {
        self.stats.recvs.fetch_add(1, Ordering::Relaxed);
        self.stats.bytes.fetch_add(data.len() as u64, Ordering::Relaxed);
        if let Some(handle) = self.handle.get() {
            if handle.send(id, data).is_err() {
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn on_disconnected(&self, _id: ConnId) {
        self.stats.closes.fetch_add(1, Ordering::Relaxed);
    }
}

/// Block until SIGINT/SIGTERM, printing stats every 5 seconds.
fn run_until_signal(stats: &Stats) {
    let start = Instant::now();
    let mut last_stats = start;
    while RUNNING.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_millis(100));
        let now = Instant::now();
        if now.duration_since(last_stats).as_secs() >= 5 {
            stats.print(now.duration_since(start).as_secs_f64());
            last_stats = now;
        }
    }
    eprintln!("\ncqnet-echo: shutting down...");
    stats.print(start.elapsed().as_secs_f64());
}

fn run_server(port: u16) -> Result<()> {
    let stats = Arc::new(Stats::default());
    let echo = Arc::new(Echo { handle: OnceLock::new(), stats: stats.clone() });

    let mut server = StreamServer::init(EngineConfig::from_env(), echo.clone(), "*", port)?;
    let _ = echo.handle.set(server.handle());
    server.start()?;
    kinfo!("cqnet-echo: tcp listening on {}", server.local_addr());

    run_until_signal(&stats);
    server.deinit();
    Ok(())
}

fn run_udp(port: u16) -> Result<()> {
    let stats = Arc::new(Stats::default());
    let node_handle: Arc<OnceLock<cqnet_engine::DatagramHandle>> = Arc::new(OnceLock::new());

    let (s, h) = (stats.clone(), node_handle.clone());
    let echo = move |id: ConnId, data: &[u8], from: SocketAddrV4| {
        s.recvs.fetch_add(1, Ordering::Relaxed);
        s.bytes.fetch_add(data.len() as u64, Ordering::Relaxed);
        if let Some(handle) = h.get() {
            if handle.send_to(id, data, from).is_err() {
                s.errors.fetch_add(1, Ordering::Relaxed);
            }
        }
    };
    let mut node = DatagramNode::init(EngineConfig::from_env(), echo)?;
    let _ = node_handle.set(node.handle());
    node.start()?;
    let (_, bound) = node.create("*", port)?;
    kinfo!("cqnet-echo: udp bound to port {}", bound);

    run_until_signal(&stats);
    node.deinit();
    Ok(())
}

fn run_client(ip: &str, port: u16, count: usize) -> Result<()> {
    let replies = Arc::new(AtomicU64::new(0));
    let r = replies.clone();
    let handler = StreamCallbacks::new(move |id, data| {
        r.fetch_add(1, Ordering::Relaxed);
        println!("{}: {}", id, String::from_utf8_lossy(data).trim_end());
    })
    .with_disconnected(|id| eprintln!("cqnet-echo: {} closed by server", id));

    let mut client = StreamClient::init(EngineConfig::from_env(), handler)?;
    client.start()?;
    let id = client.connect(ip, port)?;
    for i in 0..count {
        client.send(id, format!("ping {}\n", i).as_bytes())?;
    }

    let deadline = Instant::now() + Duration::from_secs(2);
    while RUNNING.load(Ordering::Relaxed) && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(20));
    }
    eprintln!("cqnet-echo: {} replies", replies.load(Ordering::Relaxed));
    client.close_socket(id);
    client.deinit();
    Ok(())
}

fn usage() -> ! {
    eprintln!("usage: cqnet-echo server [port] | udp [port] | client <ip> <port> [count]");
    std::process::exit(2);
}

fn main() {
    let args: Vec<String> = std::env::args().collect();
    let port_at =
        |i: usize| -> u16 { args.get(i).and_then(|s| s.parse().ok()).unwrap_or(DEFAULT_PORT) };

    // SIGINT handler for clean shutdown
    unsafe {
        libc::signal(libc::SIGINT, handle_sigint as usize);
        libc::signal(libc::SIGTERM, handle_sigint as usize);
    }

    let result = match args.get(1).map(String::as_str) {
        Some("server") | None => run_server(port_at(2)),
        Some("udp") => run_udp(port_at(2)),
        Some("client") => {
            let ip = args.get(2).map(String::as_str).unwrap_or("127.0.0.1");
            let count = args.get(4).and_then(|s| s.parse().ok()).unwrap_or(3);
            run_client(ip, port_at(3), count)
        }
        Some(_) => usage(),
    };

    if let Err(e) = result {
        eprintln!("cqnet-echo: {}", e);
        std::process::exit(1);
    }
    eprintln!("cqnet-echo: done.");
}
