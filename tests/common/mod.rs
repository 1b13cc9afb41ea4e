//! In-process mock Arcam receiver for integration tests.

#![allow(dead_code)]

use arcam_avr::commands::{self, Source};
use arcam_avr::{ConnectionConfig, ConnectionState, Response, Session};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Command code that makes the mock emit an unsolicited frame before replying
pub const BROADCAST_THEN_REPLY: u8 = 0x77;

pub const VERSION: &[u8] = b"2.01/0.03/1.";

/// Device state shared with the connection handlers
#[derive(Debug)]
pub struct DeviceState {
    pub power: bool,
    pub volume: u8,
    pub muted: bool,
    pub source: u8,
    /// Swallow commands without replying
    pub silent: bool,
    pub reply_delay: Duration,
    /// Every command frame received, in order
    pub received: Vec<Vec<u8>>,
}

impl Default for DeviceState {
    fn default() -> Self {
        Self {
            power: false,
            volume: 50,
            muted: false,
            source: 0,
            silent: false,
            reply_delay: Duration::ZERO,
            received: Vec::new(),
        }
    }
}

pub struct MockAvr {
    addr: SocketAddr,
    state: Arc<Mutex<DeviceState>>,
    inject_tx: broadcast::Sender<Vec<u8>>,
    drop_tx: broadcast::Sender<()>,
    connections: Arc<AtomicUsize>,
    task: JoinHandle<()>,
}

impl MockAvr {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(Mutex::new(DeviceState::default()));
        let (inject_tx, _) = broadcast::channel(64);
        let (drop_tx, _) = broadcast::channel(4);
        let connections = Arc::new(AtomicUsize::new(0));

        let task = {
            let state = state.clone();
            let inject_tx = inject_tx.clone();
            let drop_tx = drop_tx.clone();
            let connections = connections.clone();
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    connections.fetch_add(1, Ordering::SeqCst);
                    tokio::spawn(serve(
                        stream,
                        state.clone(),
                        inject_tx.subscribe(),
                        drop_tx.subscribe(),
                    ));
                }
            })
        };

        Self {
            addr,
            state,
            inject_tx,
            drop_tx,
            connections,
            task,
        }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Fast timeouts and backoff suited to tests
    pub fn config(&self) -> ConnectionConfig {
        ConnectionConfig::new("127.0.0.1")
            .with_port(self.port())
            .with_connect_timeout(Duration::from_secs(1))
            .with_command_timeout(Duration::from_secs(1))
            .with_backoff(Duration::from_millis(20), Duration::from_millis(100))
    }

    pub async fn open(&self) -> Session {
        Session::open_with_config(self.config()).await.unwrap()
    }

    pub fn state(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap()
    }

    /// Number of TCP connections accepted so far
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Write raw bytes to every open connection
    pub fn inject(&self, bytes: Vec<u8>) {
        let _ = self.inject_tx.send(bytes);
    }

    pub fn broadcast(&self, response: Response) {
        self.inject(response.to_bytes().unwrap());
    }

    /// Close every open connection but keep accepting new ones
    pub fn drop_connections(&self) {
        let _ = self.drop_tx.send(());
    }

    /// Stop listening and close every connection
    pub fn shutdown(&self) {
        self.task.abort();
        self.drop_connections();
    }
}

impl Drop for MockAvr {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn serve(
    stream: TcpStream,
    state: Arc<Mutex<DeviceState>>,
    mut inject_rx: broadcast::Receiver<Vec<u8>>,
    mut drop_rx: broadcast::Receiver<()>,
) {
    let (mut reader, mut writer) = stream.into_split();
    let mut pending = Vec::new();
    let mut chunk = [0u8; 256];

    loop {
        tokio::select! {
            _ = drop_rx.recv() => return,
            Ok(bytes) = inject_rx.recv() => {
                if writer.write_all(&bytes).await.is_err() {
                    return;
                }
            }
            read = reader.read(&mut chunk) => {
                let n = match read {
                    Ok(0) | Err(_) => return,
                    Ok(n) => n,
                };
                pending.extend_from_slice(&chunk[..n]);

                while let Some(frame) = take_command(&mut pending) {
                    let (delay, replies) = handle(&state, &frame);
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    for reply in replies {
                        if writer.write_all(&reply).await.is_err() {
                            return;
                        }
                    }
                }
            }
        }
    }
}

fn take_command(buf: &mut Vec<u8>) -> Option<Vec<u8>> {
    if buf.len() < 4 {
        return None;
    }
    let total = 5 + buf[3] as usize;
    if buf.len() < total {
        return None;
    }
    Some(buf.drain(..total).collect())
}

fn reply(zone: u8, code: u8, answer: u8, payload: Vec<u8>) -> Vec<u8> {
    Response {
        zone,
        code,
        answer,
        payload,
    }
    .to_bytes()
    .unwrap()
}

fn handle(state: &Mutex<DeviceState>, frame: &[u8]) -> (Duration, Vec<Vec<u8>>) {
    let mut state = state.lock().unwrap();
    state.received.push(frame.to_vec());
    if state.silent {
        return (Duration::ZERO, Vec::new());
    }

    let zone = frame[1];
    let code = frame[2];
    let data = &frame[4..frame.len() - 1];
    let ok = |payload: Vec<u8>| reply(zone, code, 0x00, payload);
    let err = |answer: u8| reply(zone, code, answer, Vec::new());

    // Only the main zone is wired up
    if zone != 0x01 {
        return (state.reply_delay, vec![err(0x82)]);
    }

    let replies = match (code, data) {
        (commands::POWER, [commands::STATUS_REQUEST]) => vec![ok(vec![state.power as u8])],
        (commands::POWER, [value @ (0x00 | 0x01)]) => {
            state.power = *value == 0x01;
            vec![ok(vec![*value])]
        }
        (commands::VOLUME, [commands::STATUS_REQUEST]) => vec![ok(vec![state.volume])],
        (commands::VOLUME, [value]) if *value <= 99 => {
            state.volume = *value;
            vec![ok(vec![*value])]
        }
        (commands::MUTE, [commands::STATUS_REQUEST]) => vec![ok(vec![state.muted as u8])],
        (commands::SOURCE, [commands::STATUS_REQUEST]) => vec![ok(vec![state.source])],
        (commands::SOFTWARE_VERSION, [commands::STATUS_REQUEST]) => vec![ok(VERSION.to_vec())],
        (commands::RC5_SIMULATE, [system, key]) => {
            let rc5 = [*system, *key];
            if rc5 == commands::RC5_MUTE {
                state.muted = !state.muted;
            } else if let Some(source) = Source::ALL.iter().find(|s| s.rc5() == rc5) {
                state.source = source.status_code();
            }
            vec![ok(rc5.to_vec())]
        }
        (BROADCAST_THEN_REPLY, _) => vec![
            reply(zone, commands::VOLUME, 0x00, vec![state.volume]),
            ok(data.to_vec()),
        ],
        (commands::POWER | commands::VOLUME | commands::MUTE | commands::SOURCE, _) => {
            vec![err(0x84)]
        }
        (commands::SOFTWARE_VERSION | commands::RC5_SIMULATE, _) => vec![err(0x86)],
        _ => vec![err(0x83)],
    };

    (state.reply_delay, replies)
}

/// Wait until the session reports `target`
pub async fn wait_for_state(session: &Session, target: ConnectionState) {
    let mut rx = session.watch_state();
    tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|state| *state == target))
        .await
        .expect("timed out waiting for connection state")
        .expect("state channel closed");
}
