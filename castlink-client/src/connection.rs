//! Frame reception from the host.
//!
//! Opens one of the two transports, then runs a single loop that
//! receives frames, keeps the host's liveness timer fresh, forwards
//! input JSON and publishes [`ClientStats`] once per interval.
//!
//! On the datagram transport every ping doubles as an RTT sample; the
//! measured round trip is sent back as a `latency` message so the
//! host's quality controller can react to the network.

use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use castlink_core::input::wire::LatencyMessage;
use castlink_core::{
    CastError, ClientMessage, DatagramReceiver, ReceiverEvent, StreamInfo, StreamReceiver,
};

use crate::config::{ClientConfig, Transport};
use crate::resolve::HostEndpoints;

/// Silence after which a datagram client says `HELLO` again.
const REHELLO_AFTER: Duration = Duration::from_secs(3);

/// Spacing of `HELLO`s while waiting for the handshake.
const HELLO_RETRY: Duration = Duration::from_millis(500);

// ── Stats ────────────────────────────────────────────────────────

/// One reporting window as seen by the client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientStats {
    pub fps: f64,
    pub bitrate_kbps: f64,
    pub rtt_ms: Option<f64>,
    pub frames_total: u64,
    pub bytes_total: u64,
    /// Datagram frames lost to missing chunks.
    pub abandoned_frames: u64,
}

/// Accumulates frames and RTTs between snapshots.
#[derive(Debug)]
pub struct StatsMeter {
    window_start: Instant,
    frames: u64,
    bytes: u64,
    rtt_sum: Duration,
    rtt_count: u32,
    frames_total: u64,
    bytes_total: u64,
}

impl StatsMeter {
    pub fn new(now: Instant) -> Self {
        Self {
            window_start: now,
            frames: 0,
            bytes: 0,
            rtt_sum: Duration::ZERO,
            rtt_count: 0,
            frames_total: 0,
            bytes_total: 0,
        }
    }

    pub fn record_frame(&mut self, len: usize) {
        self.frames += 1;
        self.bytes += len as u64;
        self.frames_total += 1;
        self.bytes_total += len as u64;
    }

    pub fn record_rtt(&mut self, rtt: Duration) {
        self.rtt_sum += rtt;
        self.rtt_count += 1;
    }

    /// Close the window at `now` and start the next one.
    pub fn snapshot(&mut self, now: Instant, abandoned_frames: u64) -> ClientStats {
        let secs = (now - self.window_start).as_secs_f64().max(f64::EPSILON);
        let rtt_ms = (self.rtt_count > 0)
            .then(|| self.rtt_sum.as_secs_f64() * 1000.0 / f64::from(self.rtt_count));
        let stats = ClientStats {
            fps: self.frames as f64 / secs,
            bitrate_kbps: self.bytes as f64 * 8.0 / 1000.0 / secs,
            rtt_ms,
            frames_total: self.frames_total,
            bytes_total: self.bytes_total,
            abandoned_frames,
        };
        self.window_start = now;
        self.frames = 0;
        self.bytes = 0;
        self.rtt_sum = Duration::ZERO;
        self.rtt_count = 0;
        stats
    }
}

// ── Connection ───────────────────────────────────────────────────

/// An open transport to the host, handshake already received.
pub enum Connection {
    Datagram(DatagramReceiver),
    Stream(StreamReceiver),
}

impl Connection {
    /// Connect over `transport` and wait up to `limit` for the info
    /// handshake.
    pub async fn open(
        endpoints: &HostEndpoints,
        transport: Transport,
        limit: Duration,
    ) -> Result<(Self, StreamInfo), CastError> {
        match transport {
            Transport::Stream => {
                info!(addr = %endpoints.stream, "connecting over stream transport");
                let receiver = tokio::time::timeout(limit, StreamReceiver::connect(endpoints.stream))
                    .await
                    .map_err(|_| CastError::Timeout(limit))??;
                let info = receiver.info().clone();
                Ok((Self::Stream(receiver), info))
            }
            Transport::Datagram => {
                info!(addr = %endpoints.datagram, "connecting over datagram transport");
                let mut receiver = DatagramReceiver::connect(endpoints.datagram).await?;
                let info = tokio::time::timeout(limit, await_info(&mut receiver))
                    .await
                    .map_err(|_| CastError::Timeout(limit))??;
                Ok((Self::Datagram(receiver), info))
            }
        }
    }

    /// Receive until cancelled or the host goes away.
    ///
    /// Input arriving on `input` is forwarded as-is; stats are
    /// published on `stats` every `config.stats_interval()`. Returns the
    /// last published stats.
    pub async fn run(
        self,
        config: &ClientConfig,
        input: mpsc::Receiver<ClientMessage>,
        stats: watch::Sender<ClientStats>,
        cancel: CancellationToken,
    ) -> Result<ClientStats, CastError> {
        match self {
            Self::Datagram(receiver) => run_datagram(receiver, config, input, stats, cancel).await,
            Self::Stream(receiver) => run_stream(receiver, config, input, stats, cancel).await,
        }
    }
}

async fn await_info(receiver: &mut DatagramReceiver) -> Result<StreamInfo, CastError> {
    let mut retry = tokio::time::interval(HELLO_RETRY);
    retry.tick().await;
    loop {
        tokio::select! {
            _ = retry.tick() => receiver.hello().await?,
            event = receiver.recv() => {
                if let ReceiverEvent::Info(info) = event? {
                    return Ok(info);
                }
            }
        }
    }
}

fn publish(stats: &watch::Sender<ClientStats>, snapshot: ClientStats) {
    info!(
        fps = format_args!("{:.1}", snapshot.fps),
        kbps = format_args!("{:.0}", snapshot.bitrate_kbps),
        rtt_ms = ?snapshot.rtt_ms,
        frames = snapshot.frames_total,
        "stream stats"
    );
    stats.send_replace(snapshot);
}

async fn run_datagram(
    mut receiver: DatagramReceiver,
    config: &ClientConfig,
    mut input: mpsc::Receiver<ClientMessage>,
    stats: watch::Sender<ClientStats>,
    cancel: CancellationToken,
) -> Result<ClientStats, CastError> {
    let mut meter = StatsMeter::new(Instant::now());
    let mut ping = tokio::time::interval(config.ping_interval());
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut report = tokio::time::interval(config.stats_interval());
    report.tick().await;
    let mut last_heard = Instant::now();
    let mut input_open = true;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ping.tick() => {
                if last_heard.elapsed() > REHELLO_AFTER {
                    debug!("host silent; saying HELLO again");
                    receiver.hello().await?;
                }
                receiver.ping().await?;
            }
            _ = report.tick() => {
                publish(&stats, meter.snapshot(Instant::now(), receiver.abandoned_frames()));
            }
            event = receiver.recv() => {
                last_heard = Instant::now();
                match event? {
                    ReceiverEvent::Frame(frame) => meter.record_frame(frame.data.len()),
                    ReceiverEvent::Rtt(rtt) => {
                        meter.record_rtt(rtt);
                        if config.stats.report_latency {
                            let report = ClientMessage::Latency(LatencyMessage {
                                rtt_ms: rtt.as_secs_f64() * 1000.0,
                            });
                            receiver.send_input(&report.to_json()).await?;
                        }
                    }
                    ReceiverEvent::Info(info) => {
                        info!(width = info.width, height = info.height, fps = info.fps, "stream info");
                    }
                }
            }
            message = input.recv(), if input_open => match message {
                Some(message) => receiver.send_input(&message.to_json()).await?,
                None => input_open = false,
            },
        }
    }

    if let Err(e) = receiver.bye().await {
        debug!("BYE failed: {e}");
    }
    Ok(*stats.borrow())
}

async fn run_stream(
    mut receiver: StreamReceiver,
    config: &ClientConfig,
    mut input: mpsc::Receiver<ClientMessage>,
    stats: watch::Sender<ClientStats>,
    cancel: CancellationToken,
) -> Result<ClientStats, CastError> {
    let mut meter = StatsMeter::new(Instant::now());
    let mut heartbeat = tokio::time::interval(config.ping_interval());
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut report = tokio::time::interval(config.stats_interval());
    report.tick().await;
    let mut input_open = true;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = heartbeat.tick() => receiver.heartbeat().await?,
            _ = report.tick() => publish(&stats, meter.snapshot(Instant::now(), 0)),
            frame = receiver.next_frame() => match frame? {
                Some(frame) => meter.record_frame(frame.len()),
                None => {
                    warn!("host closed the stream");
                    break;
                }
            },
            message = input.recv(), if input_open => match message {
                Some(message) => receiver.send_input(Bytes::from(message.to_json())).await?,
                None => input_open = false,
            },
        }
    }

    publish(&stats, meter.snapshot(Instant::now(), 0));
    Ok(*stats.borrow())
}

// ── Tests ────────────────────────────────────────────────────────
