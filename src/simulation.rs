//! Simulated lossy link driving a [`Session`] the way a video sender would.
//!
//! Time is simulated for the controllers, packets still go through the throttle in real time.

use crate::{Allocation, BandwidthOp, Feedback, FrameType, NetworkThrottle, Session, SessionConfig};
use crate::{SessionError, SimulationConfig, Statistic, StatisticSummary};
use crossbeam_channel::{bounded, Receiver, Sender};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::{
    collections::{HashMap, VecDeque},
    time::{Duration, Instant},
};

/// Congestion signals are produced ten times per second.
const CONGESTION_TICK: Duration = Duration::from_millis(100);

/// What happened during [`run`].
#[derive(Debug)]
pub struct SimulationReport {
    pub frames: u64,
    /// Frames the far end could not decode.
    pub frames_lost: u64,
    pub packets_sent: u64,
    pub packets_aborted: u64,
    pub actions: HashMap<FrameType, u64>,
    pub statistics: Vec<(Statistic, StatisticSummary)>,
}

struct Link {
    rng: StdRng,
    base_packet_loss: f64,
}

impl Link {
    /// Link capacity at `elapsed` into the stream. Drops for a while in the middle to trigger
    /// congestion.
    fn capacity(&self, elapsed: Duration, duration: Duration) -> u64 {
        let secs = elapsed.as_secs_f64();
        let total = duration.as_secs_f64();
        if secs > total * 0.4 && secs < total * 0.6 {
            3_000_000
        } else {
            12_000_000
        }
    }

    fn packet_loss(&self, bitrate: u64, capacity: u64) -> f64 {
        let overshoot = if bitrate > capacity {
            1.0 - capacity as f64 / bitrate as f64
        } else {
            0.0
        };
        (self.base_packet_loss + overshoot).min(1.0)
    }

    /// Whether enough packets of a frame got through for FEC to rebuild it.
    fn frame_arrived(&mut self, packet_loss: f64, packets: usize, fec_packets: usize) -> bool {
        let lost = (0..packets + fec_packets)
            .filter(|_| self.rng.gen_bool(packet_loss))
            .count();
        lost <= fec_packets
    }
}

/// Far end of the link. A frame is decodable only if it arrived and so did whatever it
/// references.
#[derive(Default)]
struct Decoder {
    last_frame_decodable: bool,
}

impl Decoder {
    fn decode(&mut self, frame_type: FrameType, arrived: bool) -> bool {
        let decodable = match frame_type {
            // The referred long-term frame was acked, so it is known to be decodable
            FrameType::Intra | FrameType::ReferLongTerm => arrived,
            FrameType::Normal | FrameType::CreateLongTerm => arrived && self.last_frame_decodable,
        };
        self.last_frame_decodable = decodable;
        decodable
    }
}

/// Trivial loss-driven congestion controller.
struct Congestion {
    bitrate: u64,
    min_bitrate: u64,
    max_bitrate: u64,
    ticks_since_increase: u32,
}

impl Congestion {
    fn tick(&mut self, packet_loss: f64) -> (BandwidthOp, u64) {
        let old_bitrate = self.bitrate;
        self.ticks_since_increase += 1;

        let op = if packet_loss > 0.1 {
            self.bitrate = ((self.bitrate as f64 * 0.8) as u64).max(self.min_bitrate);
            BandwidthOp::Decrease
        } else if self.ticks_since_increase >= 20 && self.bitrate < self.max_bitrate {
            self.ticks_since_increase = 0;
            self.bitrate = ((self.bitrate as f64 * 1.1) as u64).min(self.max_bitrate);
            BandwidthOp::Increase
        } else {
            BandwidthOp::Hold
        };
        (op, old_bitrate)
    }
}

fn sender(throttle: NetworkThrottle, packets: Receiver<usize>) -> (u64, u64) {
    let mut sent = 0;
    let mut aborted = 0;
    for bytes in packets {
        match throttle.wait_byte_allocation(bytes) {
            Allocation::Granted { .. } => sent += 1,
            Allocation::Aborted => aborted += 1,
        }
    }
    (sent, aborted)
}

/// Streams `config.simulation.duration_secs` simulated seconds of video over the simulated link.
pub fn run(config: &SessionConfig) -> Result<SimulationReport, SessionError> {
    let start = Instant::now();
    let mut session = Session::new(config, start)?;

    let (packet_tx, packet_rx) = bounded::<usize>(1024);
    let senders: Vec<_> = (0..config.simulation.sender_threads.max(1))
        .map(|_| {
            let throttle = session.throttle();
            let packets = packet_rx.clone();
            std::thread::spawn(move || sender(throttle, packets))
        })
        .collect();
    drop(packet_rx);

    let result = stream(&mut session, &config.simulation, start, &packet_tx);
    drop(packet_tx);
    if result.is_err() {
        // Release senders stuck waiting for coins
        session.shutdown();
    }

    let mut packets_sent = 0;
    let mut packets_aborted = 0;
    for sender in senders {
        let (sent, aborted) = sender.join().map_err(|_| SessionError::SendersExited)?;
        packets_sent += sent;
        packets_aborted += aborted;
    }
    session.shutdown();

    let mut report = result?;
    report.packets_sent = packets_sent;
    report.packets_aborted = packets_aborted;
    report.statistics = session.statistics().snapshot();
    Ok(report)
}

fn stream(
    session: &mut Session,
    simulation: &SimulationConfig,
    start: Instant,
    packet_tx: &Sender<usize>,
) -> Result<SimulationReport, SessionError> {
    let duration = Duration::from_secs(simulation.duration_secs);
    let frame_rate = simulation.frame_rate.max(1);
    let frame_interval = Duration::from_secs(1) / frame_rate;
    let round_trip = Duration::from_millis(simulation.round_trip_ms);

    let mut link = Link {
        rng: StdRng::seed_from_u64(simulation.seed),
        base_packet_loss: simulation.base_packet_loss,
    };
    let mut decoder = Decoder::default();
    let mut congestion = Congestion {
        bitrate: simulation.start_bitrate,
        min_bitrate: simulation.min_bitrate,
        max_bitrate: simulation.max_bitrate,
        ticks_since_increase: 0,
    };
    session.set_burst_bitrate((congestion.bitrate as f64 * simulation.burst_factor) as i64)?;

    let mut report = SimulationReport {
        frames: 0,
        frames_lost: 0,
        packets_sent: 0,
        packets_aborted: 0,
        actions: HashMap::new(),
        statistics: Vec::new(),
    };
    let mut feedback: VecDeque<(Duration, u32, bool)> = VecDeque::new();
    let mut next_congestion_tick = Duration::ZERO;
    let mut packet_loss = 0.0;

    let mut frame_id = 0u32;
    let mut elapsed = Duration::ZERO;
    while elapsed < duration {
        let now = start + elapsed;

        if elapsed >= next_congestion_tick {
            next_congestion_tick += CONGESTION_TICK;
            let capacity = link.capacity(elapsed, duration);
            packet_loss = link.packet_loss(congestion.bitrate, capacity);
            let (op, old_bitrate) = congestion.tick(packet_loss);
            session.feed_info(
                now,
                op,
                packet_loss,
                old_bitrate,
                congestion.bitrate,
                congestion.min_bitrate,
            )?;
            session.feed_latency(now, round_trip)?;
            session
                .set_burst_bitrate((congestion.bitrate as f64 * simulation.burst_factor) as i64)?;
        }

        // Feedback arrives one round trip after the frame was sent
        while let Some(&(due, id, decodable)) = feedback.front() {
            if due > elapsed {
                break;
            }
            feedback.pop_front();
            let result = if decodable {
                session.ack(id)?
            } else {
                session.nack(id)?
            };
            if result == Feedback::Unknown {
                tracing::debug!("Feedback for frame {id} arrived too late");
            }
        }

        let action = session.next_frame_action(frame_id)?;
        *report.actions.entry(action.frame_type).or_default() += 1;
        let fec_ratio = session.fec_ratio(now)?.min(0.9);

        let frame_bytes = (congestion.bitrate / 8) as usize / frame_rate as usize;
        let packets = (frame_bytes / simulation.packet_size.max(1)).max(1);
        let fec_packets = (packets as f64 * fec_ratio / (1.0 - fec_ratio)).ceil() as usize;
        for _ in 0..packets + fec_packets {
            packet_tx
                .send(simulation.packet_size)
                .map_err(|_| SessionError::SendersExited)?;
        }

        let arrived = link.frame_arrived(packet_loss, packets, fec_packets);
        let decodable = decoder.decode(action.frame_type, arrived);
        if !decodable {
            report.frames_lost += 1;
        }
        feedback.push_back((elapsed + round_trip, frame_id, decodable));

        session.report_statistics(now);
        report.frames += 1;
        frame_id = frame_id.wrapping_add(1);
        elapsed += frame_interval;
    }

    Ok(report)
}
