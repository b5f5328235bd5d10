/// Packet correlation and delivery metrics
///
/// Every application packet leaving the source is stamped with a 32-bit id tag and
/// its send time is remembered. Arrivals are matched against the pending sends to
/// produce end-to-end delay samples; whatever is still pending when the run ends
/// was lost.
use hashbrown::HashMap;
use log::{debug, warn};

use crate::zm_interface::{as_seconds, AppPayload, PacketId, SimTime, PACKET_TAG_SIZE};

/// Serialize a packet id into the payload tag.
pub fn encode_tag(packet_id: PacketId) -> [u8; PACKET_TAG_SIZE] {
    packet_id.to_le_bytes()
}

/// Read the packet id back out of a payload tag.
pub fn decode_tag(tag: &[u8; PACKET_TAG_SIZE]) -> PacketId {
    PacketId::from_le_bytes(*tag)
}

/// What a reception turned out to be
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveOutcome {
    /// Matched a pending send
    Matched { packet_id: PacketId, delay: SimTime },
    /// Tagged, but nothing pending under that id (duplicate, late or foreign)
    Unmatched { packet_id: PacketId },
    /// No tag at all
    Untagged,
    /// Tag present but carries the reserved id 0
    InvalidTag,
}

/// Per-run send/receive accumulator.
///
/// Created when the run starts, read once by `finalize` at the end, never reset
/// in between.
pub struct PacketCorrelator {
    last_packet_id: PacketId,
    sent: u64,
    received: u64,
    unmatched: u64,
    untagged: u64,
    invalid: u64,
    pending: HashMap<PacketId, SimTime>,
    delays: Vec<SimTime>,
}

impl Default for PacketCorrelator {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketCorrelator {
    pub fn new() -> Self {
        Self {
            last_packet_id: 0,
            sent: 0,
            received: 0,
            unmatched: 0,
            untagged: 0,
            invalid: 0,
            pending: HashMap::new(),
            delays: Vec::new(),
        }
    }

    /// Tag `payload` with the next packet id and record its send time.
    pub fn send(&mut self, payload: &mut AppPayload, now: SimTime) -> PacketId {
        self.last_packet_id += 1;
        let packet_id = self.last_packet_id;

        payload.tag = Some(encode_tag(packet_id));
        self.pending.insert(packet_id, now);
        self.sent += 1;

        packet_id
    }

    /// Match an arrival against the pending sends.
    pub fn receive(&mut self, payload: &AppPayload, now: SimTime) -> ReceiveOutcome {
        let Some(tag) = payload.tag.as_ref() else {
            self.untagged += 1;
            warn!("reception without packet id tag ({} bytes)", payload.len());
            return ReceiveOutcome::Untagged;
        };

        let packet_id = decode_tag(tag);
        if packet_id == 0 {
            self.invalid += 1;
            warn!("reception with invalid packet id 0");
            return ReceiveOutcome::InvalidTag;
        }

        match self.pending.remove(&packet_id) {
            Some(sent_at) => {
                let delay = now.saturating_sub(sent_at);
                self.delays.push(delay);
                self.received += 1;
                debug!("packet {} matched, delay {}us", packet_id, delay);
                ReceiveOutcome::Matched { packet_id, delay }
            }
            None => {
                self.unmatched += 1;
                warn!("packet {} received but no send time is pending", packet_id);
                ReceiveOutcome::Unmatched { packet_id }
            }
        }
    }

    pub fn sent_count(&self) -> u64 {
        self.sent
    }

    pub fn received_count(&self) -> u64 {
        self.received
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn delays(&self) -> &[SimTime] {
        &self.delays
    }

    /// Compute the delivery and latency statistics of the run.
    pub fn finalize(&self) -> MetricsReport {
        let pdr = if self.sent > 0 {
            Some(self.received as f64 / self.sent as f64)
        } else {
            None
        };

        MetricsReport {
            sent: self.sent,
            received: self.received,
            lost: self.pending.len(),
            unmatched: self.unmatched,
            untagged: self.untagged,
            invalid: self.invalid,
            pdr,
            delay: DelayStats::from_samples(&self.delays),
        }
    }
}

/// End-to-end latency statistics, in seconds.
#[derive(Debug, Clone, PartialEq)]
pub struct DelayStats {
    pub samples: usize,
    pub average: f64,
    pub min: f64,
    pub max: f64,
    /// Population standard deviation of the delays
    pub jitter: f64,
}

impl DelayStats {
    /// `None` when there is nothing to summarize.
    pub fn from_samples(delays: &[SimTime]) -> Option<Self> {
        let min = *delays.iter().min()?;
        let max = *delays.iter().max()?;

        let n = delays.len() as f64;
        let total: u128 = delays.iter().map(|&d| d as u128).sum();
        let average = total as f64 / 1_000_000.0 / n;

        let variance = delays
            .iter()
            .map(|&d| {
                let diff = as_seconds(d) - average;
                diff * diff
            })
            .sum::<f64>()
            / n;

        Some(Self {
            samples: delays.len(),
            average,
            min: as_seconds(min),
            max: as_seconds(max),
            jitter: variance.sqrt(),
        })
    }
}

/// Final delivery report of a run
#[derive(Debug, Clone, PartialEq)]
pub struct MetricsReport {
    pub sent: u64,
    pub received: u64,
    /// Sends never matched by a reception
    pub lost: usize,
    pub unmatched: u64,
    pub untagged: u64,
    pub invalid: u64,
    /// Received / sent; `None` when nothing was sent
    pub pdr: Option<f64>,
    /// `None` when nothing was received
    pub delay: Option<DelayStats>,
}

impl MetricsReport {
    pub fn print_summary(&self) {
        println!("\n-----------------------------------------");
        println!("---      Simulation Results           ---");
        println!("-----------------------------------------");
        println!("Total Packets Sent:     {}", self.sent);
        println!("Total Packets Received: {}", self.received);
        match self.pdr {
            Some(pdr) => println!("Packet Delivery Ratio (PDR): {:.2} %", pdr * 100.0),
            None => println!("PDR: N/A (No packets sent)"),
        }
        if self.unmatched + self.untagged + self.invalid > 0 {
            println!(
                "Anomalies: {} unmatched, {} untagged, {} invalid tag",
                self.unmatched, self.untagged, self.invalid
            );
        }

        println!("--- Latency Metrics (End-to-End) ---");
        match &self.delay {
            Some(stats) => {
                println!("Average Delay: {:.6} s", stats.average);
                println!("Minimum Delay: {:.6} s", stats.min);
                println!("Maximum Delay: {:.6} s", stats.max);
                println!("Jitter (StdDev): {:.6} s", stats.jitter);
                println!(
                    "(Based on {} successfully received packets)",
                    stats.samples
                );
            }
            None => {
                println!("Average Delay: N/A");
                println!("Minimum Delay: N/A");
                println!("Maximum Delay: N/A");
                println!("Jitter (StdDev): N/A");
                println!("(No packets received successfully to calculate latency)");
            }
        }
        println!("-------------------------------------------");
    }
}
