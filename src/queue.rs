// MIT License - Copyright (c) 2026 Peter Wright
// Outbound real-device commands awaiting acknowledgement

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::constants::RETRY_WARN_AFTER;
use crate::protocol::{ack_key, hex, AckKey};

/// A queued command frame and when it was (last) requested.
#[derive(Debug, Clone, PartialEq, Eq)]
struct PendingCommand {
    packet: Vec<u8>,
    since: Instant,
}

/// Result of one transmission attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Sent within the quiet period; waiting for the ack.
    Sent,
    /// Still unacknowledged after [`RETRY_WARN_AFTER`]; `remaining` until it is dropped.
    Retrying { remaining: Duration },
    /// Past `max_retry`: dropped together with its ack expectation.
    Exhausted,
}

/// Commands for real devices, oldest first.
///
/// Frames are keyed by their exact bytes, so asking for the same thing twice
/// only refreshes the timestamp.
#[derive(Debug)]
pub struct CommandQueue {
    pending: VecDeque<PendingCommand>,
    acks: HashMap<AckKey, Vec<u8>>,
    max_retry: Duration,
}

impl CommandQueue {
    pub fn new(max_retry: Duration) -> Self {
        Self {
            pending: VecDeque::new(),
            acks: HashMap::new(),
            max_retry,
        }
    }

    pub fn enqueue(&mut self, packet: Vec<u8>, now: Instant) {
        info!("prepare packet: {}", hex(&packet));
        match self.pending.iter_mut().find(|c| c.packet == packet) {
            Some(existing) => existing.since = now,
            None => self.pending.push_back(PendingCommand { packet, since: now }),
        }
    }

    /// Oldest command still waiting for an ack.
    pub fn front(&self) -> Option<&[u8]> {
        self.pending.front().map(|c| c.packet.as_slice())
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Account for a transmission of `packet` that just went out.
    ///
    /// Registers its ack expectation, or drops it when it has been retried
    /// for longer than `max_retry`.
    pub fn record_attempt(&mut self, packet: &[u8], now: Instant) -> SendOutcome {
        let Some(idx) = self.pending.iter().position(|c| c.packet == packet) else {
            return SendOutcome::Exhausted;
        };
        let Some(key) = ack_key(packet) else {
            self.pending.remove(idx);
            return SendOutcome::Exhausted;
        };

        let elapsed = now.saturating_duration_since(self.pending[idx].since);
        if elapsed > self.max_retry {
            error!("send to device: {} max retry time exceeded!", hex(packet));
            self.pending.remove(idx);
            self.acks.remove(&key);
            return SendOutcome::Exhausted;
        }

        self.acks.insert(key, packet.to_vec());
        if elapsed > RETRY_WARN_AFTER {
            let remaining = self.max_retry - elapsed;
            warn!(
                "send to device: {}, try another {:.1} seconds...",
                hex(packet),
                remaining.as_secs_f32()
            );
            SendOutcome::Retrying { remaining }
        } else {
            info!("send to device: {}", hex(packet));
            SendOutcome::Sent
        }
    }

    /// Resolve an acknowledgement; returns the confirmed command.
    pub fn on_ack(&mut self, key: AckKey) -> Option<Vec<u8>> {
        let packet = self.acks.remove(&key)?;
        self.pending.retain(|c| c.packet != packet);
        info!("ack from device: {} ({})", hex(&packet), hex(&key));
        Some(packet)
    }

    /// Whether `key` is an acknowledgement we are waiting for.
    pub fn expects(&self, key: &AckKey) -> bool {
        self.acks.contains_key(key)
    }
}
