//! Transport data sessions
//!
//! A session is created from the keys of a completed handshake and encrypts
//! IP packets into type-4 messages:
//!
//! ```text
//! type(1) reserved(3) receiver(4) counter(8, LE) packet(n+16)
//! ```

use std::time::{Duration, Instant};

use super::handshake::{SessionKeys, MSG_TRANSPORT};
use super::noise::{self, KEY_LEN, TAG_LEN};
use crate::error::{ProtocolError, Result};

/// Session age after which the initiator starts a new handshake
pub const REKEY_AFTER_TIME: Duration = Duration::from_secs(120);
/// Session age after which it can no longer send or receive
pub const REJECT_AFTER_TIME: Duration = Duration::from_secs(180);
/// Delay before an unanswered initiation is retransmitted
pub const REKEY_TIMEOUT: Duration = Duration::from_secs(5);
/// How long initiations are retried before queued packets are dropped
pub const REKEY_ATTEMPT_TIME: Duration = Duration::from_secs(90);
/// Idle time after receiving data before an empty keepalive is sent
pub const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(10);

/// Send counter at which the initiator rekeys
pub const REKEY_AFTER_MESSAGES: u64 = 1 << 60;
/// Counter limit beyond which a session refuses to send or accept
pub const REJECT_AFTER_MESSAGES: u64 = u64::MAX - (1 << 13);

/// Type, receiver index and counter ahead of the ciphertext
pub const TRANSPORT_HEADER_LEN: usize = 16;

/// Plaintext is padded to a multiple of this before encryption
const PADDING_MULTIPLE: usize = 16;

const WINDOW_SIZE: u64 = 128;

/// Sliding window over the most recent 128 receive counters
#[derive(Debug, Clone, Default)]
pub struct ReplayWindow {
    highest: Option<u64>,
    /// Bit N set means `highest - N` was seen
    bitmap: u128,
}

impl ReplayWindow {
    /// Whether `counter` would be accepted, without recording it
    pub fn check(&self, counter: u64) -> bool {
        match self.highest {
            None => true,
            Some(highest) if counter > highest => true,
            Some(highest) => {
                let age = highest - counter;
                age < WINDOW_SIZE && self.bitmap & (1u128 << age) == 0
            }
        }
    }

    /// Record `counter`. Returns false for replays and counters that fell
    /// out of the window.
    pub fn update(&mut self, counter: u64) -> bool {
        if !self.check(counter) {
            return false;
        }
        match self.highest {
            Some(highest) if counter <= highest => {
                self.bitmap |= 1u128 << (highest - counter);
            }
            Some(highest) => {
                let shift = counter - highest;
                self.bitmap = if shift >= WINDOW_SIZE {
                    1
                } else {
                    (self.bitmap << shift) | 1
                };
                self.highest = Some(counter);
            }
            None => {
                self.bitmap = 1;
                self.highest = Some(counter);
            }
        }
        true
    }
}

/// Established transport session with a peer
pub struct Session {
    pub local_index: u32,
    pub remote_index: u32,
    sending_key: [u8; KEY_LEN],
    receiving_key: [u8; KEY_LEN],
    sending_counter: u64,
    replay: ReplayWindow,
    created_at: Instant,
    last_sent: Instant,
    last_received: Option<Instant>,
}

impl Session {
    pub fn new(keys: SessionKeys) -> Self {
        let now = Instant::now();
        Self {
            local_index: keys.local_index,
            remote_index: keys.remote_index,
            sending_key: keys.sending_key,
            receiving_key: keys.receiving_key,
            sending_counter: 0,
            replay: ReplayWindow::default(),
            created_at: now,
            last_sent: now,
            last_received: None,
        }
    }

    /// Encrypt an IP packet (or an empty keepalive) into a transport message
    pub fn encapsulate(&mut self, packet: &[u8]) -> Result<Vec<u8>> {
        if self.is_expired() || self.sending_counter >= REJECT_AFTER_MESSAGES {
            return Err(ProtocolError::SessionExpired.into());
        }
        let counter = self.sending_counter;
        self.sending_counter += 1;

        let padded_len = packet.len().div_ceil(PADDING_MULTIPLE) * PADDING_MULTIPLE;
        let mut plaintext = Vec::with_capacity(padded_len);
        plaintext.extend_from_slice(packet);
        plaintext.resize(padded_len, 0);

        let sealed = noise::seal(&self.sending_key, counter, &plaintext, &[])?;

        let mut msg = Vec::with_capacity(TRANSPORT_HEADER_LEN + sealed.len());
        msg.extend_from_slice(&[MSG_TRANSPORT, 0, 0, 0]);
        msg.extend_from_slice(&self.remote_index.to_le_bytes());
        msg.extend_from_slice(&counter.to_le_bytes());
        msg.extend_from_slice(&sealed);

        self.last_sent = Instant::now();
        Ok(msg)
    }

    /// Decrypt a transport message. The result still carries any padding;
    /// an empty result is a keepalive.
    pub fn decapsulate(&mut self, msg: &[u8]) -> Result<Vec<u8>> {
        if msg.len() < TRANSPORT_HEADER_LEN + TAG_LEN {
            return Err(ProtocolError::InvalidMessageLength {
                expected: TRANSPORT_HEADER_LEN + TAG_LEN,
                got: msg.len(),
            }
            .into());
        }
        if self.is_expired() {
            return Err(ProtocolError::SessionExpired.into());
        }

        let mut counter_bytes = [0u8; 8];
        counter_bytes.copy_from_slice(&msg[8..16]);
        let counter = u64::from_le_bytes(counter_bytes);

        if counter >= REJECT_AFTER_MESSAGES || !self.replay.check(counter) {
            return Err(ProtocolError::ReplayDetected { counter }.into());
        }
        let plaintext = noise::open(&self.receiving_key, counter, &msg[TRANSPORT_HEADER_LEN..], &[])?;
        // Only authenticated counters move the window
        self.replay.update(counter);

        self.last_received = Some(Instant::now());
        Ok(plaintext)
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Initiator sessions are renewed once they are old or heavily used
    pub fn needs_rekey(&self) -> bool {
        self.age() >= REKEY_AFTER_TIME || self.sending_counter >= REKEY_AFTER_MESSAGES
    }

    pub fn is_expired(&self) -> bool {
        self.age() >= REJECT_AFTER_TIME
    }

    pub fn since_last_sent(&self) -> Duration {
        self.last_sent.elapsed()
    }

    /// Passive keepalive: something arrived after our last transmission and
    /// we stayed silent for KEEPALIVE_TIMEOUT
    pub fn needs_keepalive(&self) -> bool {
        match self.last_received {
            Some(received) => received > self.last_sent && self.since_last_sent() >= KEEPALIVE_TIMEOUT,
            None => false,
        }
    }
}

/// Receiver index of a transport message
pub fn receiver_index(msg: &[u8]) -> Option<u32> {
    let bytes: [u8; 4] = msg.get(4..8)?.try_into().ok()?;
    Some(u32::from_le_bytes(bytes))
}

/// Length of an IP packet according to its own header, used to strip
/// transport padding. `None` for anything that is not IPv4 or IPv6.
pub fn ip_packet_len(packet: &[u8]) -> Option<usize> {
    match packet.first()? >> 4 {
        4 if packet.len() >= 20 => Some(u16::from_be_bytes([packet[2], packet[3]]) as usize),
        6 if packet.len() >= 40 => Some(40 + u16::from_be_bytes([packet[4], packet[5]]) as usize),
        _ => None,
    }
}
