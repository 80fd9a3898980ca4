//! Initiator side of the WireGuard handshake
//!
//! ```text
//! initiation (148): type(1) reserved(3) sender(4) ephemeral(32)
//!                   static(32+16) timestamp(12+16) mac1(16) mac2(16)
//! response    (92): type(1) reserved(3) sender(4) receiver(4)
//!                   ephemeral(32) empty(0+16) mac1(16) mac2(16)
//! cookie      (64): type(1) reserved(3) receiver(4) nonce(24) cookie(16+16)
//! ```

use std::time::{Duration, Instant};

use tai64::Tai64N;
use x25519_dalek::StaticSecret;

use super::noise::{self, SymmetricState, KEY_LEN, MAC_LEN, XNONCE_LEN};
use crate::error::{CryptoError, ProtocolError, Result};

pub const MSG_INITIATION: u8 = 1;
pub const MSG_RESPONSE: u8 = 2;
pub const MSG_COOKIE_REPLY: u8 = 3;
pub const MSG_TRANSPORT: u8 = 4;

pub const INITIATION_LEN: usize = 148;
pub const RESPONSE_LEN: usize = 92;
pub const COOKIE_REPLY_LEN: usize = 64;

const INITIATION_MAC1_OFFSET: usize = 116;
const INITIATION_MAC2_OFFSET: usize = 132;
const RESPONSE_MAC1_OFFSET: usize = 60;

/// A cookie is usable for MAC2 this long after it arrived
pub const COOKIE_LIFETIME: Duration = Duration::from_secs(120);

/// Read the type byte of a datagram
pub fn message_type(packet: &[u8]) -> Result<u8> {
    let msg_type = *packet.first().ok_or(ProtocolError::InvalidMessageLength {
        expected: 1,
        got: 0,
    })?;
    if !(MSG_INITIATION..=MSG_TRANSPORT).contains(&msg_type) {
        return Err(ProtocolError::InvalidMessageType { msg_type }.into());
    }
    Ok(msg_type)
}

fn read_u32(packet: &[u8], offset: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&packet[offset..offset + 4]);
    u32::from_le_bytes(bytes)
}

fn check_len(packet: &[u8], expected: usize) -> Result<()> {
    if packet.len() != expected {
        return Err(ProtocolError::InvalidMessageLength {
            expected,
            got: packet.len(),
        }
        .into());
    }
    Ok(())
}

/// Long-term keys for one local interface and its single peer
pub struct StaticKeys {
    private: StaticSecret,
    public: [u8; KEY_LEN],
    peer_public: [u8; KEY_LEN],
    preshared: [u8; KEY_LEN],
}

impl StaticKeys {
    pub fn new(
        private_key: [u8; KEY_LEN],
        peer_public: [u8; KEY_LEN],
        preshared: Option<[u8; KEY_LEN]>,
    ) -> Self {
        Self {
            public: noise::public_key(&private_key),
            private: StaticSecret::from(private_key),
            peer_public,
            preshared: preshared.unwrap_or([0u8; KEY_LEN]),
        }
    }

    pub fn public_key(&self) -> &[u8; KEY_LEN] {
        &self.public
    }
}

/// Transport keys and indices of a completed handshake
#[derive(Debug, Clone)]
pub struct SessionKeys {
    pub local_index: u32,
    pub remote_index: u32,
    pub sending_key: [u8; KEY_LEN],
    pub receiving_key: [u8; KEY_LEN],
}

/// An initiation that has been sent and awaits its response
pub struct PendingHandshake {
    sender_index: u32,
    state: SymmetricState,
    ephemeral: StaticSecret,
    mac1: [u8; MAC_LEN],
    sent_at: Instant,
}

impl PendingHandshake {
    /// Build a handshake initiation. MAC2 is only filled in when a cookie is
    /// available.
    pub fn initiate(
        keys: &StaticKeys,
        sender_index: u32,
        cookie: Option<&[u8; MAC_LEN]>,
    ) -> Result<(Self, [u8; INITIATION_LEN])> {
        let mut state = SymmetricState::new(&keys.peer_public);
        let (ephemeral, ephemeral_public) = noise::ephemeral_keypair();

        // e, es
        state.mix_ephemeral(&ephemeral_public)?;
        let key = state.mix_key(&noise::dh(&ephemeral, &keys.peer_public)?)?;

        // s, ss
        let encrypted_static = state.encrypt_and_hash(&key, &keys.public)?;
        let key = state.mix_key(&noise::dh(&keys.private, &keys.peer_public)?)?;

        // {t}
        let encrypted_timestamp = state.encrypt_and_hash(&key, &Tai64N::now().to_bytes())?;

        let mut msg = [0u8; INITIATION_LEN];
        msg[0] = MSG_INITIATION;
        msg[4..8].copy_from_slice(&sender_index.to_le_bytes());
        msg[8..40].copy_from_slice(&ephemeral_public);
        msg[40..88].copy_from_slice(&encrypted_static);
        msg[88..116].copy_from_slice(&encrypted_timestamp);

        let mac1 = noise::mac(
            &noise::mac1_key(&keys.peer_public),
            &msg[..INITIATION_MAC1_OFFSET],
        )?;
        msg[INITIATION_MAC1_OFFSET..INITIATION_MAC2_OFFSET].copy_from_slice(&mac1);

        if let Some(cookie) = cookie {
            let mac2 = noise::mac(cookie, &msg[..INITIATION_MAC2_OFFSET])?;
            msg[INITIATION_MAC2_OFFSET..].copy_from_slice(&mac2);
        }

        tracing::debug!("Created handshake initiation (sender index {})", sender_index);

        Ok((
            Self {
                sender_index,
                state,
                ephemeral,
                mac1,
                sent_at: Instant::now(),
            },
            msg,
        ))
    }

    /// MAC1 of the initiation, the associated data of a cookie reply
    pub fn mac1(&self) -> &[u8; MAC_LEN] {
        &self.mac1
    }

    pub fn elapsed(&self) -> Duration {
        self.sent_at.elapsed()
    }

    /// Validate a handshake response and derive the transport keys.
    ///
    /// The pending state is left untouched on failure so a forged response
    /// cannot abort a handshake in progress.
    pub fn consume_response(&self, keys: &StaticKeys, packet: &[u8]) -> Result<SessionKeys> {
        check_len(packet, RESPONSE_LEN)?;
        if packet[0] != MSG_RESPONSE {
            return Err(ProtocolError::InvalidMessageType { msg_type: packet[0] }.into());
        }
        verify_response_mac1(keys, packet)?;

        let remote_index = read_u32(packet, 4);
        let receiver_index = read_u32(packet, 8);
        if receiver_index != self.sender_index {
            return Err(ProtocolError::InvalidReceiverIndex {
                index: receiver_index,
            }
            .into());
        }

        let mut responder_ephemeral = [0u8; KEY_LEN];
        responder_ephemeral.copy_from_slice(&packet[12..44]);

        let mut state = self.state.clone();

        // e, ee, se
        state.mix_ephemeral(&responder_ephemeral)?;
        state.mix_key(&noise::dh(&self.ephemeral, &responder_ephemeral)?)?;
        state.mix_key(&noise::dh(&keys.private, &responder_ephemeral)?)?;

        // psk, {}
        let key = state.mix_key_and_hash(&keys.preshared)?;
        state.decrypt_and_hash(&key, &packet[44..60])?;

        let (sending_key, receiving_key) = state.split()?;

        Ok(SessionKeys {
            local_index: self.sender_index,
            remote_index,
            sending_key,
            receiving_key,
        })
    }
}

/// Responses carry a MAC1 keyed with our own public key
pub fn verify_response_mac1(keys: &StaticKeys, packet: &[u8]) -> Result<()> {
    check_len(packet, RESPONSE_LEN)?;
    let expected = noise::mac(
        &noise::mac1_key(&keys.public),
        &packet[..RESPONSE_MAC1_OFFSET],
    )?;
    if packet[RESPONSE_MAC1_OFFSET..RESPONSE_MAC1_OFFSET + MAC_LEN] != expected {
        return Err(ProtocolError::MacVerificationFailed.into());
    }
    Ok(())
}

/// Most recent cookie received from the peer
#[derive(Debug, Default)]
pub struct CookieJar {
    cookie: Option<([u8; MAC_LEN], Instant)>,
}

impl CookieJar {
    /// The stored cookie, if it has not expired
    pub fn current(&self) -> Option<&[u8; MAC_LEN]> {
        match &self.cookie {
            Some((value, received)) if received.elapsed() < COOKIE_LIFETIME => Some(value),
            _ => None,
        }
    }

    /// Decrypt a cookie reply addressed to `pending` and store its cookie
    pub fn consume_reply(
        &mut self,
        keys: &StaticKeys,
        pending: &PendingHandshake,
        packet: &[u8],
    ) -> Result<()> {
        check_len(packet, COOKIE_REPLY_LEN)?;
        if packet[0] != MSG_COOKIE_REPLY {
            return Err(ProtocolError::InvalidMessageType { msg_type: packet[0] }.into());
        }

        let receiver_index = read_u32(packet, 4);
        if receiver_index != pending.sender_index {
            return Err(ProtocolError::InvalidReceiverIndex {
                index: receiver_index,
            }
            .into());
        }

        let mut nonce = [0u8; XNONCE_LEN];
        nonce.copy_from_slice(&packet[8..32]);
        let plaintext = noise::xopen(
            &noise::cookie_key(&keys.peer_public),
            &nonce,
            &packet[32..64],
            &pending.mac1,
        )?;

        let cookie: [u8; MAC_LEN] = plaintext
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::Decryption)?;
        self.cookie = Some((cookie, Instant::now()));

        tracing::debug!("Stored cookie (valid for {}s)", COOKIE_LIFETIME.as_secs());
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    use super::responder::Responder;
    use crate::error::WgncError;

    fn initiator_keys(responder: &Responder, psk: Option<[u8; 32]>) -> StaticKeys {
        let private = StaticSecret::random_from_rng(OsRng).to_bytes();
        StaticKeys::new(private, responder.public, psk)
    }

    #[test]
    fn test_handshake_derives_matching_keys() {
        let responder = Responder::new();
        let keys = initiator_keys(&responder, None);

        let (pending, initiation) = PendingHandshake::initiate(&keys, 42, None).unwrap();
        assert_eq!(read_u32(&initiation, 4), 42);
        assert!(initiation[132..].iter().all(|&b| b == 0));

        let (response, responder_send, responder_recv) =
            responder.respond(&initiation, keys.public_key(), [0u8; 32]);
        let session = pending.consume_response(&keys, &response).unwrap();

        assert_eq!(session.local_index, 42);
        assert_eq!(session.remote_index, 777);
        assert_eq!(session.sending_key, responder_recv);
        assert_eq!(session.receiving_key, responder_send);
    }

    #[test]
    fn test_handshake_with_preshared_key() {
        let responder = Responder::new();
        let psk = [0x5au8; 32];
        let keys = initiator_keys(&responder, Some(psk));

        let (pending, initiation) = PendingHandshake::initiate(&keys, 1, None).unwrap();
        let (response, _, responder_recv) = responder.respond(&initiation, keys.public_key(), psk);
        let session = pending.consume_response(&keys, &response).unwrap();
        assert_eq!(session.sending_key, responder_recv);

        // A responder using a different PSK cannot complete the handshake
        let (pending, initiation) = PendingHandshake::initiate(&keys, 2, None).unwrap();
        let (response, _, _) = responder.respond(&initiation, keys.public_key(), [0u8; 32]);
        assert!(matches!(
            pending.consume_response(&keys, &response),
            Err(WgncError::Crypto(CryptoError::Decryption))
        ));
    }

    #[test]
    fn test_response_with_bad_mac1_rejected() {
        let responder = Responder::new();
        let keys = initiator_keys(&responder, None);

        let (pending, initiation) = PendingHandshake::initiate(&keys, 9, None).unwrap();
        let (mut response, _, _) = responder.respond(&initiation, keys.public_key(), [0u8; 32]);
        response[61] ^= 0xff;

        assert!(matches!(
            pending.consume_response(&keys, &response),
            Err(WgncError::Protocol(ProtocolError::MacVerificationFailed))
        ));
    }

    #[test]
    fn test_response_for_other_index_rejected() {
        let responder = Responder::new();
        let keys = initiator_keys(&responder, None);

        let (_, initiation) = PendingHandshake::initiate(&keys, 10, None).unwrap();
        let (pending, _) = PendingHandshake::initiate(&keys, 11, None).unwrap();
        let (response, _, _) = responder.respond(&initiation, keys.public_key(), [0u8; 32]);

        assert!(matches!(
            pending.consume_response(&keys, &response),
            Err(WgncError::Protocol(ProtocolError::InvalidReceiverIndex { index: 10 }))
        ));
    }

    #[test]
    fn test_cookie_reply_enables_mac2() {
        let responder = Responder::new();
        let keys = initiator_keys(&responder, None);
        let mut jar = CookieJar::default();
        assert!(jar.current().is_none());

        let (pending, _) = PendingHandshake::initiate(&keys, 5, None).unwrap();
        let cookie = [0xc0u8; 16];
        let reply = responder.cookie_reply(5, pending.mac1(), cookie);
        jar.consume_reply(&keys, &pending, &reply).unwrap();
        assert_eq!(jar.current(), Some(&cookie));

        let (_, initiation) = PendingHandshake::initiate(&keys, 6, jar.current()).unwrap();
        let expected = noise::mac(&cookie, &initiation[..132]).unwrap();
        assert_eq!(&initiation[132..], &expected);
    }

    #[test]
    fn test_cookie_reply_bound_to_mac1() {
        let responder = Responder::new();
        let keys = initiator_keys(&responder, None);
        let mut jar = CookieJar::default();

        let (pending, _) = PendingHandshake::initiate(&keys, 5, None).unwrap();
        let reply = responder.cookie_reply(5, &[0u8; 16], [1u8; 16]);
        assert!(jar.consume_reply(&keys, &pending, &reply).is_err());
        assert!(jar.current().is_none());
    }

    #[test]
    fn test_message_type() {
        assert_eq!(message_type(&[4, 0, 0, 0]).unwrap(), MSG_TRANSPORT);
        assert!(message_type(&[]).is_err());
        assert!(message_type(&[9]).is_err());
    }
}
