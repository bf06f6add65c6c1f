//! The 68-byte handshake exchanged at the start of every peer connection.
//!
//! The handshake verifies that both peers are in the same swarm (via the
//! info-hash) and records the remote peer id. Outbound connections send
//! first and then read; inbound connections read first and then send.
use crate::peer::PeerError;
use crate::peer::PeerResult;
use tokio::io::{AsyncRead, AsyncReadExt};

pub const HANDSHAKE_LEN: usize = 68;
const PROTOCOL: &[u8; 19] = b"BitTorrent protocol";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handshake {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
}

impl Handshake {
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        Self { info_hash, peer_id }
    }

    /// Serialized layout: length byte (19), protocol string, 8 reserved
    /// zero bytes, info-hash, peer id.
    pub fn serialize(&self) -> [u8; HANDSHAKE_LEN] {
        let mut buf = [0u8; HANDSHAKE_LEN];
        buf[0] = PROTOCOL.len() as u8;
        buf[1..20].copy_from_slice(PROTOCOL);
        // bytes 20..28 stay zero (reserved)
        buf[28..48].copy_from_slice(&self.info_hash);
        buf[48..68].copy_from_slice(&self.peer_id);
        buf
    }

    /// Reads and validates a handshake from `stream`.
    ///
    /// The length byte must be 19 and the protocol string must match
    /// exactly; anything else is [`PeerError::BadHandshake`]. The info-hash
    /// is returned as-is; callers compare it with [`Handshake::validate`].
    pub async fn read<S: AsyncRead + Unpin>(stream: &mut S) -> PeerResult<Self> {
        let mut buf = [0u8; HANDSHAKE_LEN];
        stream.read_exact(&mut buf).await?;

        if buf[0] as usize != PROTOCOL.len() {
            return Err(PeerError::BadHandshake(format!(
                "bad protocol length {}",
                buf[0]
            )));
        }
        if &buf[1..20] != PROTOCOL {
            return Err(PeerError::BadHandshake(
                "bad protocol string".to_string(),
            ));
        }

        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&buf[28..48]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&buf[48..68]);

        Ok(Self { info_hash, peer_id })
    }

    /// Checks that the remote is in our swarm.
    pub fn validate(&self, expected_info_hash: &[u8; 20]) -> PeerResult<()> {
        if &self.info_hash != expected_info_hash {
            return Err(PeerError::InfoHashMismatch);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_to_the_fixed_layout() {
        let hs = Handshake::new([1u8; 20], [2u8; 20]);
        let bytes = hs.serialize();
        assert_eq!(bytes.len(), HANDSHAKE_LEN);
        assert_eq!(bytes[0], 19);
        assert_eq!(&bytes[1..20], b"BitTorrent protocol");
        assert_eq!(&bytes[20..28], &[0u8; 8]);
        assert_eq!(&bytes[28..48], &[1u8; 20]);
        assert_eq!(&bytes[48..68], &[2u8; 20]);
    }

    #[tokio::test]
    async fn round_trips_through_a_stream() {
        let hs = Handshake::new([7u8; 20], [9u8; 20]);
        let mut reader: &[u8] = &hs.serialize();
        let parsed = Handshake::read(&mut reader).await.unwrap();
        assert_eq!(parsed, hs);
        assert!(parsed.validate(&[7u8; 20]).is_ok());
        assert!(matches!(
            parsed.validate(&[8u8; 20]),
            Err(PeerError::InfoHashMismatch)
        ));
    }

    #[tokio::test]
    async fn rejects_a_foreign_protocol_string() {
        let mut bytes = Handshake::new([0u8; 20], [0u8; 20]).serialize();
        bytes[3] = b'X';
        let mut reader: &[u8] = &bytes;
        assert!(matches!(
            Handshake::read(&mut reader).await,
            Err(PeerError::BadHandshake(_))
        ));
    }
}
