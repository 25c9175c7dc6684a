//! Payload registry: maps protocol ids to payload types.
//!
//! The registry is the strategy behind the frame codec. It decides how a
//! payload body is parsed and serialized, and it hands out leases for every
//! [`Message`] that enters the core, whether decoded from the wire or
//! created by the server itself. A lease ends when the message is encoded
//! onto the wire or explicitly released (for example when a queue is drained
//! at teardown). `outstanding()` reports the number of live leases, which is
//! how tests prove nothing leaks.

use crate::{Message, Payload, ProtocolError, ProtocolId};

/// Converts payload bodies to and from typed messages.
///
/// Object safe, so the server can hold an `Arc<dyn PayloadRegistry>`.
pub trait PayloadRegistry: Send + Sync + 'static {
    /// Parses a payload body. On success the returned message holds a lease.
    fn decode(&self, id: ProtocolId, body: &[u8]) -> Result<Message, ProtocolError>;

    /// Serializes a payload body. Does not touch leases.
    fn encode(&self, payload: &Payload) -> Result<Vec<u8>, ProtocolError>;

    /// Wraps a payload created by the server into a leased message.
    fn acquire(&self, payload: Payload) -> Message;

    /// Ends the lease of a message that will not be encoded.
    fn release(&self, message: Message);

    /// Number of leases currently held.
    fn outstanding(&self) -> usize;
}

#[cfg(feature = "json")]
mod json {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde::Serialize;
    use serde::de::DeserializeOwned;
    use tracing::warn;

    use super::PayloadRegistry;
    use crate::{
        ClientAuth, ClientHeartbeat, Message, Payload, ProtocolError, ProtocolId,
        ServerAuthResult, ServerForceClose,
    };

    /// A [`PayloadRegistry`] whose bodies are JSON objects.
    ///
    /// ```rust
    /// use tether_protocol::{JsonRegistry, Payload, PayloadRegistry, ProtocolId};
    ///
    /// let registry = JsonRegistry::new();
    /// let msg = registry.decode(ProtocolId::CLIENT_HEARTBEAT, b"{}").unwrap();
    /// assert_eq!(registry.outstanding(), 1);
    ///
    /// registry.release(msg);
    /// assert_eq!(registry.outstanding(), 0);
    /// ```
    #[derive(Debug, Default)]
    pub struct JsonRegistry {
        leases: AtomicUsize,
    }

    impl JsonRegistry {
        pub fn new() -> Self {
            Self::default()
        }

        fn lease(&self, protocol_id: ProtocolId, payload: Payload) -> Message {
            self.leases.fetch_add(1, Ordering::Relaxed);
            Message {
                protocol_id,
                payload,
            }
        }
    }

    fn parse<T: DeserializeOwned>(id: ProtocolId, body: &[u8]) -> Result<T, ProtocolError> {
        serde_json::from_slice(body).map_err(|source| ProtocolError::Decode { id, source })
    }

    fn write<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(value).map_err(ProtocolError::Encode)
    }

    impl PayloadRegistry for JsonRegistry {
        fn decode(&self, id: ProtocolId, body: &[u8]) -> Result<Message, ProtocolError> {
            let payload = match id {
                ProtocolId::CLIENT_AUTH => Payload::ClientAuth(parse::<ClientAuth>(id, body)?),
                ProtocolId::CLIENT_HEARTBEAT => {
                    Payload::ClientHeartbeat(parse::<ClientHeartbeat>(id, body)?)
                }
                ProtocolId::SERVER_AUTH_RESULT => {
                    Payload::ServerAuthResult(parse::<ServerAuthResult>(id, body)?)
                }
                ProtocolId::SERVER_FORCE_CLOSE => {
                    Payload::ServerForceClose(parse::<ServerForceClose>(id, body)?)
                }
                other => return Err(ProtocolError::UnknownProtocol(other)),
            };
            Ok(self.lease(id, payload))
        }

        fn encode(&self, payload: &Payload) -> Result<Vec<u8>, ProtocolError> {
            match payload {
                Payload::ClientAuth(p) => write(p),
                Payload::ClientHeartbeat(p) => write(p),
                Payload::ServerAuthResult(p) => write(p),
                Payload::ServerForceClose(p) => write(p),
            }
        }

        fn acquire(&self, payload: Payload) -> Message {
            let id = payload.protocol_id();
            self.lease(id, payload)
        }

        fn release(&self, message: Message) {
            let prev = self
                .leases
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
            if prev.is_err() {
                warn!(protocol_id = %message.protocol_id, "released a message with no lease");
            }
        }

        fn outstanding(&self) -> usize {
            self.leases.load(Ordering::Relaxed)
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::{CloseReason, PlayerId};

        #[test]
        fn test_decode_client_auth_takes_lease() {
            let reg = JsonRegistry::new();
            let msg = reg
                .decode(ProtocolId::CLIENT_AUTH, br#"{"uid":5,"token":"t"}"#)
                .unwrap();
            assert!(msg.is_auth());
            assert_eq!(
                msg.payload,
                Payload::ClientAuth(ClientAuth {
                    uid: PlayerId(5),
                    token: "t".into()
                })
            );
            assert_eq!(reg.outstanding(), 1);
        }

        #[test]
        fn test_decode_unknown_id_rejected_without_lease() {
            let reg = JsonRegistry::new();
            let err = reg.decode(ProtocolId(999), b"{}").unwrap_err();
            assert!(matches!(err, ProtocolError::UnknownProtocol(ProtocolId(999))));
            assert_eq!(reg.outstanding(), 0);
        }

        #[test]
        fn test_decode_malformed_body_rejected_without_lease() {
            let reg = JsonRegistry::new();
            let err = reg.decode(ProtocolId::CLIENT_AUTH, b"{\"uid\":").unwrap_err();
            assert!(matches!(err, ProtocolError::Decode { .. }));
            assert_eq!(reg.outstanding(), 0);
        }

        #[test]
        fn test_acquire_uses_payload_id() {
            let reg = JsonRegistry::new();
            let msg = reg.acquire(Payload::force_close(CloseReason::HeartbeatTimeout));
            assert_eq!(msg.protocol_id, ProtocolId::SERVER_FORCE_CLOSE);
            assert_eq!(reg.outstanding(), 1);
            reg.release(msg);
            assert_eq!(reg.outstanding(), 0);
        }

        #[test]
        fn test_release_without_lease_saturates_at_zero() {
            let reg = JsonRegistry::new();
            reg.release(Message {
                protocol_id: ProtocolId::CLIENT_HEARTBEAT,
                payload: Payload::ClientHeartbeat(ClientHeartbeat {}),
            });
            assert_eq!(reg.outstanding(), 0);
        }

        #[test]
        fn test_encode_auth_result_body() {
            let reg = JsonRegistry::new();
            let body = reg.encode(&Payload::auth_result(false)).unwrap();
            assert_eq!(body, br#"{"passed":false}"#);
        }
    }
}

#[cfg(feature = "json")]
pub use json::JsonRegistry;
