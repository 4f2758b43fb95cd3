//! Rendezvous protocol for room code discovery
//!
//! A small iroh service mapping six-digit room codes to dialable endpoint
//! addresses. Endpoints keep one connection open to the service; every
//! request is a bi-stream carrying one postcard message each way.
//!
//! ## Message Flow
//!
//! ```text
//! Endpoint (123456)               Rendezvous
//!   |                               |
//!   |--- Register{123456, addr} --->|   registry.register()
//!   |<-- Registered / Conflict -----|
//!   |                               |
//!   |--- Lookup{654321} ----------->|   registry.resolve()
//!   |<-- Found{addr} / NotFound ----|
//!   |                               |
//!   |--- Join{654321, 123456} ----->|   registry.join()  (link accepted)
//!   |<-- Joined --------------------|
//!   |--- Leave{654321, 123456} ---->|   registry.leave() (link closed)
//!   |<-- Left ----------------------|
//!   |                               |
//!   x  connection closed            |   leave() + unregister()
//! ```
//!
//! A registration, and any room membership, lives at most as long as the
//! connection that made it.
//! The service is shared with endpoints as a ticket:
//! `studylink-rdv:{base58}`.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use iroh::endpoint::Connection;
use iroh::protocol::{ProtocolHandler, Router};
use iroh::{Endpoint, EndpointAddr, PublicKey, RelayUrl, SecretKey};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::error::{RegistryError, TransportError};
use crate::registry::SessionRegistry;
use crate::types::RoomCode;

/// ALPN protocol identifier for the rendezvous service
pub const RENDEZVOUS_ALPN: &[u8] = b"/studylink/rendezvous/1";

const TICKET_PREFIX: &str = "studylink-rdv:";

/// Requests and responses are tiny; anything larger is hostile
const MAX_MESSAGE_SIZE: usize = 16 * 1024;

/// Serializable form of an iroh [`EndpointAddr`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointAddrBytes {
    /// Endpoint public key
    pub endpoint_id: [u8; 32],
    /// Home relay, if any
    pub relay_url: Option<String>,
    /// Direct socket addresses as strings (e.g. "192.168.1.1:4433")
    pub direct_addresses: Vec<String>,
}

impl EndpointAddrBytes {
    pub fn from_endpoint_addr(addr: &EndpointAddr) -> Self {
        Self {
            endpoint_id: addr.id.as_bytes().to_owned(),
            relay_url: addr.relay_urls().next().map(|url| url.to_string()),
            direct_addresses: addr.ip_addrs().map(|addr| addr.to_string()).collect(),
        }
    }

    pub fn to_endpoint_addr(&self) -> Result<EndpointAddr, TransportError> {
        let public_key = PublicKey::from_bytes(&self.endpoint_id)
            .map_err(|e| TransportError::Serialization(format!("Invalid public key: {}", e)))?;

        let mut addr = EndpointAddr::new(public_key);

        if let Some(ref relay_str) = self.relay_url {
            let relay_url: RelayUrl = relay_str
                .parse()
                .map_err(|e| TransportError::Serialization(format!("Invalid relay URL: {}", e)))?;
            addr = addr.with_relay_url(relay_url);
        }

        for addr_str in &self.direct_addresses {
            let socket_addr: SocketAddr = addr_str.parse().map_err(|e| {
                TransportError::Serialization(format!("Invalid socket address: {}", e))
            })?;
            addr = addr.with_ip_addr(socket_addr);
        }

        Ok(addr)
    }
}

impl From<&EndpointAddr> for EndpointAddrBytes {
    fn from(addr: &EndpointAddr) -> Self {
        Self::from_endpoint_addr(addr)
    }
}

/// Shareable address of a rendezvous service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RendezvousTicket {
    pub addr: EndpointAddrBytes,
}

impl RendezvousTicket {
    pub fn new(addr: &EndpointAddr) -> Self {
        Self {
            addr: EndpointAddrBytes::from_endpoint_addr(addr),
        }
    }

    /// Encode as a `studylink-rdv:{base58}` string
    pub fn encode(&self) -> Result<String, TransportError> {
        let bytes = postcard::to_allocvec(self)
            .map_err(|e| TransportError::Serialization(format!("Failed to encode ticket: {}", e)))?;
        Ok(format!("{}{}", TICKET_PREFIX, bs58::encode(&bytes).into_string()))
    }

    /// Decode a `studylink-rdv:{base58}` string
    pub fn decode(s: &str) -> Result<Self, TransportError> {
        let data = s.trim().strip_prefix(TICKET_PREFIX).ok_or_else(|| {
            TransportError::Serialization(format!("Ticket must start with '{}'", TICKET_PREFIX))
        })?;
        let bytes = bs58::decode(data)
            .into_vec()
            .map_err(|e| TransportError::Serialization(format!("Invalid base58: {}", e)))?;
        postcard::from_bytes(&bytes)
            .map_err(|e| TransportError::Serialization(format!("Failed to decode ticket: {}", e)))
    }

    pub fn endpoint_addr(&self) -> Result<EndpointAddr, TransportError> {
        self.addr.to_endpoint_addr()
    }
}

impl fmt::Display for RendezvousTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.encode() {
            Ok(s) => f.write_str(&s),
            Err(_) => f.write_str("<invalid ticket>"),
        }
    }
}

/// Rendezvous requests
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum RendezvousRequest {
    /// Claim `code` for the connection's lifetime
    Register {
        code: RoomCode,
        addr: EndpointAddrBytes,
    },
    /// Resolve `code` to its host's address
    Lookup { code: RoomCode },
    /// `joiner` has an accepted link into `room`
    Join { room: RoomCode, joiner: RoomCode },
    /// `joiner`'s link into `room` closed
    Leave { room: RoomCode, joiner: RoomCode },
}

/// Rendezvous responses
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum RendezvousResponse {
    Registered,
    /// Another live endpoint holds the code
    Conflict,
    Found { addr: EndpointAddrBytes },
    NotFound,
    Joined,
    Left,
    Error { reason: String },
}

impl RendezvousRequest {
    /// Encode message to bytes using postcard
    pub fn encode(&self) -> Result<Vec<u8>, TransportError> {
        postcard::to_allocvec(self).map_err(|e| {
            TransportError::Serialization(format!("Failed to encode rendezvous request: {}", e))
        })
    }

    /// Decode message from bytes using postcard
    pub fn decode(bytes: &[u8]) -> Result<Self, TransportError> {
        postcard::from_bytes(bytes).map_err(|e| {
            TransportError::Serialization(format!("Failed to decode rendezvous request: {}", e))
        })
    }
}

impl RendezvousResponse {
    pub fn encode(&self) -> Result<Vec<u8>, TransportError> {
        postcard::to_allocvec(self).map_err(|e| {
            TransportError::Serialization(format!("Failed to encode rendezvous response: {}", e))
        })
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, TransportError> {
        postcard::from_bytes(bytes).map_err(|e| {
            TransportError::Serialization(format!("Failed to decode rendezvous response: {}", e))
        })
    }
}

/// Codes and room memberships claimed over one rendezvous connection.
///
/// Everything here is released when the connection goes away.
#[derive(Debug, Default)]
struct Claims {
    codes: Vec<RoomCode>,
    memberships: Vec<(RoomCode, RoomCode)>,
}

impl Claims {
    fn release(self, registry: &SessionRegistry<EndpointAddrBytes>) {
        for (room, joiner) in self.memberships {
            registry.leave(&room, &joiner);
        }
        for code in self.codes {
            registry.unregister(&code);
            info!(%code, "Room code released");
        }
    }
}

/// Protocol handler answering rendezvous requests
///
/// Registered with the Router under [`RENDEZVOUS_ALPN`].
#[derive(Clone)]
pub struct RendezvousHandler {
    registry: Arc<SessionRegistry<EndpointAddrBytes>>,
}

impl fmt::Debug for RendezvousHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RendezvousHandler")
            .field("rooms", &self.registry.len())
            .finish()
    }
}

impl RendezvousHandler {
    pub fn new(registry: Arc<SessionRegistry<EndpointAddrBytes>>) -> Self {
        Self { registry }
    }

    /// Apply one request, remembering what this connection claimed
    fn respond(
        registry: &SessionRegistry<EndpointAddrBytes>,
        request: RendezvousRequest,
        claims: &mut Claims,
    ) -> RendezvousResponse {
        match request {
            RendezvousRequest::Register { code, addr } => {
                match registry.register(code.clone(), addr) {
                    Ok(()) => {
                        info!(%code, "Room code registered");
                        claims.codes.push(code);
                        RendezvousResponse::Registered
                    }
                    Err(RegistryError::CodeTaken(code)) => {
                        debug!(%code, "Registration rejected, code in use");
                        RendezvousResponse::Conflict
                    }
                    Err(e) => RendezvousResponse::Error {
                        reason: e.to_string(),
                    },
                }
            }
            RendezvousRequest::Lookup { code } => match registry.resolve(&code) {
                Some(addr) => RendezvousResponse::Found { addr },
                None => RendezvousResponse::NotFound,
            },
            RendezvousRequest::Join { room, joiner } => {
                if room == joiner {
                    return RendezvousResponse::Error {
                        reason: "cannot join your own room".to_string(),
                    };
                }
                match registry.join(&room, joiner.clone()) {
                    Ok(()) => {
                        claims.memberships.push((room, joiner));
                        RendezvousResponse::Joined
                    }
                    Err(_) => RendezvousResponse::NotFound,
                }
            }
            RendezvousRequest::Leave { room, joiner } => {
                registry.leave(&room, &joiner);
                claims.memberships.retain(|(r, j)| !(r == &room && j == &joiner));
                RendezvousResponse::Left
            }
        }
    }

    /// Serve requests until the connection closes, then drop its claims
    async fn handle_connection(
        connection: Connection,
        registry: Arc<SessionRegistry<EndpointAddrBytes>>,
    ) -> Result<(), TransportError> {
        let remote_id = connection.remote_id();
        debug!(?remote_id, "Handling rendezvous connection");

        let mut claims = Claims::default();

        loop {
            let (mut send, mut recv) = match connection.accept_bi().await {
                Ok(streams) => streams,
                Err(e) => {
                    debug!(?remote_id, reason = %e, "Rendezvous connection closed");
                    break;
                }
            };

            let request = match recv.read_to_end(MAX_MESSAGE_SIZE).await {
                Ok(bytes) => RendezvousRequest::decode(&bytes),
                Err(e) => Err(TransportError::Network(format!("Failed to read request: {}", e))),
            };

            let response = match request {
                Ok(request) => Self::respond(&registry, request, &mut claims),
                Err(e) => {
                    warn!(?remote_id, error = %e, "Bad rendezvous request");
                    RendezvousResponse::Error {
                        reason: e.to_string(),
                    }
                }
            };

            let bytes = response.encode()?;
            if let Err(e) = send.write_all(&bytes).await {
                warn!(?remote_id, error = %e, "Failed to write rendezvous response");
                continue;
            }
            if let Err(e) = send.finish() {
                warn!(?remote_id, error = %e, "Failed to finish rendezvous stream");
            }
        }

        claims.release(&registry);
        Ok(())
    }
}

impl ProtocolHandler for RendezvousHandler {
    fn accept(
        &self,
        conn: Connection,
    ) -> impl std::future::Future<Output = Result<(), iroh::protocol::AcceptError>> + Send {
        let registry = self.registry.clone();

        async move {
            debug!(peer = %conn.remote_id(), "Router accepting rendezvous connection");

            if let Err(e) = Self::handle_connection(conn, registry).await {
                error!(error = ?e, "Failed to handle rendezvous connection");
                return Err(iroh::protocol::AcceptError::from_err(e));
            }

            Ok(())
        }
    }
}

/// A running rendezvous service
#[derive(Debug)]
pub struct RendezvousServer {
    endpoint: Endpoint,
    router: Router,
    registry: Arc<SessionRegistry<EndpointAddrBytes>>,
}

impl RendezvousServer {
    /// Bind a fresh endpoint and start serving
    pub async fn spawn() -> Result<Self, TransportError> {
        let secret_key = SecretKey::generate(&mut rand::rng());
        let endpoint = Endpoint::builder()
            .secret_key(secret_key)
            .alpns(vec![RENDEZVOUS_ALPN.to_vec()])
            .bind()
            .await
            .map_err(|e| TransportError::Network(format!("Failed to bind endpoint: {}", e)))?;

        let registry = Arc::new(SessionRegistry::new());
        let router = Router::builder(endpoint.clone())
            .accept(RENDEZVOUS_ALPN, RendezvousHandler::new(registry.clone()))
            .spawn();

        info!(endpoint_id = %endpoint.id(), "Rendezvous service started");
        Ok(Self {
            endpoint,
            router,
            registry,
        })
    }

    /// Ticket endpoints use to reach this service
    pub fn ticket(&self) -> RendezvousTicket {
        RendezvousTicket::new(&self.endpoint.addr())
    }

    /// Registered codes and who is in their rooms
    pub fn registry(&self) -> &SessionRegistry<EndpointAddrBytes> {
        &self.registry
    }

    pub async fn shutdown(self) {
        info!("Shutting down rendezvous service");
        if let Err(e) = self.router.shutdown().await {
            warn!(error = ?e, "Failed to shutdown router cleanly");
        }
        self.endpoint.close().await;
    }
}

/// Client side of the rendezvous protocol
///
/// Holds the connection that keeps this endpoint's registration alive.
#[derive(Debug, Clone)]
pub struct RendezvousClient {
    connection: Connection,
}

impl RendezvousClient {
    pub async fn connect(
        endpoint: &Endpoint,
        ticket: &RendezvousTicket,
    ) -> Result<Self, TransportError> {
        let addr = ticket.endpoint_addr()?;
        let connection = endpoint.connect(addr, RENDEZVOUS_ALPN).await.map_err(|e| {
            TransportError::Network(format!("Failed to reach rendezvous service: {}", e))
        })?;
        Ok(Self { connection })
    }

    async fn request(&self, request: &RendezvousRequest) -> Result<RendezvousResponse, TransportError> {
        let bytes = request.encode()?;

        let (mut send, mut recv) = self
            .connection
            .open_bi()
            .await
            .map_err(|e| TransportError::Network(format!("Failed to open stream: {}", e)))?;

        send.write_all(&bytes)
            .await
            .map_err(|e| TransportError::Network(format!("Failed to write request: {}", e)))?;
        send.finish()
            .map_err(|e| TransportError::Network(format!("Failed to finish stream: {}", e)))?;

        let response = recv
            .read_to_end(MAX_MESSAGE_SIZE)
            .await
            .map_err(|e| TransportError::Network(format!("Failed to read response: {}", e)))?;
        RendezvousResponse::decode(&response)
    }

    /// Claim `code` for as long as this client's connection stays open
    pub async fn register(&self, code: &RoomCode, addr: &EndpointAddr) -> Result<(), TransportError> {
        let request = RendezvousRequest::Register {
            code: code.clone(),
            addr: EndpointAddrBytes::from_endpoint_addr(addr),
        };
        match self.request(&request).await? {
            RendezvousResponse::Registered => Ok(()),
            RendezvousResponse::Conflict => Err(TransportError::RegistrationConflict(code.clone())),
            other => Err(TransportError::Network(format!(
                "Unexpected rendezvous response: {:?}",
                other
            ))),
        }
    }

    /// Resolve `code` to a dialable address
    pub async fn lookup(&self, code: &RoomCode) -> Result<EndpointAddr, TransportError> {
        let request = RendezvousRequest::Lookup { code: code.clone() };
        match self.request(&request).await? {
            RendezvousResponse::Found { addr } => addr.to_endpoint_addr(),
            RendezvousResponse::NotFound => Err(TransportError::PeerUnreachable(code.clone())),
            other => Err(TransportError::Network(format!(
                "Unexpected rendezvous response: {:?}",
                other
            ))),
        }
    }

    /// Record `joiner` as present in `room` until [`Self::leave`] or until
    /// this client's connection closes
    pub async fn join(&self, room: &RoomCode, joiner: &RoomCode) -> Result<(), TransportError> {
        let request = RendezvousRequest::Join {
            room: room.clone(),
            joiner: joiner.clone(),
        };
        match self.request(&request).await? {
            RendezvousResponse::Joined => Ok(()),
            RendezvousResponse::NotFound => Err(TransportError::PeerUnreachable(room.clone())),
            other => Err(TransportError::Network(format!(
                "Unexpected rendezvous response: {:?}",
                other
            ))),
        }
    }

    pub async fn leave(&self, room: &RoomCode, joiner: &RoomCode) -> Result<(), TransportError> {
        let request = RendezvousRequest::Leave {
            room: room.clone(),
            joiner: joiner.clone(),
        };
        match self.request(&request).await? {
            RendezvousResponse::Left => Ok(()),
            other => Err(TransportError::Network(format!(
                "Unexpected rendezvous response: {:?}",
                other
            ))),
        }
    }

    /// Drop the connection, releasing every code it registered
    pub fn close(&self) {
        self.connection.close(0u32.into(), b"closing");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn code(s: &str) -> RoomCode {
        RoomCode::parse(s).unwrap()
    }

    fn sample_addr() -> EndpointAddr {
        let secret = SecretKey::generate(&mut rand::rng());
        EndpointAddr::new(secret.public()).with_ip_addr("127.0.0.1:4433".parse().unwrap())
    }

    #[test]
    fn test_ticket_encode_decode() {
        let addr = sample_addr();
        let ticket = RendezvousTicket::new(&addr);
        let encoded = ticket.encode().unwrap();
        assert!(encoded.starts_with("studylink-rdv:"));

        let decoded = RendezvousTicket::decode(&encoded).unwrap();
        assert_eq!(decoded, ticket);
        assert_eq!(decoded.endpoint_addr().unwrap().id, addr.id);
    }

    #[test]
    fn test_ticket_rejects_wrong_prefix() {
        assert!(RendezvousTicket::decode("sync-invite:abc").is_err());
        assert!(RendezvousTicket::decode("studylink-rdv:0OIl").is_err());
    }

    #[test]
    fn test_request_encode_decode() {
        let request = RendezvousRequest::Join {
            room: code("123456"),
            joiner: code("654321"),
        };
        let decoded = RendezvousRequest::decode(&request.encode().unwrap()).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn test_register_then_conflict() {
        let registry = SessionRegistry::new();
        let mut claims = Claims::default();
        let addr = EndpointAddrBytes::from_endpoint_addr(&sample_addr());

        let first = RendezvousHandler::respond(
            &registry,
            RendezvousRequest::Register {
                code: code("123456"),
                addr: addr.clone(),
            },
            &mut claims,
        );
        assert_eq!(first, RendezvousResponse::Registered);

        let second = RendezvousHandler::respond(
            &registry,
            RendezvousRequest::Register {
                code: code("123456"),
                addr: addr.clone(),
            },
            &mut claims,
        );
        assert_eq!(second, RendezvousResponse::Conflict);
        assert_eq!(claims.codes.len(), 1);
    }

    #[test]
    fn test_lookup_does_not_record_joiner() {
        let registry = SessionRegistry::new();
        let mut claims = Claims::default();
        let addr = EndpointAddrBytes::from_endpoint_addr(&sample_addr());
        registry.register(code("123456"), addr.clone()).unwrap();

        let found = RendezvousHandler::respond(
            &registry,
            RendezvousRequest::Lookup { code: code("123456") },
            &mut claims,
        );
        assert_eq!(found, RendezvousResponse::Found { addr });
        assert_eq!(registry.participants(&code("123456")), vec![code("123456")]);

        let missing = RendezvousHandler::respond(
            &registry,
            RendezvousRequest::Lookup { code: code("111111") },
            &mut claims,
        );
        assert_eq!(missing, RendezvousResponse::NotFound);
    }

    #[test]
    fn test_join_and_leave_track_participants() {
        let registry = SessionRegistry::new();
        let mut claims = Claims::default();
        let addr = EndpointAddrBytes::from_endpoint_addr(&sample_addr());
        registry.register(code("123456"), addr).unwrap();

        let joined = RendezvousHandler::respond(
            &registry,
            RendezvousRequest::Join {
                room: code("123456"),
                joiner: code("654321"),
            },
            &mut claims,
        );
        assert_eq!(joined, RendezvousResponse::Joined);
        assert_eq!(
            registry.participants(&code("123456")),
            vec![code("123456"), code("654321")]
        );

        let left = RendezvousHandler::respond(
            &registry,
            RendezvousRequest::Leave {
                room: code("123456"),
                joiner: code("654321"),
            },
            &mut claims,
        );
        assert_eq!(left, RendezvousResponse::Left);
        assert_eq!(registry.participants(&code("123456")), vec![code("123456")]);
        assert!(claims.memberships.is_empty());
    }

    #[test]
    fn test_closed_connection_releases_memberships() {
        let registry = SessionRegistry::new();
        let addr = EndpointAddrBytes::from_endpoint_addr(&sample_addr());
        registry.register(code("123456"), addr).unwrap();

        let mut claims = Claims::default();
        RendezvousHandler::respond(
            &registry,
            RendezvousRequest::Join {
                room: code("123456"),
                joiner: code("654321"),
            },
            &mut claims,
        );
        claims.release(&registry);

        assert_eq!(registry.participants(&code("123456")), vec![code("123456")]);
    }
}
