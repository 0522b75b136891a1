//! Session handshake.
//!
//! The client opens every connection with a single handshake frame, sent
//! with the cipher disabled:
//!
//! ```text
//! [client type: GChar] [seed: GChar] [version token: 8 bytes] [payload...]
//! ```
//!
//! The client type says what kind of peer is connecting and picks the
//! cipher generation, the seed keys it, and the version token names the
//! client build. The trailing payload (account name, password,
//! client identification) is opaque here and handed to collaborators.
//!
//! Each accepted handshake yields a [`CipherPair`]: fresh, independent
//! keystream states for the two directions of the connection.

use rand::Rng;
use tracing::{debug, instrument, warn};

use crate::config::{ClientConfig, TransportConfig};
use crate::core::field::{write_gchar, FieldReader, GCHAR_MAX};
use crate::error::constants::{
    ERR_CLIENT_TYPE_RANGE, ERR_ENCRYPTION_REQUIRED, ERR_HANDSHAKE_TRUNCATED, ERR_SEED_RANGE,
    ERR_VERSION_TOKEN,
};
use crate::error::{ProtocolError, Result};
use crate::utils::crypto::{CipherState, Generation};

/// Length of the protocol version token.
pub const VERSION_TOKEN_LEN: usize = 8;

/// Kind of peer named by the first handshake byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientType {
    /// Classic game client, no keystream.
    Client,
    /// Remote control client.
    Rc,
    NpcServer,
    /// NPC control client.
    Nc,
    Client2,
    /// Current game client.
    Client3,
    Rc2,
    /// Any other code, kept as sent.
    Other(u8),
}

impl ClientType {
    /// Handshake code.
    pub const fn code(self) -> u8 {
        match self {
            ClientType::Client => 0,
            ClientType::Rc => 1,
            ClientType::NpcServer => 2,
            ClientType::Nc => 3,
            ClientType::Client2 => 4,
            ClientType::Client3 => 5,
            ClientType::Rc2 => 6,
            ClientType::Other(code) => code,
        }
    }

    pub const fn from_code(code: u8) -> Self {
        match code {
            0 => ClientType::Client,
            1 => ClientType::Rc,
            2 => ClientType::NpcServer,
            3 => ClientType::Nc,
            4 => ClientType::Client2,
            5 => ClientType::Client3,
            6 => ClientType::Rc2,
            other => ClientType::Other(other),
        }
    }

    /// Cipher generation this kind of peer speaks.
    ///
    /// Only the classic client runs unencrypted; every other type, unknown
    /// codes included, uses gen5.
    pub const fn generation(self) -> Generation {
        match self {
            ClientType::Client => Generation::Disabled,
            _ => Generation::Gen5,
        }
    }

    /// Game client type for `generation`.
    pub const fn for_generation(generation: Generation) -> Self {
        match generation {
            Generation::Disabled => ClientType::Client,
            Generation::Gen5 => ClientType::Client3,
        }
    }
}

/// Cipher states for both directions of one connection.
#[derive(Debug)]
pub struct CipherPair {
    pub outbound: CipherState,
    pub inbound: CipherState,
}

/// Decoded handshake frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    client_type: ClientType,
    seed: u8,
    version: [u8; VERSION_TOKEN_LEN],
    payload: Vec<u8>,
}

impl Handshake {
    /// Build a game client handshake speaking `generation`.
    ///
    /// # Errors
    /// Returns `ProtocolError::HandshakeError` if the seed does not fit in a
    /// single digit or the version is not 8 ASCII bytes
    pub fn new(generation: Generation, seed: u8, version: &str, payload: Vec<u8>) -> Result<Self> {
        Self::with_client_type(ClientType::for_generation(generation), seed, version, payload)
    }

    /// Build a handshake for an explicit client type.
    ///
    /// # Errors
    /// Same as [`Handshake::new`], plus a client code above the single-digit
    /// range
    pub fn with_client_type(
        client_type: ClientType,
        seed: u8,
        version: &str,
        payload: Vec<u8>,
    ) -> Result<Self> {
        if client_type.code() > GCHAR_MAX {
            return Err(ProtocolError::HandshakeError(ERR_CLIENT_TYPE_RANGE.to_string()));
        }
        if seed > GCHAR_MAX {
            return Err(ProtocolError::HandshakeError(ERR_SEED_RANGE.to_string()));
        }
        Ok(Self {
            client_type,
            seed,
            version: parse_version(version.as_bytes())?,
            payload,
        })
    }

    /// Build a handshake with a random seed.
    pub fn with_random_seed(generation: Generation, version: &str, payload: Vec<u8>) -> Result<Self> {
        let seed = rand::rng().random_range(0..=GCHAR_MAX);
        Self::new(generation, seed, version, payload)
    }

    /// Client handshake as described by `config`, with a random seed.
    pub fn for_client(config: &ClientConfig, payload: Vec<u8>) -> Result<Self> {
        let generation = if config.encrypt {
            Generation::Gen5
        } else {
            Generation::Disabled
        };
        Self::with_random_seed(generation, &config.protocol_version, payload)
    }

    pub fn client_type(&self) -> ClientType {
        self.client_type
    }

    pub fn generation(&self) -> Generation {
        self.client_type.generation()
    }

    pub fn seed(&self) -> u8 {
        self.seed
    }

    /// Version token as text.
    pub fn version(&self) -> &str {
        // The token is checked to be ASCII on construction.
        std::str::from_utf8(&self.version).unwrap_or_default()
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Serialize to handshake plaintext.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(2 + VERSION_TOKEN_LEN + self.payload.len());
        write_gchar(&mut out, self.client_type.code())?;
        write_gchar(&mut out, self.seed)?;
        out.extend_from_slice(&self.version);
        out.extend_from_slice(&self.payload);
        Ok(out)
    }

    /// Parse handshake plaintext.
    ///
    /// # Errors
    /// Returns `ProtocolError::HandshakeError` if the fixed fields are
    /// missing or malformed
    #[instrument(skip(bytes), fields(len = bytes.len()), level = "debug")]
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut reader = FieldReader::new(bytes);
        let invalid = |e: ProtocolError| ProtocolError::HandshakeError(e.to_string());
        let truncated = |_| ProtocolError::HandshakeError(ERR_HANDSHAKE_TRUNCATED.to_string());

        let client_type = ClientType::from_code(reader.read_gchar().map_err(invalid)?);
        let seed = reader.read_gchar().map_err(invalid)?;
        let version = parse_version(reader.read_bytes(VERSION_TOKEN_LEN).map_err(truncated)?)?;
        let payload = reader.remaining().to_vec();

        debug!(?client_type, seed, "Decoded handshake");
        Ok(Self {
            client_type,
            seed,
            version,
            payload,
        })
    }

    /// Check the handshake against the server's transport policy.
    ///
    /// # Errors
    /// - `ProtocolError::HandshakeError` if encryption is required but was
    ///   not requested
    /// - `ProtocolError::UnsupportedVersion` if the version is not accepted
    pub fn validate(&self, config: &TransportConfig) -> Result<()> {
        if config.encryption_required && self.generation() == Generation::Disabled {
            warn!("Rejecting unencrypted handshake");
            return Err(ProtocolError::HandshakeError(
                ERR_ENCRYPTION_REQUIRED.to_string(),
            ));
        }

        let version = self.version();
        let known = config.accepted_versions.iter().any(|v| v == version);
        if !known {
            if config.reject_unknown_versions {
                warn!(version, "Rejecting unknown client version");
                return Err(ProtocolError::UnsupportedVersion(version.to_string()));
            }
            debug!(version, "Accepting unlisted client version");
        }
        Ok(())
    }

    /// Fresh keystream states for both directions.
    pub fn cipher_pair(&self) -> CipherPair {
        CipherPair {
            outbound: CipherState::new(self.generation(), self.seed),
            inbound: CipherState::new(self.generation(), self.seed),
        }
    }
}

fn parse_version(bytes: &[u8]) -> Result<[u8; VERSION_TOKEN_LEN]> {
    let token: [u8; VERSION_TOKEN_LEN] = bytes
        .try_into()
        .map_err(|_| ProtocolError::HandshakeError(ERR_VERSION_TOKEN.to_string()))?;
    if !token.iter().all(|b| b.is_ascii_graphic()) {
        return Err(ProtocolError::HandshakeError(ERR_VERSION_TOKEN.to_string()));
    }
    Ok(token)
}
