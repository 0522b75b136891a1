use crate::core::packet::Packet;
use crate::error::constants::{
    ERR_DISPATCHER_READ_LOCK, ERR_DISPATCHER_WRITE_LOCK, ERR_DUPLICATE_HANDLER,
};
use crate::error::{ProtocolError, Result};
use crate::protocol::schema::{
    Capability, Direction, DispatchTable, InboundEvent, PacketLayout, UnknownPacket,
};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::debug;

type HandlerFn = dyn Fn(&Packet, &PacketLayout) -> Result<Vec<Packet>> + Send + Sync + 'static;
type UnknownHandlerFn = dyn Fn(&UnknownPacket) -> Result<Vec<Packet>> + Send + Sync + 'static;

/// Routes decoded packets to handlers by capability.
///
/// Handlers return the packets to send back, possibly none.
pub struct Dispatcher {
    schema: Arc<DispatchTable>,
    direction: Direction,
    handlers: Arc<RwLock<HashMap<Capability, Box<HandlerFn>>>>,
    unknown: Arc<RwLock<Option<Box<UnknownHandlerFn>>>>,
}

impl Dispatcher {
    /// Dispatcher for packets travelling in `direction`.
    pub fn new(schema: Arc<DispatchTable>, direction: Direction) -> Self {
        Self {
            schema,
            direction,
            handlers: Arc::new(RwLock::new(HashMap::new())),
            unknown: Arc::new(RwLock::new(None)),
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Register the handler for every packet of `capability`.
    ///
    /// # Errors
    /// Returns `ProtocolError::ConfigError` if `capability` already has one
    pub fn register<F>(&self, capability: Capability, handler: F) -> Result<()>
    where
        F: Fn(&Packet, &PacketLayout) -> Result<Vec<Packet>> + Send + Sync + 'static,
    {
        let mut handlers = self
            .handlers
            .write()
            .map_err(|_| ProtocolError::Custom(ERR_DISPATCHER_WRITE_LOCK.to_string()))?;

        match handlers.entry(capability) {
            Entry::Occupied(_) => Err(ProtocolError::ConfigError(format!(
                "{ERR_DUPLICATE_HANDLER}: {capability:?}"
            ))),
            Entry::Vacant(slot) => {
                slot.insert(Box::new(handler));
                Ok(())
            }
        }
    }

    /// Handler for packets whose id is not in the schema. At most one.
    pub fn register_unknown<F>(&self, handler: F) -> Result<()>
    where
        F: Fn(&UnknownPacket) -> Result<Vec<Packet>> + Send + Sync + 'static,
    {
        let mut unknown = self
            .unknown
            .write()
            .map_err(|_| ProtocolError::Custom(ERR_DISPATCHER_WRITE_LOCK.to_string()))?;

        if unknown.is_some() {
            return Err(ProtocolError::ConfigError(format!(
                "{ERR_DUPLICATE_HANDLER}: unknown packets"
            )));
        }
        *unknown = Some(Box::new(handler));
        Ok(())
    }

    /// Run the handler for `event` and return its replies.
    ///
    /// A known packet whose capability has no handler is dropped. An unknown
    /// packet without an unknown-packet handler yields
    /// `ProtocolError::UnknownPacketId`.
    pub fn dispatch(&self, event: &InboundEvent) -> Result<Vec<Packet>> {
        match event {
            InboundEvent::Packet(packet) => {
                let layout = self
                    .schema
                    .lookup(self.direction, packet.id)
                    .ok_or(ProtocolError::UnknownPacketId(packet.id))?;

                let handlers = self
                    .handlers
                    .read()
                    .map_err(|_| ProtocolError::Custom(ERR_DISPATCHER_READ_LOCK.to_string()))?;

                match handlers.get(&layout.capability) {
                    Some(handler) => handler(packet, layout),
                    None => {
                        debug!(id = packet.id, name = layout.name, "No handler registered");
                        Ok(Vec::new())
                    }
                }
            }
            InboundEvent::Unknown(unknown) => {
                let handler = self
                    .unknown
                    .read()
                    .map_err(|_| ProtocolError::Custom(ERR_DISPATCHER_READ_LOCK.to_string()))?;

                match handler.as_ref() {
                    Some(handler) => handler(unknown),
                    None => Err(ProtocolError::UnknownPacketId(unknown.id)),
                }
            }
        }
    }
}
