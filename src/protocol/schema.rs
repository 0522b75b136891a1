//! # Packet Schema
//!
//! Static registry mapping packet identifiers to their field layouts, one
//! table per direction.
//!
//! A [`DispatchTable`] is assembled once with [`DispatchTableBuilder`] and
//! then shared read-only (usually behind an `Arc`) by every connection.
//! Lookups never allocate and never mutate.
//!
//! ## Standard tables
//! [`DispatchTable::standard`] registers the legacy identifiers spoken by the
//! existing client: `PLI` packets flow client to server and `PLO` packets
//! flow server to client. Bodies whose inner structure belongs to game logic
//! (property streams, level data) are exposed as a trailing raw field.

use std::fmt;

use crate::core::field::FieldReader;
use crate::core::packet::{FieldType, FieldValue, Packet};
use crate::error::constants::{ERR_DUPLICATE_PACKET_ID, ERR_RAW_TAIL_POSITION};
use crate::error::{ProtocolError, Result};

/// Direction a packet travels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    ClientToServer,
    ServerToClient,
}

impl Direction {
    /// Direction of the packets flowing the other way.
    pub fn reverse(self) -> Self {
        match self {
            Direction::ClientToServer => Direction::ServerToClient,
            Direction::ServerToClient => Direction::ClientToServer,
        }
    }

    fn index(self) -> usize {
        match self {
            Direction::ClientToServer => 0,
            Direction::ServerToClient => 1,
        }
    }
}

/// Functional area a packet belongs to, used to route it to a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    Session,
    Player,
    Level,
    Npc,
    Combat,
    Items,
    Chat,
    Files,
    Admin,
}

/// A named, typed slot in a packet layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: &'static str,
    pub ty: FieldType,
}

/// Field layout of one packet identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketLayout {
    pub id: u8,
    pub name: &'static str,
    pub capability: Capability,
    pub fields: Vec<FieldSpec>,
}

impl PacketLayout {
    pub fn new(
        id: u8,
        name: &'static str,
        capability: Capability,
        fields: &[(&'static str, FieldType)],
    ) -> Self {
        Self {
            id,
            name,
            capability,
            fields: fields
                .iter()
                .map(|&(name, ty)| FieldSpec { name, ty })
                .collect(),
        }
    }

    /// Decode `body` (the bytes after the id) against this layout.
    ///
    /// Bytes left after the last field are discarded.
    pub fn decode(&self, body: &[u8]) -> Result<Packet> {
        let mut reader = FieldReader::new(body);
        let mut values = Vec::with_capacity(self.fields.len());
        for spec in &self.fields {
            values.push(FieldValue::read_from(&mut reader, spec.ty)?);
        }
        Ok(Packet::new(self.id, values))
    }

    /// Pair each value of `packet` with the name of its slot.
    pub fn named_fields<'p>(&self, packet: &'p Packet) -> Vec<(&'static str, &'p FieldValue)> {
        self.fields
            .iter()
            .zip(packet.fields.iter())
            .map(|(spec, value)| (spec.name, value))
            .collect()
    }

    /// Value of the slot called `name`, if present.
    pub fn field<'p>(&self, packet: &'p Packet, name: &str) -> Option<&'p FieldValue> {
        self.fields
            .iter()
            .position(|spec| spec.name == name)
            .and_then(|index| packet.fields.get(index))
    }

    fn check(&self) -> Result<()> {
        let last = self.fields.len().saturating_sub(1);
        if self
            .fields
            .iter()
            .enumerate()
            .any(|(index, spec)| spec.ty == FieldType::RawTail && index != last)
        {
            return Err(ProtocolError::ConfigError(format!(
                "{ERR_RAW_TAIL_POSITION}: packet {} ({})",
                self.id, self.name
            )));
        }
        Ok(())
    }
}

/// A packet whose id has no registered layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownPacket {
    pub id: u8,
    pub payload: Vec<u8>,
}

/// One decoded inbound packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    Packet(Packet),
    Unknown(UnknownPacket),
}

impl InboundEvent {
    pub fn id(&self) -> u8 {
        match self {
            InboundEvent::Packet(packet) => packet.id,
            InboundEvent::Unknown(unknown) => unknown.id,
        }
    }
}

const TABLE_SIZE: usize = 256;

/// Immutable id → layout mapping for both directions.
#[derive(Clone)]
pub struct DispatchTable {
    tables: [Vec<Option<PacketLayout>>; 2],
}

impl fmt::Debug for DispatchTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchTable")
            .field("client_to_server", &self.len(Direction::ClientToServer))
            .field("server_to_client", &self.len(Direction::ServerToClient))
            .finish()
    }
}

impl DispatchTable {
    pub fn builder() -> DispatchTableBuilder {
        DispatchTableBuilder::new()
    }

    /// Table holding the legacy client and server packet sets.
    pub fn standard() -> Self {
        let mut builder = Self::builder();
        for (direction, layouts) in [
            (Direction::ClientToServer, standard_client_packets()),
            (Direction::ServerToClient, standard_server_packets()),
        ] {
            for layout in layouts {
                // Ids in the standard tables are unique and raw tails are last.
                builder.insert(direction, layout);
            }
        }
        builder.build()
    }

    /// Layout registered for `id`.
    pub fn lookup(&self, direction: Direction, id: u8) -> Option<&PacketLayout> {
        self.tables[direction.index()][id as usize].as_ref()
    }

    /// Number of registered ids in `direction`.
    pub fn len(&self, direction: Direction) -> usize {
        self.tables[direction.index()]
            .iter()
            .filter(|slot| slot.is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len(Direction::ClientToServer) == 0 && self.len(Direction::ServerToClient) == 0
    }

    /// Decode a packet body for a known id.
    ///
    /// # Errors
    /// - `ProtocolError::UnknownPacketId` if nothing is registered for `id`
    /// - `ProtocolError::MalformedField` if the body does not match the layout
    pub fn decode_packet(&self, direction: Direction, id: u8, body: &[u8]) -> Result<Packet> {
        self.lookup(direction, id)
            .ok_or(ProtocolError::UnknownPacketId(id))?
            .decode(body)
    }

    /// Decode packet plaintext (id byte plus body).
    ///
    /// Unregistered ids are returned as [`InboundEvent::Unknown`] carrying
    /// the raw body.
    pub fn decode(&self, direction: Direction, plaintext: &[u8]) -> Result<InboundEvent> {
        let (id, body) = Packet::split_id(plaintext)?;
        match self.lookup(direction, id) {
            Some(layout) => layout.decode(body).map(InboundEvent::Packet),
            None => Ok(InboundEvent::Unknown(UnknownPacket {
                id,
                payload: body.to_vec(),
            })),
        }
    }
}

/// Incremental constructor for [`DispatchTable`].
pub struct DispatchTableBuilder {
    tables: [Vec<Option<PacketLayout>>; 2],
}

impl Default for DispatchTableBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl DispatchTableBuilder {
    pub fn new() -> Self {
        Self {
            tables: [vec![None; TABLE_SIZE], vec![None; TABLE_SIZE]],
        }
    }

    /// Add a layout.
    ///
    /// # Errors
    /// Returns `ProtocolError::ConfigError` if the id is already taken in
    /// `direction` or a raw tail field is not last
    pub fn register(mut self, direction: Direction, layout: PacketLayout) -> Result<Self> {
        layout.check()?;
        let slot = &self.tables[direction.index()][layout.id as usize];
        if let Some(existing) = slot {
            return Err(ProtocolError::ConfigError(format!(
                "{ERR_DUPLICATE_PACKET_ID}: {} already holds {}",
                layout.id, existing.name
            )));
        }
        self.insert(direction, layout);
        Ok(self)
    }

    /// Add the legacy client and server packet sets.
    pub fn with_standard_packets(mut self) -> Result<Self> {
        for layout in standard_client_packets() {
            self = self.register(Direction::ClientToServer, layout)?;
        }
        for layout in standard_server_packets() {
            self = self.register(Direction::ServerToClient, layout)?;
        }
        Ok(self)
    }

    pub fn build(self) -> DispatchTable {
        DispatchTable {
            tables: self.tables,
        }
    }

    fn insert(&mut self, direction: Direction, layout: PacketLayout) {
        let id = layout.id as usize;
        self.tables[direction.index()][id] = Some(layout);
    }
}

/// Legacy client → server identifiers.
pub mod pli {
    pub const LEVELWARP: u8 = 0;
    pub const BOARDMODIFY: u8 = 1;
    pub const PLAYERPROPS: u8 = 2;
    pub const NPCPROPS: u8 = 3;
    pub const BOMBADD: u8 = 4;
    pub const BOMBDEL: u8 = 5;
    pub const TOALL: u8 = 6;
    pub const HORSEADD: u8 = 7;
    pub const HORSEDEL: u8 = 8;
    pub const ARROWADD: u8 = 9;
    pub const FIRESPY: u8 = 10;
    pub const THROWCARRIED: u8 = 11;
    pub const ITEMADD: u8 = 12;
    pub const ITEMDEL: u8 = 13;
    pub const CLAIMPKER: u8 = 14;
    pub const FLAGSET: u8 = 18;
    pub const FLAGDEL: u8 = 19;
    pub const OPENCHEST: u8 = 20;
    pub const NPCDEL: u8 = 22;
    pub const WANTFILE: u8 = 23;
    pub const SHOWIMG: u8 = 24;
    pub const HURTPLAYER: u8 = 26;
    pub const EXPLOSION: u8 = 27;
    pub const PRIVATEMESSAGE: u8 = 28;
    pub const NPCWEAPONDEL: u8 = 29;
    pub const PACKETCOUNT: u8 = 31;
    pub const WEAPONADD: u8 = 33;
    pub const UPDATEFILE: u8 = 34;
    pub const ADJACENTLEVEL: u8 = 35;
    pub const HITOBJECTS: u8 = 36;
    pub const LANGUAGE: u8 = 37;
    pub const TRIGGERACTION: u8 = 38;
    pub const MAPINFO: u8 = 39;
    pub const SHOOT: u8 = 40;
    pub const SERVERWARP: u8 = 41;
    pub const PROCESSLIST: u8 = 44;
}

/// Legacy server → client identifiers.
pub mod plo {
    pub const LEVELBOARD: u8 = 0;
    pub const LEVELLINK: u8 = 1;
    pub const BADDYPROPS: u8 = 2;
    pub const NPCPROPS: u8 = 3;
    pub const LEVELCHEST: u8 = 4;
    pub const LEVELSIGN: u8 = 5;
    pub const LEVELNAME: u8 = 6;
    pub const BOARDMODIFY: u8 = 7;
    pub const OTHERPLPROPS: u8 = 8;
    pub const PLAYERPROPS: u8 = 9;
    pub const ISLEADER: u8 = 10;
    pub const BOMBADD: u8 = 11;
    pub const BOMBDEL: u8 = 12;
    pub const TOALL: u8 = 13;
    pub const PLAYERWARP: u8 = 14;
    pub const WARPFAILED: u8 = 15;
    pub const DISCMESSAGE: u8 = 16;
    pub const HORSEADD: u8 = 17;
    pub const HORSEDEL: u8 = 18;
    pub const ARROWADD: u8 = 19;
    pub const FIRESPY: u8 = 20;
    pub const THROWCARRIED: u8 = 21;
    pub const ITEMADD: u8 = 22;
    pub const ITEMDEL: u8 = 23;
    pub const NPCMOVED: u8 = 24;
    pub const SIGNATURE: u8 = 25;
    pub const FLAGSET: u8 = 28;
    pub const NPCDEL: u8 = 29;
    pub const FLAGDEL: u8 = 31;
    pub const SHOWIMG: u8 = 32;
    pub const NPCWEAPONADD: u8 = 33;
    pub const NPCWEAPONDEL: u8 = 34;
    pub const EXPLOSION: u8 = 36;
    pub const PRIVATEMESSAGE: u8 = 37;
    pub const PUSHAWAY: u8 = 38;
    pub const LEVELMODTIME: u8 = 39;
    pub const HURTPLAYER: u8 = 40;
    pub const STARTMESSAGE: u8 = 41;
    pub const NEWWORLDTIME: u8 = 42;
    pub const HASNPCSERVER: u8 = 44;
    pub const HITOBJECTS: u8 = 46;
    pub const STAFFGUILDS: u8 = 47;
    pub const TRIGGERACTION: u8 = 48;
    pub const PLAYERWARP2: u8 = 49;
    pub const SERVERTEXT: u8 = 82;
    pub const RAWDATA: u8 = 100;
    pub const BOARDPACKET: u8 = 101;
    pub const FILE: u8 = 102;
}

use Capability::*;
use FieldType::{CharString, GChar, GInt3, GInt5, GShort, RawTail};

#[rustfmt::skip]
fn standard_client_packets() -> Vec<PacketLayout> {
    use pli::*;
    vec![
        PacketLayout::new(LEVELWARP, "LEVELWARP", Level, &[("x", GChar), ("y", GChar), ("level", RawTail)]),
        PacketLayout::new(BOARDMODIFY, "BOARDMODIFY", Level, &[("x", GChar), ("y", GChar), ("width", GChar), ("height", GChar), ("tiles", RawTail)]),
        PacketLayout::new(PLAYERPROPS, "PLAYERPROPS", Player, &[("props", RawTail)]),
        PacketLayout::new(NPCPROPS, "NPCPROPS", Npc, &[("npc_id", GInt3), ("props", RawTail)]),
        PacketLayout::new(BOMBADD, "BOMBADD", Combat, &[("x", GChar), ("y", GChar), ("power", GChar), ("time", GChar)]),
        PacketLayout::new(BOMBDEL, "BOMBDEL", Combat, &[("data", RawTail)]),
        PacketLayout::new(TOALL, "TOALL", Chat, &[("message", RawTail)]),
        PacketLayout::new(HORSEADD, "HORSEADD", Level, &[("x", GChar), ("y", GChar), ("dir_bush", GChar), ("image", RawTail)]),
        PacketLayout::new(HORSEDEL, "HORSEDEL", Level, &[("x", GChar), ("y", GChar)]),
        PacketLayout::new(ARROWADD, "ARROWADD", Combat, &[("data", RawTail)]),
        PacketLayout::new(FIRESPY, "FIRESPY", Combat, &[("data", RawTail)]),
        PacketLayout::new(THROWCARRIED, "THROWCARRIED", Combat, &[("data", RawTail)]),
        PacketLayout::new(ITEMADD, "ITEMADD", Items, &[("x", GChar), ("y", GChar), ("item", GChar)]),
        PacketLayout::new(ITEMDEL, "ITEMDEL", Items, &[("x", GChar), ("y", GChar)]),
        PacketLayout::new(CLAIMPKER, "CLAIMPKER", Combat, &[("player_id", GShort)]),
        PacketLayout::new(FLAGSET, "FLAGSET", Player, &[("flag", RawTail)]),
        PacketLayout::new(FLAGDEL, "FLAGDEL", Player, &[("flag", RawTail)]),
        PacketLayout::new(OPENCHEST, "OPENCHEST", Items, &[("x", GChar), ("y", GChar)]),
        PacketLayout::new(NPCDEL, "NPCDEL", Npc, &[("npc_id", GInt3)]),
        PacketLayout::new(WANTFILE, "WANTFILE", Files, &[("file", RawTail)]),
        PacketLayout::new(SHOWIMG, "SHOWIMG", Player, &[("data", RawTail)]),
        PacketLayout::new(HURTPLAYER, "HURTPLAYER", Combat, &[("player_id", GShort), ("dx", GChar), ("dy", GChar), ("power", GChar), ("npc_id", GInt3)]),
        PacketLayout::new(EXPLOSION, "EXPLOSION", Combat, &[("radius", GChar), ("x", GChar), ("y", GChar), ("power", GChar)]),
        PacketLayout::new(PRIVATEMESSAGE, "PRIVATEMESSAGE", Chat, &[("recipients", GShort), ("body", RawTail)]),
        PacketLayout::new(NPCWEAPONDEL, "NPCWEAPONDEL", Items, &[("weapon", RawTail)]),
        PacketLayout::new(PACKETCOUNT, "PACKETCOUNT", Session, &[("count", GShort)]),
        PacketLayout::new(WEAPONADD, "WEAPONADD", Items, &[("data", RawTail)]),
        PacketLayout::new(UPDATEFILE, "UPDATEFILE", Files, &[("mod_time", GInt5), ("file", RawTail)]),
        PacketLayout::new(ADJACENTLEVEL, "ADJACENTLEVEL", Level, &[("mod_time", GInt5), ("level", RawTail)]),
        PacketLayout::new(HITOBJECTS, "HITOBJECTS", Combat, &[("power", GChar), ("x", GChar), ("y", GChar), ("npc_id", GInt3)]),
        PacketLayout::new(LANGUAGE, "LANGUAGE", Session, &[("language", RawTail)]),
        PacketLayout::new(TRIGGERACTION, "TRIGGERACTION", Npc, &[("npc_id", GInt3), ("x", GChar), ("y", GChar), ("action", RawTail)]),
        PacketLayout::new(MAPINFO, "MAPINFO", Level, &[("data", RawTail)]),
        PacketLayout::new(SHOOT, "SHOOT", Combat, &[("data", RawTail)]),
        PacketLayout::new(SERVERWARP, "SERVERWARP", Session, &[("server", RawTail)]),
        PacketLayout::new(PROCESSLIST, "PROCESSLIST", Admin, &[("processes", RawTail)]),
    ]
}

#[rustfmt::skip]
fn standard_server_packets() -> Vec<PacketLayout> {
    use plo::*;
    vec![
        PacketLayout::new(LEVELBOARD, "LEVELBOARD", Level, &[("board", RawTail)]),
        PacketLayout::new(LEVELLINK, "LEVELLINK", Level, &[("link", RawTail)]),
        PacketLayout::new(BADDYPROPS, "BADDYPROPS", Npc, &[("baddy_id", GChar), ("props", RawTail)]),
        PacketLayout::new(NPCPROPS, "NPCPROPS", Npc, &[("npc_id", GInt3), ("props", RawTail)]),
        PacketLayout::new(LEVELCHEST, "LEVELCHEST", Items, &[("opened", GChar), ("x", GChar), ("y", GChar), ("data", RawTail)]),
        PacketLayout::new(LEVELSIGN, "LEVELSIGN", Level, &[("x", GChar), ("y", GChar), ("text", RawTail)]),
        PacketLayout::new(LEVELNAME, "LEVELNAME", Level, &[("level", RawTail)]),
        PacketLayout::new(BOARDMODIFY, "BOARDMODIFY", Level, &[("x", GChar), ("y", GChar), ("width", GChar), ("height", GChar), ("tiles", RawTail)]),
        PacketLayout::new(OTHERPLPROPS, "OTHERPLPROPS", Player, &[("player_id", GShort), ("props", RawTail)]),
        PacketLayout::new(PLAYERPROPS, "PLAYERPROPS", Player, &[("props", RawTail)]),
        PacketLayout::new(ISLEADER, "ISLEADER", Level, &[]),
        PacketLayout::new(BOMBADD, "BOMBADD", Combat, &[("player_id", GShort), ("data", RawTail)]),
        PacketLayout::new(BOMBDEL, "BOMBDEL", Combat, &[("data", RawTail)]),
        PacketLayout::new(TOALL, "TOALL", Chat, &[("player_id", GShort), ("message", CharString)]),
        PacketLayout::new(PLAYERWARP, "PLAYERWARP", Level, &[("x", GChar), ("y", GChar), ("level", RawTail)]),
        PacketLayout::new(WARPFAILED, "WARPFAILED", Level, &[("level", RawTail)]),
        PacketLayout::new(DISCMESSAGE, "DISCMESSAGE", Session, &[("message", RawTail)]),
        PacketLayout::new(HORSEADD, "HORSEADD", Level, &[("x", GChar), ("y", GChar), ("dir_bush", GChar), ("image", RawTail)]),
        PacketLayout::new(HORSEDEL, "HORSEDEL", Level, &[("x", GChar), ("y", GChar)]),
        PacketLayout::new(ARROWADD, "ARROWADD", Combat, &[("player_id", GShort), ("data", RawTail)]),
        PacketLayout::new(FIRESPY, "FIRESPY", Combat, &[("player_id", GShort), ("data", RawTail)]),
        PacketLayout::new(THROWCARRIED, "THROWCARRIED", Combat, &[("player_id", GShort), ("data", RawTail)]),
        PacketLayout::new(ITEMADD, "ITEMADD", Items, &[("x", GChar), ("y", GChar), ("item", GChar)]),
        PacketLayout::new(ITEMDEL, "ITEMDEL", Items, &[("x", GChar), ("y", GChar)]),
        PacketLayout::new(NPCMOVED, "NPCMOVED", Npc, &[("npc_id", GInt3)]),
        PacketLayout::new(SIGNATURE, "SIGNATURE", Session, &[("signature", GChar)]),
        PacketLayout::new(FLAGSET, "FLAGSET", Player, &[("flag", RawTail)]),
        PacketLayout::new(NPCDEL, "NPCDEL", Npc, &[("npc_id", GInt3)]),
        PacketLayout::new(FLAGDEL, "FLAGDEL", Player, &[("flag", RawTail)]),
        PacketLayout::new(SHOWIMG, "SHOWIMG", Player, &[("player_id", GShort), ("data", RawTail)]),
        PacketLayout::new(NPCWEAPONADD, "NPCWEAPONADD", Items, &[("weapon", CharString), ("data", RawTail)]),
        PacketLayout::new(NPCWEAPONDEL, "NPCWEAPONDEL", Items, &[("weapon", RawTail)]),
        PacketLayout::new(EXPLOSION, "EXPLOSION", Combat, &[("player_id", GShort), ("radius", GChar), ("x", GChar), ("y", GChar), ("power", GChar)]),
        PacketLayout::new(PRIVATEMESSAGE, "PRIVATEMESSAGE", Chat, &[("player_id", GShort), ("body", RawTail)]),
        PacketLayout::new(PUSHAWAY, "PUSHAWAY", Combat, &[("data", RawTail)]),
        PacketLayout::new(LEVELMODTIME, "LEVELMODTIME", Level, &[("mod_time", GInt5)]),
        PacketLayout::new(HURTPLAYER, "HURTPLAYER", Combat, &[("player_id", GShort), ("dx", GChar), ("dy", GChar), ("power", GChar), ("npc_id", GInt3)]),
        PacketLayout::new(STARTMESSAGE, "STARTMESSAGE", Session, &[("message", RawTail)]),
        PacketLayout::new(NEWWORLDTIME, "NEWWORLDTIME", Session, &[("time", RawTail)]),
        PacketLayout::new(HASNPCSERVER, "HASNPCSERVER", Session, &[]),
        PacketLayout::new(HITOBJECTS, "HITOBJECTS", Combat, &[("player_id", GShort), ("power", GChar), ("x", GChar), ("y", GChar)]),
        PacketLayout::new(STAFFGUILDS, "STAFFGUILDS", Admin, &[("guilds", RawTail)]),
        PacketLayout::new(TRIGGERACTION, "TRIGGERACTION", Npc, &[("npc_id", GInt3), ("x", GChar), ("y", GChar), ("action", RawTail)]),
        PacketLayout::new(PLAYERWARP2, "PLAYERWARP2", Level, &[("x", GChar), ("y", GChar), ("z", GChar), ("map_x", GChar), ("map_y", GChar), ("map", RawTail)]),
        PacketLayout::new(SERVERTEXT, "SERVERTEXT", Session, &[("text", RawTail)]),
        PacketLayout::new(RAWDATA, "RAWDATA", Files, &[("size", GInt3)]),
        PacketLayout::new(BOARDPACKET, "BOARDPACKET", Level, &[("board", RawTail)]),
        PacketLayout::new(FILE, "FILE", Files, &[("mod_time", GInt5), ("name", CharString), ("data", RawTail)]),
    ]
}
