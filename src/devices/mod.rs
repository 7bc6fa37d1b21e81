// MIT License - Copyright (c) 2026 Peter Wright
// Device schema tables

pub mod field;
pub mod virtual_device;

use std::collections::HashMap;
use std::fmt;

use crate::protocol::{seal, Header};

pub use field::{decode, FieldDescriptor, FieldValue, Pattern};

/// Real device classes found on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DeviceKind {
    /// Light switch banks
    Light,
    /// Ventilation (heat recovery) unit
    Fan,
    /// Per-room heating
    Thermostat,
    /// Standby-power cutoff plugs with power metering
    Plug,
    /// Whole-house light cutoff (belongs to the entrance switch)
    Cutoff,
    /// Kitchen gas valve
    GasValve,
    /// Real-time meters: 0 electricity, 1 gas, 2 water
    Energy,
}

impl DeviceKind {
    pub const ALL: [DeviceKind; 7] = [
        DeviceKind::Light,
        DeviceKind::Fan,
        DeviceKind::Thermostat,
        DeviceKind::Plug,
        DeviceKind::Cutoff,
        DeviceKind::GasValve,
        DeviceKind::Energy,
    ];

    /// Topic segment.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Light => "light",
            Self::Fan => "fan",
            Self::Thermostat => "thermostat",
            Self::Plug => "plug",
            Self::Cutoff => "cutoff",
            Self::GasValve => "gas_valve",
            Self::Energy => "energy",
        }
    }

    pub fn from_name(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.name() == s)
    }

    pub fn schema(&self) -> &'static DeviceSchema {
        match self {
            Self::Light => &SCHEMAS[0],
            Self::Fan => &SCHEMAS[1],
            Self::Thermostat => &SCHEMAS[2],
            Self::Plug => &SCHEMAS[3],
            Self::Cutoff => &SCHEMAS[4],
            Self::GasValve => &SCHEMAS[5],
            Self::Energy => &SCHEMAS[6],
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Header and length of a query frame.
#[derive(Debug)]
pub struct FrameSpec {
    pub header: Header,
    pub length: usize,
    pub id: Option<usize>,
}

/// Header, length and field layout of a state frame.
#[derive(Debug)]
pub struct StateSpec {
    pub header: Header,
    pub length: usize,
    pub id: Option<usize>,
    pub fields: &'static [FieldDescriptor],
}

impl StateSpec {
    /// Instance id of a state frame; devices without an id byte are instance 1.
    pub fn instance_id(&self, frame: &[u8]) -> u8 {
        self.id.and_then(|i| frame.get(i).copied()).unwrap_or(1)
    }
}

/// Template of a command frame.
#[derive(Debug)]
pub struct CommandSpec {
    pub attribute: &'static str,
    pub header: Header,
    pub length: usize,
    /// Position of the instance id byte
    pub id: Option<usize>,
    /// Position of the value byte
    pub pos: Option<usize>,
}

impl CommandSpec {
    /// Build a sealed command frame.
    pub fn build(&self, id: u8, value: u8) -> Vec<u8> {
        let mut frame = vec![0u8; self.length];
        frame[0] = self.header.h0;
        frame[1] = self.header.h1;
        if let Some(pos) = self.pos {
            frame[pos] = value;
        }
        if let Some(i) = self.id {
            frame[i] = id;
        }
        seal(&mut frame);
        frame
    }

    /// Whether the command carries a value byte.
    pub fn takes_value(&self) -> bool {
        self.pos.is_some()
    }
}

/// Static description of one device class.
#[derive(Debug)]
pub struct DeviceSchema {
    pub kind: DeviceKind,
    pub query: FrameSpec,
    pub state: StateSpec,
    pub commands: &'static [CommandSpec],
}

impl DeviceSchema {
    pub fn command(&self, attribute: &str) -> Option<&'static CommandSpec> {
        self.commands.iter().find(|c| c.attribute == attribute)
    }
}

const fn query(header: u16, length: usize, id: Option<usize>) -> FrameSpec {
    FrameSpec {
        header: Header::from_u16(header),
        length,
        id,
    }
}

const fn state(
    header: u16,
    length: usize,
    id: Option<usize>,
    fields: &'static [FieldDescriptor],
) -> StateSpec {
    StateSpec {
        header: Header::from_u16(header),
        length,
        id,
        fields,
    }
}

const fn command(
    attribute: &'static str,
    header: u16,
    length: usize,
    id: Option<usize>,
    pos: Option<usize>,
) -> CommandSpec {
    CommandSpec {
        attribute,
        header: Header::from_u16(header),
        length,
        id,
        pos,
    }
}

const LIGHT_FIELDS: &[FieldDescriptor] = &[FieldDescriptor::new("power", 3, Pattern::Bitmap)];
const LIGHT_COMMANDS: &[CommandSpec] = &[command("power", 0xAC7A, 5, Some(2), Some(3))];

const FAN_FIELDS: &[FieldDescriptor] = &[
    FieldDescriptor::new("power", 4, Pattern::FanToggle),
    FieldDescriptor::new("preset", 2, Pattern::FanSpeed),
];
const FAN_COMMANDS: &[CommandSpec] = &[
    command("power", 0xC24F, 6, None, Some(2)),
    command("preset", 0xC24F, 6, None, Some(2)),
];

const THERMOSTAT_FIELDS: &[FieldDescriptor] = &[
    FieldDescriptor::new("power", 3, Pattern::HeatToggle),
    FieldDescriptor::new("target", 4, Pattern::Value),
    FieldDescriptor::new("current", 5, Pattern::Value),
];
const THERMOSTAT_COMMANDS: &[CommandSpec] = &[
    command("power", 0xAE7D, 8, Some(2), Some(3)),
    command("target", 0xAE7F, 8, Some(2), Some(3)),
];

const PLUG_FIELDS: &[FieldDescriptor] = &[
    FieldDescriptor::new("power", 3, Pattern::Toggle),
    FieldDescriptor::new("idlecut", 3, Pattern::Toggle2),
    FieldDescriptor::new("current", 5, Pattern::TwoByte),
];
const PLUG_COMMANDS: &[CommandSpec] = &[
    command("power", 0xC66E, 10, Some(2), Some(3)),
    command("idlecut", 0xC64B, 10, Some(2), Some(3)),
];

// 1: normal, 0: all lights cut
const CUTOFF_FIELDS: &[FieldDescriptor] = &[FieldDescriptor::new("power", 2, Pattern::Toggle)];
const CUTOFF_COMMANDS: &[CommandSpec] = &[command("power", 0xAD53, 4, None, Some(2))];

// 0: open, 1: closed
const GAS_VALVE_FIELDS: &[FieldDescriptor] = &[FieldDescriptor::new("power", 6, Pattern::Invert)];
// Closing only.
const GAS_VALVE_COMMANDS: &[CommandSpec] = &[command("power", 0xAB78, 4, None, None)];

const ENERGY_FIELDS: &[FieldDescriptor] =
    &[FieldDescriptor::new("current", 3, Pattern::SixDecimal)];

static SCHEMAS: [DeviceSchema; 7] = [
    DeviceSchema {
        kind: DeviceKind::Light,
        query: query(0xAC79, 5, Some(2)),
        state: state(0xB079, 5, Some(2), LIGHT_FIELDS),
        commands: LIGHT_COMMANDS,
    },
    DeviceSchema {
        kind: DeviceKind::Fan,
        query: query(0xC24E, 6, None),
        state: state(0xB04E, 6, None, FAN_FIELDS),
        commands: FAN_COMMANDS,
    },
    DeviceSchema {
        kind: DeviceKind::Thermostat,
        query: query(0xAE7C, 8, Some(2)),
        state: state(0xB07C, 8, Some(2), THERMOSTAT_FIELDS),
        commands: THERMOSTAT_COMMANDS,
    },
    DeviceSchema {
        kind: DeviceKind::Plug,
        query: query(0xC64A, 10, Some(2)),
        state: state(0xB04A, 10, Some(2), PLUG_FIELDS),
        commands: PLUG_COMMANDS,
    },
    DeviceSchema {
        kind: DeviceKind::Cutoff,
        query: query(0xAD52, 4, None),
        state: state(0xB052, 4, None, CUTOFF_FIELDS),
        commands: CUTOFF_COMMANDS,
    },
    DeviceSchema {
        kind: DeviceKind::GasValve,
        query: query(0xAB41, 4, None),
        // 0xB041 is the shared ack, so the valve state is read from the
        // wallpad's extended query instead.
        state: state(0xAB41, 8, None, GAS_VALVE_FIELDS),
        commands: GAS_VALVE_COMMANDS,
    },
    DeviceSchema {
        kind: DeviceKind::Energy,
        query: query(0xAA6F, 4, Some(2)),
        state: state(0xB06F, 7, Some(2), ENERGY_FIELDS),
        commands: &[],
    },
];

/// The device classes enabled for this installation, indexed by header.
#[derive(Debug)]
pub struct SchemaTable {
    devices: Vec<&'static DeviceSchema>,
    by_state: HashMap<Header, &'static DeviceSchema>,
    by_query: HashMap<Header, &'static DeviceSchema>,
}

impl SchemaTable {
    pub fn new(kinds: impl IntoIterator<Item = DeviceKind>) -> Self {
        let devices: Vec<&'static DeviceSchema> =
            kinds.into_iter().map(|k| k.schema()).collect();
        let by_state = devices.iter().map(|s| (s.state.header, *s)).collect();
        let by_query = devices.iter().map(|s| (s.query.header, *s)).collect();
        Self {
            devices,
            by_state,
            by_query,
        }
    }

    /// Schema whose state frame starts with `header`.
    pub fn by_state_header(&self, header: Header) -> Option<&'static DeviceSchema> {
        self.by_state.get(&header).copied()
    }

    /// Schema whose query frame starts with `header`.
    pub fn by_query_header(&self, header: Header) -> Option<&'static DeviceSchema> {
        self.by_query.get(&header).copied()
    }

    pub fn get(&self, kind: DeviceKind) -> Option<&'static DeviceSchema> {
        self.devices.iter().find(|s| s.kind == kind).copied()
    }

    pub fn devices(&self) -> impl Iterator<Item = DeviceKind> + '_ {
        self.devices.iter().map(|s| s.kind)
    }
}

/// What the engine remembers about one instance id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LastSeen {
    /// Announced to discovery; no state published yet.
    Registered,
    /// Raw state frame last decoded.
    Frame(Vec<u8>),
}

/// Per-instance frame cache and last-published values.
///
/// Cleared on every discovery restart, never persisted.
#[derive(Debug, Default)]
pub struct InstanceCache {
    last: HashMap<(DeviceKind, u8), LastSeen>,
    published: HashMap<String, String>,
}

impl InstanceCache {
    pub fn last(&self, kind: DeviceKind, id: u8) -> Option<&LastSeen> {
        self.last.get(&(kind, id))
    }

    pub fn set_last(&mut self, kind: DeviceKind, id: u8, seen: LastSeen) {
        self.last.insert((kind, id), seen);
    }

    /// Record `value` for `topic`; returns `false` when it is unchanged.
    pub fn update_published(&mut self, topic: &str, value: &str) -> bool {
        if self.published.get(topic).is_some_and(|v| v == value) {
            return false;
        }
        self.published.insert(topic.to_string(), value.to_string());
        true
    }

    pub fn clear(&mut self) {
        self.last.clear();
        self.published.clear();
    }
}
