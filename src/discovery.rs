// MIT License - Copyright (c) 2026 Peter Wright
// Home-assistant MQTT discovery payloads

use serde_json::{json, Value};
use tracing::warn;

use crate::constants::{DISCOVERY_NODE_ID, DISCOVERY_PREFIX};
use crate::devices::virtual_device::VirtualKind;
use crate::devices::DeviceKind;

/// One discovery config, published without the retain flag.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveryMessage {
    pub topic: String,
    pub payload: Value,
}

fn device_block() -> Value {
    json!({
        "ids": [DISCOVERY_NODE_ID],
        "name": "SDS Wallpad",
        "mf": "Samsung SDS",
        "mdl": "Samsung SDS Wallpad",
        "sw": format!("sds-wallpad {}", env!("CARGO_PKG_VERSION")),
    })
}

/// Wrap an entity config: adds the device block and `uniq_id`, and picks the topic.
fn message(component: &str, mut payload: Value) -> DiscoveryMessage {
    let obj_id = payload["obj_id"].as_str().unwrap_or_default().to_string();
    payload["device"] = device_block();
    payload["uniq_id"] = Value::String(obj_id.clone());
    DiscoveryMessage {
        topic: format!("{DISCOVERY_PREFIX}/{component}/{DISCOVERY_NODE_ID}/{obj_id}/config"),
        payload,
    }
}

/// Configs for a newly seen real device instance.
///
/// Light banks take their size from the high nibble of `id` and number their
/// switches from byte 3 of the last query frame.
pub fn device_configs(
    prefix: &str,
    device: DeviceKind,
    id: u8,
    last_query: &[u8],
    energy_decimals: [u8; 3],
) -> Vec<DiscoveryMessage> {
    match device {
        DeviceKind::Light => {
            let id2 = last_query.get(3).copied().unwrap_or_default() as u16;
            (0..(id >> 4) as u16)
                .map(|bit| {
                    message(
                        "light",
                        json!({
                            "~": format!("{prefix}/light"),
                            "name": format!("Light {}", id2 + bit),
                            "obj_id": format!("{prefix}_light_{}", id2 + bit),
                            "opt": true,
                            "stat_t": format!("~/{id:x}/power{}/state", bit + 1),
                            "cmd_t": format!("~/{}/power/command", id2 + bit),
                        }),
                    )
                })
                .collect()
        }
        DeviceKind::Fan => vec![message(
            "fan",
            json!({
                "~": format!("{prefix}/fan/{id:x}"),
                "name": "Ventilation",
                "obj_id": format!("{prefix}_fan_{id:x}"),
                "opt": true,
                "stat_t": "~/power/state",
                "cmd_t": "~/power/command",
                "pr_mode_stat_t": "~/preset/state",
                "pr_mode_cmd_t": "~/preset/command",
                "pl_on": 5,
                "pl_off": 6,
                "pr_modes": ["low", "medium", "high", "auto"],
                "spd_rng_min": 1,
                "spd_rng_max": 3,
            }),
        )],
        DeviceKind::Thermostat => vec![message(
            "climate",
            json!({
                "~": format!("{prefix}/thermostat/{id:x}"),
                "name": format!("Heating {id:x}"),
                "obj_id": format!("{prefix}_thermostat_{id:x}"),
                "mode_stat_t": "~/power/state",
                "mode_cmd_t": "~/power/command",
                "temp_stat_t": "~/target/state",
                "temp_cmd_t": "~/target/command",
                "curr_temp_t": "~/current/state",
                "modes": ["off", "heat"],
                "min_temp": 10,
                "max_temp": 30,
            }),
        )],
        DeviceKind::Plug => vec![
            message(
                "switch",
                json!({
                    "~": format!("{prefix}/plug/{id:x}/power"),
                    "name": format!("Plug {id:x} power"),
                    "obj_id": format!("{prefix}_plug_{id:x}"),
                    "stat_t": "~/state",
                    "cmd_t": "~/command",
                    "icon": "mdi:power-plug",
                }),
            ),
            message(
                "switch",
                json!({
                    "~": format!("{prefix}/plug/{id:x}/idlecut"),
                    "name": format!("Plug {id:x} standby cutoff"),
                    "obj_id": format!("{prefix}_plug_{id:x}_standby_cutoff"),
                    "stat_t": "~/state",
                    "cmd_t": "~/command",
                    "icon": "mdi:leaf",
                }),
            ),
            message(
                "sensor",
                json!({
                    "~": format!("{prefix}/plug/{id:x}"),
                    "name": format!("Plug {id:x} power usage"),
                    "obj_id": format!("{prefix}_plug_{id:x}_power_usage"),
                    "dev_cla": "power",
                    "stat_t": "~/current/state",
                    "unit_of_meas": "W",
                }),
            ),
        ],
        DeviceKind::Cutoff => vec![message(
            "switch",
            json!({
                "~": format!("{prefix}/cutoff/{id:x}/power"),
                "name": "Light cutoff",
                "obj_id": format!("{prefix}_light_cutoff_{id:x}"),
                "stat_t": "~/state",
                "cmd_t": "~/command",
            }),
        )],
        DeviceKind::GasValve => vec![message(
            "switch",
            json!({
                "~": format!("{prefix}/gas_valve/{id:x}/power"),
                "name": "Gas valve",
                "obj_id": format!("{prefix}_gas_valve_{id:x}"),
                "stat_t": "~/state",
                "cmd_t": "~/command",
                "icon": "mdi:valve",
            }),
        )],
        DeviceKind::Energy => {
            let (eng, name, unit) = match id {
                0 => ("power", "Electricity", "W"),
                1 => ("gas", "Gas", "m³/h"),
                2 => ("water", "Water", "m³/h"),
                other => {
                    warn!("unknown energy meter {other}");
                    return Vec::new();
                }
            };
            let divisor = 10u32.pow(energy_decimals[id as usize].min(9) as u32);
            let mut payload = json!({
                "~": format!("{prefix}/energy/{id:x}"),
                "name": format!("{name} consumption"),
                "obj_id": format!("{prefix}_{eng}_consumption"),
                "stat_t": "~/current/state",
                "unit_of_meas": unit,
                "val_tpl": format!("{{{{ value | float / {divisor} }}}}"),
            });
            if id == 0 {
                payload["dev_cla"] = json!("power");
            }
            vec![message("sensor", payload)]
        }
    }
}

/// Configs for an emulated module's entities.
pub fn virtual_configs(prefix: &str, device: VirtualKind) -> Vec<DiscoveryMessage> {
    let switch = |trigger: &str, name: &str, obj: &str, icon: &str| {
        message(
            "switch",
            json!({
                "~": format!("{prefix}/virtual/{device}/{trigger}"),
                "name": name,
                "obj_id": format!("{prefix}_{obj}"),
                "stat_t": "~/state",
                "cmd_t": "~/command",
                "icon": icon,
            }),
        )
    };

    match device {
        VirtualKind::Entrance => vec![
            switch("ev", "Elevator", "elevator", "mdi:elevator"),
            switch("gas", "Gas cutoff", "gas_cutoff", "mdi:valve"),
        ],
        VirtualKind::Entrance2 => vec![
            switch("ev", "Elevator", "new_elevator", "mdi:elevator"),
            switch("gas", "Gas cutoff", "new_gas_cutoff", "mdi:valve"),
        ],
        VirtualKind::Intercom => {
            let mut public = switch("public", "Shared entrance", "intercom_public", "mdi:door-closed");
            public.payload["avty_t"] = json!("~/available");
            let private = switch("private", "Entrance", "intercom_private", "mdi:door-closed");

            let bell = |entrance: &str, name: &str| {
                message(
                    "binary_sensor",
                    json!({
                        "~": format!("{prefix}/virtual/intercom/{entrance}"),
                        "name": name,
                        "obj_id": format!("{prefix}_intercom_{entrance}_bell"),
                        "dev_cla": "sound",
                        "stat_t": "~/available",
                        "pl_on": "online",
                        "pl_off": "offline",
                    }),
                )
            };
            vec![
                public,
                private,
                bell("public", "Shared entrance doorbell"),
                bell("private", "Entrance doorbell"),
            ]
        }
    }
}
