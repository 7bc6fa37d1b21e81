// MIT License - Copyright (c) 2026 Peter Wright
// Classification of inbound automation-layer messages

use crate::constants::DISCOVERY_PREFIX;
use crate::devices::virtual_device::VirtualKind;
use crate::devices::DeviceKind;
use crate::error::{Result, WallpadError};
use crate::protocol::seal;

/// A request handed from the messaging side to the bus engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusCommand {
    /// Sealed command frame for a real device.
    Device { device: DeviceKind, packet: Vec<u8> },
    /// Trigger payload for a virtual device.
    Virtual {
        device: VirtualKind,
        trigger: String,
        payload: String,
    },
    /// Raw frame from the debug topic, checksum already recomputed.
    InjectRaw(Vec<u8>),
    /// The automation layer restarted: run discovery again.
    Rediscover,
}

/// Map a state-like payload to the byte the wallpad expects.
///
/// Anything that is not a known word is read as a number and truncated.
pub fn payload_value(payload: &str) -> Result<u8> {
    let value = match payload {
        "ON" | "heat" | "high" => 1,
        "OFF" | "off" => 0,
        "medium" => 2,
        "low" => 3,
        "auto" => 4,
        other => {
            let number: f64 = other.trim().parse().map_err(|_| WallpadError::InvalidPayload {
                payload: other.to_string(),
            })?;
            if !(0.0..256.0).contains(&number) {
                return Err(WallpadError::InvalidPayload {
                    payload: other.to_string(),
                });
            }
            number as u8
        }
    };
    Ok(value)
}

/// Decode a hex string such as `"ac7a31010"` into bytes.
fn parse_hex(s: &str) -> Option<Vec<u8>> {
    let s: String = s.chars().filter(|c| !c.is_whitespace()).collect();
    if s.is_empty() || s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(s.get(i..i + 2)?, 16).ok())
        .collect()
}

/// Classify an inbound `(topic, payload)`.
///
/// Returns `Ok(None)` for messages that need no action (e.g. the automation
/// layer going offline).
pub fn parse_inbound(prefix: &str, topic: &str, payload: &str) -> Result<Option<BusCommand>> {
    let invalid = || WallpadError::InvalidTopic {
        topic: topic.to_string(),
    };
    let parts: Vec<&str> = topic.split('/').collect();

    if parts.len() == 2 && parts[0] == DISCOVERY_PREFIX && parts[1] == "status" {
        return Ok((payload == "online").then_some(BusCommand::Rediscover));
    }
    if parts.first() != Some(&prefix) || parts.len() < 2 {
        return Err(invalid());
    }

    match parts[1] {
        "virtual" => {
            let [_, _, device, trigger, "command"] = parts[..] else {
                return Err(invalid());
            };
            let device = VirtualKind::from_name(device).ok_or_else(|| {
                WallpadError::UnknownDevice {
                    device: device.to_string(),
                }
            })?;
            Ok(Some(BusCommand::Virtual {
                device,
                trigger: trigger.to_string(),
                payload: payload.to_string(),
            }))
        }
        "debug" => {
            let [_, _, "packet", "send"] = parts[..] else {
                return Err(invalid());
            };
            let mut packet = parse_hex(payload)
                .filter(|p| p.len() >= 3)
                .ok_or_else(|| WallpadError::InvalidPayload {
                    payload: payload.to_string(),
                })?;
            seal(&mut packet);
            Ok(Some(BusCommand::InjectRaw(packet)))
        }
        _ => {
            let [_, device, id, attribute, "command"] = parts[..] else {
                return Err(invalid());
            };
            let kind = DeviceKind::from_name(device).ok_or_else(|| WallpadError::UnknownDevice {
                device: device.to_string(),
            })?;
            let spec = kind
                .schema()
                .command(attribute)
                .ok_or_else(|| WallpadError::UnknownCommand {
                    device: device.to_string(),
                    command: attribute.to_string(),
                })?;
            if payload.is_empty() {
                return Err(WallpadError::EmptyPayload {
                    topic: topic.to_string(),
                });
            }
            if kind == DeviceKind::GasValve && payload == "ON" {
                return Err(WallpadError::Disallowed {
                    reason: "gas valves cannot be opened remotely".to_string(),
                });
            }
            let id: u8 = id.parse().map_err(|_| invalid())?;
            let value = if spec.takes_value() {
                payload_value(payload)?
            } else {
                0
            };
            Ok(Some(BusCommand::Device {
                device: kind,
                packet: spec.build(id, value),
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::verify_checksum;

    fn parse(topic: &str, payload: &str) -> Result<Option<BusCommand>> {
        parse_inbound("sds", topic, payload)
    }

    #[test]
    fn test_payload_mapping() {
        assert_eq!(payload_value("ON").unwrap(), 1);
        assert_eq!(payload_value("off").unwrap(), 0);
        assert_eq!(payload_value("low").unwrap(), 3);
        assert_eq!(payload_value("auto").unwrap(), 4);
        assert_eq!(payload_value("23.5").unwrap(), 23);
        assert!(payload_value("warm").is_err());
        assert!(payload_value("300").is_err());
    }

    #[test]
    fn test_device_command() {
        let cmd = parse("sds/thermostat/2/target/command", "24").unwrap();
        let Some(BusCommand::Device { device, packet }) = cmd else {
            panic!("expected device command");
        };
        assert_eq!(device, DeviceKind::Thermostat);
        assert_eq!(&packet[..4], &[0xAE, 0x7F, 0x02, 24]);
        assert!(verify_checksum(&packet));
    }

    #[test]
    fn test_fan_preset() {
        let Some(BusCommand::Device { packet, .. }) =
            parse("sds/fan/1/preset/command", "medium").unwrap()
        else {
            panic!("expected device command");
        };
        assert_eq!(&packet[..3], &[0xC2, 0x4F, 0x02]);
    }

    #[test]
    fn test_gas_valve_rules() {
        assert!(matches!(
            parse("sds/gas_valve/1/power/command", "ON"),
            Err(WallpadError::Disallowed { .. })
        ));
        let Some(BusCommand::Device { packet, .. }) =
            parse("sds/gas_valve/1/power/command", "OFF").unwrap()
        else {
            panic!("expected device command");
        };
        assert_eq!(packet, vec![0xAB, 0x78, 0x00, 0x53]);
    }

    #[test]
    fn test_malformed_commands() {
        assert!(matches!(
            parse("sds/doorbell/1/power/command", "ON"),
            Err(WallpadError::UnknownDevice { .. })
        ));
        assert!(matches!(
            parse("sds/light/1/brightness/command", "ON"),
            Err(WallpadError::UnknownCommand { .. })
        ));
        assert!(matches!(
            parse("sds/light/1/power/command", ""),
            Err(WallpadError::EmptyPayload { .. })
        ));
        assert!(matches!(
            parse("sds/light/1/power", "ON"),
            Err(WallpadError::InvalidTopic { .. })
        ));
        assert!(matches!(
            parse("other/light/1/power/command", "ON"),
            Err(WallpadError::InvalidTopic { .. })
        ));
        assert!(matches!(
            parse("sds/energy/1/current/command", "1"),
            Err(WallpadError::UnknownCommand { .. })
        ));
    }

    #[test]
    fn test_virtual_command() {
        assert_eq!(
            parse("sds/virtual/intercom/public/command", "ON").unwrap(),
            Some(BusCommand::Virtual {
                device: VirtualKind::Intercom,
                trigger: "public".to_string(),
                payload: "ON".to_string(),
            })
        );
        assert!(matches!(
            parse("sds/virtual/intercom/public", "ON"),
            Err(WallpadError::InvalidTopic { .. })
        ));
        assert!(matches!(
            parse("sds/virtual/garage/open/command", "ON"),
            Err(WallpadError::UnknownDevice { .. })
        ));
    }

    #[test]
    fn test_debug_inject_recomputes_checksum() {
        let Some(BusCommand::InjectRaw(packet)) =
            parse("sds/debug/packet/send", "ac7a310100").unwrap()
        else {
            panic!("expected raw packet");
        };
        assert_eq!(packet, vec![0xAC, 0x7A, 0x31, 0x01, 0x66]);
        assert!(parse("sds/debug/packet/send", "zz").is_err());
    }

    #[test]
    fn test_automation_layer_restart() {
        assert_eq!(
            parse("homeassistant/status", "online").unwrap(),
            Some(BusCommand::Rediscover)
        );
        assert_eq!(parse("homeassistant/status", "offline").unwrap(), None);
    }
}
