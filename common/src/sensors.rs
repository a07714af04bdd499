use std::fmt;

use log::warn;

use crate::config::{LoggerConfig, MAX_SENSORS};

/// Temperature reported by the bus driver for a probe that did not answer.
pub const DISCONNECTED_C: f32 = -127.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RomCode(pub [u8; 8]);

impl fmt::Display for RomCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02X}")?;
        }
        Ok(())
    }
}

pub trait SensorBus {
    fn device_count(&mut self) -> usize;

    fn address(&mut self, index: usize) -> Option<RomCode>;

    fn set_resolution(&mut self, bits: u8);

    fn request_conversion(&mut self);

    fn read_celsius(&mut self, address: &RomCode) -> f32;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SensorSlot {
    pub index: usize,
    pub address: Option<RomCode>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SensorReading {
    pub index: usize,
    pub address: Option<RomCode>,
    pub temp_c: Option<f32>,
}

impl SensorReading {
    pub fn is_valid(&self) -> bool {
        self.address.is_some() && self.temp_c.is_some()
    }
}

pub fn enumerate<B: SensorBus>(bus: &mut B) -> Vec<SensorSlot> {
    let count = bus.device_count().min(MAX_SENSORS);
    (0..count)
        .map(|index| SensorSlot {
            index,
            address: bus.address(index),
        })
        .collect()
}

pub fn logical_id(index: usize) -> String {
    format!("S{}", index + 1)
}

pub fn room_name(index: usize, config: &LoggerConfig) -> String {
    config
        .rooms
        .get(index)
        .map(|room| room.trim())
        .filter(|room| !room.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| logical_id(index))
}

pub fn is_plausible_celsius(temp_c: f32) -> bool {
    temp_c.is_finite() && temp_c != DISCONNECTED_C
}

pub fn conversion_time_ms(bits: u8) -> u64 {
    match bits {
        0..=9 => 94,
        10 => 188,
        11 => 375,
        _ => 750,
    }
}

pub fn newly_attached<T: PartialEq + Clone>(known: &[T], found: &[T]) -> Vec<T> {
    found
        .iter()
        .filter(|device| !known.contains(device))
        .cloned()
        .collect()
}

pub fn read_all<B: SensorBus>(bus: &mut B) -> Vec<SensorReading> {
    let slots = enumerate(bus);
    if slots.is_empty() {
        return Vec::new();
    }

    bus.request_conversion();
    slots
        .into_iter()
        .map(|slot| {
            let temp_c = slot.address.as_ref().and_then(|address| {
                let temp_c = bus.read_celsius(address);
                if is_plausible_celsius(temp_c) {
                    Some(temp_c)
                } else {
                    warn!("{} ({address}) reported disconnected", logical_id(slot.index));
                    None
                }
            });
            SensorReading {
                index: slot.index,
                address: slot.address,
                temp_c,
            }
        })
        .collect()
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    #[derive(Debug, Default)]
    pub struct ScriptedBus {
        pub probes: Vec<Option<(RomCode, f32)>>,
        pub conversions: usize,
        pub resolution: Option<u8>,
    }

    impl ScriptedBus {
        pub fn with_temps(temps: &[Option<f32>]) -> Self {
            let probes = temps
                .iter()
                .enumerate()
                .map(|(i, temp)| temp.map(|t| (RomCode([0x28, 0, 0, 0, 0, 0, 0, i as u8]), t)))
                .collect();
            Self {
                probes,
                ..Self::default()
            }
        }
    }

    impl SensorBus for ScriptedBus {
        fn device_count(&mut self) -> usize {
            self.probes.len()
        }

        fn address(&mut self, index: usize) -> Option<RomCode> {
            self.probes.get(index).copied().flatten().map(|(rom, _)| rom)
        }

        fn set_resolution(&mut self, bits: u8) {
            self.resolution = Some(bits);
        }

        fn request_conversion(&mut self) {
            self.conversions += 1;
        }

        fn read_celsius(&mut self, address: &RomCode) -> f32 {
            self.probes
                .iter()
                .flatten()
                .find(|(rom, _)| rom == address)
                .map(|(_, temp)| *temp)
                .unwrap_or(DISCONNECTED_C)
        }
    }
}
