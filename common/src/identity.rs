use crate::config::LoggerConfig;

pub const DEVICE_ID_PREFIX: &str = "esp32-";
pub const UNKNOWN_DEVICE_ID: &str = "esp32-000000";

pub fn derive_device_id(mac: &[u8]) -> String {
    let hex: String = mac.iter().map(|byte| format!("{byte:02X}")).collect();
    derive_device_id_from_hex(&hex)
}

/// `:` and `-` separators are ignored;
/// anything other than exactly 12 hex digits yields [`UNKNOWN_DEVICE_ID`].
pub fn derive_device_id_from_hex(text: &str) -> String {
    let hex: String = text
        .trim()
        .chars()
        .filter(|c| *c != ':' && *c != '-')
        .collect();

    if hex.len() != 12 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return UNKNOWN_DEVICE_ID.to_string();
    }

    format!("{DEVICE_ID_PREFIX}{}", hex[6..].to_ascii_uppercase())
}

pub fn parse_mac(text: &str) -> Option<[u8; 6]> {
    let hex: String = text
        .trim()
        .chars()
        .filter(|c| *c != ':' && *c != '-')
        .collect();
    if hex.len() != 12 || !hex.is_ascii() {
        return None;
    }

    let mut mac = [0_u8; 6];
    for (index, byte) in mac.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&hex[index * 2..index * 2 + 2], 16).ok()?;
    }
    Some(mac)
}

pub fn enforce_device_id(config: &mut LoggerConfig, mac: &[u8]) -> bool {
    let derived = derive_device_id(mac);
    if config.device_id == derived {
        return false;
    }
    config.device_id = derived;
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn is_well_formed(id: &str) -> bool {
        id.strip_prefix(DEVICE_ID_PREFIX).is_some_and(|suffix| {
            suffix.len() == 6
                && suffix
                    .chars()
                    .all(|c| c.is_ascii_digit() || ('A'..='F').contains(&c))
        })
    }

    #[test]
    fn uses_last_three_bytes() {
        let mac = [0x24, 0x6f, 0x28, 0xab, 0xcd, 0x0e];
        assert_eq!(derive_device_id(&mac), "esp32-ABCD0E");
        assert_eq!(derive_device_id(&mac), derive_device_id(&mac));
    }

    #[test]
    fn always_matches_expected_shape() {
        for seed in 0..=255_u8 {
            let mac = [seed, seed ^ 0x5a, 0x10, seed.wrapping_mul(7), 0xff - seed, seed];
            assert!(is_well_formed(&derive_device_id(&mac)));
        }
        assert!(is_well_formed(&derive_device_id(&[1, 2, 3])));
    }

    #[test]
    fn bad_addresses_give_sentinel() {
        assert_eq!(derive_device_id(&[]), UNKNOWN_DEVICE_ID);
        assert_eq!(derive_device_id(&[0; 8]), UNKNOWN_DEVICE_ID);
        assert_eq!(derive_device_id_from_hex("24:6F:28:AB:CD"), UNKNOWN_DEVICE_ID);
        assert_eq!(derive_device_id_from_hex("24:6F:28:AB:CD:ZZ"), UNKNOWN_DEVICE_ID);
        assert_eq!(derive_device_id_from_hex("24-6f-28-ab-cd-ef"), "esp32-ABCDEF");
    }

    #[test]
    fn parses_mac_text() {
        assert_eq!(
            parse_mac("24:6F:28:AB:CD:EF"),
            Some([0x24, 0x6f, 0x28, 0xab, 0xcd, 0xef])
        );
        assert_eq!(parse_mac("nope"), None);
    }

    #[test]
    fn enforce_is_stable_after_first_change() {
        let mac = [0x24, 0x6f, 0x28, 0x01, 0x02, 0x03];
        let mut config = LoggerConfig {
            device_id: "hand-edited".to_string(),
            ..LoggerConfig::default()
        };

        assert!(enforce_device_id(&mut config, &mac));
        assert_eq!(config.device_id, "esp32-010203");
        assert!(!enforce_device_id(&mut config, &mac));
    }
}
