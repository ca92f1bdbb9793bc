//! Small helpers shared by the document and the mesh layers.

use std::time::{SystemTime, UNIX_EPOCH};

/// Marker palette for agents on the map.
pub const AGENT_COLORS: [&str; 10] = [
    "#FF6B6B", "#4ECDC4", "#45B7D1", "#FFA07A", "#98D8C8",
    "#F7DC6F", "#BB8FCE", "#85C1E2", "#F8B739", "#52B788",
];

/// Maximum length of user-authored text, in characters.
pub const MAX_INPUT_CHARS: usize = 500;

/// Milliseconds since the Unix epoch. Clocks set before 1970 read as zero.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Pick a palette colour from an id. Same id, same colour (FNV-1a).
pub fn pick_color(id: &str) -> &'static str {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in id.bytes() {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    AGENT_COLORS[(hash % AGENT_COLORS.len() as u64) as usize]
}

/// Room ids accepted by clients: 3-50 characters of `[A-Za-z0-9_-]`.
pub fn is_valid_room_id(room_id: &str) -> bool {
    (3..=50).contains(&room_id.len())
        && room_id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

/// Trim and cap user input at [`MAX_INPUT_CHARS`] characters.
pub fn sanitize_input(input: &str) -> String {
    input.trim().chars().take(MAX_INPUT_CHARS).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_room_id_validation() {
        assert!(is_valid_room_id("team-alpha_01"));
        assert!(is_valid_room_id("abc"));
        assert!(!is_valid_room_id("ab"));
        assert!(!is_valid_room_id(&"a".repeat(51)));
        assert!(!is_valid_room_id("room with spaces"));
        assert!(!is_valid_room_id("room/1"));
    }

    #[test]
    fn test_sanitize_input() {
        assert_eq!(sanitize_input("  hello  "), "hello");
        assert_eq!(sanitize_input(&"é".repeat(501)).chars().count(), 500);
        assert_eq!(sanitize_input(""), "");
    }

    #[test]
    fn test_pick_color_in_palette() {
        for id in ["a", "b", "agent-42", ""] {
            assert!(AGENT_COLORS.contains(&pick_color(id)));
        }
        assert_eq!(pick_color("agent-42"), pick_color("agent-42"));
    }

    #[test]
    fn test_now_millis_advances() {
        let a = now_millis();
        assert!(a > 1_600_000_000_000);
        assert!(now_millis() >= a);
    }
}
