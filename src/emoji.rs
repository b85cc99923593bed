//! Platform sticker ids used for voting and admin controls.
//!
//! These ids come from the chat platform's emoji table and are part of the
//! external contract; they must not be renamed or renumbered. CONFIRM shares
//! an id with YAY and DENY with NAY, so reactions are disambiguated by which
//! message they land on, never by id alone.

/// Option letters A through G on the main message.
pub const OPTION_A: u32 = 127822;
pub const OPTION_B: u32 = 9973;
pub const OPTION_C: u32 = 128663;
pub const OPTION_D: u32 = 128054;
pub const OPTION_E: u32 = 127859;
pub const OPTION_F: u32 = 128293;
pub const OPTION_G: u32 = 128123;

/// Admin controls on the main message.
pub const CONFIRM: u32 = 127881;
pub const DENY: u32 = 128560;
pub const RETRACT: u32 = 10060;

/// Votes on a custom input candidate.
pub const YAY: u32 = 127881;
pub const NAY: u32 = 128560;
pub const CANCEL: u32 = 10060;

/// Busy-channel indicator on a pending proposal.
pub const COFFEE: u32 = 9749;

/// Option letters in ballot order with their emoji ids.
pub const OPTIONS: [(char, u32); 7] = [
    ('A', OPTION_A),
    ('B', OPTION_B),
    ('C', OPTION_C),
    ('D', OPTION_D),
    ('E', OPTION_E),
    ('F', OPTION_F),
    ('G', OPTION_G),
];

/// The full reaction set attached to a freshly published main message.
pub const MAIN_MESSAGE_REACTIONS: [u32; 10] = [
    OPTION_A, OPTION_B, OPTION_C, OPTION_D, OPTION_E, OPTION_F, OPTION_G, CONFIRM, DENY, RETRACT,
];

/// Reactions pre-attached to a newly submitted custom input.
pub const CUSTOM_INPUT_REACTIONS: [u32; 3] = [YAY, NAY, CANCEL];

/// Map an option emoji id back to its letter.
pub fn option_letter(emoji_id: u32) -> Option<char> {
    OPTIONS
        .iter()
        .find(|(_, id)| *id == emoji_id)
        .map(|(letter, _)| *letter)
}

/// Map an option letter to its emoji id.
pub fn option_emoji(letter: char) -> Option<u32> {
    OPTIONS
        .iter()
        .find(|(l, _)| *l == letter)
        .map(|(_, id)| *id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn letters_round_trip_through_emoji_ids() {
        for (letter, id) in OPTIONS {
            assert_eq!(option_emoji(letter), Some(id));
            assert_eq!(option_letter(id), Some(letter));
        }
        assert_eq!(option_letter(CONFIRM), None);
    }

    #[test]
    fn admin_ids_collide_with_custom_input_votes() {
        // The disambiguation-by-message rule depends on these staying equal.
        assert_eq!(CONFIRM, YAY);
        assert_eq!(DENY, NAY);
        assert_eq!(RETRACT, CANCEL);
    }
}
