
use rand::{thread_rng, Rng};

const RUNES_HEX: &[u8] = b"0123456789abcdef";

const LEN_UFRAG: usize = 8;
const LEN_PWD: usize = 24;

fn generate_hex_string(n: usize) -> String {
    let mut rng = thread_rng();

    (0..n)
        .map(|_| {
            let idx = rng.gen_range(0..RUNES_HEX.len());
            RUNES_HEX[idx] as char
        })
        .collect()
}

/// Generates an ICE user fragment (8 hex chars).
pub fn generate_ufrag() -> String {
    generate_hex_string(LEN_UFRAG)
}

/// Generates an ICE password (24 hex chars).
pub fn generate_pwd() -> String {
    generate_hex_string(LEN_PWD)
}

/// Generates the 64-bit number used to resolve role conflicts.
pub fn generate_tie_breaker() -> u64 {
    thread_rng().gen()
}

/// Generates a foundation for a candidate learned on the fly: a random
/// 64-bit hex string, re-drawn while `taken` reports a collision.
pub fn generate_arbitrary_foundation(taken: impl Fn(&str) -> bool) -> String {
    let mut rng = thread_rng();
    loop {
        let foundation = format!("{:x}", rng.gen::<u64>());
        if !taken(&foundation) {
            return foundation;
        }
    }
}
