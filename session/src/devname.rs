// Process-wide registry of device names handed to the engine.

use once_cell::sync::Lazy;
use std::collections::HashSet;
use std::sync::Mutex;

/// Names currently reserved by live sessions. Generation and reservation
/// happen under this one lock, so two sessions opened concurrently can never
/// pick the same name.
static RESERVED_NAMES: Lazy<Mutex<HashSet<String>>> = Lazy::new(|| Mutex::new(HashSet::new()));

/// Reserve a fresh device name: a fixed-width hexadecimal token. Collisions
/// are retried under the lock, so the returned name is unique among all
/// currently reserved names in this process.
pub(crate) fn reserve() -> String {
    let mut names = RESERVED_NAMES.lock().unwrap_or_else(|e| e.into_inner());
    loop {
        let name = format!("{:08x}", rand::random::<u32>());
        if names.insert(name.clone()) {
            return name;
        }
    }
}

pub(crate) fn release(name: &str) {
    let mut names = RESERVED_NAMES.lock().unwrap_or_else(|e| e.into_inner());
    names.remove(name);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_names_are_unique_and_fixed_width() {
        let names: Vec<String> = (0..64).map(|_| reserve()).collect();
        let unique: std::collections::HashSet<&String> = names.iter().collect();
        assert_eq!(unique.len(), names.len());
        for name in &names {
            assert_eq!(name.len(), 8);
            assert!(name.chars().all(|c| c.is_ascii_hexdigit()));
            release(name);
        }
    }
}
