/*
 *  Copyright 2025-2026 Colliery Software
 *
 *  Licensed under the Apache License, Version 2.0 (the "License");
 *  you may not use this file except in compliance with the License.
 *  You may obtain a copy of the License at
 *
 *      http://www.apache.org/licenses/LICENSE-2.0
 *
 *  Unless required by applicable law or agreed to in writing, software
 *  distributed under the License is distributed on an "AS IS" BASIS,
 *  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 *  See the License for the specific language governing permissions and
 *  limitations under the License.
 */

//! Stable machine identity.
//!
//! The control node keys a physical worker by `(token, machine_id)`, so
//! the id must survive restarts and reinstalls. The OS machine id is
//! hashed rather than sent raw.

use sha2::{Digest, Sha256};

/// Derives a stable hex machine id for this host.
pub fn machine_id() -> String {
    let seed = raw_machine_seed();
    let mut hasher = Sha256::new();
    hasher.update(b"capstan-agent:");
    hasher.update(seed.as_bytes());
    hex(&hasher.finalize())
}

fn raw_machine_seed() -> String {
    for path in ["/etc/machine-id", "/var/lib/dbus/machine-id"] {
        if let Ok(contents) = std::fs::read_to_string(path) {
            let trimmed = contents.trim();
            if !trimmed.is_empty() {
                return trimmed.to_string();
            }
        }
    }
    // Fall back to the hostname; weaker, but stable on one machine.
    gethostname::gethostname().to_string_lossy().into_owned()
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn machine_id_is_stable_and_hex() {
        let a = machine_id();
        let b = machine_id();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
