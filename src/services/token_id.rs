//! Token identifier generation

use anyhow::{anyhow, Result};
use data_encoding::BASE64URL_NOPAD;

/// Random bytes per identifier (256 bits)
const TOKEN_ID_BYTES: usize = 32;

/// Generate a new token identifier.
///
/// 32 bytes from the operating system CSPRNG, encoded as unpadded URL-safe
/// base64 so the value can travel in headers and cookies unchanged.
pub fn generate_token_id() -> Result<String> {
    let mut bytes = [0u8; TOKEN_ID_BYTES];
    getrandom::fill(&mut bytes).map_err(|e| anyhow!("Failed to generate token id: {}", e))?;
    Ok(BASE64URL_NOPAD.encode(&bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_token_id_format() {
        let id = generate_token_id().unwrap();

        // 32 bytes -> 43 base64 characters without padding
        assert_eq!(id.len(), 43);
        assert!(id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
        assert_eq!(BASE64URL_NOPAD.decode(id.as_bytes()).unwrap().len(), TOKEN_ID_BYTES);
    }

    #[test]
    fn test_token_ids_are_unique() {
        let ids: HashSet<String> = (0..1000).map(|_| generate_token_id().unwrap()).collect();
        assert_eq!(ids.len(), 1000);
    }
}
