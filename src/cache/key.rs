use sha2::{Digest, Sha256};

use crate::providers::types::ChatParams;

/// Bumped whenever the hashed fields or their encoding change.
const KEY_VERSION: &[u8] = b"v1:";

// ---------------------------------------------------------------------------
// Exact-match key (SHA-256 of prompt, model and output-affecting params)
// ---------------------------------------------------------------------------

/// Compute a deterministic SHA-256 hex digest for a request.
///
/// Variable-length fields are length-prefixed so no prompt content can
/// collide with a field boundary. `extra` params are serialized from a
/// `BTreeMap`, so insertion order never affects the key.
pub fn cache_key(prompt: &str, model: &str, params: &ChatParams) -> String {
    let mut hasher = Sha256::new();
    hasher.update(KEY_VERSION);

    update_field(&mut hasher, model.as_bytes());
    update_field(&mut hasher, prompt.as_bytes());

    // Temperature rounded to 2 decimal places
    match params.temperature {
        Some(temp) => {
            let rounded = (temp * 100.0).round() / 100.0;
            update_field(&mut hasher, format!("{rounded:.2}").as_bytes());
        }
        None => update_field(&mut hasher, b""),
    }

    match params.max_tokens {
        Some(max) => update_field(&mut hasher, max.to_string().as_bytes()),
        None => update_field(&mut hasher, b""),
    }

    update_field(
        &mut hasher,
        params.system_message.as_deref().unwrap_or_default().as_bytes(),
    );

    match serde_json::to_string(&params.extra) {
        Ok(extra_json) => update_field(&mut hasher, extra_json.as_bytes()),
        Err(_) => update_field(&mut hasher, b"<extra-serialization-error>"),
    }

    format!("{:x}", hasher.finalize())
}

fn update_field(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
