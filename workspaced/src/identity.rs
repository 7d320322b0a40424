//! Deterministic names and per-session secrets derived from a user's
//! identity.

use rand::RngCore;

use workspaced_protocol::StartRequest;

const VOLUME_NAME_CONTEXT: &str = "workspaced 2024 home volume name";
const FLAG_CONTEXT: &str = "workspaced 2024 challenge flag";
const MAX_ID_LEN: usize = 64;
const MAX_IMAGE_LEN: usize = 255;

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("invalid {field} {value:?}")]
    InvalidId { field: &'static str, value: String },

    #[error("invalid image reference {0:?}")]
    InvalidImage(String),
}

/// Identifiers end up in container names, labels and lock keys.
pub fn validate_id(field: &'static str, value: &str) -> Result<(), IdentityError> {
    let valid = !value.is_empty()
        && value.len() <= MAX_ID_LEN
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if valid {
        Ok(())
    } else {
        Err(IdentityError::InvalidId {
            field,
            value: value.to_string(),
        })
    }
}

/// `[registry[:port]/]repository[:tag][@digest]`. The reference is a
/// positional `docker run` argument, so it must never parse as a flag.
pub fn validate_image(image: &str) -> Result<(), IdentityError> {
    let valid = image.len() <= MAX_IMAGE_LEN
        && image
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphanumeric())
        && image
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '/' | ':' | '@'))
        && !image.split('/').any(str::is_empty)
        && image.matches('@').count() <= 1;
    if valid {
        Ok(())
    } else {
        Err(IdentityError::InvalidImage(image.to_string()))
    }
}

pub fn validate_request(request: &StartRequest) -> Result<(), IdentityError> {
    validate_id("userId", &request.user_id)?;
    validate_id("dojoRef", &request.dojo_ref)?;
    validate_id("moduleRef", &request.module_ref)?;
    validate_id("challengeRef", &request.challenge_ref)?;
    if let Some(image) = &request.image {
        validate_image(image)?;
    }
    Ok(())
}

/// One live sandbox per user.
pub fn sandbox_name(user_id: &str) -> String {
    format!("user_{user_id}")
}

pub fn user_lock_key(user_id: &str) -> String {
    format!("user:{user_id}:docker")
}

/// Home volume name: not guessable from the user id without the deployment
/// secret.
pub fn home_volume_name(secret: &str, user_id: &str) -> String {
    let key = blake3::derive_key(VOLUME_NAME_CONTEXT, secret.as_bytes());
    let hash = blake3::keyed_hash(&key, user_id.as_bytes());
    format!("home-{}", &hash.to_hex()[..24])
}

/// Flag planted in the sandbox. Practice sessions get a placeholder.
pub fn flag(secret: &str, prefix: &str, request: &StartRequest) -> String {
    if request.practice {
        return format!("{prefix}{{practice}}");
    }
    let key = blake3::derive_key(FLAG_CONTEXT, secret.as_bytes());
    let material = format!(
        "{}:{}:{}:{}",
        request.user_id, request.dojo_ref, request.module_ref, request.challenge_ref
    );
    let mac = blake3::keyed_hash(&key, material.as_bytes());
    format!("{prefix}{{{}}}", mac.to_hex())
}

/// Random callback token, 32 bytes hex-encoded.
pub fn auth_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}
