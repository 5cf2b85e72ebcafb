//! Redirect state for federated logins.
//!
//! The state is base64 of `{"authParams": .., "connection": ..}` with the
//! trailing `=` padding stripped. Nothing is stored server-side; the
//! provider round-trips the value verbatim.

use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig};
use base64::engine::DecodePaddingMode;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::auth::AuthError;
use crate::model::AuthParams;

const STATE_ENGINE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new()
        .with_encode_padding(false)
        .with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SocialState {
    #[serde(rename = "authParams")]
    pub auth_params: AuthParams,
    pub connection: String,
}

impl SocialState {
    pub fn encode(&self) -> Result<String, AuthError> {
        let json = serde_json::to_vec(self)
            .map_err(|e| AuthError::Internal(format!("Failed to encode state: {}", e)))?;
        Ok(STATE_ENGINE.encode(json))
    }

    /// Decodes a state value, with or without padding.
    pub fn decode(raw: &str) -> Result<Self, AuthError> {
        let bytes = STATE_ENGINE
            .decode(raw.trim())
            .map_err(|_| AuthError::Validation("Invalid state".to_string()))?;
        serde_json::from_slice(&bytes)
            .map_err(|_| AuthError::Validation("Invalid state".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> SocialState {
        SocialState {
            auth_params: AuthParams {
                client_id: "client".to_string(),
                redirect_uri: Some("https://app.example.com/cb".to_string()),
                response_type: Some("code".to_string()),
                state: Some("xyz".to_string()),
                ..Default::default()
            },
            connection: "google-oauth2".to_string(),
        }
    }

    #[test]
    fn encoded_state_has_no_padding_and_decodes() {
        let encoded = state().encode().unwrap();
        assert!(!encoded.ends_with('='));
        assert_eq!(SocialState::decode(&encoded).unwrap(), state());
    }

    #[test]
    fn padded_state_is_accepted() {
        let json = serde_json::to_vec(&state()).unwrap();
        let padded = base64::engine::general_purpose::STANDARD.encode(json);
        assert_eq!(SocialState::decode(&padded).unwrap(), state());
    }

    #[test]
    fn uses_wire_field_names() {
        let json = serde_json::to_value(state()).unwrap();
        assert_eq!(json["authParams"]["client_id"], "client");
        assert_eq!(json["connection"], "google-oauth2");
    }

    #[test]
    fn garbage_is_a_validation_error() {
        assert!(matches!(
            SocialState::decode("not base64!"),
            Err(AuthError::Validation(_))
        ));
    }
}
