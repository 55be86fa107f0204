//! Signed provider callback URLs
//!
//! Providers call back to `/webhooks/{provider}/{sub_task_id}?token=...`.
//! The token is an HMAC-SHA256 of the subtask id, so a callback can only
//! address the subtask it was issued for.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

#[derive(Clone)]
pub struct WebhookSigner {
    secret: Vec<u8>,
    public_base_url: String,
}

impl std::fmt::Debug for WebhookSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookSigner")
            .field("public_base_url", &self.public_base_url)
            .finish_non_exhaustive()
    }
}

impl WebhookSigner {
    pub fn new(secret: impl Into<Vec<u8>>, public_base_url: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            public_base_url: public_base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn mac(&self) -> HmacSha256 {
        match HmacSha256::new_from_slice(&self.secret) {
            Ok(mac) => mac,
            Err(_) => unreachable!("HMAC-SHA256 accepts any key length"),
        }
    }

    pub fn token(&self, sub_task_id: Uuid) -> String {
        let mut mac = self.mac();
        mac.update(sub_task_id.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    pub fn verify(&self, sub_task_id: Uuid, token: &str) -> bool {
        let Ok(provided) = hex::decode(token) else {
            return false;
        };
        let mut mac = self.mac();
        mac.update(sub_task_id.as_bytes());
        let expected = mac.finalize().into_bytes();
        expected.as_slice().ct_eq(provided.as_slice()).into()
    }

    pub fn callback_url(&self, provider_path: &str, sub_task_id: Uuid) -> String {
        format!(
            "{}/webhooks/{}/{}?token={}",
            self.public_base_url,
            provider_path,
            sub_task_id,
            self.token(sub_task_id)
        )
    }
}
