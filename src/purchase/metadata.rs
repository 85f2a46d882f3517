// Metadata carried on provider payments so webhooks can be reconciled back
// to inventory. Stripe takes a flat string map on the intent; Square gets a
// single base64-JSON reference string on the payment.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PaymentMetadata {
    pub campaign_id: String,
    pub square_ids: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub donor_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub donor_email: Option<String>,
    #[serde(default)]
    pub is_anonymous: bool,
}

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("invalid base64 encoding")]
    InvalidEncoding,
    #[error("invalid metadata format: {0}")]
    InvalidFormat(String),
    #[error("missing metadata field: {0}")]
    MissingField(&'static str),
}

impl PaymentMetadata {
    pub fn new(campaign_id: String, square_ids: Vec<String>) -> Self {
        Self {
            campaign_id,
            square_ids,
            ..Default::default()
        }
    }

    /// Flat map form for the intent-based provider's metadata fields.
    pub fn to_map(&self) -> HashMap<String, String> {
        let mut map = HashMap::new();
        map.insert("campaign_id".to_string(), self.campaign_id.clone());
        map.insert("square_ids".to_string(), self.square_ids.join(","));
        if let Some(name) = &self.donor_name {
            map.insert("donor_name".to_string(), name.clone());
        }
        if let Some(email) = &self.donor_email {
            map.insert("donor_email".to_string(), email.clone());
        }
        if self.is_anonymous {
            map.insert("is_anonymous".to_string(), "true".to_string());
        }
        map
    }

    pub fn from_map(map: &HashMap<String, String>) -> Result<Self, MetadataError> {
        let campaign_id = map
            .get("campaign_id")
            .filter(|v| !v.is_empty())
            .ok_or(MetadataError::MissingField("campaign_id"))?
            .clone();
        let square_ids: Vec<String> = map
            .get("square_ids")
            .ok_or(MetadataError::MissingField("square_ids"))?
            .split(',')
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        if square_ids.is_empty() {
            return Err(MetadataError::MissingField("square_ids"));
        }
        Ok(Self {
            campaign_id,
            square_ids,
            donor_name: map.get("donor_name").cloned(),
            donor_email: map.get("donor_email").cloned(),
            is_anonymous: map
                .get("is_anonymous")
                .map(|v| v == "true")
                .unwrap_or(false),
        })
    }

    /// Base64-JSON form for the token-based provider's reference field.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        let json = serde_json::to_string(self)?;
        Ok(STANDARD.encode(json))
    }

    pub fn decode(encoded: &str) -> Result<Self, MetadataError> {
        let bytes = STANDARD
            .decode(encoded)
            .map_err(|_| MetadataError::InvalidEncoding)?;
        let json = String::from_utf8(bytes).map_err(|_| MetadataError::InvalidEncoding)?;
        let meta: Self = serde_json::from_str(&json)
            .map_err(|e| MetadataError::InvalidFormat(e.to_string()))?;
        if meta.campaign_id.is_empty() || meta.square_ids.is_empty() {
            return Err(MetadataError::MissingField("square_ids"));
        }
        Ok(meta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_round_trip() {
        let mut meta = PaymentMetadata::new("c1".into(), vec!["a".into(), "b".into()]);
        meta.donor_name = Some("Ada".into());
        meta.is_anonymous = true;
        let parsed = PaymentMetadata::from_map(&meta.to_map()).unwrap();
        assert_eq!(parsed.campaign_id, "c1");
        assert_eq!(parsed.square_ids, vec!["a", "b"]);
        assert_eq!(parsed.donor_name.as_deref(), Some("Ada"));
        assert!(parsed.is_anonymous);
    }

    #[test]
    fn encoded_round_trip() {
        let meta = PaymentMetadata::new("c1".into(), vec!["sq_9".into()]);
        let parsed = PaymentMetadata::decode(&meta.encode().unwrap()).unwrap();
        assert_eq!(parsed.square_ids, vec!["sq_9"]);
    }

    #[test]
    fn rejects_empty_square_list() {
        let map = HashMap::from([
            ("campaign_id".to_string(), "c1".to_string()),
            ("square_ids".to_string(), "".to_string()),
        ]);
        assert!(matches!(
            PaymentMetadata::from_map(&map),
            Err(MetadataError::MissingField("square_ids"))
        ));
    }

    #[test]
    fn rejects_garbage_encoding() {
        assert!(matches!(
            PaymentMetadata::decode("not-base64!!"),
            Err(MetadataError::InvalidEncoding)
        ));
    }
}
