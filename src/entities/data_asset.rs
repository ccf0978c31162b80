// 🖼️ DataAsset Entity - Downloaded binary content (profile images, banners)
//
// Identity key is (url, SHA-512 of the bytes). Referencing code resolves an
// asset by that key, so any row carrying the key is interchangeable.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataAsset {
    /// Storage identity (UUID)
    pub object_id: String,

    pub url: Option<String>,

    /// SHA-512 digest of `data` (64 bytes)
    pub data_sha512: Option<Vec<u8>>,

    pub data: Option<Vec<u8>>,

    pub content_type: Option<String>,

    pub creation_date: DateTime<Utc>,
}

/// Identity key of a DataAsset: (url, content hash)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AssetKey {
    pub url: String,
    pub data_sha512: Vec<u8>,
}

impl DataAsset {
    /// Create an asset for downloaded bytes, hashing them on the way in
    pub fn new(url: &str, data: Vec<u8>, creation_date: DateTime<Utc>) -> Self {
        DataAsset {
            object_id: uuid::Uuid::new_v4().to_string(),
            url: Some(url.to_string()),
            data_sha512: Some(Self::compute_sha512(&data)),
            data: Some(data),
            content_type: None,
            creation_date,
        }
    }

    pub fn with_content_type(mut self, content_type: &str) -> Self {
        self.content_type = Some(content_type.to_string());
        self
    }

    pub fn compute_sha512(data: &[u8]) -> Vec<u8> {
        let mut hasher = Sha512::new();
        hasher.update(data);
        hasher.finalize().to_vec()
    }

    /// Identity key, or None for assets still missing url or hash
    pub fn asset_key(&self) -> Option<AssetKey> {
        match (&self.url, &self.data_sha512) {
            (Some(url), Some(hash)) => Some(AssetKey {
                url: url.clone(),
                data_sha512: hash.clone(),
            }),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_asset_hashes_content() {
        let asset = DataAsset::new("https://pbs.example/a.png", b"png-bytes".to_vec(), Utc::now());

        let hash = asset.data_sha512.clone().unwrap();
        assert_eq!(hash.len(), 64, "SHA-512 digest should be 64 bytes");
        assert_eq!(hash, DataAsset::compute_sha512(b"png-bytes"));
    }

    #[test]
    fn test_same_url_different_bytes_are_different_keys() {
        let now = Utc::now();
        let a = DataAsset::new("https://pbs.example/a.png", b"v1".to_vec(), now);
        let b = DataAsset::new("https://pbs.example/a.png", b"v2".to_vec(), now);
        let c = DataAsset::new("https://pbs.example/a.png", b"v1".to_vec(), now);

        assert_ne!(a.asset_key(), b.asset_key());
        assert_eq!(a.asset_key(), c.asset_key());
    }

    #[test]
    fn test_asset_key_requires_url() {
        let mut asset = DataAsset::new("https://pbs.example/a.png", b"v1".to_vec(), Utc::now());
        asset.url = None;
        assert!(asset.asset_key().is_none());
    }
}
