use async_trait::async_trait;
use image::imageops::FilterType;
use reqwest::Client;
use std::{collections::HashMap, fmt};
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Error)]
pub enum ImageError {
    #[error("download failed: {0}")]
    Download(String),
    #[error("image is larger than {limit} bytes")]
    TooLarge { limit: usize },
    #[error("decode failed: {0}")]
    Decode(#[from] image::ImageError),
    #[error("hash task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// 64-bit difference hash.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PerceptualHash(pub u64);

impl PerceptualHash {
    /// Hamming distance; 0 means visually identical at hash resolution.
    pub fn distance(&self, other: &PerceptualHash) -> u32 {
        (self.0 ^ other.0).count_ones()
    }
}

impl fmt::Debug for PerceptualHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PerceptualHash({:016x})", self.0)
    }
}

/// dHash: shrink to 9x8 grey, one bit per horizontally adjacent pair,
/// set when the left pixel is brighter.
pub fn dhash(bytes: &[u8]) -> Result<PerceptualHash, ImageError> {
    let grey = image::load_from_memory(bytes)?
        .resize_exact(9, 8, FilterType::Triangle)
        .to_luma8();
    let mut bits = 0u64;
    for y in 0..8 {
        for x in 0..8 {
            bits <<= 1;
            if grey.get_pixel(x, y)[0] > grey.get_pixel(x + 1, y)[0] {
                bits |= 1;
            }
        }
    }
    Ok(PerceptualHash(bits))
}

#[async_trait]
pub trait ImageHasher: Send + Sync {
    async fn hash(&self, url: &str) -> Result<PerceptualHash, ImageError>;
}

pub struct HttpImageHasher {
    http: Client,
    max_bytes: usize,
    cache_capacity: usize,
    cache: Mutex<HashMap<String, PerceptualHash>>,
}

impl HttpImageHasher {
    pub fn new(http: Client, max_bytes: usize, cache_capacity: usize) -> Self {
        Self {
            http,
            max_bytes,
            cache_capacity,
            cache: Mutex::new(HashMap::new()),
        }
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>, ImageError> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|err| ImageError::Download(err.to_string()))?;
        if !response.status().is_success() {
            return Err(ImageError::Download(format!("HTTP {}", response.status())));
        }
        if response
            .content_length()
            .is_some_and(|len| len as usize > self.max_bytes)
        {
            return Err(ImageError::TooLarge {
                limit: self.max_bytes,
            });
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|err| ImageError::Download(err.to_string()))?;
        if bytes.len() > self.max_bytes {
            return Err(ImageError::TooLarge {
                limit: self.max_bytes,
            });
        }
        Ok(bytes.to_vec())
    }
}

#[async_trait]
impl ImageHasher for HttpImageHasher {
    async fn hash(&self, url: &str) -> Result<PerceptualHash, ImageError> {
        if let Some(hit) = self.cache.lock().await.get(url) {
            return Ok(*hit);
        }
        let bytes = self.download(url).await?;
        let hash = tokio::task::spawn_blocking(move || dhash(&bytes)).await??;

        let mut cache = self.cache.lock().await;
        if cache.len() >= self.cache_capacity {
            cache.clear();
        }
        cache.insert(url.to_string(), hash);
        Ok(hash)
    }
}
