//! Проверка подписи вебхуков платёжного провайдера.
//!
//! Формат заголовка: `t=<unix-ts>,v1=<hex hmac>[,v1=...]`. Подписывается
//! строка `"{t}.{raw body}"` ключом HMAC-SHA256, равным общему секрету.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Допустимое расхождение часов, защищает от повторной отправки старых событий.
pub const DEFAULT_TOLERANCE_SECS: i64 = 300;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("signature header is malformed")]
    Malformed,
    #[error("signature timestamp is outside the tolerance window")]
    Expired,
    #[error("no matching signature")]
    Mismatch,
}

/// Проверяет подпись `payload` относительно заголовка.
pub fn verify(
    payload: &[u8],
    header: &str,
    secret: &str,
    now_unix: i64,
    tolerance_secs: i64,
) -> Result<(), SignatureError> {
    let mut timestamp: Option<&str> = None;
    let mut candidates: Vec<&str> = Vec::new();

    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = Some(value),
            Some(("v1", value)) => candidates.push(value),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or(SignatureError::Malformed)?;
    let ts: i64 = timestamp.parse().map_err(|_| SignatureError::Malformed)?;
    if candidates.is_empty() {
        return Err(SignatureError::Malformed);
    }
    if (now_unix - ts).abs() > tolerance_secs {
        return Err(SignatureError::Expired);
    }

    for candidate in candidates {
        let Ok(expected) = hex::decode(candidate) else {
            continue;
        };
        // verify_slice сравнивает за постоянное время
        if new_mac(secret, timestamp, payload)?.verify_slice(&expected).is_ok() {
            return Ok(());
        }
    }

    Err(SignatureError::Mismatch)
}

/// Строит заголовок подписи; нужен тестам и локальной отладке вебхуков.
pub fn sign(payload: &[u8], secret: &str, timestamp: i64) -> Result<String, SignatureError> {
    let ts = timestamp.to_string();
    let mac = new_mac(secret, &ts, payload)?;
    Ok(format!("t={},v1={}", ts, hex::encode(mac.finalize().into_bytes())))
}

fn new_mac(secret: &str, timestamp: &str, payload: &[u8]) -> Result<HmacSha256, SignatureError> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(secret.as_bytes())
        .map_err(|_| SignatureError::Malformed)?;
    mac.update(timestamp.as_bytes());
    mac.update(b".");
    mac.update(payload);
    Ok(mac)
}
