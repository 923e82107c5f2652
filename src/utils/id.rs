//! 注册句柄 ID 生成
//!
//! 钩子注册、事件订阅和热重载批次都用带前缀的 62 进制短 ID 标识，
//! 例如 `hook-a1B2c3D4e5`、`sub-0Zk9QeLm2x`。

use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// 62 进制字符集
const BASE62_CHARS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// 随机部分长度
const ID_LENGTH: usize = 10;

/// 进程内单调计数，避免同一毫秒内随机数碰撞
static SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// 生成 10 位 62 进制 ID
///
/// ```
/// use chips_plugin_core::utils::id::generate_id;
///
/// let id = generate_id();
/// assert_eq!(id.len(), 10);
/// ```
pub fn generate_id() -> String {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default();
    let sequence = SEQUENCE.fetch_add(1, Ordering::Relaxed);
    let random: u64 = rand::thread_rng().gen();

    let mut value = timestamp.rotate_left(17) ^ random ^ sequence.wrapping_mul(0x9E37_79B9_7F4A_7C15);

    let mut result = Vec::with_capacity(ID_LENGTH);
    for _ in 0..ID_LENGTH {
        result.push(BASE62_CHARS[(value % 62) as usize]);
        value /= 62;
    }
    result.reverse();
    result.into_iter().map(char::from).collect()
}

/// 生成带前缀的 ID，例如 `sub-0Zk9QeLm2x`
pub fn prefixed_id(prefix: &str) -> String {
    format!("{}-{}", prefix, generate_id())
}

/// 生成 UUID v4，用于事件 ID 等需要全局唯一的场景
pub fn generate_uuid() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_generate_id_shape() {
        let id = generate_id();
        assert_eq!(id.len(), ID_LENGTH);
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn test_generate_id_uniqueness() {
        let mut ids = HashSet::new();
        for _ in 0..1000 {
            assert!(ids.insert(generate_id()), "ID collision detected");
        }
    }

    #[test]
    fn test_prefixed_id() {
        let id = prefixed_id("hook");
        assert!(id.starts_with("hook-"));
        assert_eq!(id.len(), "hook-".len() + ID_LENGTH);
    }

    #[test]
    fn test_generate_uuid() {
        let uuid = generate_uuid();
        assert_eq!(uuid.len(), 36);
    }
}
