//! 事件数据结构

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::utils::generate_uuid;

/// 模块间事件
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// 事件唯一标识
    pub event_id: String,

    /// 事件名（格式: category.name，如 user.created）
    pub name: String,

    /// 发布方模块名，宿主发布时为 `host`
    pub source: String,

    #[serde(default)]
    pub payload: Value,

    pub timestamp: DateTime<Utc>,

    /// 扩展元数据
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
}

impl Event {
    pub fn new(name: impl Into<String>, source: impl Into<String>, payload: Value) -> Self {
        Self {
            event_id: generate_uuid(),
            name: name.into(),
            source: source.into(),
            payload,
            timestamp: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// 订阅模式匹配：`*` 匹配全部，`prefix.*` 匹配 `prefix.` 开头的事件名
pub fn matches_pattern(pattern: &str, name: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix(".*") {
        return name.len() > prefix.len() + 1
            && name.starts_with(prefix)
            && name.as_bytes()[prefix.len()] == b'.';
    }
    pattern == name
}
