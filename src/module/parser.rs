//! 模块清单解析器
//!
//! 把 YAML/JSON 清单解码为 [`ModuleDescriptor`]，并一次性报告全部问题。
//!
//! ```yaml
//! name: auth
//! version: 1.2.0
//! priority: 10
//! dependencies:
//!   - name: database
//!     constraint: ">=1.0, <2.0"
//!   - name: cache
//!     constraint: ^1
//!     optional: true
//! permissions: [database, cache]
//! configSchema:
//!   type: object
//!   required: [secret]
//! ```
//!
//! `dependencies` 也可以写成映射：`{ database: "^1.0" }`。

use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::module::metadata::{Capability, ConfigSchema, DependencySpec, ModuleDescriptor};
use crate::utils::{CoreError, Result};

/// 清单格式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestFormat {
    Yaml,
    Json,
}

impl ManifestFormat {
    /// 按扩展名判断，无法识别时返回 None
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "yaml" | "yml" => Some(ManifestFormat::Yaml),
            "json" => Some(ManifestFormat::Json),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawDependencies {
    List(Vec<DependencySpec>),
    Map(BTreeMap<String, String>),
}

impl Default for RawDependencies {
    fn default() -> Self {
        RawDependencies::List(Vec::new())
    }
}

impl RawDependencies {
    fn into_specs(self) -> Vec<DependencySpec> {
        match self {
            RawDependencies::List(list) => list,
            RawDependencies::Map(map) => map
                .into_iter()
                .map(|(name, constraint)| DependencySpec::required(name, constraint))
                .collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawManifest {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    description: String,
    #[serde(default)]
    dependencies: RawDependencies,
    #[serde(default)]
    permissions: Vec<String>,
    #[serde(default, alias = "configSchema")]
    config_schema: Option<Value>,
    #[serde(default)]
    priority: i32,
}

/// 清单解析器
#[derive(Debug, Clone, Default)]
pub struct ManifestParser;

impl ManifestParser {
    /// 从文件解析，格式由扩展名决定
    pub async fn parse_file(path: &Path) -> Result<ModuleDescriptor> {
        let format = ManifestFormat::from_path(path).ok_or_else(|| CoreError::InvalidManifest {
            module: path.display().to_string(),
            reason: "不支持的清单扩展名，需要 .yaml/.yml/.json".to_string(),
        })?;
        let content = tokio::fs::read_to_string(path).await?;
        Self::parse_str(&content, format)
    }

    /// 解析目录下所有清单（按文件名排序）
    pub async fn parse_dir(dir: &Path) -> Result<Vec<ModuleDescriptor>> {
        let mut entries = tokio::fs::read_dir(dir).await?;
        let mut paths: Vec<PathBuf> = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if ManifestFormat::from_path(&path).is_some() {
                paths.push(path);
            }
        }
        paths.sort();

        let mut descriptors = Vec::with_capacity(paths.len());
        for path in paths {
            descriptors.push(Self::parse_file(&path).await?);
        }
        Ok(descriptors)
    }

    /// 从字符串解析
    ///
    /// # Errors
    ///
    /// - 语法错误返回 `Yaml` / `Json`
    /// - 字段缺失或不合法返回 `InvalidManifest`，reason 中以 `; ` 分隔列出全部问题
    pub fn parse_str(content: &str, format: ManifestFormat) -> Result<ModuleDescriptor> {
        let raw: RawManifest = match format {
            ManifestFormat::Yaml => serde_yaml::from_str(content)?,
            ManifestFormat::Json => serde_json::from_str(content)?,
        };
        Self::build(raw)
    }

    fn build(raw: RawManifest) -> Result<ModuleDescriptor> {
        let mut errors = Vec::new();

        let name = raw.name.unwrap_or_default();
        if name.is_empty() {
            errors.push("缺少必填字段 name".to_string());
        } else if !Self::is_valid_module_name(&name) {
            errors.push(format!(
                "模块名 '{}' 格式无效，需以字母开头，只含字母、数字、'_'、'-'、'.'",
                name
            ));
        }

        let version = match raw.version.as_deref() {
            None | Some("") => {
                errors.push("缺少必填字段 version".to_string());
                None
            }
            Some(v) => match semver::Version::parse(v) {
                Ok(version) => Some(version),
                Err(e) => {
                    errors.push(format!("无效的版本号 '{}': {}", v, e));
                    None
                }
            },
        };

        let display_name = if name.is_empty() { "<unnamed>".to_string() } else { name.clone() };

        let Some(version) = version else {
            return Err(CoreError::InvalidManifest {
                module: display_name,
                reason: errors.join("; "),
            });
        };

        let mut descriptor = ModuleDescriptor::new(name, version);
        descriptor.description = raw.description;
        descriptor.dependencies = raw.dependencies.into_specs();
        descriptor.permissions = raw.permissions.into_iter().map(Capability::from).collect();
        descriptor.config_schema = raw.config_schema.map(ConfigSchema::new);
        descriptor.priority = raw.priority;

        if let Err(problems) = descriptor.validate() {
            errors.extend(problems);
        }

        if errors.is_empty() {
            Ok(descriptor)
        } else {
            Err(CoreError::InvalidManifest {
                module: display_name,
                reason: errors.join("; "),
            })
        }
    }

    fn is_valid_module_name(name: &str) -> bool {
        let mut chars = name.chars();
        match chars.next() {
            Some(c) if c.is_ascii_alphabetic() => {}
            _ => return false,
        }
        chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
    }
}
