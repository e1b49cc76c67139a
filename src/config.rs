//! 查看器配置
//!
//! JSON 文件描述演示服务端里预置的类型、标签和初值，以及事件/刷新周期。

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::Path;

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::client::{write_text, TagServerClient};
use crate::events::DEFAULT_EVENT_TIMEOUT_MS;
use crate::types::{Member, TagDef, TypeId};

/// 复合类型成员
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberConfig {
    pub name: String,
    /// 类型名（基本类型或之前定义的复合类型）
    #[serde(rename = "type")]
    pub ty: String,
    #[serde(default = "default_count", deserialize_with = "deserialize_hex_or_int")]
    pub count: u32,
}

/// 复合类型
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypeConfig {
    pub name: String,
    pub members: Vec<MemberConfig>,
}

/// 标签
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: String,
    #[serde(default = "default_count", deserialize_with = "deserialize_hex_or_int")]
    pub count: u32,
    #[serde(default)]
    pub readonly: bool,
}

fn default_count() -> u32 {
    1
}

fn default_event_timeout() -> u64 {
    DEFAULT_EVENT_TIMEOUT_MS
}

fn default_refresh_interval() -> u64 {
    1000
}

fn default_writable() -> bool {
    true
}

/// 自定义反序列化：支持整数或十六进制字符串
fn deserialize_hex_or_int<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: serde::Deserializer<'de>,
    T: TryFrom<u64>,
    T::Error: std::fmt::Display,
{
    use serde::de::Error;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum HexOrInt {
        Int(u64),
        Str(String),
    }

    let v = match HexOrInt::deserialize(deserializer)? {
        HexOrInt::Int(v) => v,
        HexOrInt::Str(s) => {
            let s = s.trim();
            if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
                u64::from_str_radix(hex, 16).map_err(D::Error::custom)?
            } else {
                s.parse::<u64>().map_err(D::Error::custom)?
            }
        }
    };
    T::try_from(v).map_err(D::Error::custom)
}

/// 查看器配置（JSON 格式）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViewerConfig {
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub description: String,

    /// 事件等待超时，也是停止延迟上限
    #[serde(
        default = "default_event_timeout",
        deserialize_with = "deserialize_hex_or_int"
    )]
    pub event_timeout_ms: u64,

    /// 周期刷新间隔
    #[serde(
        default = "default_refresh_interval",
        deserialize_with = "deserialize_hex_or_int"
    )]
    pub refresh_interval_ms: u64,

    /// 视图级编辑开关
    #[serde(default = "default_writable")]
    pub writable: bool,

    #[serde(default)]
    pub types: Vec<TypeConfig>,

    #[serde(default)]
    pub tags: Vec<TagConfig>,

    /// 路径 -> 初值（字符串、数字或布尔）
    #[serde(default)]
    pub values: BTreeMap<String, serde_json::Value>,

    /// 监视的标签路径
    #[serde(default)]
    pub watch: Vec<String>,
}

/// 编译时嵌入的默认配置 JSON
const DEFAULT_CONFIG_JSON: &str = include_str!("../config/default_view.json");

impl Default for ViewerConfig {
    fn default() -> Self {
        serde_json::from_str(DEFAULT_CONFIG_JSON)
            .expect("Failed to parse embedded default_view.json")
    }
}

impl ViewerConfig {
    /// 从 JSON 文件加载配置
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("cannot read {}", path.as_ref().display()))?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> anyhow::Result<Self> {
        let config: ViewerConfig = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.event_timeout_ms == 0 {
            bail!("event_timeout_ms must be greater than 0");
        }
        let mut seen = HashSet::new();
        for t in &self.tags {
            if !seen.insert(t.name.as_str()) {
                bail!("duplicate tag name '{}'", t.name);
            }
            if t.count == 0 {
                bail!("tag '{}': count must be >= 1", t.name);
            }
        }
        let mut seen = HashSet::new();
        for t in &self.types {
            if !seen.insert(t.name.as_str()) {
                bail!("duplicate type name '{}'", t.name);
            }
        }
        Ok(())
    }

    /// 保存配置到 JSON 文件
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path.as_ref(), content)
            .with_context(|| format!("cannot write {}", path.as_ref().display()))?;
        Ok(())
    }

    /// 在服务端创建配置里的类型和标签并写入初值
    pub fn seed(&self, client: &dyn TagServerClient) -> anyhow::Result<()> {
        for t in &self.types {
            let members = t
                .members
                .iter()
                .map(|m| Ok(Member::new(m.name.clone(), lookup_type(client, &m.ty)?, m.count)))
                .collect::<anyhow::Result<Vec<_>>>()
                .with_context(|| format!("type {}", t.name))?;
            let id = client
                .add_type(&t.name, &members)
                .with_context(|| format!("cannot create type {}", t.name))?;
            debug!("config: type {} -> {}", t.name, id);
        }

        for t in &self.tags {
            let ty = lookup_type(client, &t.ty).with_context(|| format!("tag {}", t.name))?;
            let attrs = if t.readonly { TagDef::ATTR_READONLY } else { 0 };
            client
                .add_tag(&t.name, ty, t.count, attrs)
                .with_context(|| format!("cannot create tag {}", t.name))?;
        }

        for (path, value) in &self.values {
            let text = value_text(value)
                .with_context(|| format!("unsupported value for {}", path))?;
            write_text(client, path, &text)
                .with_context(|| format!("cannot set {} = {}", path, text))?;
        }

        info!(
            "config: seeded {} types, {} tags, {} values",
            self.types.len(),
            self.tags.len(),
            self.values.len()
        );
        Ok(())
    }
}

fn lookup_type(client: &dyn TagServerClient, name: &str) -> anyhow::Result<TypeId> {
    client
        .list_builtin_types()
        .into_iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, t)| t)
        .with_context(|| format!("unknown type '{}'", name))
}

fn value_text(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}
