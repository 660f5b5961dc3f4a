//! 负载序列化支持 / Payload serialization support
//!
//! 队列只搬运字节；此模块把 serde 类型编码为包负载，支持 Bincode、JSON 和 MessagePack。
//! The queue only moves bytes; this module encodes serde types into packet
//! payloads using Bincode, JSON or MessagePack.

use std::str::FromStr;
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;

#[derive(Debug, thiserror::Error)]
pub enum SerializationError {
    #[error("Bincode error: {0}")]
    Bincode(#[from] bincode::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("MessagePack encode error: {0}")]
    MessagePackEncode(#[from] rmp_serde::encode::Error),
    #[error("MessagePack decode error: {0}")]
    MessagePackDecode(#[from] rmp_serde::decode::Error),

    #[error("Unsupported serialization format: {0}")]
    UnsupportedFormat(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SerializationFormat {
    #[default]
    Bincode,
    Json,
    MessagePack,
}

impl SerializationFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            SerializationFormat::Bincode => "bincode",
            SerializationFormat::Json => "json",
            SerializationFormat::MessagePack => "messagepack",
        }
    }
}

impl FromStr for SerializationFormat {
    type Err = SerializationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "bincode" | "binary" => Ok(SerializationFormat::Bincode),
            "json" => Ok(SerializationFormat::Json),
            "msgpack" | "messagepack" => Ok(SerializationFormat::MessagePack),
            other => Err(SerializationError::UnsupportedFormat(other.to_string())),
        }
    }
}

impl std::fmt::Display for SerializationFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 序列化辅助工具
///
/// Serialization helper.
pub struct SerializationHelper;

impl SerializationHelper {
    /// 按指定格式序列化
    ///
    /// Serialize `data` with the given format.
    pub fn serialize<T: Serialize + ?Sized>(data: &T, format: SerializationFormat) -> Result<Vec<u8>, SerializationError> {
        let bytes = match format {
            SerializationFormat::Bincode => bincode::serialize(data)?,
            SerializationFormat::Json => serde_json::to_vec(data)?,
            // 结构体编码为映射 / structs encoded as maps
            SerializationFormat::MessagePack => rmp_serde::to_vec_named(data)?,
        };
        Ok(bytes)
    }

    /// 按指定格式反序列化
    ///
    /// Deserialize `data` with the given format.
    pub fn deserialize<T: DeserializeOwned>(data: &[u8], format: SerializationFormat) -> Result<T, SerializationError> {
        let value = match format {
            SerializationFormat::Bincode => bincode::deserialize(data)?,
            SerializationFormat::Json => serde_json::from_slice(data)?,
            SerializationFormat::MessagePack => rmp_serde::from_slice(data)?,
        };
        Ok(value)
    }
}
