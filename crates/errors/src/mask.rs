//! 密钥掩码

use std::fmt;

use serde_json::Value;

/// 掩码替换文本
pub const MASK: &str = "***";

/// 短于该长度的值不参与掩码，避免把普通单词替换掉
const MIN_SECRET_LEN: usize = 4;

/// 在日志和响应中隐藏已配置的密钥值
#[derive(Clone, Default)]
pub struct SecretMasker {
    secrets: Vec<String>,
}

impl SecretMasker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        let secret = secret.into();
        if secret.len() >= MIN_SECRET_LEN && !self.secrets.contains(&secret) {
            self.secrets.push(secret);
            // 先替换较长的值，防止较短的值截断较长值的一部分
            self.secrets.sort_by_key(|s| std::cmp::Reverse(s.len()));
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        self.secrets.is_empty()
    }

    pub fn mask(&self, text: &str) -> String {
        self.secrets
            .iter()
            .fold(text.to_string(), |acc, secret| acc.replace(secret.as_str(), MASK))
    }

    /// 递归掩码 JSON 值中的字符串
    pub fn mask_value(&self, value: &Value) -> Value {
        match value {
            Value::String(s) => Value::String(self.mask(s)),
            Value::Array(items) => Value::Array(items.iter().map(|v| self.mask_value(v)).collect()),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.mask_value(v)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }
}

impl fmt::Debug for SecretMasker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretMasker")
            .field("secrets", &self.secrets.len())
            .finish()
    }
}
