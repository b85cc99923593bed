//! Per-user LLM credential presets and per-group bindings.
//!
//! Presets live in `llm_presets.json` with API keys encrypted at rest
//! (AES-256-GCM, random nonce prepended, base64). The cipher key is a
//! 32-byte file named `.secret.key` with owner-only permissions, generated
//! on first use. A group's effective credentials come from its active
//! binding (first-come-first-served, optionally expiring) or its permanent
//! fallback.

use crate::error::{BrokerError, LlmError, Result};
use crate::llm::client::{ChatCompletion, ChatMessage};
use aes_gcm::aead::{Aead, AeadCore, OsRng};
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};
use anyhow::Context as _;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::Mutex;

const NONCE_LEN: usize = 12;
const MAX_BINDING_DAYS: i64 = 90;

/// A decrypted, usable preset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LlmPreset {
    pub model: String,
    pub base_url: String,
    pub api_key: String,
}

/// On-disk preset with the API key encrypted.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredPreset {
    model: String,
    base_url: String,
    api_key: String,
}

/// A credential lease on a group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BindingInfo {
    pub owner_id: String,
    pub preset_name: String,
    /// UTC epoch seconds.
    pub bound_at: i64,
    /// UTC epoch seconds; `None` means permanent.
    pub expire_at: Option<i64>,
}

impl BindingInfo {
    pub fn is_valid(&self) -> bool {
        match self.expire_at {
            None => true,
            Some(expire_at) => Utc::now().timestamp() < expire_at,
        }
    }
}

/// A group's active and fallback bindings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GroupBinding {
    pub active: Option<BindingInfo>,
    pub fallback: Option<BindingInfo>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct BrokerData {
    #[serde(default)]
    user_presets: HashMap<String, HashMap<String, StoredPreset>>,
    #[serde(default)]
    group_bindings: HashMap<String, GroupBinding>,
}

struct Inner {
    loaded: bool,
    data: BrokerData,
}

/// The credential broker.
pub struct LlmBroker {
    config_path: PathBuf,
    cipher: Aes256Gcm,
    inner: Mutex<Inner>,
}

impl LlmBroker {
    /// Open the broker rooted at `data_dir`, creating the cipher key file on
    /// first use.
    pub fn open(data_dir: &Path) -> Result<Self> {
        let key = load_or_create_key(data_dir)?;
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
        Ok(Self {
            config_path: data_dir.join("llm_presets.json"),
            cipher,
            inner: Mutex::new(Inner {
                loaded: false,
                data: BrokerData::default(),
            }),
        })
    }

    /// One-shot load of the preset file.
    pub async fn load(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.loaded {
            return Ok(());
        }
        inner.loaded = true;

        match std::fs::read_to_string(&self.config_path) {
            Ok(raw) => {
                inner.data =
                    serde_json::from_str(&raw).context("preset file is malformed")?;
                tracing::info!(path = %self.config_path.display(), "LLM presets loaded");
            }
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
            Err(error) => {
                return Err(anyhow::Error::new(error)
                    .context("failed to read preset file")
                    .into());
            }
        }
        Ok(())
    }

    // --- Presets ---

    /// Validate and store a preset, encrypting its API key.
    pub async fn add_preset(
        &self,
        user_id: &str,
        name: &str,
        model: &str,
        base_url: &str,
        api_key: &str,
    ) -> Result<()> {
        validate_preset_params(name, model, base_url, api_key)?;
        let encrypted = self.encrypt(api_key)?;

        let mut inner = self.inner.lock().await;
        inner
            .data
            .user_presets
            .entry(user_id.to_string())
            .or_default()
            .insert(
                name.to_string(),
                StoredPreset {
                    model: model.trim().to_string(),
                    base_url: base_url.trim().to_string(),
                    api_key: encrypted,
                },
            );
        self.save_locked(&inner.data)?;
        tracing::info!(
            user_id,
            preset = name,
            model,
            key = %mask_key(api_key),
            "preset saved"
        );
        Ok(())
    }

    /// Remove a preset. Refuses while any group binding still references it,
    /// reporting the referrer groups.
    pub async fn remove_preset(&self, user_id: &str, name: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;

        let mut referrers: Vec<String> = Vec::new();
        for (group_id, binding) in &inner.data.group_bindings {
            let refers = |info: &Option<BindingInfo>| {
                info.as_ref()
                    .is_some_and(|b| b.owner_id == user_id && b.preset_name == name)
            };
            if refers(&binding.active) || refers(&binding.fallback) {
                referrers.push(group_id.clone());
            }
        }
        if !referrers.is_empty() {
            referrers.sort();
            return Err(BrokerError::PresetInUse { groups: referrers }.into());
        }

        let removed = inner
            .data
            .user_presets
            .get_mut(user_id)
            .map(|presets| presets.remove(name).is_some())
            .unwrap_or(false);
        if !removed {
            return Err(BrokerError::PresetNotFound {
                name: name.to_string(),
            }
            .into());
        }
        self.save_locked(&inner.data)?;
        Ok(())
    }

    /// A user's presets with keys decrypted. Presets that fail to decrypt
    /// are logged and omitted.
    pub async fn get_user_presets(&self, user_id: &str) -> HashMap<String, LlmPreset> {
        let inner = self.inner.lock().await;
        let Some(presets) = inner.data.user_presets.get(user_id) else {
            return HashMap::new();
        };

        let mut decrypted = HashMap::new();
        for (name, stored) in presets {
            match self.decrypt(&stored.api_key) {
                Ok(api_key) => {
                    decrypted.insert(
                        name.clone(),
                        LlmPreset {
                            model: stored.model.clone(),
                            base_url: stored.base_url.clone(),
                            api_key,
                        },
                    );
                }
                Err(error) => {
                    tracing::error!(user_id, preset = %name, %error, "skipping undecryptable preset");
                }
            }
        }
        decrypted
    }

    pub async fn get_preset(&self, user_id: &str, name: &str) -> Option<LlmPreset> {
        let inner = self.inner.lock().await;
        self.preset_locked(&inner.data, user_id, name)
    }

    fn preset_locked(&self, data: &BrokerData, user_id: &str, name: &str) -> Option<LlmPreset> {
        let stored = data.user_presets.get(user_id)?.get(name)?;
        match self.decrypt(&stored.api_key) {
            Ok(api_key) => Some(LlmPreset {
                model: stored.model.clone(),
                base_url: stored.base_url.clone(),
                api_key,
            }),
            Err(error) => {
                tracing::error!(user_id, preset = name, %error, "preset decryption failed");
                None
            }
        }
    }

    // --- Bindings ---

    /// Take (or refresh) the active binding for a group. First come, first
    /// served: fails while another user holds a valid active binding.
    pub async fn bind_active(
        &self,
        group_id: &str,
        owner_id: &str,
        preset_name: &str,
        duration: Option<Duration>,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;

        if let Some(current) = inner
            .data
            .group_bindings
            .get(group_id)
            .and_then(|b| b.active.as_ref())
            && current.is_valid()
            && current.owner_id != owner_id
        {
            return Err(BrokerError::BindingHeld {
                owner: current.owner_id.clone(),
            }
            .into());
        }

        if self.preset_locked(&inner.data, owner_id, preset_name).is_none() {
            return Err(BrokerError::PresetNotFound {
                name: preset_name.to_string(),
            }
            .into());
        }

        let now = Utc::now().timestamp();
        let binding = BindingInfo {
            owner_id: owner_id.to_string(),
            preset_name: preset_name.to_string(),
            bound_at: now,
            expire_at: duration.map(|d| now + d.as_secs() as i64),
        };
        inner
            .data
            .group_bindings
            .entry(group_id.to_string())
            .or_default()
            .active = Some(binding);
        self.save_locked(&inner.data)?;
        Ok(())
    }

    pub async fn unbind_active(&self, group_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(binding) = inner.data.group_bindings.get_mut(group_id) {
            binding.active = None;
            self.save_locked(&inner.data)?;
        }
        Ok(())
    }

    /// Set the permanent fallback binding for a group.
    pub async fn set_fallback(
        &self,
        group_id: &str,
        owner_id: &str,
        preset_name: &str,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if self.preset_locked(&inner.data, owner_id, preset_name).is_none() {
            return Err(BrokerError::PresetNotFound {
                name: preset_name.to_string(),
            }
            .into());
        }

        inner
            .data
            .group_bindings
            .entry(group_id.to_string())
            .or_default()
            .fallback = Some(BindingInfo {
            owner_id: owner_id.to_string(),
            preset_name: preset_name.to_string(),
            bound_at: Utc::now().timestamp(),
            expire_at: None,
        });
        self.save_locked(&inner.data)?;
        Ok(())
    }

    pub async fn clear_fallback(&self, group_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(binding) = inner.data.group_bindings.get_mut(group_id) {
            binding.fallback = None;
            self.save_locked(&inner.data)?;
        }
        Ok(())
    }

    /// The effective binding for a group: active if valid, else fallback.
    ///
    /// An expired active binding is cleared in memory here; the file catches
    /// up on the next save-triggering operation, keeping this read path free
    /// of I/O.
    pub async fn resolve(&self, group_id: &str) -> Option<BindingInfo> {
        let mut inner = self.inner.lock().await;
        let binding = inner.data.group_bindings.get_mut(group_id)?;

        if let Some(active) = &binding.active {
            if active.is_valid() {
                return Some(active.clone());
            }
            tracing::debug!(group_id, "active binding expired, clearing lazily");
            binding.active = None;
        }

        binding.fallback.clone()
    }

    /// Resolve a binding to the owner's actual preset.
    pub async fn resolve_preset(&self, binding: &BindingInfo) -> Option<LlmPreset> {
        self.get_preset(&binding.owner_id, &binding.preset_name).await
    }

    /// Full binding state of a group, for status displays.
    pub async fn binding_status(&self, group_id: &str) -> GroupBinding {
        let inner = self.inner.lock().await;
        inner
            .data
            .group_bindings
            .get(group_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Probe a preset with a minimal completion. Returns `(usable, message)`
    /// with curated messages only; provider payloads never pass through.
    pub async fn test_preset(
        &self,
        preset: &LlmPreset,
        client: &dyn ChatCompletion,
        timeout: Duration,
    ) -> (bool, String) {
        let messages = [
            ChatMessage::system("You are a helpful assistant."),
            ChatMessage::user("Hello"),
        ];

        let outcome = tokio::time::timeout(timeout, client.get_completion(&messages, preset)).await;
        match outcome {
            Ok(Ok(_)) => (true, "预设可用".to_string()),
            Ok(Err(crate::error::Error::Llm(error))) => (false, describe_test_failure(&error)),
            Ok(Err(_)) => (false, "测试失败".to_string()),
            Err(_) => (false, format!("测试超时（{}秒）", timeout.as_secs())),
        }
    }

    // --- Crypto and persistence ---

    fn encrypt(&self, plaintext: &str) -> Result<String> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| BrokerError::EncryptionFailed)?;

        let mut combined = nonce.to_vec();
        combined.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(combined))
    }

    fn decrypt(&self, encoded: &str) -> Result<String> {
        let combined = BASE64
            .decode(encoded)
            .map_err(|_| BrokerError::DecryptionFailed)?;
        if combined.len() <= NONCE_LEN {
            return Err(BrokerError::DecryptionFailed.into());
        }

        let (nonce_bytes, ciphertext) = combined.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| BrokerError::DecryptionFailed)?;
        String::from_utf8(plaintext).map_err(|_| BrokerError::DecryptionFailed.into())
    }

    /// Atomic write: temp file, rename, then owner-only permissions.
    fn save_locked(&self, data: &BrokerData) -> Result<()> {
        let encoded = serde_json::to_string_pretty(data)
            .map_err(|e| BrokerError::Persist(e.to_string()))?;

        let tmp_path = self.config_path.with_extension("tmp");
        let write = || -> std::io::Result<()> {
            if let Some(parent) = self.config_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&tmp_path, &encoded)?;
            std::fs::rename(&tmp_path, &self.config_path)?;
            restrict_permissions(&self.config_path)?;
            Ok(())
        };

        write().map_err(|error| {
            let _ = std::fs::remove_file(&tmp_path);
            tracing::error!(%error, "failed to persist presets");
            BrokerError::Persist(error.to_string()).into()
        })
    }
}

/// Translate LLM failures into the short, sanitized test report lines.
fn describe_test_failure(error: &LlmError) -> String {
    match error {
        LlmError::Status { status: 401, .. } => "API Key 无效".to_string(),
        LlmError::Status { status: 404, .. } => "API 端点不存在".to_string(),
        LlmError::RateLimited => "速率限制".to_string(),
        LlmError::Timeout => "连接超时".to_string(),
        LlmError::Connection(_) => "无法连接到 API 端点".to_string(),
        LlmError::Status { status, .. } => format!("测试失败 (HTTP {status})"),
        LlmError::Decode(_) => "测试失败 (响应格式异常)".to_string(),
        _ => "测试失败".to_string(),
    }
}

/// Mask an API key down to its last four characters.
pub fn mask_key(key: &str) -> String {
    if key.chars().count() > 4 {
        let tail: String = key.chars().rev().take(4).collect::<Vec<_>>().into_iter().rev().collect();
        format!("***{tail}")
    } else {
        "***".to_string()
    }
}

/// Parse a binding duration: `Nm`, `Nh`, or `Nd`, capped at 90 days.
pub fn parse_duration(raw: &str) -> Option<Duration> {
    let raw = raw.trim().to_lowercase();
    let (digits, unit_secs, max_units) = if let Some(d) = raw.strip_suffix('m') {
        (d, 60u64, MAX_BINDING_DAYS * 24 * 60)
    } else if let Some(d) = raw.strip_suffix('h') {
        (d, 3600, MAX_BINDING_DAYS * 24)
    } else if let Some(d) = raw.strip_suffix('d') {
        (d, 86_400, MAX_BINDING_DAYS)
    } else {
        return None;
    };

    let count: i64 = digits.parse().ok()?;
    if count <= 0 || count > max_units {
        return None;
    }
    Some(Duration::from_secs(count as u64 * unit_secs))
}

fn validate_preset_params(name: &str, model: &str, base_url: &str, api_key: &str) -> Result<()> {
    let invalid = |message: &str| Err(BrokerError::Validation(message.to_string()).into());

    if name.is_empty() || name.len() > 50 {
        return invalid("预设名称长度应在1-50之间");
    }
    if !name.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-') {
        return invalid("预设名称只能包含字母、数字、下划线和连字符");
    }
    if model.trim().is_empty() {
        return invalid("模型名称不能为空");
    }

    let parsed = match reqwest::Url::parse(base_url.trim()) {
        Ok(url) => url,
        Err(_) => return invalid("API 地址格式无效（需要完整的 URL，如 https://api.example.com）"),
    };
    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        return invalid("API 地址必须使用 http 或 https 协议");
    }

    if api_key.len() < 10 {
        return invalid("API Key 过短（至少需要10个字符）");
    }
    if api_key.len() > 500 {
        return invalid("API Key 过长（最多500个字符）");
    }
    Ok(())
}

/// Read the cipher key, generating a fresh one with 0o600 permissions on
/// first use.
fn load_or_create_key(data_dir: &Path) -> Result<[u8; 32]> {
    let key_path = data_dir.join(".secret.key");

    if key_path.exists() {
        restrict_permissions(&key_path).ok();
        let bytes = std::fs::read(&key_path).context("failed to read cipher key file")?;
        let key: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| BrokerError::Persist("cipher key file has the wrong size".to_string()))?;
        return Ok(key);
    }

    let key: [u8; 32] = Aes256Gcm::generate_key(OsRng).into();
    std::fs::create_dir_all(data_dir).context("failed to create data directory")?;
    std::fs::write(&key_path, key).context("failed to write cipher key file")?;
    restrict_permissions(&key_path).context("failed to restrict cipher key permissions")?;
    tracing::info!(path = %key_path.display(), "generated new cipher key");
    Ok(key)
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt as _;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> std::io::Result<()> {
    Ok(())
}
