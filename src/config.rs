//! `ServerConfig` and the validation it must pass before any configurator
//! runs (component 4.H).

use std::{fmt, sync::Arc};

use crate::{
    path::{derived_bus_name, derived_root_path, ObjectPath},
    value::Value,
    Error, ErrorKind, Result,
};

/// A read for a semantic data-access name (e.g. `"battery/level"`), or
/// `None` if the host has nothing to offer for that name.
pub type DataGetter = Arc<dyn Fn(&str) -> Option<Vec<u8>> + Send + Sync>;
/// A write for a semantic data-access name; returns whether it was accepted.
pub type DataSetter = Arc<dyn Fn(&str, &[u8]) -> bool + Send + Sync>;

/// Immutable (after `start`) server configuration.
#[derive(Clone)]
pub struct ServerConfig {
    pub service_name: String,
    pub advertising_name: String,
    pub advertising_short_name: String,
    pub enable_bondable: bool,
    pub enable_discoverable: bool,
    pub enable_advertising: bool,
    pub data_getter: DataGetter,
    pub data_setter: DataSetter,
    pub init_timeout_ms: u32,
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("service_name", &self.service_name)
            .field("advertising_name", &self.advertising_name)
            .field("advertising_short_name", &self.advertising_short_name)
            .field("enable_bondable", &self.enable_bondable)
            .field("enable_discoverable", &self.enable_discoverable)
            .field("enable_advertising", &self.enable_advertising)
            .field("init_timeout_ms", &self.init_timeout_ms)
            .finish_non_exhaustive()
    }
}

/// The legacy advertising-data budget (spec §3.2 / §8.3): 31 bytes total for
/// service-UUID list entries plus name/tx-power inclusions.
pub const ADVERTISING_AD_BUDGET: usize = 31;

impl ServerConfig {
    /// A config with a no-op data getter/setter, `enable_discoverable` and
    /// `enable_advertising` both on, a 30 s init timeout, and `bondable`
    /// enabled — a reasonable baseline a host can clone and tweak.
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            advertising_name: String::new(),
            advertising_short_name: String::new(),
            enable_bondable: true,
            enable_discoverable: true,
            enable_advertising: true,
            data_getter: Arc::new(|_| None),
            data_setter: Arc::new(|_, _| false),
            init_timeout_ms: 30_000,
        }
    }

    pub fn with_advertising_name(mut self, name: impl Into<String>, short_name: impl Into<String>) -> Self {
        self.advertising_name = name.into();
        self.advertising_short_name = short_name.into();
        self
    }

    pub fn with_data_access(mut self, getter: DataGetter, setter: DataSetter) -> Self {
        self.data_getter = getter;
        self.data_setter = setter;
        self
    }

    pub fn with_init_timeout_ms(mut self, ms: u32) -> Self {
        self.init_timeout_ms = ms;
        self
    }

    /// Validates every field per spec §4.H, returning the derived bus name
    /// and root object path on success.
    pub fn validate(&self) -> Result<(String, ObjectPath)> {
        validate_service_name(&self.service_name)?;

        if !(100..=60_000).contains(&self.init_timeout_ms) {
            return Err(Error::new(ErrorKind::InvalidArgument, format!("init_timeout {} ms out of range [100, 60000]", self.init_timeout_ms)));
        }

        Ok((derived_bus_name(&self.service_name), derived_root_path(&self.service_name)))
    }
}

/// `service_name` non-empty, ≤255 bytes, lower-cased, and either `"bzperi"`
/// or a prefix-match of `"bzperi."` followed by one or more dot-separated
/// identifier segments.
pub fn validate_service_name(service_name: &str) -> Result<()> {
    let invalid = || Error::new(ErrorKind::InvalidServiceName, format!("invalid service_name {service_name:?}"));

    if service_name.is_empty() || service_name.len() > 255 {
        return Err(invalid());
    }
    if service_name.chars().any(|c| c.is_ascii_uppercase()) {
        return Err(invalid());
    }
    if service_name == "bzperi" {
        return Ok(());
    }
    let Some(rest) = service_name.strip_prefix("bzperi.") else {
        return Err(invalid());
    };
    if rest.is_empty() {
        return Err(invalid());
    }
    for segment in rest.split('.') {
        if segment.is_empty() || !segment.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_') {
            return Err(invalid());
        }
    }
    Ok(())
}

/// Truncates a UTF-8 string to fit within `max_bytes`, never splitting a
/// multi-byte character.
pub fn truncate_to_byte_budget(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

/// Applies the service-UUID advertising budget policy (spec §3.2/§4.F):
/// only 16-bit UUIDs are eligible for the advertisement; they are kept,
/// in order, until adding one more would exceed `ADVERTISING_AD_BUDGET`
/// bytes (2 bytes per 16-bit UUID plus a 2-byte AD header), with 128-bit
/// UUIDs dropped first (never included at all).
pub fn budget_advertised_uuids(short_uuids: &[u16]) -> Vec<u16> {
    let mut kept = Vec::new();
    let mut used = 2usize; // AD structure header (length + type octets)
    for &uuid in short_uuids {
        if used + 2 > ADVERTISING_AD_BUDGET {
            break;
        }
        kept.push(uuid);
        used += 2;
    }
    kept
}

pub(crate) fn value_as_string_list(v: &Value) -> Vec<String> {
    match v {
        Value::Array(items) => items.iter().filter_map(|i| i.as_str().map(String::from)).collect(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boundary_service_names() {
        assert!(validate_service_name("").is_err());
        assert!(validate_service_name("bzperi").is_ok());
        assert!(validate_service_name("bzperi.myapp").is_ok());
        assert!(validate_service_name("other").is_err());
        assert!(validate_service_name("bzperi.").is_err());
        assert!(validate_service_name("BZPERI").is_err());
        assert!(validate_service_name("bzperi.My_App-1").is_err());
        assert!(validate_service_name("bzperi.my_app1").is_ok());
    }

    #[test]
    fn boundary_init_timeout() {
        let cfg = |ms| ServerConfig::new("bzperi").with_init_timeout_ms(ms);
        assert!(cfg(99).validate().is_err());
        assert!(cfg(60_001).validate().is_err());
        assert!(cfg(100).validate().is_ok());
        assert!(cfg(60_000).validate().is_ok());
    }

    #[test]
    fn derives_bus_name_and_root_path() {
        let (bus_name, root) = ServerConfig::new("bzperi.myapp").validate().unwrap();
        assert_eq!(bus_name, "com.bzperi.myapp");
        assert_eq!(root.as_str(), "/com/bzperi/myapp");
    }

    #[test]
    fn advertising_budget_caps_at_31_bytes() {
        let uuids: Vec<u16> = (0..20).collect();
        let kept = budget_advertised_uuids(&uuids);
        assert_eq!(kept.len(), 14, "2 header bytes + 14*2 = 30 <= 31, 15th would overflow");
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate_to_byte_budget("hello world", 5), "hello");
        assert_eq!(truncate_to_byte_budget("hi", 10), "hi");
    }
}
