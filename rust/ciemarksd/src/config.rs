//! Per-workspace settings. Each section is a JSON object stored under
//! `setup.<section>`; saved values are merged over the defaults field by field.

use crate::db;
use rusqlite::Connection;
use serde_json::{json, Map, Value};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SetupSection {
    Cie,
    Notifications,
}

impl SetupSection {
    pub const ALL: [SetupSection; 2] = [SetupSection::Cie, SetupSection::Notifications];

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "cie" => Some(Self::Cie),
            "notifications" => Some(Self::Notifications),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Cie => "cie",
            Self::Notifications => "notifications",
        }
    }

    fn key(self) -> &'static str {
        match self {
            Self::Cie => "setup.cie",
            Self::Notifications => "setup.notifications",
        }
    }
}

fn default_section(section: SetupSection) -> Value {
    match section {
        SetupSection::Cie => json!({
            "maxMarksDefault": 50,
            "maxBatchEntries": 5000,
            "busyTimeoutMs": db::DEFAULT_BUSY_TIMEOUT_MS,
            "enforceInstructor": true,
            "allowAbsentMarker": true
        }),
        SetupSection::Notifications => json!({
            "enabled": true
        }),
    }
}

/// Typed view of the settings the CIE core consults.
#[derive(Debug, Clone, PartialEq)]
pub struct CieConfig {
    pub max_marks_default: f64,
    pub max_batch_entries: usize,
    pub busy_timeout_ms: u64,
    pub enforce_instructor: bool,
    pub allow_absent_marker: bool,
    pub notifications_enabled: bool,
}

impl Default for CieConfig {
    fn default() -> Self {
        Self {
            max_marks_default: 50.0,
            max_batch_entries: 5000,
            busy_timeout_ms: db::DEFAULT_BUSY_TIMEOUT_MS,
            enforce_instructor: true,
            allow_absent_marker: true,
            notifications_enabled: true,
        }
    }
}

fn parse_bool(v: &Value, key: &str) -> Result<bool, String> {
    v.as_bool().ok_or_else(|| format!("{} must be boolean", key))
}

fn parse_i64_range(v: &Value, key: &str, min: i64, max: i64) -> Result<i64, String> {
    let n = v
        .as_i64()
        .ok_or_else(|| format!("{} must be integer", key))?;
    if !(min..=max).contains(&n) {
        return Err(format!("{} must be in {}..={}", key, min, max));
    }
    Ok(n)
}

pub fn merge_section_patch(
    section: SetupSection,
    current: &mut Value,
    patch: &Map<String, Value>,
) -> Result<(), String> {
    let obj = current
        .as_object_mut()
        .ok_or_else(|| "internal setup object must be a JSON object".to_string())?;
    for (k, v) in patch {
        match section {
            SetupSection::Cie => match k.as_str() {
                "maxMarksDefault" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 1, 1000)?));
                }
                "maxBatchEntries" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 1, 50_000)?));
                }
                "busyTimeoutMs" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 0, 60_000)?));
                }
                "enforceInstructor" | "allowAbsentMarker" => {
                    obj.insert(k.clone(), Value::Bool(parse_bool(v, k)?));
                }
                _ => return Err(format!("unknown cie field: {}", k)),
            },
            SetupSection::Notifications => match k.as_str() {
                "enabled" => {
                    obj.insert(k.clone(), Value::Bool(parse_bool(v, k)?));
                }
                _ => return Err(format!("unknown notifications field: {}", k)),
            },
        }
    }
    Ok(())
}

pub fn load_section(conn: &Connection, section: SetupSection) -> anyhow::Result<Value> {
    let mut current = default_section(section);
    if let Some(saved) = db::settings_get_json(conn, section.key())? {
        if let Some(saved_obj) = saved.as_object() {
            // Malformed historical values fall back to defaults instead of blocking startup.
            if let Err(e) = merge_section_patch(section, &mut current, saved_obj) {
                tracing::warn!(section = section.name(), error = %e, "ignoring saved settings");
                current = default_section(section);
            }
        }
    }
    Ok(current)
}

pub fn save_section(conn: &Connection, section: SetupSection, value: &Value) -> anyhow::Result<()> {
    db::settings_set_json(conn, section.key(), value)
}

pub fn load(conn: &Connection) -> anyhow::Result<CieConfig> {
    let cie = load_section(conn, SetupSection::Cie)?;
    let notifications = load_section(conn, SetupSection::Notifications)?;
    let defaults = CieConfig::default();
    Ok(CieConfig {
        max_marks_default: cie
            .get("maxMarksDefault")
            .and_then(|v| v.as_f64())
            .unwrap_or(defaults.max_marks_default),
        max_batch_entries: cie
            .get("maxBatchEntries")
            .and_then(|v| v.as_u64())
            .map(|n| n as usize)
            .unwrap_or(defaults.max_batch_entries),
        busy_timeout_ms: cie
            .get("busyTimeoutMs")
            .and_then(|v| v.as_u64())
            .unwrap_or(defaults.busy_timeout_ms),
        enforce_instructor: cie
            .get("enforceInstructor")
            .and_then(|v| v.as_bool())
            .unwrap_or(defaults.enforce_instructor),
        allow_absent_marker: cie
            .get("allowAbsentMarker")
            .and_then(|v| v.as_bool())
            .unwrap_or(defaults.allow_absent_marker),
        notifications_enabled: notifications
            .get("enabled")
            .and_then(|v| v.as_bool())
            .unwrap_or(defaults.notifications_enabled),
    })
}
