//! Settings repository.

use rusqlite::types::Value;
use rusqlite::Row;

use super::{text, StorageGateway, StoreError, StoreResult};
use crate::models::{now_millis, Setting};

fn setting_from_row(row: &Row<'_>) -> rusqlite::Result<Setting> {
    Ok(Setting {
        key: row.get(0)?,
        value: row.get(1)?,
        updated_at: row.get(2)?,
    })
}

/// Key/value settings shared by the whole app.
pub struct SettingsRepository<'g> {
    gateway: &'g StorageGateway,
}

impl<'g> SettingsRepository<'g> {
    pub fn new(gateway: &'g StorageGateway) -> Self {
        Self { gateway }
    }

    pub fn get(&self, key: &str) -> StoreResult<Option<Setting>> {
        self.gateway.query_one(
            "SELECT key, value, updatedAt FROM settings WHERE key = ?1",
            &[text(key)],
            setting_from_row,
        )
    }

    pub fn get_value(&self, key: &str) -> StoreResult<Option<String>> {
        Ok(self.get(key)?.map(|s| s.value))
    }

    /// Insert or overwrite a setting.
    pub fn set(&self, key: &str, value: &str) -> StoreResult<Setting> {
        if key.trim().is_empty() {
            return Err(StoreError::InvalidArgument("setting key must not be empty".into()));
        }
        let setting = Setting {
            key: key.to_string(),
            value: value.to_string(),
            updated_at: now_millis(),
        };
        self.gateway.execute(
            r#"
            INSERT INTO settings (key, value, updatedAt) VALUES (?1, ?2, ?3)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updatedAt = excluded.updatedAt
            "#,
            &[
                text(&setting.key),
                text(&setting.value),
                Value::Integer(setting.updated_at),
            ],
        )?;
        Ok(setting)
    }

    pub fn list(&self) -> StoreResult<Vec<Setting>> {
        self.gateway.query_all(
            "SELECT key, value, updatedAt FROM settings ORDER BY key",
            &[],
            setting_from_row,
        )
    }
}
