//! Per-user integration overrides and the effective-config overlay.

use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};

use selfserve_domain::{
    model::ConfigSource, BackoffShape, EffectiveConfig, IntegrationKind, Result,
    UserIntegrationConfig,
};

use crate::{parse_ts, sql_err, ts, Store};

fn user_config_from_row(row: &Row<'_>) -> rusqlite::Result<UserIntegrationConfig> {
    let kind: String = row.get(1)?;
    let config: String = row.get(3)?;
    let created_at: String = row.get(7)?;
    let updated_at: String = row.get(8)?;

    Ok(UserIntegrationConfig {
        user_id: row.get(0)?,
        kind: kind.parse().unwrap_or(IntegrationKind::Test),
        enabled: row.get::<_, i64>(2)? != 0,
        config: serde_json::from_str(&config).unwrap_or_default(),
        priority: row.get(4)?,
        retry_count: row.get::<_, i64>(5)? as u32,
        retry_delay_seconds: row.get::<_, i64>(6)? as u64,
        created_at: parse_ts(&created_at).unwrap_or_default(),
        updated_at: parse_ts(&updated_at).unwrap_or_default(),
    })
}

impl Store {
    /// Insert or update the override row for `(user, kind)`.
    pub fn upsert_user_config(&self, config: &UserIntegrationConfig) -> Result<()> {
        let now = ts(Utc::now());
        let raw = serde_json::to_string(&config.config)?;

        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO user_integration_configs \
                 (user_id, kind, enabled, config, priority, retry_count, retry_delay_seconds, \
                  created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8) \
                 ON CONFLICT (user_id, kind) DO UPDATE SET \
                   enabled = excluded.enabled, config = excluded.config, \
                   priority = excluded.priority, retry_count = excluded.retry_count, \
                   retry_delay_seconds = excluded.retry_delay_seconds, \
                   updated_at = excluded.updated_at",
                params![
                    config.user_id,
                    config.kind.as_str(),
                    config.enabled as i64,
                    raw,
                    config.priority,
                    config.retry_count as i64,
                    config.retry_delay_seconds as i64,
                    now
                ],
            )
            .map_err(sql_err)?;
            Ok(())
        })
    }

    pub fn get_user_config(
        &self,
        user_id: &str,
        kind: IntegrationKind,
    ) -> Result<Option<UserIntegrationConfig>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT user_id, kind, enabled, config, priority, retry_count, \
                 retry_delay_seconds, created_at, updated_at \
                 FROM user_integration_configs WHERE user_id = ?1 AND kind = ?2",
                params![user_id, kind.as_str()],
                user_config_from_row,
            )
            .optional()
            .map_err(sql_err)
        })
    }

    /// Resolve the effective config for `(user, kind)`: the user
    /// override if present, else the system default, else disabled.
    /// The override and the default are never blended — only the
    /// back-off shape always comes from the default, since overrides
    /// don't carry one.
    pub fn get_user_effective_config(
        &self,
        user_id: &str,
        kind: IntegrationKind,
    ) -> Result<EffectiveConfig> {
        let backoff = self
            .default_for(kind)
            .map(|d| d.backoff)
            .unwrap_or(BackoffShape::Linear);

        if let Some(user) = self.get_user_config(user_id, kind)? {
            return Ok(EffectiveConfig {
                kind,
                enabled: user.enabled,
                config: user.config,
                priority: user.priority,
                retry_count: user.retry_count,
                retry_delay_seconds: user.retry_delay_seconds,
                backoff,
                source: ConfigSource::User,
            });
        }

        if let Some(default) = self.default_for(kind) {
            return Ok(EffectiveConfig {
                kind,
                enabled: default.enabled,
                config: default.config.clone(),
                priority: default.priority,
                retry_count: default.retry_count,
                retry_delay_seconds: default.retry_delay_seconds,
                backoff,
                source: ConfigSource::Default,
            });
        }

        Ok(EffectiveConfig {
            kind,
            enabled: false,
            config: serde_json::Value::Null,
            priority: 0,
            retry_count: 0,
            retry_delay_seconds: 0,
            backoff,
            source: ConfigSource::Default,
        })
    }

    /// Effective configs for every known kind, sorted by priority
    /// descending. Disabled kinds are included; the dispatcher skips
    /// them during fan-out.
    pub fn effective_configs_for_user(&self, user_id: &str) -> Result<Vec<EffectiveConfig>> {
        let mut configs = Vec::with_capacity(IntegrationKind::ALL.len());
        for kind in IntegrationKind::ALL {
            configs.push(self.get_user_effective_config(user_id, kind)?);
        }
        configs.sort_by(|a, b| b.priority.cmp(&a.priority));
        Ok(configs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use selfserve_domain::IntegrationDefault;

    fn defaults() -> Vec<IntegrationDefault> {
        vec![
            IntegrationDefault {
                kind: IntegrationKind::Test,
                enabled: true,
                config: serde_json::json!({}),
                priority: 0,
                retry_count: 0,
                retry_delay_seconds: 0,
                backoff: BackoffShape::Linear,
            },
            IntegrationDefault {
                kind: IntegrationKind::Webhook,
                enabled: false,
                config: serde_json::json!({}),
                priority: 10,
                retry_count: 3,
                retry_delay_seconds: 30,
                backoff: BackoffShape::Exponential,
            },
        ]
    }

    fn user_override(user: &str, kind: IntegrationKind, enabled: bool) -> UserIntegrationConfig {
        UserIntegrationConfig {
            user_id: user.into(),
            kind,
            enabled,
            config: serde_json::json!({"url": "https://hooks.example/x"}),
            priority: 42,
            retry_count: 5,
            retry_delay_seconds: 10,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn default_applies_without_override() {
        let store = Store::open_in_memory(defaults()).unwrap();
        let eff = store
            .get_user_effective_config("alice", IntegrationKind::Test)
            .unwrap();
        assert!(eff.enabled);
        assert_eq!(eff.source, ConfigSource::Default);
    }

    #[test]
    fn override_shadows_default_entirely() {
        let store = Store::open_in_memory(defaults()).unwrap();
        store
            .upsert_user_config(&user_override("bob", IntegrationKind::Webhook, true))
            .unwrap();

        let eff = store
            .get_user_effective_config("bob", IntegrationKind::Webhook)
            .unwrap();
        assert!(eff.enabled);
        assert_eq!(eff.source, ConfigSource::User);
        assert_eq!(eff.priority, 42);
        assert_eq!(eff.retry_count, 5);
        // Back-off shape still comes from the default for the kind.
        assert_eq!(eff.backoff, BackoffShape::Exponential);
        assert_eq!(eff.config["url"], "https://hooks.example/x");
    }

    #[test]
    fn unconfigured_kind_is_disabled() {
        let store = Store::open_in_memory(defaults()).unwrap();
        let eff = store
            .get_user_effective_config("alice", IntegrationKind::Email)
            .unwrap();
        assert!(!eff.enabled);
        assert_eq!(eff.source, ConfigSource::Default);
    }

    #[test]
    fn disabled_override_is_retained_and_respected() {
        let store = Store::open_in_memory(defaults()).unwrap();
        store
            .upsert_user_config(&user_override("carol", IntegrationKind::Test, false))
            .unwrap();

        let eff = store
            .get_user_effective_config("carol", IntegrationKind::Test)
            .unwrap();
        // The default enables test, but the user's disabled row wins.
        assert!(!eff.enabled);
        assert_eq!(eff.source, ConfigSource::User);
        assert!(store
            .get_user_config("carol", IntegrationKind::Test)
            .unwrap()
            .is_some());
    }

    #[test]
    fn upsert_replaces_existing_row() {
        let store = Store::open_in_memory(Vec::new()).unwrap();
        store
            .upsert_user_config(&user_override("dave", IntegrationKind::Email, true))
            .unwrap();
        let mut updated = user_override("dave", IntegrationKind::Email, true);
        updated.priority = 7;
        store.upsert_user_config(&updated).unwrap();

        let row = store
            .get_user_config("dave", IntegrationKind::Email)
            .unwrap()
            .unwrap();
        assert_eq!(row.priority, 7);
    }

    #[test]
    fn fanout_sorted_by_priority_desc() {
        let store = Store::open_in_memory(defaults()).unwrap();
        store
            .upsert_user_config(&user_override("erin", IntegrationKind::Webhook, true))
            .unwrap();

        let configs = store.effective_configs_for_user("erin").unwrap();
        assert_eq!(configs.len(), IntegrationKind::ALL.len());
        assert!(configs.windows(2).all(|w| w[0].priority >= w[1].priority));
        assert_eq!(configs[0].kind, IntegrationKind::Webhook);
    }
}
