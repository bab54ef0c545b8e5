use std::collections::BTreeSet;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::db::Database;

/// Distinct lowercased application identifiers and names seen in the store.
/// Used to classify query terms as app filters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KnownApps {
    pub app_ids: BTreeSet<String>,
    pub app_names: BTreeSet<String>,
}

impl KnownApps {
    /// `true` if `term` equals a known app id or is contained in a known app name.
    pub fn classifies_as_app(&self, term: &str) -> bool {
        self.app_ids.contains(term) || self.app_names.iter().any(|name| name.contains(term))
    }

    pub fn is_empty(&self) -> bool {
        self.app_ids.is_empty() && self.app_names.is_empty()
    }
}

impl Database {
    pub async fn fetch_known_apps(&self) -> Result<KnownApps> {
        self.execute(|conn| {
            let mut stmt = conn.prepare(
                "SELECT DISTINCT app_id, app_name
                 FROM snapshots
                 WHERE app_id IS NOT NULL OR app_name IS NOT NULL",
            )?;

            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, Option<String>>(0)?,
                        row.get::<_, Option<String>>(1)?,
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?;

            let mut known = KnownApps::default();
            for (app_id, app_name) in rows {
                if let Some(id) = app_id.filter(|id| !id.is_empty()) {
                    known.app_ids.insert(id.to_lowercase());
                }
                if let Some(name) = app_name.filter(|name| !name.is_empty()) {
                    known.app_names.insert(name.to_lowercase());
                }
            }
            Ok(known)
        })
        .await
    }
}
