//! Per-dialog settings. Only the disappearing-message timer lives here; the
//! dialog id itself is derived, never stored on its own.

use std::time::Duration;

use rusqlite::params;

use sigil_shared::{DialogId, DisappearingTimer};

use crate::database::Database;
use crate::error::Result;

impl Database {
    pub fn store_dialog_timer(&self, dialog_id: &DialogId, timer: DisappearingTimer) -> Result<()> {
        match timer {
            DisappearingTimer::Off => {
                self.conn().execute(
                    "DELETE FROM dialog_timers WHERE dialog_id = ?1",
                    params![dialog_id.as_str()],
                )?;
            }
            DisappearingTimer::After(ttl) => {
                self.conn().execute(
                    "INSERT OR REPLACE INTO dialog_timers (dialog_id, ttl_secs) VALUES (?1, ?2)",
                    params![dialog_id.as_str(), ttl.as_secs() as i64],
                )?;
            }
        }
        Ok(())
    }

    pub fn list_dialog_timers(&self) -> Result<Vec<(DialogId, DisappearingTimer)>> {
        let mut stmt = self
            .conn()
            .prepare("SELECT dialog_id, ttl_secs FROM dialog_timers ORDER BY dialog_id")?;

        let rows = stmt.query_map([], |row| {
            let dialog_id: String = row.get(0)?;
            let ttl_secs: i64 = row.get(1)?;
            Ok((
                DialogId(dialog_id),
                DisappearingTimer::After(Duration::from_secs(ttl_secs.max(0) as u64)),
            ))
        })?;

        let mut timers = Vec::new();
        for row in rows {
            timers.push(row?);
        }
        Ok(timers)
    }
}
