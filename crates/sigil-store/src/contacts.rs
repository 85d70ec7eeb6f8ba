//! CRUD operations for [`Contact`] records.

use rusqlite::params;

use sigil_shared::{Address, Contact, DialogId};

use crate::database::Database;
use crate::error::Result;
use crate::messages::millis_to_datetime;

impl Database {
    // ------------------------------------------------------------------
    // Create / update
    // ------------------------------------------------------------------

    /// Insert a contact or overwrite the stored projection.
    pub fn upsert_contact(&self, contact: &Contact) -> Result<()> {
        self.conn().execute(
            "INSERT OR REPLACE INTO contacts
                (address, display_name, dialog_id, last_preview, last_timestamp, unread, blocked)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                contact.address.as_str(),
                contact.display_name,
                contact.dialog_id.as_str(),
                contact.last_preview,
                contact.last_timestamp.map(|t| t.timestamp_millis()),
                contact.unread,
                contact.blocked,
            ],
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    /// All contacts, most recently active first.
    pub fn list_contacts(&self) -> Result<Vec<Contact>> {
        let mut stmt = self.conn().prepare(
            "SELECT address, display_name, dialog_id, last_preview, last_timestamp, unread, blocked
             FROM contacts
             ORDER BY last_timestamp IS NULL, last_timestamp DESC, address ASC",
        )?;

        let rows = stmt.query_map([], row_to_contact)?;

        let mut contacts = Vec::new();
        for row in rows {
            contacts.push(row?);
        }
        Ok(contacts)
    }

    // ------------------------------------------------------------------
    // Delete
    // ------------------------------------------------------------------

    pub fn remove_contact(&self, address: &Address) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM contacts WHERE address = ?1",
            params![address.as_str()],
        )?;
        Ok(affected > 0)
    }
}

fn row_to_contact(row: &rusqlite::Row<'_>) -> rusqlite::Result<Contact> {
    let last_timestamp: Option<i64> = row.get(4)?;

    Ok(Contact {
        address: Address::new(row.get::<_, String>(0)?),
        display_name: row.get(1)?,
        dialog_id: DialogId(row.get(2)?),
        last_preview: row.get(3)?,
        last_timestamp: last_timestamp
            .map(|ms| millis_to_datetime(4, ms))
            .transpose()?,
        unread: row.get(5)?,
        blocked: row.get(6)?,
    })
}
