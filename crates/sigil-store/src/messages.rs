use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use sigil_shared::{Address, DialogId, Message, MessageId, MessageStatus};

use crate::database::Database;
use crate::error::Result;

const MESSAGE_COLUMNS: &str = "id, dialog_id, sender, recipient, ciphertext, ciphertext_self,
     timestamp, status, plaintext, reply_to, reply_preview, edited, edit_count,
     reactions, attachment_ref, tx_id";

impl Database {
    pub fn upsert_message(&self, message: &Message) -> Result<()> {
        let reactions = serde_json::to_string(&message.reactions)?;
        self.conn().execute(
            &format!(
                "INSERT OR REPLACE INTO messages ({MESSAGE_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)"
            ),
            params![
                message.id.as_str(),
                message.dialog_id.as_str(),
                message.sender.as_str(),
                message.recipient.as_ref().map(Address::as_str),
                message.ciphertext,
                message.ciphertext_self,
                message.timestamp.timestamp_millis(),
                message.status.as_str(),
                message.plaintext,
                message.reply_to.as_ref().map(MessageId::as_str),
                message.reply_preview,
                message.edited,
                message.edit_count,
                reactions,
                message.attachment_ref,
                message.tx_id,
            ],
        )?;
        Ok(())
    }

    pub fn find_message(&self, id: &MessageId) -> Result<Option<Message>> {
        let message = self
            .conn()
            .query_row(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
                params![id.as_str()],
                row_to_message,
            )
            .optional()?;
        Ok(message)
    }

    pub fn get_messages_for_dialog(
        &self,
        dialog_id: &DialogId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Message>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {MESSAGE_COLUMNS}
             FROM messages
             WHERE dialog_id = ?1
             ORDER BY timestamp DESC, id DESC
             LIMIT ?2 OFFSET ?3"
        ))?;

        let rows = stmt.query_map(
            params![dialog_id.as_str(), limit as i64, offset as i64],
            row_to_message,
        )?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        messages.reverse();
        Ok(messages)
    }

    pub fn remove_message(&self, id: &MessageId) -> Result<bool> {
        let affected = self
            .conn()
            .execute("DELETE FROM messages WHERE id = ?1", params![id.as_str()])?;
        Ok(affected > 0)
    }

    pub fn remove_dialog_messages(&self, dialog_id: &DialogId) -> Result<usize> {
        let affected = self.conn().execute(
            "DELETE FROM messages WHERE dialog_id = ?1",
            params![dialog_id.as_str()],
        )?;
        Ok(affected)
    }

    /// Swap a temporary id for its durable id in one transaction. If the
    /// durable row already exists (the relay echo won the race) the temporary
    /// row is dropped instead.
    pub fn rename_message_id(&mut self, temp_id: &MessageId, durable_id: &MessageId) -> Result<()> {
        let tx = self.conn_mut().transaction()?;

        let durable_exists: bool = tx
            .query_row(
                "SELECT 1 FROM messages WHERE id = ?1",
                params![durable_id.as_str()],
                |_| Ok(()),
            )
            .optional()?
            .is_some();

        if durable_exists {
            tx.execute("DELETE FROM messages WHERE id = ?1", params![temp_id.as_str()])?;
        } else {
            tx.execute(
                "UPDATE messages SET id = ?2 WHERE id = ?1",
                params![temp_id.as_str(), durable_id.as_str()],
            )?;
        }
        tx.execute(
            "UPDATE messages SET reply_to = ?2 WHERE reply_to = ?1",
            params![temp_id.as_str(), durable_id.as_str()],
        )?;

        tx.commit()?;
        Ok(())
    }
}

fn conversion_error(
    col: usize,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(col, rusqlite::types::Type::Text, Box::new(err))
}

pub(crate) fn millis_to_datetime(col: usize, millis: i64) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis)
        .ok_or(rusqlite::Error::IntegralValueOutOfRange(col, millis))
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let recipient: Option<String> = row.get(3)?;
    let ts_millis: i64 = row.get(6)?;
    let status_str: String = row.get(7)?;
    let reply_to: Option<String> = row.get(9)?;
    let reactions_json: String = row.get(13)?;

    let status = MessageStatus::parse(&status_str).ok_or_else(|| {
        conversion_error(
            7,
            crate::error::StoreError::Corrupt(format!("unknown status {status_str}")),
        )
    })?;
    let reactions = serde_json::from_str(&reactions_json).map_err(|e| conversion_error(13, e))?;

    Ok(Message {
        id: MessageId::new(row.get::<_, String>(0)?),
        dialog_id: DialogId(row.get(1)?),
        sender: Address::new(row.get::<_, String>(2)?),
        recipient: recipient.map(Address::new),
        ciphertext: row.get(4)?,
        ciphertext_self: row.get(5)?,
        timestamp: millis_to_datetime(6, ts_millis)?,
        status,
        plaintext: row.get(8)?,
        reply_to: reply_to.map(MessageId::new),
        reply_preview: row.get(10)?,
        edited: row.get(11)?,
        edit_count: row.get(12)?,
        reactions,
        attachment_ref: row.get(14)?,
        tx_id: row.get(15)?,
    })
}
