//! CRUD operations for persisted [`Group`] rosters.
//!
//! Groups survive server restarts; the directory loads them all at startup
//! and writes back on every membership mutation.

use chrono::{DateTime, Utc};
use rusqlite::params;
use std::collections::BTreeSet;

use palaver_shared::{Group, GroupId, UserId};

use crate::database::Database;
use crate::error::{Result, StoreError};

impl Database {
    /// Insert or replace a group together with its member set.
    pub fn save_group(&self, group: &Group) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT OR REPLACE INTO groups (id, name, creator, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                group.id.as_str(),
                group.name,
                group.creator.to_hex(),
                group.created_at.to_rfc3339(),
            ],
        )?;

        tx.execute(
            "DELETE FROM group_members WHERE group_id = ?1",
            params![group.id.as_str()],
        )?;
        for member in &group.members {
            tx.execute(
                "INSERT INTO group_members (group_id, user_id) VALUES (?1, ?2)",
                params![group.id.as_str(), member.to_hex()],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    /// Load every persisted group with its members.
    pub fn load_groups(&self) -> Result<Vec<Group>> {
        let conn = self.conn();

        let mut stmt = conn.prepare(
            "SELECT id, name, creator, created_at FROM groups ORDER BY created_at ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            let id: String = row.get(0)?;
            let name: String = row.get(1)?;
            let creator: String = row.get(2)?;
            let created: String = row.get(3)?;
            Ok((id, name, creator, created))
        })?;

        let mut groups = Vec::new();
        for row in rows {
            let (id, name, creator_hex, created_str) = row?;

            let creator = UserId::from_hex(&creator_hex)?;
            let created_at: DateTime<Utc> = DateTime::parse_from_rfc3339(&created_str)
                .map(|dt| dt.with_timezone(&Utc))?;

            let mut member_stmt =
                conn.prepare("SELECT user_id FROM group_members WHERE group_id = ?1")?;
            let member_rows = member_stmt.query_map(params![id], |row| row.get::<_, String>(0))?;

            let mut members = BTreeSet::new();
            for member in member_rows {
                members.insert(UserId::from_hex(&member?)?);
            }

            groups.push(Group {
                id: GroupId(id),
                name,
                creator,
                members,
                created_at,
            });
        }
        Ok(groups)
    }

    /// Delete a group. Members go with it (ON DELETE CASCADE).
    /// Returns `true` if a row was deleted.
    pub fn delete_group(&self, id: &GroupId) -> Result<bool> {
        let affected = self
            .conn()
            .execute("DELETE FROM groups WHERE id = ?1", params![id.as_str()])?;
        Ok(affected > 0)
    }

    /// Fetch a single group by id.
    pub fn get_group(&self, id: &GroupId) -> Result<Group> {
        self.load_groups()?
            .into_iter()
            .find(|g| &g.id == id)
            .ok_or(StoreError::NotFound)
    }
}
