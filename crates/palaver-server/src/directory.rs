//! Group directory.
//!
//! Maps group id to roster. Membership rules: adds are idempotent, the
//! creator is always a member and can never be removed by a leave, only the
//! creator may dissolve. Mutations are persisted through the store and
//! reloaded at startup; persistence failures are logged but never fail the
//! in-memory mutation (delivery must not depend on the disk).

use std::sync::Arc;

use dashmap::DashMap;

use palaver_shared::{Group, GroupId, UserId};
use palaver_store::Database;

use crate::error::ServerError;

pub const PUBLIC_ROOM_NAME: &str = "Public Room";

pub struct GroupDirectory {
    groups: DashMap<GroupId, Group>,
    db: Arc<Database>,
}

impl GroupDirectory {
    /// Create a directory backed by the given database: load every persisted
    /// group and ensure the well-known public room exists.
    pub fn load(db: Arc<Database>) -> Result<Self, ServerError> {
        let directory = Self {
            groups: DashMap::new(),
            db,
        };

        let persisted = directory.db.load_groups()?;
        let count = persisted.len();
        for group in persisted {
            directory.groups.insert(group.id.clone(), group);
        }
        tracing::info!(groups = count, "loaded persisted groups");

        if !directory.groups.contains_key(&GroupId::public()) {
            // The public room is owned by nobody in particular; a zeroed
            // creator id keeps the creator-irremovability rule vacuous.
            let room = Group {
                id: GroupId::public(),
                name: PUBLIC_ROOM_NAME.to_string(),
                creator: UserId([0u8; 32]),
                members: Default::default(),
                created_at: chrono::Utc::now(),
            };
            directory.persist(&room);
            directory.groups.insert(room.id.clone(), room);
            tracing::info!("created public room");
        }

        Ok(directory)
    }

    fn persist(&self, group: &Group) {
        if let Err(e) = self.db.save_group(group) {
            tracing::warn!(group = %group.id, error = %e, "failed to persist group");
        }
    }

    /// Create a group; the creator is automatically its first member.
    pub fn create(&self, name: &str, creator: UserId) -> Group {
        let group = Group::new(name, creator);
        self.persist(&group);
        self.groups.insert(group.id.clone(), group.clone());
        group
    }

    /// Idempotent add. Returns whether the member set actually changed.
    pub fn join(&self, group_id: &GroupId, user: UserId) -> Result<bool, ServerError> {
        let mut entry = self
            .groups
            .get_mut(group_id)
            .ok_or_else(|| ServerError::NotFound(format!("group {group_id}")))?;

        let changed = entry.members.insert(user);
        if changed {
            self.persist(&entry);
        }
        Ok(changed)
    }

    /// Remove a member. The creator cannot leave (dissolve instead);
    /// removing a non-member is a no-op success.
    pub fn leave(&self, group_id: &GroupId, user: &UserId) -> Result<(), ServerError> {
        let mut entry = self
            .groups
            .get_mut(group_id)
            .ok_or_else(|| ServerError::NotFound(format!("group {group_id}")))?;

        if &entry.creator == user {
            return Err(ServerError::Forbidden(
                "the creator cannot leave; dissolve the group instead".into(),
            ));
        }

        if entry.members.remove(user) {
            self.persist(&entry);
        }
        Ok(())
    }

    /// Remove a group entirely. Creator-only.
    pub fn dissolve(&self, group_id: &GroupId, requester: &UserId) -> Result<Group, ServerError> {
        let group = self
            .get(group_id)
            .ok_or_else(|| ServerError::NotFound(format!("group {group_id}")))?;

        if &group.creator != requester {
            return Err(ServerError::Forbidden(
                "only the creator may dissolve a group".into(),
            ));
        }

        self.groups.remove(group_id);
        if let Err(e) = self.db.delete_group(group_id) {
            tracing::warn!(group = %group_id, error = %e, "failed to delete persisted group");
        }
        Ok(group)
    }

    pub fn get(&self, group_id: &GroupId) -> Option<Group> {
        self.groups.get(group_id).map(|e| e.value().clone())
    }

    pub fn members_of(&self, group_id: &GroupId) -> Option<Vec<UserId>> {
        self.groups
            .get(group_id)
            .map(|e| e.members.iter().copied().collect())
    }

    pub fn is_member(&self, group_id: &GroupId, user: &UserId) -> bool {
        self.groups
            .get(group_id)
            .map(|e| e.is_member(user))
            .unwrap_or(false)
    }

    /// Groups the user belongs to, public room included.
    pub fn groups_for(&self, user: &UserId) -> Vec<Group> {
        self.groups
            .iter()
            .filter(|e| e.is_member(user))
            .map(|e| e.value().clone())
            .collect()
    }

    pub fn public_room(&self) -> Group {
        // Ensured at load time; missing only if dissolved by a bug.
        self.get(&GroupId::public())
            .expect("public room must exist")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_directory() -> (tempfile::TempDir, GroupDirectory) {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(Database::open_at(&dir.path().join("test.db")).unwrap());
        (dir, GroupDirectory::load(db).unwrap())
    }

    #[test]
    fn public_room_is_created_at_startup() {
        let (_dir, directory) = open_directory();
        let room = directory.public_room();
        assert_eq!(room.name, PUBLIC_ROOM_NAME);
        assert!(room.id.is_public());
    }

    #[test]
    fn join_is_idempotent() {
        let (_dir, directory) = open_directory();
        let alice = UserId::from_username("alice");
        let bob = UserId::from_username("bob");

        let group = directory.create("g", alice);
        assert!(directory.join(&group.id, bob).unwrap());
        assert!(!directory.join(&group.id, bob).unwrap());
        assert_eq!(directory.members_of(&group.id).unwrap().len(), 2);
    }

    #[test]
    fn creator_cannot_be_removed_by_leave() {
        let (_dir, directory) = open_directory();
        let alice = UserId::from_username("alice");

        let group = directory.create("g", alice);
        let err = directory.leave(&group.id, &alice).unwrap_err();
        assert!(matches!(err, ServerError::Forbidden(_)));
        assert!(directory.is_member(&group.id, &alice));
    }

    #[test]
    fn leaving_when_not_a_member_is_a_noop() {
        let (_dir, directory) = open_directory();
        let group = directory.create("g", UserId::from_username("alice"));
        directory
            .leave(&group.id, &UserId::from_username("stranger"))
            .unwrap();
    }

    #[test]
    fn only_creator_may_dissolve() {
        let (_dir, directory) = open_directory();
        let alice = UserId::from_username("alice");
        let bob = UserId::from_username("bob");

        let group = directory.create("g", alice);
        directory.join(&group.id, bob).unwrap();

        let err = directory.dissolve(&group.id, &bob).unwrap_err();
        assert!(matches!(err, ServerError::Forbidden(_)));
        assert!(directory.get(&group.id).is_some());

        directory.dissolve(&group.id, &alice).unwrap();
        assert!(directory.get(&group.id).is_none());
    }

    #[test]
    fn unknown_group_is_not_found() {
        let (_dir, directory) = open_directory();
        let ghost = GroupId::new();
        let err = directory
            .join(&ghost, UserId::from_username("alice"))
            .unwrap_err();
        assert!(matches!(err, ServerError::NotFound(_)));
    }

    #[test]
    fn groups_survive_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");
        let alice = UserId::from_username("alice");

        let group_id = {
            let db = Arc::new(Database::open_at(&path).unwrap());
            let directory = GroupDirectory::load(db).unwrap();
            let group = directory.create("persistent", alice);
            directory.join(&group.id, UserId::from_username("bob")).unwrap();
            group.id
        };

        let db = Arc::new(Database::open_at(&path).unwrap());
        let directory = GroupDirectory::load(db).unwrap();
        let reloaded = directory.get(&group_id).expect("group survives restart");
        assert_eq!(reloaded.members.len(), 2);
        assert_eq!(reloaded.creator, alice);
    }
}
