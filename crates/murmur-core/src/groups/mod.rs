//! Group key management.
//!
//! Every group holds a random 32-byte symmetric key with a monotonic
//! version. The key is sealed to each member's registered public key; the
//! node stores only sealed copies alongside the current key. Admission,
//! eviction, and rotation are admin-gated, and every multi-row mutation
//! runs in a single transaction so member key versions can never diverge
//! from the group's.

use crate::crypto::{random_bytes, sealed, sign, X25519PublicKey};
use crate::error::{Error, Result};
use crate::storage::{Database, GroupRecord, MemberRecord};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

/// Admin role name.
pub const ROLE_ADMIN: &str = "admin";
/// Regular member role name.
pub const ROLE_MEMBER: &str = "member";

/// Group management service.
pub struct GroupService {
    db: Arc<Mutex<Database>>,
}

impl GroupService {
    /// Create the service.
    pub fn new(db: Arc<Mutex<Database>>) -> Self {
        Self { db }
    }

    /// Create a group with the creator as its sole admin.
    ///
    /// Group row and creator member row are inserted in one transaction;
    /// the fresh group key is sealed to the creator's public key.
    pub async fn create_group(
        &self,
        creator_id: &str,
        name: &str,
        creator_public_key: &[u8],
    ) -> Result<GroupRecord> {
        let group_id = uuid::Uuid::now_v7().to_string();
        let group_key: [u8; 32] = random_bytes();
        let sealed_key = sealed::wrap_key(&group_key, &parse_member_key(creator_public_key)?)?;

        {
            let mut db = self.db.lock().await;
            db.create_group(&group_id, name, creator_id, &group_key, &sealed_key)?;
        }

        info!(%group_id, creator = creator_id, "created group");
        Ok(GroupRecord {
            id: group_id,
            name: name.to_string(),
            creator_id: creator_id.to_string(),
            created_at: chrono::Utc::now().timestamp(),
            key_version: 1,
            member_count: 1,
            encrypted_key: Some(sealed_key),
        })
    }

    /// Add a member, sealing the current group key to their public key.
    ///
    /// Admin-only. Re-adding an existing member is a no-op success.
    pub async fn add_member(
        &self,
        group_id: &str,
        user_id: &str,
        adder_id: &str,
        user_public_key: &[u8],
    ) -> Result<()> {
        let member_key = parse_member_key(user_public_key)?;

        let db = self.db.lock().await;
        match db.member_role(group_id, adder_id)? {
            Some(role) if role == ROLE_ADMIN => {}
            Some(_) => return Err(Error::NotAuthorized),
            None => return Err(Error::NotMember),
        }

        let (group_key, key_version) = db
            .group_key(group_id)?
            .ok_or_else(|| Error::Storage("group not found".into()))?;
        let group_key: [u8; 32] = group_key
            .try_into()
            .map_err(|_| Error::Internal("stored group key length".into()))?;

        let sealed_key = sealed::wrap_key(&group_key, &member_key)?;
        let inserted = db.insert_member(group_id, user_id, ROLE_MEMBER, &sealed_key, key_version)?;
        if inserted {
            info!(%group_id, member = user_id, "added group member");
        }
        Ok(())
    }

    /// Remove a member.
    ///
    /// Allowed for admins and for the member themselves (self-leave). An
    /// admin evicting someone else rotates the group key afterwards so
    /// the evicted member's sealed copy stops matching the live key.
    pub async fn remove_member(
        &self,
        group_id: &str,
        user_id: &str,
        remover_id: &str,
    ) -> Result<()> {
        let rotate_after = {
            let db = self.db.lock().await;
            let role = db
                .member_role(group_id, remover_id)?
                .ok_or(Error::NotMember)?;
            let self_leave = remover_id == user_id;
            if role != ROLE_ADMIN && !self_leave {
                return Err(Error::NotAuthorized);
            }

            if !db.delete_member(group_id, user_id)? {
                return Err(Error::NotMember);
            }
            info!(%group_id, member = user_id, "removed group member");

            role == ROLE_ADMIN && !self_leave
        };

        if rotate_after {
            self.rotate_group_key(group_id, remover_id).await?;
        }
        Ok(())
    }

    /// Rotate the group key.
    ///
    /// Admin-only. Generates a fresh key, bumps the version, and re-seals
    /// it to every remaining member in one transaction.
    pub async fn rotate_group_key(&self, group_id: &str, initiator_id: &str) -> Result<i64> {
        let mut db = self.db.lock().await;
        match db.member_role(group_id, initiator_id)? {
            Some(role) if role == ROLE_ADMIN => {}
            Some(_) => return Err(Error::NotAuthorized),
            None => return Err(Error::NotMember),
        }

        let new_key: [u8; 32] = random_bytes();
        let members = db.members_with_public_keys(group_id)?;
        let mut sealed_keys = Vec::with_capacity(members.len());
        for (member_id, public_key) in members {
            let sealed_key = sealed::wrap_key(&new_key, &parse_member_key(&public_key)?)?;
            sealed_keys.push((member_id, sealed_key));
        }

        let version = db.rotate_group_key(group_id, &new_key, &sealed_keys)?;
        info!(%group_id, version, "rotated group key");
        Ok(version)
    }

    /// Groups the user belongs to, each carrying the key sealed to them.
    pub async fn get_user_groups(&self, user_id: &str) -> Result<Vec<GroupRecord>> {
        self.db.lock().await.user_groups(user_id)
    }

    /// Members of a group. The requester must be a member.
    pub async fn get_group_members(
        &self,
        group_id: &str,
        requester_id: &str,
    ) -> Result<Vec<MemberRecord>> {
        let db = self.db.lock().await;
        if db.member_role(group_id, requester_id)?.is_none() {
            return Err(Error::NotMember);
        }
        db.group_members(group_id)
    }
}

/// Registered identity keys are Ed25519; sealing runs over their X25519
/// (Montgomery) form.
fn parse_member_key(public_key: &[u8]) -> Result<X25519PublicKey> {
    Ok(X25519PublicKey::from_bytes(sign::agreement_public_key(
        public_key,
    )?))
}
