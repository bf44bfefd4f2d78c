use bytes::Bytes;

use super::document::{Inbox, Invitation};
use super::store::ProfileStore;
use crate::codec::BlockEncoded;
use crate::crypto::PublicKey;
use crate::dht::{DhtKey, Version};
use crate::error::SyncError;

// Inboxes are unprotected so any user can drop an invitation in; every
// change is a compare-and-swap on the whole list.
impl ProfileStore {
    /// The identity public key `user_id` published at registration
    pub async fn lookup_public_key(&self, user_id: &str) -> Result<PublicKey, SyncError> {
        let key = DhtKey::public_key(user_id);
        let entry = self
            .retry()
            .run("get public key", || self.dht().get(&key))
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("user {} is not registered", user_id)))?;
        Ok(PublicKey::try_from(&entry.value[..])?)
    }

    /// Pending invitations addressed to this user
    pub async fn read_inbox(&self) -> Result<Inbox, SyncError> {
        Ok(self.load_inbox(self.user_id()).await?.0)
    }

    /// False when the same invitation was already pending
    pub async fn post_invitation(
        &self,
        recipient: &str,
        invitation: Invitation,
    ) -> Result<bool, SyncError> {
        self.update_inbox(recipient, |inbox| {
            if inbox.invitations.contains(&invitation) {
                return false;
            }
            inbox.invitations.push(invitation.clone());
            true
        })
        .await
    }

    pub async fn withdraw_invitation(
        &self,
        recipient: &str,
        invitation: &Invitation,
    ) -> Result<(), SyncError> {
        self.update_inbox(recipient, |inbox| {
            let before = inbox.invitations.len();
            inbox.invitations.retain(|pending| pending != invitation);
            inbox.invitations.len() != before
        })
        .await?;
        Ok(())
    }

    /// Drop `handled` from this user's inbox, keeping anything that arrived since
    pub async fn clear_invitations(&self, handled: &[Invitation]) -> Result<(), SyncError> {
        let user_id = self.user_id().to_string();
        self.update_inbox(&user_id, |inbox| {
            let before = inbox.invitations.len();
            inbox.invitations.retain(|pending| !handled.contains(pending));
            inbox.invitations.len() != before
        })
        .await?;
        Ok(())
    }

    async fn load_inbox(&self, user_id: &str) -> Result<(Inbox, Version), SyncError> {
        let key = DhtKey::inbox(user_id);
        match self
            .retry()
            .run("get inbox", || self.dht().get(&key))
            .await?
        {
            Some(entry) => Ok((Inbox::decode(&entry.value)?, entry.version)),
            None => Ok((Inbox::default(), Version::ZERO)),
        }
    }

    /// `edit` returns whether it changed anything; unchanged inboxes are not written
    async fn update_inbox<F>(&self, user_id: &str, mut edit: F) -> Result<bool, SyncError>
    where
        F: FnMut(&mut Inbox) -> bool + Send,
    {
        let key = DhtKey::inbox(user_id);
        let attempts = self.config().max_commit_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let (mut inbox, base) = self.load_inbox(user_id).await?;
            if !edit(&mut inbox) {
                return Ok(false);
            }
            let value = Bytes::from(inbox.encode()?);
            let result = self
                .retry()
                .run("put inbox", || self.dht().put(&key, base, value.clone(), None))
                .await;
            match result {
                Ok(_) => return Ok(true),
                Err(err) => {
                    let err = SyncError::from(err);
                    if !err.is_conflict() || attempt >= attempts {
                        return Err(err);
                    }
                    tracing::debug!("inbox of {} moved under us, retrying", user_id);
                }
            }
        }
    }
}
