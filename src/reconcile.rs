//! Find-or-create of conversations, message persistence and merge-on-discovery.
//!
//! Every write for a canonical address happens while holding that address's entry in
//! [`KeyedLocks`]. A merge holds both the alias key and the stable key, taken in sorted
//! order so two merges can never wait on each other.

use crate::db::{ConversationRecord, ConversationStore, MessageRecord, NewConversation, NewMessage};
use crate::error::StoreError;
use crate::identity::{IdentityResolver, Resolution};
use crate::types::{AddressKind, CanonicalAddress, ContactUpdate, InboundMessage};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info};

#[derive(Default)]
pub struct KeyedLocks {
    inner: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Locks every key, deduplicated and in sorted order.
    ///
    /// The guard is built up as keys are taken, so dropping this future part way
    /// still releases and prunes whatever it had registered.
    pub async fn lock_all(&self, mut keys: Vec<String>) -> KeyedGuard<'_> {
        keys.sort();
        keys.dedup();
        let mut guard = KeyedGuard {
            locks: self,
            keys: Vec::with_capacity(keys.len()),
            guards: Vec::with_capacity(keys.len()),
        };
        for key in keys {
            let lock = {
                let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
                Arc::clone(map.entry(key.clone()).or_default())
            };
            guard.keys.push(key);
            let owned = lock.lock_owned().await;
            guard.guards.push(owned);
        }
        guard
    }

    /// Number of keys currently held or waited on.
    pub fn active(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

pub struct KeyedGuard<'a> {
    locks: &'a KeyedLocks,
    keys: Vec<String>,
    guards: Vec<OwnedMutexGuard<()>>,
}

impl Drop for KeyedGuard<'_> {
    fn drop(&mut self) {
        self.guards.clear();
        let mut map = self.locks.inner.lock().unwrap_or_else(|e| e.into_inner());
        for key in &self.keys {
            // Only the map holds it: nobody is waiting.
            if map.get(key).is_some_and(|lock| Arc::strong_count(lock) == 1) {
                map.remove(key);
            }
        }
    }
}

pub fn lock_key(instance: &str, address: &CanonicalAddress) -> String {
    format!("{instance}\u{1f}{address}")
}

/// Per-event data that is not part of the message itself.
#[derive(Debug, Clone)]
pub struct MessageContext {
    pub sender: Option<CanonicalAddress>,
    pub push_name: Option<String>,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct Reconciled {
    pub conversation: ConversationRecord,
    pub message: MessageRecord,
    /// False when the message id was already stored.
    pub inserted: bool,
}

pub struct Reconciler {
    store: Arc<dyn ConversationStore>,
    resolver: IdentityResolver,
    locks: KeyedLocks,
}

impl Reconciler {
    pub fn new(store: Arc<dyn ConversationStore>, resolver: IdentityResolver) -> Self {
        Self {
            store,
            resolver,
            locks: KeyedLocks::new(),
        }
    }

    pub fn resolver(&self) -> &IdentityResolver {
        &self.resolver
    }

    pub fn locks(&self) -> &KeyedLocks {
        &self.locks
    }

    /// Stores one message under the conversation for `resolution.canonical`.
    ///
    /// Returns [`StoreError::Conflict`] when a concurrent event invalidated the
    /// resolution; the caller resolves again and retries.
    pub async fn reconcile(
        &self,
        instance: &str,
        resolution: &Resolution,
        message: &InboundMessage,
        context: &MessageContext,
    ) -> Result<Reconciled, StoreError> {
        let canonical = &resolution.canonical;
        let _guard = self.lock_for(instance, canonical, resolution.linked_alias.as_ref()).await;
        self.ensure_still_canonical(instance, canonical).await?;

        if let Some(alias) = resolution.linked_alias.as_ref() {
            self.absorb_alias(instance, alias, canonical).await?;
        }

        let display_name = context
            .push_name
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty() && !message.from_me && !canonical.is_group());
        let conversation = self
            .find_or_create(instance, canonical, display_name)
            .await?;

        let media = message.media.as_ref();
        let unread_delta = if message.from_me { 0 } else { 1 };
        let insert = self
            .store
            .record_message(
                &NewMessage {
                    conversation_id: conversation.id.clone(),
                    instance: instance.to_string(),
                    external_id: message.id.clone(),
                    from_me: message.from_me,
                    kind: message.kind,
                    sender_address: context.sender.as_ref().map(|s| s.to_string()),
                    content: message.text.clone(),
                    media_url: media.and_then(|m| m.url.clone()),
                    media_mime: media.and_then(|m| m.mime_type.clone()),
                    media_key: media.and_then(|m| m.media_key.clone()),
                    media_direct_path: media.and_then(|m| m.direct_path.clone()),
                    timestamp: message.timestamp.unwrap_or(context.received_at),
                },
                unread_delta,
            )
            .await?;

        let inserted = !insert.is_duplicate();
        if !inserted {
            debug!(instance, external_id = %message.id, "duplicate delivery ignored");
        }
        if conversation.display_name.is_none() && display_name.is_some() {
            self.store
                .update_conversation_profile(&conversation.id, display_name, None)
                .await?;
        }

        let conversation = self
            .store
            .find_conversation(instance, canonical)
            .await?
            .ok_or_else(|| StoreError::Conflict(format!("conversation {canonical} vanished")))?;
        Ok(Reconciled {
            conversation,
            message: insert.into_record(),
            inserted,
        })
    }

    /// Applies a contact profile update to an existing conversation. Never creates one.
    pub async fn apply_contact(
        &self,
        instance: &str,
        resolution: &Resolution,
        contact: &ContactUpdate,
    ) -> Result<Option<ConversationRecord>, StoreError> {
        let canonical = &resolution.canonical;
        let _guard = self.lock_for(instance, canonical, resolution.linked_alias.as_ref()).await;
        self.ensure_still_canonical(instance, canonical).await?;

        if let Some(alias) = resolution.linked_alias.as_ref() {
            self.absorb_alias(instance, alias, canonical).await?;
        }

        let Some(conversation) = self.store.find_conversation(instance, canonical).await? else {
            return Ok(None);
        };
        let name = contact.display_name.as_deref().filter(|n| !n.trim().is_empty());
        let avatar = contact.avatar_url.as_deref().filter(|a| !a.trim().is_empty());
        if name.is_none() && avatar.is_none() {
            return Ok(Some(conversation));
        }
        self.store
            .update_conversation_profile(&conversation.id, name, avatar)
            .await?;
        self.store.find_conversation(instance, canonical).await
    }

    /// Folds the conversation keyed by `alias` into the one keyed by `stable`.
    pub async fn link_identities(
        &self,
        instance: &str,
        alias: &CanonicalAddress,
        stable: &CanonicalAddress,
    ) -> Result<Option<ConversationRecord>, StoreError> {
        let _guard = self.lock_for(instance, stable, Some(alias)).await;
        self.absorb_alias(instance, alias, stable).await
    }

    /// Replays every learned alias mapping of `instance` through [`Self::link_identities`].
    /// Returns how many alias conversations were folded.
    pub async fn backfill_aliases(&self, instance: &str) -> Result<usize, StoreError> {
        let mut folded = 0;
        for record in self.store.list_aliases(instance).await? {
            let alias = CanonicalAddress::new(record.alias);
            let stable = CanonicalAddress::new(record.stable);
            if self.link_identities(instance, &alias, &stable).await?.is_some() {
                folded += 1;
            }
        }
        if folded > 0 {
            info!(instance, folded, "alias backfill folded conversations");
        }
        Ok(folded)
    }

    async fn lock_for(
        &self,
        instance: &str,
        canonical: &CanonicalAddress,
        alias: Option<&CanonicalAddress>,
    ) -> KeyedGuard<'_> {
        let mut keys = vec![lock_key(instance, canonical)];
        if let Some(alias) = alias {
            keys.push(lock_key(instance, alias));
        }
        self.locks.lock_all(keys).await
    }

    /// An opaque address may have been linked to a stable one after it was resolved.
    async fn ensure_still_canonical(
        &self,
        instance: &str,
        canonical: &CanonicalAddress,
    ) -> Result<(), StoreError> {
        if canonical.kind() != AddressKind::OpaqueAlias {
            return Ok(());
        }
        match self.resolver.lookup_alias(instance, canonical).await {
            Ok(Some(stable)) if &stable != canonical => Err(StoreError::Conflict(format!(
                "{canonical} was linked to {stable} concurrently"
            ))),
            _ => Ok(()),
        }
    }

    /// Must run with both keys locked.
    async fn absorb_alias(
        &self,
        instance: &str,
        alias: &CanonicalAddress,
        stable: &CanonicalAddress,
    ) -> Result<Option<ConversationRecord>, StoreError> {
        if alias == stable {
            return Ok(None);
        }
        let Some(loser) = self.store.find_conversation(instance, alias).await? else {
            return Ok(None);
        };
        match self.store.find_conversation(instance, stable).await? {
            Some(winner) => {
                info!(instance, alias = %alias, stable = %stable, "merging alias conversation");
                self.store
                    .merge_conversations(&loser.id, &winner.id)
                    .await
                    .map(Some)
            }
            None => {
                info!(instance, alias = %alias, stable = %stable, "re-keying alias conversation");
                self.store.rekey_conversation(&loser.id, stable).await.map(Some)
            }
        }
    }

    async fn find_or_create(
        &self,
        instance: &str,
        canonical: &CanonicalAddress,
        display_name: Option<&str>,
    ) -> Result<ConversationRecord, StoreError> {
        if let Some(existing) = self.store.find_conversation(instance, canonical).await? {
            return Ok(existing);
        }
        let created = self
            .store
            .create_conversation(&NewConversation {
                instance: instance.to_string(),
                canonical_address: canonical.clone(),
                display_name: display_name.map(str::to_string),
            })
            .await?;
        debug!(instance, canonical = %canonical, conversation_id = %created.id, "conversation ready");
        Ok(created)
    }
}
