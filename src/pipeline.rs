//! Normalized event -> resolved identity -> reconciled conversation -> media task.

use crate::db::{ConversationRecord, MediaState, MessageRecord};
use crate::error::{PipelineError, StoreError};
use crate::identity::{canonicalize, IdentityResolver, Resolution};
use crate::media::{MediaStabilizer, StabilizationOutcome};
use crate::reconcile::{MessageContext, Reconciler};
use crate::types::{Address, AddressKind, CanonicalAddress, EventKind, InboundEvent};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const MAX_RECONCILE_ATTEMPTS: u32 = 3;

#[derive(Debug)]
pub struct StoredMessage {
    pub conversation: ConversationRecord,
    pub message: MessageRecord,
    pub duplicate: bool,
    /// Background stabilization started for this delivery, if any.
    pub media_task: Option<JoinHandle<StabilizationOutcome>>,
}

#[derive(Debug)]
pub enum IngestOutcome {
    Stored(StoredMessage),
    ContactsApplied(usize),
    Ignored(&'static str),
}

pub struct Pipeline {
    reconciler: Arc<Reconciler>,
    stabilizer: Option<Arc<MediaStabilizer>>,
}

impl Pipeline {
    pub fn new(reconciler: Arc<Reconciler>, stabilizer: Option<Arc<MediaStabilizer>>) -> Self {
        Self {
            reconciler,
            stabilizer,
        }
    }

    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    pub fn stabilizer(&self) -> Option<&Arc<MediaStabilizer>> {
        self.stabilizer.as_ref()
    }

    fn resolver(&self) -> &IdentityResolver {
        self.reconciler.resolver()
    }

    pub async fn ingest(&self, event: InboundEvent) -> Result<IngestOutcome, PipelineError> {
        match event.kind {
            EventKind::MessageUpsert => self.ingest_message(&event).await,
            EventKind::ContactsUpdate => self.apply_contacts(&event).await,
            EventKind::PresenceUpdate | EventKind::ConnectionUpdate => {
                debug!(instance = %event.instance, kind = ?event.kind, "event carries nothing to store");
                Ok(IngestOutcome::Ignored("no-op event kind"))
            }
        }
    }

    async fn ingest_message(&self, event: &InboundEvent) -> Result<IngestOutcome, PipelineError> {
        let (Some(remote), Some(message)) = (event.remote_address.as_deref(), event.message.as_ref())
        else {
            return Ok(IngestOutcome::Ignored("message event without message"));
        };
        if Address::parse(remote).kind() == AddressKind::Broadcast {
            return Ok(IngestOutcome::Ignored("broadcast"));
        }

        let instance = event.instance.as_str();
        let mut last_conflict = String::new();
        for attempt in 1..=MAX_RECONCILE_ATTEMPTS {
            let resolution = self
                .resolver()
                .resolve(instance, remote, event.remote_alias.as_deref())
                .await;
            let context = MessageContext {
                sender: self.resolve_sender(event, &resolution).await,
                push_name: event.push_name.clone(),
                received_at: event.received_at,
            };

            match self
                .reconciler
                .reconcile(instance, &resolution, message, &context)
                .await
            {
                Ok(reconciled) => {
                    let media_task = self.start_media(&reconciled.message, reconciled.inserted);
                    return Ok(IngestOutcome::Stored(StoredMessage {
                        conversation: reconciled.conversation,
                        message: reconciled.message,
                        duplicate: !reconciled.inserted,
                        media_task,
                    }));
                }
                Err(StoreError::Conflict(reason)) => {
                    debug!(instance, attempt, external_id = %message.id, "reconcile conflict: {reason}");
                    last_conflict = reason;
                }
                Err(err) => return Err(err.into()),
            }
        }

        warn!(instance, external_id = %message.id, "reconcile retries exhausted: {last_conflict}");
        Err(PipelineError::RetriesExhausted {
            attempts: MAX_RECONCILE_ATTEMPTS,
            last: last_conflict,
        })
    }

    async fn apply_contacts(&self, event: &InboundEvent) -> Result<IngestOutcome, PipelineError> {
        let instance = event.instance.as_str();
        let mut applied = 0;
        for contact in &event.contacts {
            let mut outcome = None;
            for _ in 0..MAX_RECONCILE_ATTEMPTS {
                let resolution = self
                    .resolver()
                    .resolve(instance, &contact.address, contact.alias.as_deref())
                    .await;
                match self.reconciler.apply_contact(instance, &resolution, contact).await {
                    Err(StoreError::Conflict(_)) => continue,
                    other => {
                        outcome = Some(other?);
                        break;
                    }
                }
            }
            match outcome {
                Some(Some(_)) => applied += 1,
                Some(None) => {}
                None => warn!(
                    instance,
                    address = %contact.address,
                    "contact update dropped after {MAX_RECONCILE_ATTEMPTS} conflicting attempts"
                ),
            }
        }
        if applied > 0 {
            info!(instance, applied, "contact profiles updated");
        }
        Ok(IngestOutcome::ContactsApplied(applied))
    }

    /// The member in a group, the correspondent for inbound direct messages and the
    /// instance owner for outbound ones.
    async fn resolve_sender(
        &self,
        event: &InboundEvent,
        resolution: &Resolution,
    ) -> Option<CanonicalAddress> {
        let from_me = event.message.as_ref().is_some_and(|m| m.from_me);
        if resolution.canonical.is_group() {
            if from_me {
                return self.owner(event);
            }
            let participant = event.participant_address.as_deref()?;
            let sender = self
                .resolver()
                .resolve(&event.instance, participant, event.participant_alias.as_deref())
                .await;
            return Some(sender.canonical);
        }
        if from_me {
            self.owner(event)
        } else {
            Some(resolution.canonical.clone())
        }
    }

    fn owner(&self, event: &InboundEvent) -> Option<CanonicalAddress> {
        event
            .owner_address
            .as_deref()
            .map(|owner| canonicalize(&Address::parse(owner), self.resolver().format()))
    }

    fn start_media(
        &self,
        message: &MessageRecord,
        inserted: bool,
    ) -> Option<JoinHandle<StabilizationOutcome>> {
        let stabilizer = self.stabilizer.as_ref()?;
        let wanted = match message.media_state {
            MediaState::Pending => inserted,
            // A redelivery is a fresh chance for media that failed before.
            MediaState::Failed => true,
            MediaState::None | MediaState::Stabilized => false,
        };
        wanted.then(|| stabilizer.spawn(message.clone()))
    }
}
