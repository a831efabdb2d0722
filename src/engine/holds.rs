use tracing::debug;

use crate::clock::Ms;
use crate::limits::MAX_HOLDER_LEN;
use crate::model::*;
use crate::observability;

use super::{Engine, ReservationError};

pub(super) fn validate_holder(holder_id: &str) -> Result<(), ReservationError> {
    if holder_id.trim().is_empty() {
        return Err(ReservationError::invalid("holder id must not be empty"));
    }
    if holder_id.len() > MAX_HOLDER_LEN {
        return Err(ReservationError::invalid("holder id too long"));
    }
    Ok(())
}

/// Commit-time check on a locked slot: `holder_id` must still hold it.
pub(super) fn verify_hold(slot: &SlotState, holder_id: &str, now: Ms) -> Result<(), ReservationError> {
    let id = slot.instance.id;
    match &slot.hold {
        Some(h) if h.holder_id == holder_id && h.is_active(now) => Ok(()),
        Some(h) if h.is_active(now) => Err(ReservationError::SlotHeldByOther {
            instance_id: id,
            expires_at: h.expires_at,
        }),
        _ => Err(ReservationError::ExpiredHold(id)),
    }
}

impl Engine {
    /// Claim `instance_id` for `holder_id` for one TTL. The same holder re-acquiring
    /// before expiry renews the hold. Check-and-write happens under the slot's
    /// write lock, so two callers can never both observe "no active hold".
    pub async fn acquire_hold(
        &self,
        instance_id: InstanceId,
        holder_id: &str,
    ) -> Result<Hold, ReservationError> {
        validate_holder(holder_id)?;
        let slot = self.slot(&instance_id)?;
        let mut guard = slot.write().await;
        let now = self.now();

        if guard.instance.is_full() {
            metrics::counter!(observability::HOLDS_REJECTED_TOTAL, "kind" => "SlotUnavailable")
                .increment(1);
            return Err(ReservationError::SlotUnavailable(instance_id));
        }

        let renewal = match guard.active_hold(now) {
            Some(h) if h.holder_id != holder_id => {
                metrics::counter!(observability::HOLDS_REJECTED_TOTAL, "kind" => "SlotHeldByOther")
                    .increment(1);
                return Err(ReservationError::SlotHeldByOther {
                    instance_id,
                    expires_at: h.expires_at,
                });
            }
            Some(_) => true,
            None => false,
        };

        let hold = Hold {
            session_instance_id: instance_id,
            holder_id: holder_id.to_string(),
            acquired_at: now,
            expires_at: now + self.policy.hold_ttl_ms,
        };
        let event = Event::HoldAcquired {
            session_instance_id: instance_id,
            holder_id: hold.holder_id.clone(),
            acquired_at: hold.acquired_at,
            expires_at: hold.expires_at,
        };
        self.persist_and_apply(&mut guard, &event).await?;

        let label = if renewal { "renewed" } else { "acquired" };
        metrics::counter!(observability::HOLDS_ACQUIRED_TOTAL, "mode" => label).increment(1);
        debug!("hold {label} on {instance_id} by {holder_id} until {}", hold.expires_at);
        Ok(hold)
    }

    /// Give up a hold. Releasing an expired or absent hold is a no-op; releasing
    /// someone else's active hold fails with `NotHolder` and leaves it untouched.
    pub async fn release_hold(
        &self,
        instance_id: InstanceId,
        holder_id: &str,
    ) -> Result<(), ReservationError> {
        let slot = self.slot(&instance_id)?;
        let mut guard = slot.write().await;
        let now = self.now();

        let Some(stale) = guard.hold.clone() else {
            return Ok(());
        };
        let expired = !stale.is_active(now);
        if !expired && stale.holder_id != holder_id {
            return Err(ReservationError::NotHolder(instance_id));
        }

        let event = Event::HoldReleased {
            session_instance_id: instance_id,
            holder_id: stale.holder_id,
            expired,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        if !expired {
            metrics::counter!(observability::HOLDS_RELEASED_TOTAL).increment(1);
            debug!("hold on {instance_id} released by {holder_id}");
        }
        Ok(())
    }

    /// The active hold on an instance, if any. Expired records read as absent.
    pub async fn get_hold(&self, instance_id: InstanceId) -> Result<Option<Hold>, ReservationError> {
        let slot = self.slot(&instance_id)?;
        let guard = slot.read().await;
        Ok(guard.active_hold(self.now()).cloned())
    }

    /// Instances whose hold record has lapsed. Contended slots are skipped this round.
    pub fn collect_expired_holds(&self, now: Ms) -> Vec<InstanceId> {
        let mut expired = Vec::new();
        for entry in self.slots.iter() {
            if let Ok(guard) = entry.value().try_read()
                && guard.hold.as_ref().is_some_and(|h| !h.is_active(now))
            {
                expired.push(guard.instance.id);
            }
        }
        expired
    }

    /// Drop a lapsed hold record. Re-checks under the write lock, so a hold renewed
    /// or re-acquired since `collect_expired_holds` is left alone. Returns whether
    /// anything was purged.
    pub async fn purge_expired_hold(&self, instance_id: InstanceId) -> Result<bool, ReservationError> {
        let slot = self.slot(&instance_id)?;
        let mut guard = slot.write().await;
        let now = self.now();
        let Some(hold) = guard.hold.clone() else {
            return Ok(false);
        };
        if hold.is_active(now) {
            return Ok(false);
        }
        let event = Event::HoldReleased {
            session_instance_id: instance_id,
            holder_id: hold.holder_id,
            expired: true,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(true)
    }
}
