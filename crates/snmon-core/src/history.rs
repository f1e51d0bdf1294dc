use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::model::{AlertId, AlertKind, AlertRecord, DeviceId, EmailStatus, InterfaceId, NewAlertRecord, UserAction};
use crate::store::{commit_with_retry, Repository, RetryPolicy, Session, StoreError};

const MAX_EMAIL_ERROR_CHARS: usize = 500;

/// Opens a record for a new occurrence. An occurrence that is already
/// open for the same kind, device and interface is returned instead.
pub fn open(session: &mut dyn Session, record: NewAlertRecord) -> Result<AlertRecord, StoreError> {
    if let Some(existing) = find_open(&*session, record.kind, record.device_id, record.interface_id)? {
        debug!(alert_id = existing.id, kind = %record.kind, "reusing open alert record");
        return Ok(existing);
    }
    session.insert_alert_record(record)
}

pub fn find_open(
    session: &dyn Session,
    kind: AlertKind,
    device: DeviceId,
    interface: Option<InterfaceId>,
) -> Result<Option<AlertRecord>, StoreError> {
    session.find_open_alert_record(kind, device, interface)
}

pub fn auto_clear(
    session: &mut dyn Session,
    kind: AlertKind,
    device: DeviceId,
    interface: Option<InterfaceId>,
    message: Option<&str>,
    at: DateTime<Utc>,
) -> Result<Option<AlertId>, StoreError> {
    let Some(mut record) = find_open(&*session, kind, device, interface)? else {
        return Ok(None);
    };

    record.action = Some(UserAction::AutoCleared);
    record.action_at = Some(at);
    record.action_by = None;
    record.action_notes = message.map(str::to_string);
    session.save_alert_record(&record)?;
    session.close_alert_record(record.id, at)?;
    Ok(Some(record.id))
}

pub fn record_user_action(
    session: &mut dyn Session,
    id: AlertId,
    action: UserAction,
    actor: &str,
    notes: Option<&str>,
    at: DateTime<Utc>,
) -> Result<AlertRecord, StoreError> {
    let mut record = session
        .get_alert_record(id)?
        .ok_or_else(|| StoreError::NotFound(format!("alert record {id}")))?;

    record.action = Some(action);
    record.action_at = Some(at);
    record.action_by = Some(actor.to_string());
    record.action_notes = notes.map(str::to_string);
    if action == UserAction::Resolved && record.cleared_at.is_none() {
        record.cleared_at = Some(at);
    }

    session.save_alert_record(&record)?;
    Ok(record)
}

/// Writes a delivery outcome back to each record. Runs after the
/// originating evaluation is gone, so it re-reads every record in its own
/// session. `error` is `None` on success.
pub async fn record_dispatch<R: Repository>(
    repo: &R,
    ids: &[AlertId],
    recipients: &[String],
    error: Option<&str>,
) -> Result<(), StoreError> {
    let mut session = repo.begin()?;
    let now = Utc::now();

    for id in ids {
        let Some(mut record) = session.get_alert_record(*id)? else {
            warn!(alert_id = id, "alert record vanished before dispatch was recorded");
            continue;
        };
        record.email_recipients = recipients.to_vec();
        match error {
            None => {
                record.email_status = EmailStatus::Success;
                record.email_sent_at = Some(now);
                record.email_error = None;
            }
            Some(error) => {
                record.email_status = EmailStatus::Failed;
                record.email_error = Some(error.chars().take(MAX_EMAIL_ERROR_CHARS).collect());
            }
        }
        session.save_alert_record(&record)?;
    }

    commit_with_retry(&mut session, &RetryPolicy::default()).await
}
