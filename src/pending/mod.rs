//! Payment data captured when a payment was initiated, waiting for the gateway to confirm it.
//!
//! Each row holds a full message. A row is *resolved* once a terminal notification has been
//! recorded against it; resolved rows are never returned by
//! [`PendingStore::fetch_message_by_gateway_order_id`] but stay around so duplicate deliveries
//! can be recognised.

use futures_util::future::BoxFuture;

use crate::{error::Error, message::Message};

pub mod memory;
pub mod sqlite;

/// Key carrying the row id of a fetched pending record. Stripped before the message is stored.
pub const PENDING_ID: &str = "pending_id";

pub trait PendingStore: Send + Sync + 'static {
    /// Most recent unresolved record for the pair, with [`PENDING_ID`] set.
    fn fetch_message_by_gateway_order_id<'a>(
        &'a self,
        gateway: &'a str,
        order_id: &'a str,
    ) -> BoxFuture<'a, Result<Option<Message>, Error>>;

    /// Inserts `message`, or updates the row named by its [`PENDING_ID`]. Returns the row id.
    fn store_message<'a>(&'a self, message: &'a Message) -> BoxFuture<'a, Result<i64, Error>>;

    /// Marks every unresolved record for the message's gateway and order id as resolved.
    fn delete_message<'a>(&'a self, message: &'a Message) -> BoxFuture<'a, Result<(), Error>>;

    /// Stores an already-resolved record for a payment that was recorded without ever having
    /// a pending record, so later deliveries of the same notification are recognised.
    fn mark_resolved<'a>(
        &'a self,
        message: &'a Message,
        date: i64,
    ) -> BoxFuture<'a, Result<(), Error>>;

    /// Whether a resolved record exists for the pair.
    fn has_resolved<'a>(
        &'a self,
        gateway: &'a str,
        order_id: &'a str,
    ) -> BoxFuture<'a, Result<bool, Error>>;

    /// Removes records for `gateway` dated before `before`, resolved or not.
    fn delete_old_messages<'a>(
        &'a self,
        before: i64,
        gateway: &'a str,
    ) -> BoxFuture<'a, Result<u64, Error>>;
}

/// Checks the fields every pending record must carry.
pub fn validate_pending(message: &Message) -> Result<(), Error> {
    if message.get_i64("date").is_none() {
        return Err(Error::invalid_message("pending message is missing a date"));
    }
    if message.gateway().is_none() {
        return Err(Error::invalid_message("pending message is missing a gateway"));
    }
    if message.gateway_txn_id().is_none() && message.order_id().is_none() {
        return Err(Error::invalid_message(
            "pending message needs a gateway_txn_id or an order_id",
        ));
    }
    Ok(())
}

/// The pair a resolved marker is keyed by.
fn marker_key(message: &Message) -> Result<(String, String), Error> {
    match (message.gateway(), message.order_id()) {
        (Some(gateway), Some(order_id)) => Ok((gateway, order_id)),
        _ => Err(Error::invalid_message(
            "cannot resolve a payment without gateway and order_id",
        )),
    }
}

/// Splits a message into the id to update, if any, and the body to persist.
fn prepare(message: &Message) -> Result<(Option<i64>, Message), Error> {
    validate_pending(message)?;

    let mut body = message.clone();
    let pending_id = body.remove(PENDING_ID).and_then(|id| id.as_i64());

    Ok((pending_id, body))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_validate_pending() {
        let ok = Message::try_from(json!({
            "date": 100,
            "gateway": "adyen",
            "gateway_txn_id": "PSP1",
        }))
        .unwrap();
        assert!(validate_pending(&ok).is_ok());

        let no_ids = Message::try_from(json!({ "date": 100, "gateway": "adyen" })).unwrap();
        assert!(validate_pending(&no_ids).is_err());

        let no_date = Message::try_from(json!({ "gateway": "adyen", "order_id": "1" })).unwrap();
        assert!(validate_pending(&no_date).is_err());
    }

    #[test]
    fn test_prepare_strips_pending_id() {
        let message = Message::try_from(json!({
            "date": 100,
            "gateway": "adyen",
            "order_id": "1",
            "pending_id": 7,
        }))
        .unwrap();

        let (id, body) = prepare(&message).unwrap();
        assert_eq!(id, Some(7));
        assert!(!body.contains_key(PENDING_ID));
    }
}
