//! Fuzz target for wire-level model types.
//!
//! Notifications, entities, and subscription requests arrive as JSON from
//! outside the process. Parsing must never panic, and a notification that
//! parses and validates must survive re-serialization unchanged.

#![no_main]

use cdc_reactivator::model::{ChangeNotification, EntityState, SubscriptionRequest};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(notification) = serde_json::from_slice::<ChangeNotification>(data) {
        if notification.validate().is_ok() {
            let encoded = serde_json::to_vec(&notification).unwrap();
            let decoded: ChangeNotification = serde_json::from_slice(&encoded).unwrap();
            assert_eq!(decoded, notification);
        }
    }

    if let Ok(entity) = serde_json::from_slice::<EntityState>(data) {
        let _ = entity.id();
        let _ = entity.is_relation();
    }

    if let Ok(request) = serde_json::from_slice::<SubscriptionRequest>(data) {
        if request.validate().is_ok() {
            let _ = request.control_entity();
        }
    }
});
