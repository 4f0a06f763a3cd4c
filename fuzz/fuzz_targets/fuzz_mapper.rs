//! Fuzz target for the change mapper.
//!
//! Any raw event that deserializes must map without panicking, and whatever
//! comes out must satisfy the op/before/after shape rule.

#![no_main]

use cdc_reactivator::mapper::{ChangeMapper, RawEvent};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(event) = serde_json::from_slice::<RawEvent>(data) else {
        return;
    };

    let mapper = ChangeMapper::new();
    if let Ok(Some(change)) = mapper.map(&event, 1_700_000_000_000) {
        let notification = change.into_notification(1, "fuzz", "p0", None);
        assert!(notification.validate().is_ok());
    }

    // Event Hub bodies are free text; feed the raw bytes through one too.
    if let Ok(body) = std::str::from_utf8(data) {
        let hub = RawEvent::EventHub {
            partition: "0".into(),
            sequence_number: 0,
            enqueued_time_ms: 0,
            body: body.to_string(),
            properties: Default::default(),
        };
        let _ = mapper.map(&hub, 0);
    }
});
