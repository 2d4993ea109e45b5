#![no_main]

use didcomm_sdk::message_type::MessageTypeIdentifier;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &str| {
    if let Ok(parsed) = MessageTypeIdentifier::parse(data) {
        let reparsed = MessageTypeIdentifier::parse(&parsed.to_string()).unwrap();
        assert_eq!(parsed, reparsed);
    }
});
