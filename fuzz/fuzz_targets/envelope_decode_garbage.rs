#![no_main]

use didcomm_sdk::{
    PlaintextMessage,
    crypto::{EncryptedEnvelope, WireFormat, detect},
};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    match detect(data) {
        WireFormat::Encrypted(envelope) => {
            let encoded = envelope.to_json().unwrap();
            let decoded = EncryptedEnvelope::from_json(&encoded).unwrap();
            assert_eq!(envelope.to_json().unwrap(), decoded.to_json().unwrap());
        }
        WireFormat::Plaintext(message) => {
            let _ = message.parsed_type();
            let _ = message.thread_id();
            let encoded = message.to_json().unwrap();
            PlaintextMessage::from_json(&encoded).unwrap();
        }
        WireFormat::Unknown => {
            // garbage is expected; we're looking for panics
        }
    }
});
