#![no_main]

use bytes::Bytes;
use libfuzzer_sys::fuzz_target;
use swiftpage_http::HttpValue;

fuzz_target!(|data: &[u8]| {
    let data = Bytes::copy_from_slice(data);
    let Ok(value) = HttpValue::decode(&data) else {
        return;
    };

    // Anything that decodes encodes back to an equivalent value
    let encoded = value.encode().expect("decoded value must encode");
    let again = HttpValue::decode(&encoded).expect("encoded value must decode");
    assert_eq!(again, value);
});
