#![no_main]

use libfuzzer_sys::fuzz_target;
use swiftpage_core::{ResourceNamer, RewrittenUrl};

fuzz_target!(|data: &[u8]| {
    let Ok(s) = std::str::from_utf8(data) else {
        return;
    };

    // Leaves that decode must survive a re-encode unchanged
    if let Ok(namer) = ResourceNamer::decode(s, 32) {
        if let Ok(leaf) = namer.encode() {
            let again = ResourceNamer::decode(&leaf, 32).expect("re-encoded leaf must decode");
            assert_eq!(again, namer);
        }
    }

    // Full URLs, with a base and without
    let _ = RewrittenUrl::parse(s, 32, |id| id.len() == 2);
    let _ = RewrittenUrl::parse(&format!("http://test.com/{s}"), 32, |_| true)
        .map(|url| url.to_url());
});
