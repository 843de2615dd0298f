#![no_main]

use libfuzzer_sys::fuzz_target;
use swiftpage_http::{compute_caching, names, parse_http_date, ResponseHeaders};

fuzz_target!(|data: &[u8]| {
    let Ok(s) = std::str::from_utf8(data) else {
        return;
    };

    let _ = parse_http_date(s);

    let mut headers = ResponseHeaders::ok("text/html");
    headers.set(names::CACHE_CONTROL, s);
    headers.set(names::EXPIRES, s);
    headers.set(names::DATE, "Mon, 05 Apr 2010 18:51:26 GMT");
    let info = compute_caching(&headers, 300_000, 1_270_493_486_000);
    let _ = info.is_fresh(1_270_493_486_000);
});
