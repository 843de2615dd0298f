#![no_main]

use libfuzzer_sys::fuzz_target;
use swiftpage_rewrite::html::Lexer;

fuzz_target!(|data: &[u8]| {
    if data.is_empty() {
        return;
    }

    // First byte picks the chunk size so split points move around
    let chunk_size = usize::from(data[0]).max(1);
    let document = &data[1..];

    let mut lexer = Lexer::new();
    let mut out = Vec::with_capacity(document.len());
    for chunk in document.chunks(chunk_size) {
        for token in lexer.feed(chunk) {
            token.write_to(&mut out);
        }
    }
    for token in lexer.finish() {
        token.write_to(&mut out);
    }

    // Unmodified tokens reproduce the input byte for byte
    assert_eq!(out, document);
});
