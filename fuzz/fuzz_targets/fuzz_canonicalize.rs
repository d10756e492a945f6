#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let text = String::from_utf8_lossy(data);
    let once = cw_canon::canonicalize(&text);
    let twice = cw_canon::canonicalize(&once);
    assert_eq!(once, twice);

    let quote = cw_canon::normalize_quote(&text);
    assert_eq!(quote, cw_canon::normalize_quote(&quote));

    let id = cw_canon::CanonicalId::of(&text);
    assert_eq!(id.as_str().len(), 64);
});
