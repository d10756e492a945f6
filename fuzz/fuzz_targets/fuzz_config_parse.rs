#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    if let Ok(config) = cw_model::Config::from_json(text) {
        // Anything that parses must survive its own validation.
        config.validate().expect("parsed configs are valid");
    }
});
