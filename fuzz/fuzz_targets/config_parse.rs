#![no_main]

use libfuzzer_sys::fuzz_target;
use owfenc::Config;

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };

    let mut config = Config::default();
    for option in text.lines() {
        if let Some((name, value)) = option.split_once('=') {
            let _ = config.parse(name, value);
        }
    }

    if let Ok(control) = config.validate() {
        assert!(control.num_states() >= 1);
        assert!(control.resolution.width % 2 == 0 && control.resolution.height % 2 == 0);
    }
});
