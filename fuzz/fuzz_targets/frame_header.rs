#![no_main]

use libfuzzer_sys::fuzz_target;
use owfenc::syntax::parse_sequence_header;
use owfenc::syntax::split_frame;

fuzz_target!(|data: &[u8]| {
    let _ = parse_sequence_header(data);

    if let Ok((header, rows)) = split_frame(data) {
        assert_eq!(rows.len(), header.num_rows as usize);
    }
});
