#![no_main]

use ember::collapsed;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let line = String::from_utf8_lossy(data);
    if let Ok(record) = collapsed::parse_line(&line) {
        // formatting normalizes, after which a line must come back unchanged
        let formatted = collapsed::format_record(&record);
        let reparsed = collapsed::parse_line(&formatted).expect("formatted line parses");
        assert_eq!(collapsed::format_record(&reparsed), formatted);
    }
});
