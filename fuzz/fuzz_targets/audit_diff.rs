#![no_main]

use libfuzzer_sys::fuzz_target;
use shipit_audit::diff;

fuzz_target!(|data: &[u8]| {
    let mut parts = data.splitn(2, |b| *b == 0);
    let (Some(a), Some(b)) = (parts.next(), parts.next()) else {
        return;
    };
    let (Ok(before), Ok(after)) = (
        serde_json::from_slice::<serde_json::Value>(a),
        serde_json::from_slice::<serde_json::Value>(b),
    ) else {
        return;
    };

    assert!(diff(&before, &before).is_empty());
    if !diff(&before, &after).is_empty() {
        assert_ne!(before, after);
    }
});
