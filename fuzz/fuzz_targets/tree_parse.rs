#![no_main]

use libfuzzer_sys::fuzz_target;
use shipit::diff::TreeDiff;
use shipit::plan::Plan;
use shipit::tree::parse;
use shipit_encrypt::FieldCodec;
use shipit_types::EntityKind;

fuzz_target!(|data: &[u8]| {
    let Ok(value) = serde_json::from_slice::<serde_json::Value>(data) else {
        return;
    };

    for kind in EntityKind::ALL {
        let Ok(node) = parse(kind, &value, "") else {
            continue;
        };

        // A tree diffed against itself is a no-op.
        let diff = TreeDiff::compute(Some(&node), &node, &[], None);
        assert!(diff.is_noop());
        let _ = Plan::build(&diff, &FieldCodec::passthrough());
    }
});
