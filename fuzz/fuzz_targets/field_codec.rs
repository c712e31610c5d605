#![no_main]

use libfuzzer_sys::fuzz_target;
use shipit_encrypt::FieldCodec;

fuzz_target!(|data: &[u8]| {
    let codec = FieldCodec::with_passphrase("test-passphrase-fuzz");

    if let Ok(text) = std::str::from_utf8(data) {
        if let Ok(sealed) = codec.encrypt_field(text) {
            assert_eq!(codec.try_decrypt_field(&sealed).ok().as_deref(), Some(text));
        }
        // Arbitrary stored values must never panic.
        let _ = codec.decrypt_field(text);
        assert_eq!(codec.digest(text), codec.digest(text));
    }
});
