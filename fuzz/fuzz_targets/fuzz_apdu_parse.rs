#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let framer = cardport::Framer::new(true, false);
    let _ = framer.command_status(data, false);
    let _ = framer.command_status(data, true);
    if let Ok(frame) = cardport::parse_command(data) {
        let _ = frame.to_bytes();
    }
    let _ = cardport::parse_response(data);
});
