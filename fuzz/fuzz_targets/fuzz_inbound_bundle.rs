#![no_main]

use cloudcall_client::protocol::{CallResponse, InboundBundle};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Raw-byte path, including serde_json's own UTF-8 validation.
    let _ = serde_json::from_slice::<InboundBundle>(data);

    // Whatever parses must also convert into outcomes without panicking.
    if let Ok(s) = std::str::from_utf8(data) {
        if let Ok(bundle) = serde_json::from_str::<InboundBundle>(s) {
            for response in bundle.responses {
                let _ = CallResponse::into_outcome(response);
            }
        }
    }
});
