#![no_main]

use libfuzzer_sys::fuzz_target;
use vidc_decode::device::vidc_event;
use vidc_decode::device::RawEvent;
use vidc_decode::event::Event;

fuzz_target!(|data: &[u8]| {
    let Some((selector, payload)) = data.split_first() else {
        return;
    };

    let kinds = vidc_event::SUBSCRIBED;
    let mut raw = RawEvent::new(kinds[*selector as usize % kinds.len()]);
    let len = payload.len().min(raw.data.len());
    raw.data[..len].copy_from_slice(&payload[..len]);

    let _ = Event::from_raw(&raw);
});
