#![no_main]

use libfuzzer_sys::fuzz_target;
use vidc_decode::bitstream_utils::AnnexBSource;
use vidc_decode::bitstream_utils::BitstreamSource;
use vidc_decode::EncodedFormat;

fuzz_target!(|data: &[u8]| {
    let Some((selector, stream)) = data.split_first() else {
        return;
    };

    let format = if selector & 1 == 0 { EncodedFormat::H264 } else { EncodedFormat::H265 };
    let Ok(mut source) = AnnexBSource::new(stream.to_vec(), format, None) else {
        return;
    };

    let mut total = 0;
    while let Ok(Some(unit)) = source.next_unit() {
        total += unit.data.len();
        assert!(total <= stream.len());
    }
});
