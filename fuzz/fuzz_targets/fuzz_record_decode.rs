#![no_main]
use blobstore_rs::{ByteOrder, RecordHeader};
use libfuzzer_sys::fuzz_target;

// Decoding arbitrary bytes must fail cleanly or yield a header that
// re-encodes to the same bytes.
fuzz_target!(|data: &[u8]| {
    for order in [ByteOrder::Little, ByteOrder::Big] {
        let header = match RecordHeader::decode(data, order) {
            Ok(header) => header,
            Err(_) => continue,
        };

        if let Some(length) = header.length() {
            assert!(length <= header.capacity());
        }

        let mut buf = vec![0u8; header.header_size()];
        header.encode(&mut buf, order).unwrap();
        assert_eq!(RecordHeader::decode(&buf, order).unwrap(), header);
    }
});
