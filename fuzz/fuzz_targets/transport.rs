#![no_main]

use futures::executor::block_on;
use libfuzzer_sys::fuzz_target;
use veilstream::{Config, SecretStream};

const MAX_MESSAGE_SIZE: usize = 64 * 1024;

fn fuzz(data: &[u8]) {
    block_on(async move {
        let config = || Config {
            max_message_size: MAX_MESSAGE_SIZE,
            ..Config::default()
        };
        let (mut left, mut right) =
            SecretStream::pair(config(), config()).expect("Failed to build stream pair!");

        let (left_connect, right_connect) = futures::join!(left.connect(), right.connect());
        left_connect.unwrap();
        right_connect.unwrap();
        assert_eq!(left.remote_public_key(), right.public_key());
        assert_eq!(right.remote_public_key(), left.public_key());
        assert_eq!(left.handshake_hash(), right.handshake_hash());

        for chunk in data.chunks(1024) {
            left.send(chunk).await.unwrap();
            let received = right.recv().await.unwrap().expect("Stream ended early!");
            assert_eq!(received.as_ref(), chunk);

            right.send(chunk).await.unwrap();
            let received = left.recv().await.unwrap().expect("Stream ended early!");
            assert_eq!(received.as_ref(), chunk);
        }
    });
}

fuzz_target!(|input: &[u8]| {
    fuzz(input);
});
