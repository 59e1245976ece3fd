//! Stress test for the broadcast log: many concurrent cursors over one
//! produced sequence, each observing every element, followed by full
//! reclamation.

use spool::BroadcastLog;

const END_INCLUSIVE: i64 = 20_000;
const READERS: usize = 16;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn should_broadcast_full_sequence_to_every_cursor() {
    let log = BroadcastLog::new();

    let mut readers = Vec::new();
    for _ in 0..READERS {
        let mut cursor = log.subscribe().unwrap();
        readers.push(tokio::spawn(async move {
            let mut last = -1i64;
            let mut observed = 0u64;
            while let Some(value) = cursor.next().await.unwrap() {
                last = value;
                observed += 1;
            }
            (last, observed)
        }));
    }

    log.consume(futures::stream::iter(1..=END_INCLUSIVE))
        .await
        .unwrap()
        .unwrap();

    for reader in readers {
        let (last, observed) = reader.await.unwrap();
        assert_eq!(last, END_INCLUSIVE);
        assert_eq!(observed, END_INCLUSIVE as u64);
    }

    // Every cursor is done, so the whole chain is reclaimable.
    log.shrink();
    assert_eq!(log.count(), 0);
}
