//! End-to-end fragmentation and reassembly scenarios.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{addr, HashSigner, HashVerifier};
use lnchat_lib::{Aggregator, CodecConfig, SequentialIds, Sharder, Signer, Verifier};

fn signed_sharder(data: &[u8], destination: u8, source: u8) -> Sharder {
    let signer: Arc<dyn Signer> = Arc::new(HashSigner(addr(source)));
    Sharder::new(
        data.to_vec(),
        Some(addr(destination)),
        Some(signer),
        &SequentialIds::new(false),
        CodecConfig::default(),
    )
    .unwrap()
}

fn aggregator(local: u8) -> Aggregator {
    let verifier: Arc<dyn Verifier> = Arc::new(HashVerifier(addr(local)));
    Aggregator::new(Some(verifier))
}

#[tokio::test]
async fn test_single_fragment_roundtrip() {
    let sharder = signed_sharder(&[0xDE, 0xAD, 0xBE, 0xEF], 0x02, 0x03);
    let (records, lease) = sharder.get(4).await.unwrap().unwrap();
    lease.commit();

    let agg = aggregator(0x02);
    let notifier = agg.update(&records).await.unwrap();
    let t = notifier.recv().await.unwrap();

    assert_eq!(t.data, vec![0xDE, 0xAD, 0xBE, 0xEF]);
    assert_eq!(t.source, Some(addr(0x03)));
    assert_eq!(t.destination, Some(addr(0x02)));
    assert!(t.verified());
    assert!(notifier.recv().await.is_none());
}

#[tokio::test]
async fn test_multi_fragment_out_of_order() {
    let sharder = signed_sharder(b"hello world", 0x02, 0x03);
    let (f0, l0) = sharder.get(5).await.unwrap().unwrap();
    let (f1, l1) = sharder.get(3).await.unwrap().unwrap();
    let (f2, l2) = sharder.get(3).await.unwrap().unwrap();
    l0.commit();
    l1.commit();
    l2.commit();
    assert!(sharder.result().1);

    let agg = aggregator(0x02);
    let n2 = agg.update(&f2).await.unwrap();
    let n0 = agg.update(&f0).await.unwrap();
    let n1 = agg.update(&f1).await.unwrap();
    assert!(n0.same_channel(&n1));
    assert!(n0.same_channel(&n2));

    let t = n0.recv().await.unwrap();
    assert_eq!(t.data, b"hello world");
    assert_eq!(
        t.fragments.iter().map(|f| f.start).collect::<Vec<_>>(),
        vec![0, 5, 8]
    );
    assert!(t.verified());
    assert!(n2.recv().await.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_incomplete_transmission_times_out() {
    let sharder = signed_sharder(b"0123456789", 0x02, 0x03);
    let (records, lease) = sharder.get(5).await.unwrap().unwrap();
    lease.commit();

    let agg = aggregator(0x02);
    let notifier = agg.update(&records).await.unwrap();
    assert_eq!(agg.in_flight(), 1);

    let started = tokio::time::Instant::now();
    assert!(notifier.recv().await.is_none());
    let waited = started.elapsed();
    assert!(waited >= Duration::from_secs(120));
    assert!(waited < Duration::from_secs(240));

    tokio::task::yield_now().await;
    assert_eq!(agg.in_flight(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_idle_timer_resets_on_each_fragment() {
    let sharder = signed_sharder(b"abcdef", 0x02, 0x03);
    let (fa, la) = sharder.get(2).await.unwrap().unwrap();
    let (fb, lb) = sharder.get(2).await.unwrap().unwrap();
    let (fc, lc) = sharder.get(2).await.unwrap().unwrap();
    la.commit();
    lb.commit();
    lc.commit();

    let agg = aggregator(0x02).with_idle_timeout(Duration::from_secs(10));
    let notifier = agg.update(&fa).await.unwrap();
    tokio::time::sleep(Duration::from_secs(8)).await;
    agg.update(&fb).await.unwrap();
    tokio::time::sleep(Duration::from_secs(8)).await;
    agg.update(&fc).await.unwrap();

    assert_eq!(notifier.recv().await.unwrap().data, b"abcdef");
}

#[tokio::test]
async fn test_concurrent_updates_share_one_channel() {
    let sharder = signed_sharder(b"concurrent", 0x02, 0x03);
    let mut fields = Vec::new();
    while let Some((records, lease)) = sharder.get(2).await.unwrap() {
        lease.commit();
        fields.push(records);
    }
    assert_eq!(fields.len(), 5);

    let agg = Arc::new(aggregator(0x02));
    let handles: Vec<_> = fields
        .into_iter()
        .map(|records| {
            let agg = Arc::clone(&agg);
            tokio::spawn(async move { agg.update(&records).await.unwrap() })
        })
        .collect();

    let mut notifiers = Vec::new();
    for handle in handles {
        notifiers.push(handle.await.unwrap());
    }
    for n in &notifiers[1..] {
        assert!(notifiers[0].same_channel(n));
    }

    let mut values = 0;
    for n in &notifiers {
        if let Some(t) = n.recv().await {
            assert_eq!(t.data, b"concurrent");
            values += 1;
        }
    }
    assert_eq!(values, 1);
}

#[tokio::test]
async fn test_replayed_fragment_to_other_recipient_is_unverified() {
    let sharder = signed_sharder(b"xyz", 0x02, 0x03);
    let (records, lease) = sharder.get(3).await.unwrap().unwrap();
    lease.commit();

    let agg = aggregator(0x09);
    let t = agg.update(&records).await.unwrap().recv().await.unwrap();
    assert_eq!(t.data, b"xyz");
    assert!(!t.verified());
    assert_eq!(t.destination, Some(addr(0x09)));
}

#[tokio::test]
async fn test_anonymous_transmissions() {
    let sharder = Sharder::new(
        b"anon".to_vec(),
        None,
        None,
        &SequentialIds::new(false),
        CodecConfig::default(),
    )
    .unwrap();
    let (records, lease) = sharder.get(10).await.unwrap().unwrap();
    lease.commit();

    let agg = Aggregator::new(None);
    let t = agg.update(&records).await.unwrap().recv().await.unwrap();
    assert_eq!(t.data, b"anon");
    assert!(t.source.is_none());
    assert!(t.destination.is_none());
    assert!(!t.verified());
}

#[tokio::test]
async fn test_cancelled_lease_is_resent() {
    let sharder = signed_sharder(b"retry me", 0x02, 0x03);
    let (_, lost) = sharder.get(4).await.unwrap().unwrap();
    let (second, l2) = sharder.get(4).await.unwrap().unwrap();
    l2.commit();
    lost.cancel();
    assert_eq!(sharder.pending(), 4);

    let (first, l1) = sharder.get(4).await.unwrap().unwrap();
    l1.commit();
    assert!(sharder.result().1);

    let agg = aggregator(0x02);
    agg.update(&second).await.unwrap();
    let t = agg.update(&first).await.unwrap().recv().await.unwrap();
    assert_eq!(t.data, b"retry me");
}

#[tokio::test]
async fn test_oversized_transmission_not_buffered() {
    let sender_codec = CodecConfig {
        max_transmission_size: u32::MAX,
        ..CodecConfig::default()
    };
    let sharder = Sharder::new(
        vec![1u8; 64],
        None,
        None,
        &SequentialIds::new(false),
        sender_codec,
    )
    .unwrap();
    let (records, lease) = sharder.get(8).await.unwrap().unwrap();
    lease.commit();

    let agg = Aggregator::new(None).with_codec(CodecConfig {
        max_transmission_size: 32,
        ..CodecConfig::default()
    });
    let err = agg.update(&records).await.unwrap_err();
    assert_eq!(err.kind(), lnchat_lib::ErrorKind::Marshal);
    assert_eq!(agg.in_flight(), 0);
}
