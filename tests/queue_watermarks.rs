#![cfg(feature = "os-poll")]

use nexio::error::Result;
use nexio::queue::{ReadQueue, SendOptions, WatermarkEvent, Watermarks, WriteQueue};

#[test]
fn write_queue_rejects_past_high_then_accepts_again_after_draining() {
    let queue = WriteQueue::new(Watermarks::new(2, 8), None);
    let mut blocked = |_: &[u8]| -> Result<usize> { Err(nexio::Error::WouldBlock) };

    // Filling exactly to the high watermark is accepted; the guard only
    // rejects a send that would push strictly past it.
    queue.send(vec![0u8; 8], SendOptions::default(), None, &mut blocked).unwrap();
    assert_eq!(queue.total_size(), 8);

    let err = queue
        .send(vec![0u8; 1], SendOptions::default(), None, &mut blocked)
        .unwrap_err();
    assert!(matches!(err, nexio::Error::WouldBlock));

    let mut accept_all = |chunk: &[u8]| -> Result<usize> { Ok(chunk.len()) };
    queue.drain(usize::MAX, &mut accept_all);
    assert_eq!(queue.total_size(), 0);

    queue.send(vec![0u8; 5], SendOptions::default(), None, &mut blocked).unwrap();
    assert_eq!(queue.total_size(), 5);
}

#[test]
fn read_queue_alternates_high_and_low_across_fill_and_take() {
    let queue = ReadQueue::new(Watermarks::new(2, 4));

    assert_eq!(queue.fill(&[0u8; 2]), None);
    let event = queue.fill(&[0u8; 2]);
    assert_eq!(event, Some(WatermarkEvent::High));
    assert!(queue.is_at_high_watermark());

    // Draining most of it but staying above low must not re-fire anything.
    let (_, remaining) = queue.take(1).unwrap();
    assert_eq!(remaining, 3);

    let (_, remaining) = queue.take(1).unwrap();
    assert_eq!(remaining, 2);

    let (_, remaining) = queue.take(1).unwrap();
    assert_eq!(remaining, 1);

    // One more fill re-breaches High, confirming the latch re-armed.
    let event = queue.fill(&[0u8; 4]);
    assert_eq!(event, Some(WatermarkEvent::High));
}
