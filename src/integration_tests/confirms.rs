use super::with_chan;
use crate::{AmqpProperties, ConfirmStatus, QueueDeclareOptions};
use std::time::{Duration, Instant};

#[test]
fn publisher_confirms_all_ack() {
    with_chan(|chan| {
        let queue = chan
            .queue_declare(
                "",
                QueueDeclareOptions {
                    exclusive: true,
                    ..QueueDeclareOptions::default()
                },
            )
            .unwrap();
        chan.enable_publisher_confirms().unwrap();

        let mut handles = Vec::new();
        for _ in 0..200 {
            let handle = chan
                .basic_publish(
                    b"msg",
                    "",
                    queue.name(),
                    false,
                    &AmqpProperties::default(),
                )
                .unwrap()
                .expect("confirm mode must yield a handle");
            handles.push(handle);
        }

        let deadline = Instant::now() + Duration::from_secs(30);
        for handle in handles {
            let remaining = deadline
                .checked_duration_since(Instant::now())
                .expect("confirms did not arrive within 30s");
            assert_eq!(handle.wait_timeout(remaining).unwrap(), ConfirmStatus::Ack);
        }
    })
}

#[test]
fn graceful_close_settles_every_confirm() {
    super::with_conn(|conn| {
        let chan = conn.open_channel(None).unwrap();
        let queue = chan
            .queue_declare(
                "",
                QueueDeclareOptions {
                    exclusive: true,
                    ..QueueDeclareOptions::default()
                },
            )
            .unwrap();
        chan.enable_publisher_confirms().unwrap();

        let mut handles = Vec::new();
        for _ in 0..1000 {
            handles.push(
                chan.basic_publish(b"m", "", queue.name(), false, &AmqpProperties::default())
                    .unwrap()
                    .unwrap(),
            );
        }
        chan.close().unwrap();

        // every handle must be settled: acked, or interrupted by the close
        for handle in handles {
            match handle.wait_timeout(Duration::from_secs(5)) {
                Ok(ConfirmStatus::Ack) | Err(crate::Error::OperationInterrupted) => (),
                other => panic!("unsettled confirm handle: {:?}", other),
            }
        }
    })
}
