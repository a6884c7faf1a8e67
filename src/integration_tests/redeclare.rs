use super::with_conn;
use crate::{Error, QueueDeclareOptions};

#[test]
fn redeclare_with_mismatched_durability_is_channel_fatal() {
    with_conn(|conn| {
        let chan = conn.open_channel(None).unwrap();
        chan.queue_declare("coney-redeclare", QueueDeclareOptions::default())
            .unwrap();

        let err = chan
            .queue_declare(
                "coney-redeclare",
                QueueDeclareOptions {
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
            )
            .unwrap_err();
        match err {
            Error::ServerClosedChannel {
                code: 406,
                class_id: 50,
                method_id: 10,
                ..
            } => (),
            other => panic!("unexpected error {:?}", other),
        }

        // the channel is terminal, but the connection survives
        assert!(chan
            .queue_declare("coney-after", QueueDeclareOptions::default())
            .is_err());
        let chan2 = conn.open_channel(None).unwrap();
        chan2
            .queue_declare("coney-after", QueueDeclareOptions::default())
            .unwrap();
        chan2.queue_delete("coney-after", Default::default()).unwrap();

        let cleanup = conn.open_channel(None).unwrap();
        cleanup
            .queue_delete("coney-redeclare", Default::default())
            .unwrap();
    })
}
