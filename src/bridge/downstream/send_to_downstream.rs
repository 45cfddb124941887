use crate::bridge::{
    codec::{encode, Message},
    error::BridgeResult,
};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::trace;

/// Encodes `messages` and queues them to the ingress writer, in order. A miner that does not
/// drain its queue within the write timeout fails the send.
pub(super) async fn send_to_downstream(
    send_to_down: &mpsc::Sender<String>,
    messages: Vec<Message>,
    connection_id: u32,
) -> BridgeResult<()> {
    for message in messages {
        let line = encode(&message)?;
        trace!("Downstream {} <- {}", connection_id, line);
        send_to_down
            .send_timeout(line, Duration::from_secs(crate::WRITE_TIMEOUT_SECS))
            .await?;
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::bridge::{codec::Notification, error::Error};

    #[tokio::test]
    async fn messages_are_queued_in_order() {
        let (tx, mut rx) = mpsc::channel(4);
        let messages = vec![
            Notification::set_difficulty(4.0).into(),
            Notification::new("mining.notify", vec![]).into(),
        ];
        send_to_downstream(&tx, messages, 1).await.unwrap();
        assert!(rx.recv().await.unwrap().contains("mining.set_difficulty"));
        assert!(rx.recv().await.unwrap().contains("mining.notify"));
    }

    #[tokio::test]
    async fn closed_writer_is_an_error() {
        let (tx, rx) = mpsc::channel(4);
        drop(rx);
        let res = send_to_downstream(&tx, vec![Notification::set_difficulty(1.0).into()], 1).await;
        assert!(matches!(res, Err(Error::ChannelClosed)));
    }
}
