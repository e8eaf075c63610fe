use tokio::sync::oneshot;

/// A message paired with a oneshot notifier. The sender is told when the receiving worker has
/// processed the message, or learns that it never will once the message is dropped.
#[derive(Debug)]
pub(crate) struct AcknowledgedMessage<M, R = ()> {
    notifier: oneshot::Sender<R>,
    message: M,
}

impl<M, R> AcknowledgedMessage<M, R> {
    /// Wrap `message`, returning it along with the receiver for its acknowledgment.
    pub(crate) fn package(message: M) -> (Self, AcknowledgmentReceiver<R>) {
        let (notifier, receiver) = oneshot::channel();
        (Self { message, notifier }, AcknowledgmentReceiver { receiver })
    }

    /// Send the acknowledgment, discarding the message.
    pub(crate) fn acknowledge(self, result: impl Into<R>) {
        self.into_parts().1.acknowledge(result);
    }

    pub(crate) fn into_parts(self) -> (M, Acknowledger<R>) {
        (
            self.message,
            Acknowledger {
                notifier: self.notifier,
            },
        )
    }
}

/// The sending half of an acknowledgment, split off from its message.
#[derive(Debug)]
pub(crate) struct Acknowledger<R> {
    notifier: oneshot::Sender<R>,
}

impl<R> Acknowledger<R> {
    pub(crate) fn acknowledge(self, result: impl Into<R>) {
        // The other end may have hung up, e.g. after a timeout.
        let _: std::result::Result<_, _> = self.notifier.send(result.into());
    }
}

/// Receiver for the acknowledgement that the message was processed or dropped.
pub(crate) struct AcknowledgmentReceiver<R> {
    receiver: oneshot::Receiver<R>,
}

impl<R> AcknowledgmentReceiver<R> {
    /// Wait for the message to be acknowledged. `None` means the message was dropped without
    /// the worker sending anything back.
    pub(crate) async fn wait_for_acknowledgment(self) -> Option<R> {
        self.receiver.await.ok()
    }
}
