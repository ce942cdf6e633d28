use crate::SendResult;

/// Progress callbacks for one logical send. Passed by reference into the
/// planner; every method defaults to a no-op.
pub trait SendEvents: Send + Sync {
    /// Envelopes were produced for a recipient (first attempt only).
    fn on_encrypted(&self) {}

    /// A transport call succeeded.
    fn on_sent(&self) {}

    /// The sync transcript reached our own other devices.
    fn on_sync_sent(&self) {}

    /// Sender-key distribution finished for a group send.
    fn on_sender_key_shared(&self) {}

    /// A recipient's outcome is final.
    fn on_recipient_complete(&self, _result: &SendResult) {}
}

pub struct NoopSendEvents;

impl SendEvents for NoopSendEvents {}
