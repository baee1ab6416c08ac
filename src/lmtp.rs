//! The LMTP per-recipient status collector.
//!
//! Each distinct recipient gets a bounded `mpsc` channel sized to its
//! multiplicity in the RCPT list, so `set_status` can be non-blocking and
//! `fill_remaining` is guaranteed to terminate without ever needing a lock.
//! Draining happens in RCPT order: for a recipient named more than once,
//! its channel is consumed once per occurrence, FIFO.

use std::collections::HashMap;

use tokio::sync::mpsc;

use crate::error::SmtpError;

pub struct StatusCollector {
    senders: HashMap<String, mpsc::Sender<Result<(), SmtpError>>>,
    receivers: HashMap<String, mpsc::Receiver<Result<(), SmtpError>>>,
}

impl StatusCollector {
    /// Builds a collector for `recipients`, in RCPT order. Recipients that
    /// appear more than once share one channel, sized to their count.
    pub fn new(recipients: &[String]) -> Self {
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for r in recipients {
            *counts.entry(r.as_str()).or_insert(0) += 1;
        }

        let mut senders = HashMap::new();
        let mut receivers = HashMap::new();
        for (rcpt, count) in counts {
            let (tx, rx) = mpsc::channel(count);
            senders.insert(rcpt.to_string(), tx);
            receivers.insert(rcpt.to_string(), rx);
        }

        StatusCollector { senders, receivers }
    }

    /// Sets the status for one occurrence of `rcpt_to`. Panics if called
    /// for a recipient that was never specified, or more times than it
    /// appeared — both are programming errors in the backend, matching the
    /// Go original's `panic("SetStatus is called ...")`.
    pub fn set_status(&self, rcpt_to: &str, result: Result<(), SmtpError>) {
        let tx = self
            .senders
            .get(rcpt_to)
            .unwrap_or_else(|| panic!("set_status called for unspecified recipient {rcpt_to:?}"));
        tx.try_send(result)
            .unwrap_or_else(|_| panic!("set_status called more times than {rcpt_to:?} was specified"));
    }

    /// Non-blockingly fills every channel slot `set_status` never reached,
    /// with `result`, after `lmtp_data` has returned.
    pub fn fill_remaining(&self, result: &Result<(), SmtpError>) {
        for tx in self.senders.values() {
            while tx.try_send(result.clone()).is_ok() {}
        }
    }

    /// Drains exactly one status per recipient, in RCPT order. Call only
    /// after the backend's `lmtp_data` (or the single-status fallback) has
    /// returned and `fill_remaining` has topped up any untouched slots, so
    /// every recv below is immediately ready.
    pub async fn drain_in_order(
        &mut self,
        recipients: &[String],
    ) -> Vec<Result<(), SmtpError>> {
        let mut out = Vec::with_capacity(recipients.len());
        for rcpt in recipients {
            let rx = self
                .receivers
                .get_mut(rcpt)
                .expect("receiver exists for every recipient passed to new()");
            let status = rx
                .recv()
                .await
                .expect("fill_remaining guarantees a value for every RCPT occurrence");
            out.push(status);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{EnhancedCode, SmtpError};

    #[tokio::test]
    async fn one_status_per_recipient_in_order() {
        let recipients = vec!["a@x".to_string(), "b@y".to_string()];
        let collector = StatusCollector::new(&recipients);

        collector.set_status("a@x", Ok(()));
        collector.set_status(
            "b@y",
            Err(SmtpError::new(550, EnhancedCode(5, 7, 1), "rejected")),
        );

        let mut collector = collector;
        let results = collector.drain_in_order(&recipients).await;
        assert!(results[0].is_ok());
        assert_eq!(results[1].as_ref().unwrap_err().code, 550);
    }

    #[tokio::test]
    async fn duplicate_recipients_get_one_slot_each() {
        let recipients = vec!["a@x".to_string(), "a@x".to_string()];
        let collector = StatusCollector::new(&recipients);

        collector.set_status("a@x", Ok(()));
        collector.set_status("a@x", Err(SmtpError::new(550, EnhancedCode(5, 7, 1), "no")));

        let mut collector = collector;
        let results = collector.drain_in_order(&recipients).await;
        assert!(results[0].is_ok());
        assert!(results[1].is_err());
    }

    #[tokio::test]
    async fn fill_remaining_tops_up_untouched_slots() {
        let recipients = vec!["a@x".to_string(), "b@y".to_string()];
        let collector = StatusCollector::new(&recipients);

        collector.set_status("a@x", Ok(()));
        collector.fill_remaining(&Err(SmtpError::new(451, EnhancedCode(4, 0, 0), "timeout")));

        let mut collector = collector;
        let results = collector.drain_in_order(&recipients).await;
        assert!(results[0].is_ok());
        assert!(results[1].is_err());
    }

    #[test]
    #[should_panic]
    fn set_status_on_unknown_recipient_panics() {
        let recipients = vec!["a@x".to_string()];
        let collector = StatusCollector::new(&recipients);
        collector.set_status("unknown@z", Ok(()));
    }

    #[test]
    #[should_panic]
    fn set_status_overfilling_panics() {
        let recipients = vec!["a@x".to_string()];
        let collector = StatusCollector::new(&recipients);
        collector.set_status("a@x", Ok(()));
        collector.set_status("a@x", Ok(()));
    }
}
