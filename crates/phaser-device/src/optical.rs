//! Optical transmitter task.
//!
//! Messages are clocked out MSB first, one bit period per bit, with the line
//! idle low before and after. Once a message starts it runs to completion.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;

use phaser_core::codec::{MessageFormat, OpticalMessage};

/// Default transmit queue depth.
pub const OPTICAL_QUEUE_CAPACITY: usize = 5;

/// A digital output line driving the emitter.
pub trait OutputPin: Send {
    fn set_level(&mut self, high: bool);
}

/// Host stand-in for the emitter pin: logs level changes.
#[derive(Debug)]
pub struct LoggingPin {
    pin: u8,
    high: bool,
}

impl LoggingPin {
    pub fn new(pin: u8) -> Self {
        Self { pin, high: false }
    }
}

impl OutputPin for LoggingPin {
    fn set_level(&mut self, high: bool) {
        if self.high != high {
            tracing::trace!(pin = self.pin, high, "emitter level");
        }
        self.high = high;
    }
}

/// Records every level write with its time. Clones share the same log.
#[derive(Debug, Clone, Default)]
pub struct RecordingPin {
    log: Arc<Mutex<Vec<(Instant, bool)>>>,
}

impl RecordingPin {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<(Instant, bool)> {
        self.log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl OutputPin for RecordingPin {
    fn set_level(&mut self, high: bool) {
        self.log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((Instant::now(), high));
    }
}

/// Drives the line low when dropped, however transmission ended.
struct IdleGuard<'a, P: OutputPin>(&'a mut P);

impl<P: OutputPin> Drop for IdleGuard<'_, P> {
    fn drop(&mut self) {
        self.0.set_level(false);
    }
}

pub struct OpticalTransmitter<P> {
    pin: P,
    bit_period: Duration,
}

impl<P: OutputPin> OpticalTransmitter<P> {
    pub fn new(mut pin: P, format: MessageFormat) -> Self {
        pin.set_level(false);
        Self {
            pin,
            bit_period: format.bit_period(),
        }
    }

    /// Transmit queued messages until the queue closes or `cancel` fires.
    /// Cancellation is only observed between messages.
    pub async fn run(
        mut self,
        mut queue: mpsc::Receiver<OpticalMessage>,
        cancel: CancellationToken,
    ) {
        loop {
            let msg = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                msg = queue.recv() => match msg {
                    Some(msg) => msg,
                    None => break,
                },
            };
            tracing::debug!(bits = %msg, "transmitting optical message");
            self.transmit(&msg).await;
        }
        tracing::debug!("optical transmitter stopped");
    }

    /// Clock out one message. Deadlines are absolute so per-bit scheduling
    /// jitter does not accumulate.
    pub async fn transmit(&mut self, msg: &OpticalMessage) {
        let line = IdleGuard(&mut self.pin);
        let mut deadline = Instant::now();
        for level in msg.levels() {
            line.0.set_level(level);
            deadline += self.bit_period;
            sleep_until(deadline).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use phaser_core::codec::OpticalCodec;

    #[tokio::test(start_paused = true)]
    async fn bits_are_clocked_msb_first_at_fixed_period() {
        let format = MessageFormat::COMPACT;
        let msg = OpticalCodec::new(format).encode(0x5A, 5);
        let pin = RecordingPin::new();
        let mut tx = OpticalTransmitter::new(pin.clone(), format);
        let start = Instant::now();
        tx.transmit(&msg).await;

        let events = pin.events();
        // Initial idle, one write per bit, final idle.
        assert_eq!(events.len(), 1 + usize::from(msg.width()) + 1);
        let period = format.bit_period();
        for (i, (level, (at, written))) in msg.levels().zip(&events[1..]).enumerate() {
            assert_eq!(*written, level, "bit {i}");
            assert_eq!(*at, start + period * i as u32, "bit {i}");
        }
        let (end, last) = events[events.len() - 1];
        assert!(!last);
        assert_eq!(end, start + format.transmit_duration());
    }

    #[tokio::test(start_paused = true)]
    async fn run_drains_queue_and_idles_low_on_cancel() {
        let format = MessageFormat::COMPACT;
        let codec = OpticalCodec::new(format);
        let pin = RecordingPin::new();
        let (tx, rx) = mpsc::channel(OPTICAL_QUEUE_CAPACITY);
        let cancel = CancellationToken::new();
        let transmitter = OpticalTransmitter::new(pin.clone(), format);
        let task = tokio::spawn(transmitter.run(rx, cancel.clone()));

        tx.send(codec.encode(1, 5)).await.unwrap();
        tx.send(codec.encode(2, 5)).await.unwrap();
        tokio::time::sleep(format.transmit_duration() * 3).await;
        cancel.cancel();
        task.await.unwrap();

        let events = pin.events();
        let highs = events.iter().filter(|(_, high)| *high).count();
        let expected: usize = [codec.encode(1, 5), codec.encode(2, 5)]
            .iter()
            .map(|m| m.levels().filter(|&l| l).count())
            .sum();
        assert_eq!(highs, expected);
        assert_eq!(events.last().map(|(_, high)| *high), Some(false));
    }

    #[tokio::test(start_paused = true)]
    async fn in_flight_message_completes_before_cancel() {
        let format = MessageFormat::COMPACT;
        let msg = OpticalCodec::new(format).encode(3, 5);
        let pin = RecordingPin::new();
        let (tx, rx) = mpsc::channel(OPTICAL_QUEUE_CAPACITY);
        let cancel = CancellationToken::new();
        let transmitter = OpticalTransmitter::new(pin.clone(), format);
        let task = tokio::spawn(transmitter.run(rx, cancel.clone()));

        tx.send(msg).await.unwrap();
        tokio::time::sleep(format.bit_period() * 3).await;
        cancel.cancel();
        task.await.unwrap();

        // Every bit plus the idle writes made it out.
        assert_eq!(pin.events().len(), 1 + usize::from(msg.width()) + 1);
    }
}
